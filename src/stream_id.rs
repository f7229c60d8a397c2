use std::fmt;
use std::str::FromStr;

use cid::Cid;
use multibase::Base;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use unsigned_varint::{decode as varint_decode, encode as varint_encode};

/// Multicodec code reserved for Ceramic StreamIDs.
const STREAMID_CODEC: u64 = 0xce;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid multibase prefix: {0}")]
    Multibase(#[from] multibase::Error),
    #[error("invalid varint in stream id")]
    Varint,
    #[error("invalid cid in stream id: {0}")]
    Cid(#[from] cid::Error),
    #[error("not a stream id codec: {0:#x}")]
    WrongCodec(u64),
    #[error("stream id is empty")]
    Empty,
}

/// A CIP-59 StreamID: `<multibase(base36)><varint 0xce><varint type><cid>`.
///
/// The type discriminates stream kinds (tile, CAIP-10 link, model, ...) but
/// the anchor pipeline treats it as opaque.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId {
    pub stream_type: u64,
    pub cid: Cid,
}

impl StreamId {
    pub fn new(stream_type: u64, cid: Cid) -> Self {
        Self { stream_type, cid }
    }

    /// The genesis commit CID embedded in the identifier.
    pub fn genesis_cid(&self) -> &Cid {
        &self.cid
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut buf = varint_encode::u64_buffer();
        let mut out = varint_encode::u64(STREAMID_CODEC, &mut buf).to_vec();
        let mut buf = varint_encode::u64_buffer();
        out.extend_from_slice(varint_encode::u64(self.stream_type, &mut buf));
        out.extend_from_slice(&self.cid.to_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.is_empty() {
            return Err(Error::Empty);
        }
        let (codec, rest) = varint_decode::u64(bytes).map_err(|_| Error::Varint)?;
        if codec != STREAMID_CODEC {
            return Err(Error::WrongCodec(codec));
        }
        let (stream_type, rest) = varint_decode::u64(rest).map_err(|_| Error::Varint)?;
        let cid = Cid::read_bytes(rest)?;
        Ok(Self { stream_type, cid })
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&multibase::encode(Base::Base36Lower, self.to_vec()))
    }
}

impl fmt::Debug for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StreamId({self})")
    }
}

impl FromStr for StreamId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(Error::Empty);
        }
        let (_base, bytes) = multibase::decode(s)?;
        Self::from_bytes(&bytes)
    }
}

impl Serialize for StreamId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for StreamId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}
