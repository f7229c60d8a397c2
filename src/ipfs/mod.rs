//! IPLD block storage capability.
//!
//! The pipeline only needs content-addressed put/get; the network-attached
//! IPFS client is an external collaborator behind the [`IpldStore`] trait.

use async_trait::async_trait;
use cid::Cid;
use multihash_codetable::{Code, MultihashDigest};
use serde::Serialize;
use thiserror::Error;

pub mod memory;

pub use memory::MemoryIpldStore;

/// Multicodec for dag-cbor blocks.
pub const DAG_CBOR: u64 = 0x71;

/// Multicodec for content-addressable archives.
pub const CAR: u64 = 0x0202;

#[derive(Debug, Error)]
pub enum Error {
    #[error("block {cid} not found")]
    NotFound { cid: Cid },

    #[error("ipld store unavailable: {0}")]
    Unavailable(String),

    #[error("dag-cbor encoding failed: {0}")]
    Encode(String),

    #[error("dag-cbor decoding failed: {0}")]
    Decode(String),
}

#[async_trait]
pub trait IpldStore: Send + Sync {
    /// Stores a block and returns its CID. Writes are idempotent: storing
    /// the same bytes twice yields the same CID.
    async fn put_block(&self, data: &[u8], codec: u64) -> Result<Cid, Error>;

    async fn get_block(&self, cid: &Cid) -> Result<Vec<u8>, Error>;
}

/// The CID a block would get when stored: sha2-256 over the raw bytes.
pub fn block_cid(data: &[u8], codec: u64) -> Cid {
    Cid::new_v1(codec, Code::Sha2_256.digest(data))
}

pub fn encode_dag_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>, Error> {
    serde_ipld_dagcbor::to_vec(value).map_err(|e| Error::Encode(e.to_string()))
}

pub fn decode_dag_cbor<T: serde::de::DeserializeOwned>(data: &[u8]) -> Result<T, Error> {
    serde_ipld_dagcbor::from_slice(data).map_err(|e| Error::Decode(e.to_string()))
}

/// Encodes `value` as dag-cbor and stores it.
pub async fn put_dag_cbor<T: Serialize>(store: &dyn IpldStore, value: &T) -> Result<Cid, Error> {
    let data = encode_dag_cbor(value)?;
    store.put_block(&data, DAG_CBOR).await
}

/// Fetches and decodes a dag-cbor block.
pub async fn get_dag_cbor<T: serde::de::DeserializeOwned>(
    store: &dyn IpldStore,
    cid: &Cid,
) -> Result<T, Error> {
    let data = store.get_block(cid).await?;
    decode_dag_cbor(&data)
}
