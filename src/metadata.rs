//! Genesis-field resolution with a database-backed cache.
//!
//! A stream's genesis commit pins the fields that matter to anchoring:
//! the controller list and the optional model. Resolutions are cached in the
//! `metadata` table; rows that no batch has referenced for a retention
//! horizon are evicted by a background task.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::database::methods::DbMethods as _;
use crate::database::Database;
use crate::ipfs::{self, IpldStore};
use crate::stream_id::StreamId;

const FETCH_ATTEMPTS: u32 = 3;
const FETCH_BACKOFF: Duration = Duration::from_millis(250);

#[derive(Debug, Error)]
pub enum Error {
    #[error("genesis fields for {stream_id} unavailable: {reason}")]
    Unavailable { stream_id: String, reason: String },

    #[error(transparent)]
    Database(#[from] crate::database::Error),
}

/// Fields lifted from a stream's genesis commit header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisFields {
    /// Signature-verification peers, insertion order significant.
    pub controllers: Vec<String>,
    /// Raw StreamID bytes of the model this stream is an instance of.
    #[serde(default, skip_serializing_if = "Option::is_none", with = "serde_bytes")]
    pub model: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub family: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
}

impl GenesisFields {
    /// The model as a StreamID, when present and well-formed.
    pub fn model_stream(&self) -> Option<StreamId> {
        self.model
            .as_deref()
            .and_then(|bytes| StreamId::from_bytes(bytes).ok())
    }
}

/// Shape of a (unsigned) genesis commit block. Only the header matters here.
#[derive(Debug, Deserialize)]
struct GenesisCommit {
    header: GenesisHeader,
}

#[derive(Debug, Deserialize)]
struct GenesisHeader {
    #[serde(default)]
    controllers: Vec<String>,
    #[serde(default, with = "serde_bytes")]
    model: Option<Vec<u8>>,
    #[serde(default)]
    schema: Option<String>,
    #[serde(default)]
    family: Option<String>,
    #[serde(default)]
    tags: Option<Vec<String>>,
}

pub struct MetadataResolver {
    database: Arc<Database>,
    ipfs: Arc<dyn IpldStore>,
}

impl MetadataResolver {
    pub fn new(database: Arc<Database>, ipfs: Arc<dyn IpldStore>) -> Self {
        Self { database, ipfs }
    }

    /// Resolves genesis fields for `stream_id`, from cache when possible.
    #[instrument(skip(self), level = "debug")]
    pub async fn resolve(&self, stream_id: &StreamId) -> Result<GenesisFields, Error> {
        let key = stream_id.to_string();

        if let Some(entry) = self.database.pool.get_metadata(&key).await? {
            self.database.pool.touch_metadata(&[key]).await?;
            return Ok(entry.metadata.0);
        }

        let fields = self.dereference_genesis(stream_id).await?;
        self.database.pool.put_metadata(&key, &fields).await?;

        Ok(fields)
    }

    /// Fetches and parses the genesis commit, retrying store failures a
    /// bounded number of times. Malformed commits are permanent failures.
    async fn dereference_genesis(&self, stream_id: &StreamId) -> Result<GenesisFields, Error> {
        let cid = stream_id.genesis_cid();

        let mut last_error = String::new();
        for attempt in 1..=FETCH_ATTEMPTS {
            match self.ipfs.get_block(cid).await {
                Ok(block) => return self.parse_genesis(stream_id, &block),
                Err(e) => {
                    warn!(%stream_id, attempt, error = %e, "genesis block fetch failed");
                    last_error = e.to_string();
                }
            }
            if attempt < FETCH_ATTEMPTS {
                tokio::time::sleep(FETCH_BACKOFF * attempt).await;
            }
        }

        Err(Error::Unavailable {
            stream_id: stream_id.to_string(),
            reason: last_error,
        })
    }

    fn parse_genesis(
        &self,
        stream_id: &StreamId,
        block: &[u8],
    ) -> Result<GenesisFields, Error> {
        let commit: GenesisCommit =
            ipfs::decode_dag_cbor(block).map_err(|e| Error::Unavailable {
                stream_id: stream_id.to_string(),
                reason: e.to_string(),
            })?;

        if commit.header.controllers.is_empty() {
            return Err(Error::Unavailable {
                stream_id: stream_id.to_string(),
                reason: "genesis header has no controllers".to_string(),
            });
        }

        debug!(%stream_id, controllers = commit.header.controllers.len(), "resolved genesis fields");

        Ok(GenesisFields {
            controllers: commit.header.controllers,
            model: commit.header.model,
            schema: commit.header.schema,
            family: commit.header.family,
            tags: commit.header.tags,
        })
    }
}
