use std::sync::Arc;

use base64::Engine as _;
use chrono::{DateTime, Utc};
use cid::Cid;
use tokio::sync::Notify;
use tracing::{instrument, warn};

use crate::anchor::{witness, AnchorIndex, AnchorService};
use crate::blockchain::BlockchainClient;
use crate::config::Config;
use crate::database::methods::DbMethods as _;
use crate::database::types::{RequestEntry, RequestStatus};
use crate::database::Database;
use crate::ipfs::IpldStore;
use crate::merkle::PathLine;
use crate::retry_tx;
use crate::server::data::{AnchorCommitContent, AnchorCommitView, CasResponse};
use crate::server::error::Error as ServerError;
use crate::stream_id::StreamId;

pub struct App {
    pub database: Arc<Database>,
    pub ipfs: Arc<dyn IpldStore>,
    pub anchor_service: AnchorService,
    pub config: Config,
    /// Nudges the anchor task when intake accepts a request.
    pub wake_anchor: Arc<Notify>,
}

impl App {
    /// Wires the app from its collaborators. Process-wide state (pool, block
    /// store, chain client) is created once by the caller and passed down;
    /// components hold what they need, nothing is looked up ambiently.
    #[instrument(name = "App::new", level = "debug", skip_all)]
    pub async fn new(
        config: Config,
        ipfs: Arc<dyn IpldStore>,
        blockchain: Arc<dyn BlockchainClient>,
        anchor_index: Option<Arc<dyn AnchorIndex>>,
    ) -> anyhow::Result<Arc<Self>> {
        config.validate()?;

        let database = Arc::new(Database::new(&config.database).await?);

        let anchor_service = AnchorService::new(
            database.clone(),
            ipfs.clone(),
            blockchain,
            anchor_index,
            config.clone(),
        );

        Ok(Arc::new(Self {
            database,
            ipfs,
            anchor_service,
            config,
            wake_anchor: Arc::new(Notify::new()),
        }))
    }

    /// Accepts an anchor request. Idempotent on `(stream_id, cid)`: while a
    /// non-terminal request for the pair is in flight, intake returns it
    /// instead of creating a new row. Once the pair reaches a terminal
    /// status, a resubmission queues a fresh PENDING request.
    #[instrument(level = "debug", skip(self))]
    pub async fn create_request(
        &self,
        stream_id: &str,
        cid: &str,
        timestamp: Option<DateTime<Utc>>,
        origin: Option<String>,
    ) -> Result<CasResponse, ServerError> {
        let parsed_stream: StreamId = stream_id
            .parse()
            .map_err(|_| ServerError::InvalidStreamId)?;
        let parsed_cid: Cid = cid.parse().map_err(|_| ServerError::InvalidCid)?;

        // Canonical text forms, in case the client used a different base.
        let stream_text = parsed_stream.to_string();
        let cid_text = parsed_cid.to_string();

        let origin = origin.as_deref();
        let entry = retry_tx!(self.database.pool, tx, {
            match tx.get_active_request(&stream_text, &cid_text).await? {
                Some(existing) => Ok(existing),
                None => {
                    tx.insert_request(&stream_text, &cid_text, timestamp, origin)
                        .await
                }
            }
        })
        .await?;

        self.wake_anchor.notify_one();

        self.response_for(entry).await
    }

    /// Current state of the newest request carrying `cid`.
    #[instrument(level = "debug", skip(self))]
    pub async fn request_status(&self, cid: &str) -> Result<CasResponse, ServerError> {
        let parsed: Cid = cid.parse().map_err(|_| ServerError::InvalidCid)?;

        let entry = self
            .database
            .pool
            .get_request_by_cid(&parsed.to_string())
            .await?
            .ok_or(ServerError::RequestNotFound)?;

        self.response_for(entry).await
    }

    /// Materializes the wire response; COMPLETED requests carry the anchor
    /// commit and, when the blocks are still available, the witness CAR.
    async fn response_for(&self, entry: RequestEntry) -> Result<CasResponse, ServerError> {
        let mut response = CasResponse {
            status: entry.status,
            stream_id: entry.stream_id.clone(),
            cid: entry.cid.clone(),
            message: entry.message.clone().unwrap_or_default(),
            anchor_commit: None,
            witness_car: None,
        };

        if entry.status != RequestStatus::Completed {
            return Ok(response);
        }

        let Some(anchor) = self.database.pool.get_anchor_for_request(entry.id).await? else {
            // COMPLETED without a row happens when a remote anchor was
            // accepted without a retrievable proof.
            return Ok(response);
        };

        let stream_id: StreamId = entry
            .stream_id
            .parse()
            .map_err(|e| ServerError::Other(anyhow::anyhow!("persisted stream id: {e}")))?;
        let path: PathLine = anchor
            .path
            .parse()
            .map_err(|e| ServerError::Other(anyhow::anyhow!("persisted path: {e}")))?;

        let commit = witness::encode_anchor_commit(&stream_id, &anchor)?;
        response.anchor_commit = Some(AnchorCommitView {
            cid: commit.0.to_string(),
            content: Some(AnchorCommitContent {
                path: Some(anchor.path.clone()),
                prev: anchor.cid.clone(),
                proof: Some(anchor.proof_cid.clone()),
            }),
        });

        match witness::witness_car(&*self.ipfs, commit, &path).await {
            Ok(car) => {
                response.witness_car =
                    Some(base64::engine::general_purpose::STANDARD.encode(car));
            }
            Err(e) => {
                // The anchor itself is proven on-chain; a missing block only
                // costs the inline witness.
                warn!(request = entry.id, error = %e, "witness car unavailable");
            }
        }

        Ok(response)
    }
}
