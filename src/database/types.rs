use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, Row};
use thiserror::Error;

use crate::metadata::GenesisFields;

#[derive(Debug, Error)]
#[error("unknown request status: {0}")]
pub struct UnknownStatus(pub String);

/// Lifecycle of an anchor request.
///
/// ```text
/// PENDING -> READY -> PROCESSING -> COMPLETED | FAILED
/// PENDING | READY | PROCESSING  -> REPLACED   (newer commit for the stream)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RequestStatus {
    Pending,
    Ready,
    Processing,
    Completed,
    Failed,
    Replaced,
}

impl RequestStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Replaced)
    }
}

impl From<RequestStatus> for &str {
    fn from(status: RequestStatus) -> Self {
        match status {
            RequestStatus::Pending => "PENDING",
            RequestStatus::Ready => "READY",
            RequestStatus::Processing => "PROCESSING",
            RequestStatus::Completed => "COMPLETED",
            RequestStatus::Failed => "FAILED",
            RequestStatus::Replaced => "REPLACED",
        }
    }
}

impl FromStr for RequestStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "READY" => Ok(Self::Ready),
            "PROCESSING" => Ok(Self::Processing),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            "REPLACED" => Ok(Self::Replaced),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RequestEntry {
    pub id: i64,
    pub stream_id: String,
    pub cid: String,
    pub status: RequestStatus,
    pub message: Option<String>,
    pub pinned: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Client-asserted event time, not trusted for ordering.
    pub timestamp: Option<DateTime<Utc>>,
    pub origin: Option<String>,
    pub scheduler_id: Option<String>,
}

impl FromRow<'_, PgRow> for RequestEntry {
    fn from_row(row: &PgRow) -> sqlx::Result<Self> {
        let status: &str = row.try_get("status")?;
        let status = status
            .parse()
            .map_err(|e: UnknownStatus| sqlx::Error::ColumnDecode {
                index: "status".into(),
                source: Box::new(e),
            })?;

        Ok(Self {
            id: row.try_get("id")?,
            stream_id: row.try_get("stream_id")?,
            cid: row.try_get("cid")?,
            status,
            message: row.try_get("message")?,
            pinned: row.try_get("pinned")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            timestamp: row.try_get("timestamp")?,
            origin: row.try_get("origin")?,
            scheduler_id: row.try_get("scheduler_id")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct AnchorEntry {
    pub id: i64,
    pub request_id: i64,
    /// Slash-joined bit path from the Merkle root to this request's leaf.
    pub path: String,
    /// The commit CID witnessed by the anchor; for replaced requests this is
    /// the superseding tip, not the request's own CID.
    pub cid: String,
    /// CID of the batch-wide proof block.
    pub proof_cid: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct MetadataEntry {
    pub stream_id: String,
    pub metadata: sqlx::types::Json<GenesisFields>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub used_at: DateTime<Utc>,
}
