use serde::{Deserialize, Serialize};

use crate::database::types::RequestStatus;

/// Body of `POST /requests`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(deny_unknown_fields)]
pub struct CreateRequestPayload {
    pub stream_id: String,
    pub cid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
}

/// Wire form of a request's state; the anchor fields appear once the request
/// is COMPLETED.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CasResponse {
    pub status: RequestStatus,
    pub stream_id: String,
    pub cid: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anchor_commit: Option<AnchorCommitView>,
    /// Base64 CAR bytes proving the commit's inclusion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub witness_car: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnchorCommitView {
    pub cid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<AnchorCommitContent>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnchorCommitContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub prev: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proof: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_response_round_trips() {
        let response = CasResponse {
            status: RequestStatus::Pending,
            stream_id: "k2t6wz4yhfp1r5p".to_string(),
            cid: "bafyreib".to_string(),
            message: String::new(),
            anchor_commit: None,
            witness_car: None,
        };

        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["status"], "PENDING");
        assert_eq!(json["streamId"], "k2t6wz4yhfp1r5p");
        assert!(json.get("anchorCommit").is_none());

        let back: CasResponse = serde_json::from_value(json).unwrap();
        assert_eq!(back, response);
    }

    #[test]
    fn completed_response_round_trips() {
        let response = CasResponse {
            status: RequestStatus::Completed,
            stream_id: "k2t6wz4yhfp1r5p".to_string(),
            cid: "bafyreib".to_string(),
            message: "CID successfully anchored".to_string(),
            anchor_commit: Some(AnchorCommitView {
                cid: "bafyreic".to_string(),
                content: Some(AnchorCommitContent {
                    path: Some("0/1".to_string()),
                    prev: "bafyreib".to_string(),
                    proof: Some("bafyreid".to_string()),
                }),
            }),
            witness_car: Some("OqJlcm9vdHM=".to_string()),
        };

        let json = serde_json::to_string(&response).unwrap();
        let back: CasResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(back, response);
    }

    #[test]
    fn payload_rejects_unknown_fields() {
        let err = serde_json::from_str::<CreateRequestPayload>(
            r#"{"streamId": "k2t6", "cid": "bafy", "docId": "nope"}"#,
        );
        assert!(err.is_err());
    }

    #[test]
    fn payload_accepts_optional_fields() {
        let payload: CreateRequestPayload = serde_json::from_str(
            r#"{"streamId": "k2t6", "cid": "bafy", "timestamp": "2024-05-01T12:00:00Z", "origin": "10.0.0.1"}"#,
        )
        .unwrap();
        assert!(payload.timestamp.is_some());
        assert_eq!(payload.origin.as_deref(), Some("10.0.0.1"));
    }
}
