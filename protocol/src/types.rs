use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Participant id used for the synthetic per-round global model entry.
/// Contains `_`, so it can never collide with a real participant id.
pub const GLOBAL_MODEL_ID: &str = "GLOBAL_MODEL";

/// Scores of a model against a labelled dataset
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub accuracy: f64,
    pub loss: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
}

impl Metrics {
    /// Recorded when an artifact could not be scored at all.
    pub fn unscored() -> Self {
        Self {
            accuracy: 0.0,
            loss: 99.9,
            precision: 0.0,
            recall: 0.0,
            f1: 0.0,
        }
    }
}

/// One row of `GET /metrics`: a participant contribution or a global model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricRecord {
    pub round: u64,
    pub participant: String,
    #[serde(default)]
    pub verified: bool,
    #[serde(default)]
    pub paid: bool,
    /// Participant-reported accuracy; server-measured for the global model
    pub accuracy: f64,
    pub loss: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    /// Accuracy measured by the coordinator on its held-out set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_accuracy: Option<f64>,
    pub recorded_at: DateTime<Utc>,
}

impl MetricRecord {
    pub fn contribution(round: u64, participant: &str, reported_accuracy: f64, scored: Metrics) -> Self {
        Self {
            round,
            participant: participant.to_string(),
            verified: false,
            paid: false,
            accuracy: reported_accuracy,
            loss: scored.loss,
            precision: scored.precision,
            recall: scored.recall,
            f1: scored.f1,
            server_accuracy: Some(scored.accuracy),
            recorded_at: Utc::now(),
        }
    }

    pub fn global(round: u64, scored: Metrics) -> Self {
        Self {
            round,
            participant: GLOBAL_MODEL_ID.to_string(),
            verified: false,
            paid: false,
            accuracy: scored.accuracy,
            loss: scored.loss,
            precision: scored.precision,
            recall: scored.recall,
            f1: scored.f1,
            server_accuracy: None,
            recorded_at: Utc::now(),
        }
    }

    pub fn is_global(&self) -> bool {
        self.participant == GLOBAL_MODEL_ID
    }
}

/// Read-only snapshot returned by `GET /status`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundStatus {
    pub training_active: bool,
    #[serde(default)]
    pub finished: bool,
    pub current_round: u64,
    pub target_round: u64,
    pub expected_participants: usize,
    pub received_this_round: usize,
    #[serde(default)]
    pub verified_this_round: usize,
    #[serde(default)]
    pub aggregated_rounds: Vec<u64>,
}

// --- Request/response types ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyRequest {
    #[serde(alias = "participant")]
    pub participant_address: String,
    pub round: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyOutcome {
    Inactive,
    Ignored,
    AlreadyAggregated,
    Verified,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyResponse {
    pub status: VerifyOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartResponse {
    pub status: String,
    pub start_round: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadAck {
    pub message: String,
}

pub const PENDING_VERIFICATION: &str = "Pending Blockchain Verification";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verify_outcome_wire_names() {
        let json = serde_json::to_string(&VerifyResponse { status: VerifyOutcome::AlreadyAggregated }).unwrap();
        assert_eq!(json, r#"{"status":"already_aggregated"}"#);
    }

    #[test]
    fn test_verify_request_accepts_short_field() {
        let req: VerifyRequest = serde_json::from_str(r#"{"participant":"0xabc","round":4}"#).unwrap();
        assert_eq!(req.participant_address, "0xabc");
        assert_eq!(req.round, 4);
    }

    #[test]
    fn test_global_record_is_flagged() {
        let rec = MetricRecord::global(3, Metrics::unscored());
        assert!(rec.is_global());
        assert!(!MetricRecord::contribution(3, "0xabc", 0.8, Metrics::unscored()).is_global());
    }
}
