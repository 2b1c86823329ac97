use axum::{
    extract::{DefaultBodyLimit, Multipart, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use ledgerfl_protocol::{
    MetricRecord, RoundStatus, StartResponse, UploadAck, VerifyRequest, VerifyResponse, PENDING_VERIFICATION,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::services::ServeDir;

use crate::coordinator::CoordinatorError;
use crate::state::AppState;

pub fn create_router(state: Arc<AppState>, max_upload_bytes: usize) -> Router {
    let static_dir = state.coordinator.store().static_dir().to_path_buf();
    Router::new()
        .route("/status", get(status))
        .route("/control/start_auto", post(start_auto))
        .route("/control/stop", post(stop))
        .route("/upload", post(upload))
        .route("/webhook/verify_contribution", post(verify_contribution))
        .route("/metrics", get(metrics))
        .nest_service("/static", ServeDir::new(static_dir))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(max_upload_bytes))
        .with_state(state)
}

pub struct ApiError(StatusCode, String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(json!({ "status": "error", "message": self.1 }))).into_response()
    }
}

impl From<CoordinatorError> for ApiError {
    fn from(e: CoordinatorError) -> Self {
        let code = match &e {
            CoordinatorError::Inactive => StatusCode::FORBIDDEN,
            CoordinatorError::AlreadyActive => StatusCode::CONFLICT,
            CoordinatorError::InvalidRequest(_) | CoordinatorError::InvalidParticipant(_) => StatusCode::BAD_REQUEST,
            CoordinatorError::LedgerSync(_) => StatusCode::BAD_GATEWAY,
            CoordinatorError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError(code, e.to_string())
    }
}

fn bad_request(message: impl Into<String>) -> ApiError {
    ApiError(StatusCode::BAD_REQUEST, message.into())
}

fn check_auth(expected: Option<&str>, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = expected else {
        return Ok(());
    };
    let provided = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    match provided {
        Some(token) if token == expected => Ok(()),
        _ => Err(ApiError(StatusCode::UNAUTHORIZED, "missing or invalid bearer token".into())),
    }
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    #[serde(flatten)]
    round: RoundStatus,
    uptime_secs: i64,
}

async fn status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        round: state.coordinator.status().await,
        uptime_secs: (Utc::now() - state.start_time).num_seconds(),
    })
}

#[derive(Debug, Deserialize)]
struct StartParams {
    #[serde(default = "default_rounds")]
    rounds: u64,
    #[serde(default = "default_participants")]
    participants: usize,
}

fn default_rounds() -> u64 { 3 }
fn default_participants() -> usize { 2 }

async fn start_auto(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<StartParams>,
) -> Result<Json<StartResponse>, ApiError> {
    check_auth(state.control_token.as_deref(), &headers)?;
    let start_round = state.coordinator.start_auto(params.rounds, params.participants).await?;
    Ok(Json(StartResponse { status: "started".into(), start_round }))
}

async fn stop(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Result<Json<serde_json::Value>, ApiError> {
    check_auth(state.control_token.as_deref(), &headers)?;
    state.coordinator.stop().await;
    Ok(Json(json!({ "status": "stopped" })))
}

async fn upload(State(state): State<Arc<AppState>>, mut multipart: Multipart) -> Result<Json<UploadAck>, ApiError> {
    let mut participant = None;
    let mut accuracy = None;
    let mut artifact = None;

    while let Some(field) = multipart.next_field().await.map_err(|e| bad_request(e.body_text()))? {
        match field.name() {
            Some("participant_address") | Some("participant") => {
                participant = Some(field.text().await.map_err(|e| bad_request(e.body_text()))?);
            }
            Some("accuracy") => {
                let raw = field.text().await.map_err(|e| bad_request(e.body_text()))?;
                let value = raw
                    .trim()
                    .parse::<f64>()
                    .map_err(|_| bad_request(format!("accuracy '{raw}' is not a number")))?;
                accuracy = Some(value);
            }
            Some("file") | Some("artifact") => {
                artifact = Some(field.bytes().await.map_err(|e| bad_request(e.body_text()))?);
            }
            _ => {}
        }
    }

    let participant = participant.ok_or_else(|| bad_request("missing field: participant_address"))?;
    let artifact = artifact.ok_or_else(|| bad_request("missing field: file"))?;
    let accuracy = accuracy.ok_or_else(|| bad_request("missing field: accuracy"))?;

    state.coordinator.upload(participant.trim(), accuracy, &artifact).await?;
    Ok(Json(UploadAck { message: PENDING_VERIFICATION.into() }))
}

async fn verify_contribution(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<VerifyRequest>,
) -> Result<Json<VerifyResponse>, ApiError> {
    check_auth(state.webhook_token.as_deref(), &headers)?;
    let status = state.coordinator.verify_contribution(&req.participant_address, req.round).await;
    Ok(Json(VerifyResponse { status }))
}

async fn metrics(State(state): State<Arc<AppState>>) -> Json<Vec<MetricRecord>> {
    Json(state.coordinator.metrics().await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::Coordinator;
    use crate::storage::ArtifactStore;
    use axum::body::Body;
    use axum::http::Request;
    use ledgerfl_protocol::ledger::MemoryLedger;
    use ledgerfl_protocol::{ModelParams, ReferenceEvaluator, VerifyOutcome};
    use tower::ServiceExt;

    const BOUNDARY: &str = "ledgerflboundary";

    async fn app(dir: &std::path::Path, ledger: &MemoryLedger, webhook_token: Option<&str>) -> Router {
        let store = ArtifactStore::open(dir.join("artifacts"), dir.join("static")).await.unwrap();
        let coordinator = Coordinator::new(
            Arc::new(ledger.clone()),
            store,
            Arc::new(ReferenceEvaluator::empty()),
            dir.to_path_buf(),
        );
        let state = AppState::new(coordinator, None, webhook_token.map(String::from));
        create_router(state, 1024 * 1024)
    }

    fn multipart_upload(participant: &str, accuracy: &str, artifact: &[u8]) -> Request<Body> {
        let mut body = Vec::new();
        for (name, value) in [("participant_address", participant), ("accuracy", accuracy)] {
            body.extend_from_slice(
                format!("--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n").as_bytes(),
            );
        }
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"model.json\"\r\n\
                 Content-Type: application/json\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(artifact);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

        Request::post("/upload")
            .header("content-type", format!("multipart/form-data; boundary={BOUNDARY}"))
            .body(Body::from(body))
            .unwrap()
    }

    fn verify(participant: &str, round: u64, token: Option<&str>) -> Request<Body> {
        let mut req = Request::post("/webhook/verify_contribution").header("content-type", "application/json");
        if let Some(t) = token {
            req = req.header("authorization", format!("Bearer {t}"));
        }
        let body = json!({ "participant_address": participant, "round": round }).to_string();
        req.body(Body::from(body)).unwrap()
    }

    async fn json_body(resp: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn artifact() -> Vec<u8> {
        ModelParams {
            coefficients: vec![vec![0.5, -0.5]],
            intercepts: vec![0.1],
            classes: vec![0, 1],
            feature_names: vec!["a".into(), "b".into()],
        }
        .to_json()
        .unwrap()
    }

    #[tokio::test]
    async fn test_upload_rejected_while_inactive() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path(), &MemoryLedger::new("coordinator"), None).await;

        let resp = app.oneshot(multipart_upload("0xaaa", "0.9", &artifact())).await.unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        let body = json_body(resp).await;
        assert_eq!(body["status"], "error");
    }

    #[tokio::test]
    async fn test_session_over_http() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = MemoryLedger::at_round(4, "coordinator");
        let app = app(dir.path(), &ledger, Some("bot-secret")).await;

        let resp = app
            .clone()
            .oneshot(Request::post("/control/start_auto?rounds=2&participants=1").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["status"], "started");
        assert_eq!(body["start_round"], 5);

        let resp = app.clone().oneshot(multipart_upload("0xaaa", "0.75", &artifact())).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await["message"], PENDING_VERIFICATION);

        let resp = app.clone().oneshot(verify("0xaaa", 5, None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = app.clone().oneshot(verify("0xaaa", 5, Some("bot-secret"))).await.unwrap();
        let body: VerifyResponse = serde_json::from_value(json_body(resp).await).unwrap();
        assert_eq!(body.status, VerifyOutcome::Verified);

        let resp = app.clone().oneshot(Request::get("/status").body(Body::empty()).unwrap()).await.unwrap();
        let status: RoundStatus = serde_json::from_value(json_body(resp).await).unwrap();
        assert!(status.training_active);
        assert_eq!(status.current_round, 6);

        let resp = app.clone().oneshot(Request::get("/metrics").body(Body::empty()).unwrap()).await.unwrap();
        let metrics: Vec<MetricRecord> = serde_json::from_value(json_body(resp).await).unwrap();
        assert_eq!(metrics.len(), 2);
        assert!(metrics[1].is_global());
        assert_eq!(metrics[1].round, 5);

        let resp = app
            .clone()
            .oneshot(Request::get("/static/global_model_round_5.json").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = app.oneshot(Request::post("/control/stop").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(json_body(resp).await["status"], "stopped");
    }

    #[tokio::test]
    async fn test_start_auto_ledger_failure_is_bad_gateway() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = MemoryLedger::new("coordinator");
        ledger.fail_round_starts(1);
        let app = app(dir.path(), &ledger, None).await;

        let resp = app
            .oneshot(Request::post("/control/start_auto?rounds=1&participants=1").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_upload_requires_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path(), &MemoryLedger::new("coordinator"), None).await;

        let body = format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"participant_address\"\r\n\r\n0xaaa\r\n--{BOUNDARY}--\r\n"
        );
        let req = Request::post("/upload")
            .header("content-type", format!("multipart/form-data; boundary={BOUNDARY}"))
            .body(Body::from(body))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_upload_requires_accuracy() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = MemoryLedger::new("coordinator");
        let app = app(dir.path(), &ledger, None).await;
        let resp = app
            .clone()
            .oneshot(Request::post("/control/start_auto?rounds=1&participants=1").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let mut body = format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"participant_address\"\r\n\r\n0xaaa\r\n\
             --{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"model.json\"\r\n\r\n"
        )
        .into_bytes();
        body.extend_from_slice(&artifact());
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
        let req = Request::post("/upload")
            .header("content-type", format!("multipart/form-data; boundary={BOUNDARY}"))
            .body(Body::from(body))
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(json_body(resp).await.to_string().contains("accuracy"));

        let resp = app.oneshot(Request::get("/metrics").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(json_body(resp).await, json!([]));
    }

    #[tokio::test]
    async fn test_webhook_accepts_legacy_field_name() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path(), &MemoryLedger::new("coordinator"), None).await;

        let req = Request::post("/webhook/verify_contribution")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"participant":"0xaaa","round":1}"#))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(json_body(resp).await["status"], "inactive");
    }
}
