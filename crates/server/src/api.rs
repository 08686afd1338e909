//! HTTP API used by the bridge and by dashboards without a channel.
//!
//! Bodies are taken as raw bytes and parsed here, so malformed JSON always
//! answers `400 {error}` before the dispatcher sees anything.

use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use colony_protocol::{AgentUpdate, Colony, CommandRequest, CommandResult};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::colony::ColonyError;
use crate::dispatcher::{DispatchError, DispatcherHandle};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid request body: {0}")]
    InvalidBody(#[from] serde_json::Error),

    #[error(transparent)]
    Rejected(ColonyError),

    #[error("dispatcher is not running")]
    Unavailable,
}

impl From<DispatchError> for ApiError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::Closed => ApiError::Unavailable,
            DispatchError::Colony(e) => ApiError::Rejected(e),
        }
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidBody(_) | ApiError::Rejected(_) => StatusCode::BAD_REQUEST,
            ApiError::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        warn!(
            component = "api",
            event = "api.request.rejected",
            status = status.as_u16(),
            error = %self,
            "Request rejected"
        );
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

pub fn router(dispatcher: DispatcherHandle) -> Router {
    Router::new()
        .route("/api/update", post(post_update))
        .route("/api/status", get(get_status))
        .route("/api/turtles", get(get_turtles))
        .route("/api/commands", get(get_commands))
        .route("/api/command", post(post_command))
        .route("/api/command-result", post(post_command_result))
        .route("/health", get(health_handler))
        .with_state(dispatcher)
}

fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, ApiError> {
    Ok(serde_json::from_slice(body)?)
}

fn success() -> Json<Value> {
    Json(json!({ "success": true }))
}

async fn post_update(State(dispatcher): State<DispatcherHandle>, body: Bytes) -> ApiResult<Value> {
    let update: AgentUpdate = parse_body(&body)?;
    if let AgentUpdate::Unknown = update {
        debug!(
            component = "api",
            event = "api.update.unknown_type",
            payload_bytes = body.len(),
            "Accepted update with unrecognized type"
        );
    }
    dispatcher.apply_update(update).await?;
    Ok(success())
}

async fn get_status(State(dispatcher): State<DispatcherHandle>) -> ApiResult<Colony> {
    Ok(Json(dispatcher.snapshot().await?))
}

async fn get_turtles(State(dispatcher): State<DispatcherHandle>) -> ApiResult<Value> {
    let turtles = dispatcher.turtles().await?;
    Ok(Json(json!({ "turtles": turtles })))
}

async fn get_commands(State(dispatcher): State<DispatcherHandle>) -> ApiResult<Value> {
    let commands = dispatcher.poll_pending().await?;
    Ok(Json(json!({ "commands": commands })))
}

async fn post_command(State(dispatcher): State<DispatcherHandle>, body: Bytes) -> ApiResult<Value> {
    let request: CommandRequest = parse_body(&body)?;
    dispatcher.enqueue(request).await?;
    Ok(success())
}

async fn post_command_result(
    State(dispatcher): State<DispatcherHandle>,
    body: Bytes,
) -> ApiResult<Value> {
    let result: CommandResult = parse_body(&body)?;
    dispatcher.report_result(result).await?;
    Ok(success())
}

async fn health_handler() -> impl IntoResponse {
    "OK"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::DispatchSettings;
    use std::time::Duration;

    fn spawn_dispatcher() -> DispatcherHandle {
        DispatcherHandle::spawn(DispatchSettings {
            colony_name: "Genesis".to_string(),
            stale_after: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(30),
            command_lease: None,
        })
    }

    fn body(value: Value) -> Bytes {
        Bytes::from(value.to_string())
    }

    fn status_of(result: ApiResult<Value>) -> StatusCode {
        match result {
            Ok(json) => json.into_response().status(),
            Err(e) => e.into_response().status(),
        }
    }

    #[tokio::test]
    async fn heartbeat_then_status_shows_turtle() {
        let dispatcher = spawn_dispatcher();
        let Json(reply) = post_update(
            State(dispatcher.clone()),
            body(json!({
                "type": "heartbeat",
                "turtle": {"id": "t1", "label": "Bob", "position": {"x": 1, "y": 2, "z": 3}, "fuel": 500}
            })),
        )
        .await
        .unwrap();
        assert_eq!(reply, json!({"success": true}));

        let Json(colony) = get_status(State(dispatcher.clone())).await.unwrap();
        assert_eq!(colony.turtles["t1"].label, "Bob");
        assert_eq!(colony.stats.total_turtles_born, 1);
        assert_eq!(colony.events[0].kind, "birth");

        let Json(listing) = get_turtles(State(dispatcher)).await.unwrap();
        assert_eq!(listing["turtles"][0]["id"], "t1");
        assert_eq!(listing["turtles"][0]["fuelLimit"], 20000);
    }

    #[tokio::test]
    async fn malformed_json_is_rejected_without_mutation() {
        let dispatcher = spawn_dispatcher();

        let result = post_update(State(dispatcher.clone()), Bytes::from_static(b"{oops")).await;
        assert_eq!(status_of(result), StatusCode::BAD_REQUEST);
        let result = post_command(State(dispatcher.clone()), Bytes::from_static(b"[]")).await;
        assert_eq!(status_of(result), StatusCode::BAD_REQUEST);
        let result =
            post_update(State(dispatcher.clone()), body(json!({"type": "heartbeat"}))).await;
        assert_eq!(status_of(result), StatusCode::BAD_REQUEST);

        let Json(colony) = get_status(State(dispatcher.clone())).await.unwrap();
        assert!(colony.turtles.is_empty());
        assert!(colony.events.is_empty());
        assert!(dispatcher.poll_pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_update_type_is_accepted() {
        let dispatcher = spawn_dispatcher();
        let result = post_update(State(dispatcher), body(json!({"type": "telemetry", "x": 1}))).await;
        assert_eq!(status_of(result), StatusCode::OK);
    }

    #[tokio::test]
    async fn non_numeric_stats_are_rejected() {
        let dispatcher = spawn_dispatcher();
        let result = post_update(
            State(dispatcher.clone()),
            body(json!({"type": "stats", "stats": {"totalBlocksMined": "many"}})),
        )
        .await;
        assert_eq!(status_of(result), StatusCode::BAD_REQUEST);

        post_update(
            State(dispatcher.clone()),
            body(json!({"type": "stats", "stats": {"totalBlocksMined": 12}})),
        )
        .await
        .unwrap();
        let Json(colony) = get_status(State(dispatcher)).await.unwrap();
        assert_eq!(colony.stats.total_blocks_mined, 12);
    }

    #[tokio::test]
    async fn command_lifecycle_over_http() {
        let dispatcher = spawn_dispatcher();
        post_command(
            State(dispatcher.clone()),
            body(json!({"targetId": "all", "command": "refuel", "args": {}})),
        )
        .await
        .unwrap();

        let Json(first) = get_commands(State(dispatcher.clone())).await.unwrap();
        assert_eq!(first["commands"][0]["id"], 1);
        assert_eq!(first["commands"][0]["status"], "sent");
        let Json(second) = get_commands(State(dispatcher.clone())).await.unwrap();
        assert_eq!(second["commands"], json!([]));

        let result = post_command_result(
            State(dispatcher.clone()),
            body(json!({"commandId": 1, "success": true, "message": "refueled"})),
        )
        .await;
        assert_eq!(status_of(result), StatusCode::OK);

        let unknown = post_command_result(
            State(dispatcher.clone()),
            body(json!({"commandId": 99, "success": true})),
        )
        .await;
        assert_eq!(status_of(unknown), StatusCode::OK);

        let Json(colony) = get_status(State(dispatcher)).await.unwrap();
        let messages: Vec<&str> = colony.events.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(
            messages,
            vec![
                "Command completed",
                "Command completed: refueled",
                "Command sent: refuel to all turtles",
            ]
        );
    }

    #[tokio::test]
    async fn heartbeat_then_targeted_command_is_polled_once() {
        let dispatcher = spawn_dispatcher();
        post_update(
            State(dispatcher.clone()),
            body(json!({
                "type": "heartbeat",
                "turtle": {
                    "id": "t1", "label": "Bob", "position": {"x": 1, "y": 2, "z": 3},
                    "fuel": 500, "fuelLimit": 20000
                }
            })),
        )
        .await
        .unwrap();

        let Json(colony) = get_status(State(dispatcher.clone())).await.unwrap();
        assert!(colony.turtles["t1"].last_seen > 0);
        assert!(colony.events.iter().any(|e| e.kind == "birth"));

        post_command(
            State(dispatcher.clone()),
            body(json!({"targetId": "t1", "command": "forward"})),
        )
        .await
        .unwrap();
        let Json(first) = get_commands(State(dispatcher.clone())).await.unwrap();
        assert_eq!(first["commands"].as_array().map(Vec::len), Some(1));
        assert_eq!(first["commands"][0]["id"], 1);
        assert_eq!(first["commands"][0]["targetId"], "t1");
        assert_eq!(first["commands"][0]["status"], "sent");

        let Json(second) = get_commands(State(dispatcher)).await.unwrap();
        assert_eq!(second["commands"], json!([]));
    }

    #[tokio::test]
    async fn unlimited_fuel_heartbeat_registers_turtle() {
        let dispatcher = spawn_dispatcher();
        let result = post_update(
            State(dispatcher.clone()),
            body(json!({"type": "heartbeat", "turtle": {"id": 5, "fuel": "unlimited"}})),
        )
        .await;
        assert_eq!(status_of(result), StatusCode::OK);

        let Json(listing) = get_turtles(State(dispatcher)).await.unwrap();
        assert_eq!(listing["turtles"][0]["id"], "5");
        assert_eq!(listing["turtles"][0]["fuel"], "unlimited");
    }

    #[tokio::test]
    async fn string_result_id_is_accepted_and_broadcast() {
        let dispatcher = spawn_dispatcher();
        post_command(
            State(dispatcher.clone()),
            body(json!({"targetId": "7", "command": "dig"})),
        )
        .await
        .unwrap();
        get_commands(State(dispatcher.clone())).await.unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::channel(16);
        dispatcher.connect(900, tx).await.unwrap();
        rx.recv().await.unwrap();

        let result = post_command_result(
            State(dispatcher.clone()),
            body(json!({"commandId": "1", "success": true, "message": "done"})),
        )
        .await;
        assert_eq!(status_of(result), StatusCode::OK);

        let mut decoder = crate::frame::FrameDecoder::new(1 << 20);
        decoder.extend(&rx.recv().await.unwrap());
        decoder.extend(&rx.recv().await.unwrap());
        let mut broadcast = Vec::new();
        while let Some(crate::frame::Inbound::Text(text)) = decoder.next_message().unwrap() {
            broadcast.push(serde_json::from_str::<Value>(&text).unwrap());
        }
        assert_eq!(broadcast[0]["data"]["message"], "Command completed: done");
        assert_eq!(broadcast[1]["type"], "command_result");
        assert_eq!(broadcast[1]["data"]["commandId"], "1");

        // A string id never matches, so the queued command is untouched
        let Json(colony) = get_status(State(dispatcher)).await.unwrap();
        assert_eq!(colony.events[0].message, "Command completed: done");
    }

    #[test]
    fn closed_dispatcher_maps_to_503() {
        let response = ApiError::from(DispatchError::Closed).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
