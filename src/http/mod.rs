//! HTTP ingress.
//!
//! Thin handlers over the [`ControlPlane`]: every request maps onto one
//! bridge or pool operation.

use crate::bridge::ReadPath;
use crate::engine::ControlPlane;
use crate::error::Error;
use crate::model::Message;
use crate::model::job::Job;
use axum::Router;
use axum::body::Bytes;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Body of `POST /message`.
#[derive(Debug, Deserialize)]
pub struct NewMessage {
    #[serde(default, alias = "UID")]
    pub uid: Option<String>,
    #[serde(alias = "Message")]
    pub message: String,
}

pub fn router(control: Arc<ControlPlane>) -> Router {
    Router::new()
        .route("/pushdata", post(push_data))
        .route("/message", post(post_message))
        .route("/getdata", get(get_data))
        .route("/messages", get(list_messages))
        .route("/message/{uid}", get(get_message))
        .route("/process", post(process))
        .route("/health", get(health))
        .with_state(control)
}

fn failure(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({ "error": message.into() }))).into_response()
}

async fn publish(control: &ControlPlane, message: Message) -> Response {
    match control.bridge().submit(&message).await {
        Ok(key) => (
            StatusCode::OK,
            Json(serde_json::json!({ "uid": message.uid, "key": key })),
        )
            .into_response(),
        Err(e) => {
            error!(uid = %message.uid, error = %e, "publish failed");
            failure(StatusCode::INTERNAL_SERVER_ERROR, "failed to publish message")
        }
    }
}

/// Raw body in, new message with a generated uid out.
async fn push_data(State(control): State<Arc<ControlPlane>>, body: Bytes) -> Response {
    let text = match String::from_utf8(body.to_vec()) {
        Ok(text) => text,
        Err(_) => {
            warn!("rejected non-UTF-8 body");
            return failure(StatusCode::BAD_REQUEST, "body must be UTF-8 text");
        }
    };
    publish(&control, Message::generated(text)).await
}

async fn post_message(
    State(control): State<Arc<ControlPlane>>,
    body: Result<Json<NewMessage>, JsonRejection>,
) -> Response {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => {
            warn!(error = %rejection, "rejected malformed message");
            return failure(StatusCode::BAD_REQUEST, rejection.body_text());
        }
    };
    let message = match body.uid {
        Some(uid) if !uid.is_empty() => Message::new(uid, body.message),
        _ => Message::generated(body.message),
    };
    publish(&control, message).await
}

async fn get_data(State(control): State<Arc<ControlPlane>>) -> Response {
    match control.read_path() {
        ReadPath::Republish => match control.bridge().republish_all().await {
            Ok(republish) => (
                StatusCode::OK,
                format!("republishing {} records", republish.keys),
            )
                .into_response(),
            Err(_) => failure(StatusCode::INTERNAL_SERVER_ERROR, "failed to read cached keys"),
        },
        ReadPath::List => list(&control).await,
    }
}

async fn list_messages(State(control): State<Arc<ControlPlane>>) -> Response {
    list(&control).await
}

async fn list(control: &ControlPlane) -> Response {
    match control.bridge().list().await {
        Ok(messages) => (StatusCode::OK, Json(messages)).into_response(),
        Err(e) => {
            error!(error = %e, "failed to list cached messages");
            failure(StatusCode::INTERNAL_SERVER_ERROR, "failed to read cached messages")
        }
    }
}

async fn get_message(
    State(control): State<Arc<ControlPlane>>,
    Path(uid): Path<String>,
) -> Response {
    match control.bridge().get(&Message::key_for(&uid)).await {
        Ok(Some(message)) => (StatusCode::OK, Json(message)).into_response(),
        Ok(None) => failure(StatusCode::NOT_FOUND, format!("no message with uid {uid}")),
        Err(Error::Malformed(detail)) => {
            error!(%uid, %detail, "cached message is malformed");
            failure(StatusCode::INTERNAL_SERVER_ERROR, "cached message is malformed")
        }
        Err(e) => {
            error!(%uid, error = %e, "failed to read cached message");
            failure(StatusCode::INTERNAL_SERVER_ERROR, "failed to read cached message")
        }
    }
}

/// Queue one unit of work and answer immediately, whether or not the
/// queue has room yet.
async fn process(State(control): State<Arc<ControlPlane>>) -> Response {
    let job = Job::bare();
    info!(job = %job.id, "job submitted");
    control.pool().submit_detached(job);
    (StatusCode::OK, "job queued").into_response()
}

async fn health(State(control): State<Arc<ControlPlane>>) -> Response {
    let pool = control.pool().stats();
    let publisher = control.bridge().publisher().stats();
    let subscriber = control.subscriber_stats().await;

    Json(serde_json::json!({
        "status": "ok",
        "pool": {
            "state": pool.state,
            "active": pool.active,
            "submitted": pool.submitted,
            "rejected": pool.rejected,
            "executed": pool.executed,
            "panicked": pool.panicked,
        },
        "publisher": {
            "mode": control.bridge().publisher().mode(),
            "accepted": publisher.accepted,
            "delivered": publisher.delivered,
            "failed": publisher.failed,
        },
        "subscriber": subscriber.map(|s| serde_json::json!({
            "position": s.position,
            "applied": s.applied,
            "skipped": s.skipped,
        })),
    }))
    .into_response()
}
