//! Functions custom handler invocation endpoints

use std::{any::Any, sync::Arc};

use axum::{
    body::Body,
    extract::{rejection::JsonRejection, State},
    http::{Response, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use super::errors::{ApiError, ErrorResponse};
use crate::domain::dispatch::{
    BlobReader, Consumed, DispatchPipeline, EmailDispatcher, TriggerEvent,
};

/// The queue trigger's input binding name
pub const QUEUE_BINDING: &str = "inputmsg";

/// The blob trigger's input binding name
pub const BLOB_BINDING: &str = "inputblob";

/// The request the Functions host sends for each trigger invocation
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct InvocationRequest {
    /// Input bindings by name
    #[serde(default)]
    pub data: Map<String, Value>,

    /// Trigger metadata, e.g. the queue message `Id` or the blob `name`
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl InvocationRequest {
    /// The raw content of an input binding. String bindings are used as-is;
    /// anything else the host already parsed is serialized back to JSON.
    fn binding(&self, name: &str) -> Result<Vec<u8>, ApiError> {
        match lookup(&self.data, name) {
            Some(Value::String(content)) => Ok(content.as_bytes().to_vec()),
            Some(Value::Null) | None => Err(ApiError::new_400(&format!(
                "Input binding \"{name}\" is missing"
            ))),
            Some(content) => Ok(content.to_string().into_bytes()),
        }
    }

    fn metadata(&self, name: &str) -> Option<String> {
        match lookup(&self.metadata, name)? {
            Value::String(s) => Some(s.trim_matches('"').to_string()),
            Value::Null => None,
            other => Some(other.to_string()),
        }
    }
}

/// The response returned to the Functions host
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct InvocationResponse {
    /// Output bindings; this handler has none
    pub outputs: Map<String, Value>,

    /// Log lines for the host; logging goes to stdout instead
    pub logs: Vec<String>,

    /// The function's return value
    pub return_value: Option<Value>,
}

/// Handles a queue trigger invocation
pub async fn queue_trigger<D: EmailDispatcher, B: BlobReader>(
    State(pipeline): State<Arc<DispatchPipeline<D, B>>>,
    request: Result<Json<InvocationRequest>, JsonRejection>,
) -> Result<Json<InvocationResponse>, ApiError> {
    let Json(request) = request?;

    let event = TriggerEvent::QueueMessage {
        id: request.metadata("Id"),
        body: request.binding(QUEUE_BINDING)?,
    };

    process(&pipeline, &event).await
}

/// Handles a blob trigger invocation
pub async fn blob_trigger<D: EmailDispatcher, B: BlobReader>(
    State(pipeline): State<Arc<DispatchPipeline<D, B>>>,
    request: Result<Json<InvocationRequest>, JsonRejection>,
) -> Result<Json<InvocationResponse>, ApiError> {
    let Json(request) = request?;

    let name = request
        .metadata("name")
        .or_else(|| request.metadata("BlobTrigger"))
        .unwrap_or_else(|| "(unnamed)".to_string());

    let event = TriggerEvent::BlobCreated {
        name,
        content: request.binding(BLOB_BINDING)?,
    };

    process(&pipeline, &event).await
}

async fn process<D: EmailDispatcher, B: BlobReader>(
    pipeline: &DispatchPipeline<D, B>,
    event: &TriggerEvent,
) -> Result<Json<InvocationResponse>, ApiError> {
    match pipeline.process(event).await? {
        Consumed::Sent(outcome) => {
            debug!(message_id = ?outcome.provider_message_id, "Invocation complete");
        }
        Consumed::Suppressed(reason) => {
            debug!(?reason, "Invocation complete, event dropped");
        }
    }

    Ok(Json(InvocationResponse::default()))
}

fn lookup<'a>(map: &'a Map<String, Value>, name: &str) -> Option<&'a Value> {
    map.get(name).or_else(|| {
        map.iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value)
    })
}

/// Catch panics and return a 500 error
pub fn panic_handler(err: Box<dyn Any + Send + 'static>) -> Response<Body> {
    let details = if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "Internal server error".to_string()
    };

    let error = ErrorResponse { error: details };

    let response = Json(error).into_response();

    (StatusCode::INTERNAL_SERVER_ERROR, response).into_response()
}
