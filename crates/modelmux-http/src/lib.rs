//! Downstream HTTP surface for modelmux.
//!
//! Thin by design: handlers authenticate the caller, lift the model name and
//! stream flag out of the body, and hand raw bytes to the execution core.
//! Responses are written back verbatim; failures become the dialect's error
//! envelope with the core's status and headers applied.

pub mod access;
pub mod envelope;
pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::post;

use modelmux_core::Pipeline;

use crate::access::AccessControl;

pub struct HttpState {
    pub pipeline: Arc<Pipeline>,
    pub access: AccessControl,
    /// Enables response-body capture into the request log.
    pub request_log: bool,
}

pub fn http_router(state: Arc<HttpState>) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(handlers::openai_chat))
        .route("/v1/responses", post(handlers::openai_responses))
        .route("/v1/messages", post(handlers::claude_messages))
        .route(
            "/v1/messages/count_tokens",
            post(handlers::claude_count_tokens),
        )
        .route(
            "/v1beta/models/{model_action}",
            post(handlers::gemini_action),
        )
        .with_state(state)
}
