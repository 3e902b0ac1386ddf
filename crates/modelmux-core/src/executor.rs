use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::auth::{Auth, Metadata};
use crate::error::CallError;

/// The request/response dialect spoken by a downstream caller.
///
/// The execution core never interprets payload bytes; this tag rides along on
/// [`Options`] so a translator between the surface and the provider executor
/// knows which conversion to apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    OpenAiChat,
    OpenAiResponses,
    Claude,
    Gemini,
}

impl SourceFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceFormat::OpenAiChat => "openai",
            SourceFormat::OpenAiResponses => "openai-responses",
            SourceFormat::Claude => "claude",
            SourceFormat::Gemini => "gemini",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "openai" => Some(SourceFormat::OpenAiChat),
            "openai-responses" => Some(SourceFormat::OpenAiResponses),
            "claude" => Some(SourceFormat::Claude),
            "gemini" => Some(SourceFormat::Gemini),
            _ => None,
        }
    }
}

/// Immutable value handed to the provider executor.
///
/// `payload` is the upstream-format body; the pipeline owns the backing
/// buffer, so executors and translators never alias caller memory.
#[derive(Debug, Clone)]
pub struct Request {
    pub model: String,
    pub payload: Bytes,
    pub metadata: Metadata,
}

/// Per-call configuration, read-only inside the pipeline.
///
/// `original_request` carries the caller's untranslated bytes: sticky
/// selection fingerprints the user's own messages, not a translated body.
#[derive(Debug, Clone)]
pub struct Options {
    pub stream: bool,
    /// Response-format hint; empty string means the dialect default.
    pub alt: String,
    pub original_request: Bytes,
    pub source_format: SourceFormat,
    pub metadata: Metadata,
}

/// One streaming event: a payload chunk in upstream framing, or the first and
/// final error. A stream ends on the first `Err` or on channel close.
#[derive(Debug)]
pub enum StreamChunk {
    Payload(Bytes),
    Err(CallError),
}

pub type StreamReceiver = mpsc::Receiver<StreamChunk>;

/// Drives an actual upstream call for one provider.
///
/// Implementations map the opaque payload onto the provider's wire protocol.
/// Errors should implement the [`CallFailure`](crate::CallFailure)
/// capabilities when upstream status or headers are known, so they survive
/// passthrough to the downstream response.
#[async_trait]
pub trait ProviderExecutor: Send + Sync {
    async fn call(
        &self,
        cancel: &CancellationToken,
        auth: &Auth,
        req: &Request,
        opts: &Options,
    ) -> Result<Bytes, CallError>;

    async fn call_count(
        &self,
        cancel: &CancellationToken,
        auth: &Auth,
        req: &Request,
        opts: &Options,
    ) -> Result<Bytes, CallError>;

    async fn call_stream(
        &self,
        cancel: &CancellationToken,
        auth: &Auth,
        req: &Request,
        opts: &Options,
    ) -> Result<StreamReceiver, CallError>;
}
