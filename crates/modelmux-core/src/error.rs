use http::{HeaderMap, StatusCode};

/// Capability surface for errors flowing out of an upstream call.
///
/// Callers never downcast: an error that knows its upstream HTTP status or
/// carries passthrough headers exposes them here, everything else falls back
/// to the defaults.
pub trait CallFailure: std::error::Error + Send + Sync {
    fn status_code(&self) -> Option<StatusCode> {
        None
    }

    fn headers(&self) -> Option<&HeaderMap> {
        None
    }
}

pub type CallError = Box<dyn CallFailure>;

impl<E: CallFailure + 'static> From<E> for CallError {
    fn from(err: E) -> Self {
        Box::new(err)
    }
}

/// Model resolution produced no candidate providers.
#[derive(Debug, thiserror::Error)]
#[error("unknown provider for model {model}")]
pub struct UnknownProvider {
    pub model: String,
}

impl CallFailure for UnknownProvider {
    fn status_code(&self) -> Option<StatusCode> {
        Some(StatusCode::BAD_REQUEST)
    }
}

/// No enabled credential in any candidate provider.
#[derive(Debug, thiserror::Error)]
#[error("no auth available")]
pub struct AuthNotFound;

impl CallFailure for AuthNotFound {
    fn status_code(&self) -> Option<StatusCode> {
        Some(StatusCode::SERVICE_UNAVAILABLE)
    }
}

/// The caller's cancellation token fired.
#[derive(Debug, thiserror::Error)]
#[error("request cancelled")]
pub struct Cancelled;

impl CallFailure for Cancelled {
    fn status_code(&self) -> Option<StatusCode> {
        StatusCode::from_u16(CLIENT_CLOSED_REQUEST).ok()
    }
}

const CLIENT_CLOSED_REQUEST: u16 = 499;

/// Upstream answered with a non-success HTTP status.
///
/// Status and headers are preserved verbatim for downstream passthrough.
#[derive(Debug, thiserror::Error)]
#[error("upstream returned {status}: {message}")]
pub struct UpstreamHttpError {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub message: String,
}

impl UpstreamHttpError {
    pub fn new(status: u16, headers: HeaderMap, message: impl Into<String>) -> Self {
        Self {
            status: clamp_status(status),
            headers,
            message: message.into(),
        }
    }
}

impl CallFailure for UpstreamHttpError {
    fn status_code(&self) -> Option<StatusCode> {
        Some(self.status)
    }

    fn headers(&self) -> Option<&HeaderMap> {
        Some(&self.headers)
    }
}

/// Transport-level failure: no HTTP response was received.
#[derive(Debug, thiserror::Error)]
#[error("upstream transport error: {message}")]
pub struct TransportError {
    pub message: String,
}

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl CallFailure for TransportError {}

/// Uniform record of a failed call, ready for the HTTP layer.
///
/// `status` becomes the downstream HTTP status, `headers` are merged into the
/// downstream response verbatim, and `message` is the plain-text body; the
/// surface layer wraps it into the dialect's error envelope.
#[derive(Debug, Clone)]
pub struct ErrorRecord {
    pub status: StatusCode,
    pub message: String,
    pub headers: Option<HeaderMap>,
}

impl ErrorRecord {
    pub fn from_failure(err: &dyn CallFailure) -> Self {
        Self {
            status: err.status_code().unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            message: err.to_string(),
            headers: err.headers().cloned(),
        }
    }
}

impl From<&CallError> for ErrorRecord {
    fn from(err: &CallError) -> Self {
        Self::from_failure(err.as_ref())
    }
}

/// Out-of-range upstream statuses collapse to 500 rather than panicking the
/// response path.
fn clamp_status(code: u16) -> StatusCode {
    if (100..=599).contains(&code) {
        StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    }
}
