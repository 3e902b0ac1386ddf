use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use http::HeaderMap;
use http::header::CONTENT_TYPE;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::auth::Auth;
use crate::error::{CallError, Cancelled, TransportError, UpstreamHttpError};
use crate::executor::{Options, ProviderExecutor, Request, StreamChunk, StreamReceiver};

const STREAM_CHANNEL_CAPACITY: usize = 16;

/// Passthrough executor: posts the payload verbatim to the provider's
/// configured endpoint with the auth's credential header.
///
/// Dialect translation happens (if at all) before the payload reaches the
/// pipeline; this executor only carries bytes and surfaces upstream failures
/// with their status and headers attached.
pub struct HttpExecutor {
    provider: String,
    /// May contain a `{model}` placeholder, substituted per request.
    base_url: String,
    count_tokens_path: Option<String>,
    client: reqwest::Client,
}

impl HttpExecutor {
    pub fn new(
        provider: impl Into<String>,
        base_url: impl Into<String>,
        count_tokens_path: Option<String>,
        client: reqwest::Client,
    ) -> Self {
        Self {
            provider: provider.into().trim().to_ascii_lowercase(),
            base_url: base_url.into(),
            count_tokens_path,
            client,
        }
    }

    fn url_for(&self, req: &Request) -> String {
        self.base_url.replace("{model}", &req.model)
    }

    fn count_url_for(&self, req: &Request) -> Option<String> {
        let path = self.count_tokens_path.as_deref()?;
        Some(format!(
            "{}{}",
            self.url_for(req).trim_end_matches('/'),
            path.replace("{model}", &req.model)
        ))
    }

    async fn send(
        &self,
        cancel: &CancellationToken,
        auth: &Auth,
        req: &Request,
        opts: &Options,
        url: String,
    ) -> Result<reqwest::Response, CallError> {
        let mut builder = self
            .client
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .body(req.payload.clone());
        if let Some(key) = credential_of(auth) {
            let (name, value) = credential_header(&self.provider, key);
            builder = builder.header(name, value);
        }
        if !opts.alt.is_empty() {
            builder = builder.query(&[("alt", opts.alt.as_str())]);
        }

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(Cancelled.into()),
            result = builder.send() => {
                result.map_err(|err| CallError::from(TransportError::new(err.to_string())))?
            }
        };
        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response.text().await.unwrap_or_default();
        Err(UpstreamHttpError::new(status, headers, body).into())
    }
}

#[async_trait]
impl ProviderExecutor for HttpExecutor {
    async fn call(
        &self,
        cancel: &CancellationToken,
        auth: &Auth,
        req: &Request,
        opts: &Options,
    ) -> Result<Bytes, CallError> {
        let url = self.url_for(req);
        let response = self.send(cancel, auth, req, opts, url).await?;
        let body = tokio::select! {
            _ = cancel.cancelled() => return Err(Cancelled.into()),
            body = response.bytes() => {
                body.map_err(|err| CallError::from(TransportError::new(err.to_string())))?
            }
        };
        Ok(body)
    }

    async fn call_count(
        &self,
        cancel: &CancellationToken,
        auth: &Auth,
        req: &Request,
        opts: &Options,
    ) -> Result<Bytes, CallError> {
        let Some(url) = self.count_url_for(req) else {
            return Err(UpstreamHttpError::new(
                404,
                HeaderMap::new(),
                format!("provider {} has no token counting endpoint", self.provider),
            )
            .into());
        };
        let response = self.send(cancel, auth, req, opts, url).await?;
        let body = tokio::select! {
            _ = cancel.cancelled() => return Err(Cancelled.into()),
            body = response.bytes() => {
                body.map_err(|err| CallError::from(TransportError::new(err.to_string())))?
            }
        };
        Ok(body)
    }

    async fn call_stream(
        &self,
        cancel: &CancellationToken,
        auth: &Auth,
        req: &Request,
        opts: &Options,
    ) -> Result<StreamReceiver, CallError> {
        let url = self.url_for(req);
        let response = self.send(cancel, auth, req, opts, url).await?;

        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut body = response.bytes_stream();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    next = body.next() => match next {
                        None => return,
                        Some(Ok(chunk)) => {
                            if tx.send(StreamChunk::Payload(chunk)).await.is_err() {
                                return;
                            }
                        }
                        Some(Err(err)) => {
                            let failure = TransportError::new(err.to_string());
                            let _ = tx.send(StreamChunk::Err(failure.into())).await;
                            return;
                        }
                    },
                }
            }
        });
        Ok(rx)
    }
}

fn credential_of(auth: &Auth) -> Option<&str> {
    auth.metadata
        .get("api_key")
        .and_then(serde_json::Value::as_str)
        .filter(|key| !key.is_empty())
}

/// Providers disagree on where the credential goes; default is a bearer.
fn credential_header(provider: &str, key: &str) -> (&'static str, String) {
    match provider {
        "gemini" => ("x-goog-api-key", key.to_string()),
        "claude" => ("x-api-key", key.to_string()),
        _ => ("authorization", format!("Bearer {key}")),
    }
}
