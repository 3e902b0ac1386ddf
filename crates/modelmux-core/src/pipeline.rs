use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::ErrorRecord;
use crate::executor::{Options, Request, SourceFormat, StreamChunk};
use crate::manager::AuthManager;
use crate::resolver::ModelResolver;

/// The entry points callers drive: unary, token-count, and streaming.
///
/// All three share the same pre-processing: resolve the model, copy the
/// caller's bytes into pipeline-owned buffers, and deep-copy metadata twice
/// so the request and options travel independent paths. Failures come back
/// as [`ErrorRecord`] with upstream status and headers intact.
pub struct Pipeline {
    manager: Arc<AuthManager>,
    resolver: Arc<ModelResolver>,
}

/// Streaming hand-back: payload chunks in upstream framing on the data
/// channel, at most one terminal error on the error channel. Both close when
/// the call finishes, fails, or is cancelled.
pub struct StreamHandles {
    pub data: mpsc::Receiver<Bytes>,
    pub errors: mpsc::Receiver<ErrorRecord>,
}

impl Pipeline {
    pub fn new(manager: Arc<AuthManager>, resolver: Arc<ModelResolver>) -> Self {
        Self { manager, resolver }
    }

    pub fn manager(&self) -> &Arc<AuthManager> {
        &self.manager
    }

    pub async fn execute(
        &self,
        cancel: &CancellationToken,
        source: SourceFormat,
        model_name: &str,
        raw: &[u8],
        alt: &str,
    ) -> Result<Bytes, ErrorRecord> {
        let (providers, req, opts) = self.prepare(source, model_name, raw, alt, false)?;
        self.manager
            .execute(cancel, &providers, &req, &opts)
            .await
            .map_err(|err| ErrorRecord::from(&err))
    }

    pub async fn execute_count(
        &self,
        cancel: &CancellationToken,
        source: SourceFormat,
        model_name: &str,
        raw: &[u8],
        alt: &str,
    ) -> Result<Bytes, ErrorRecord> {
        let (providers, req, opts) = self.prepare(source, model_name, raw, alt, false)?;
        self.manager
            .execute_count(cancel, &providers, &req, &opts)
            .await
            .map_err(|err| ErrorRecord::from(&err))
    }

    /// Establishes the upstream stream, then forwards chunks from a single
    /// task. The data channel is a rendezvous (capacity 1) so the consumer
    /// drives the producer; the error channel holds the one terminal error.
    pub async fn execute_stream(
        &self,
        cancel: &CancellationToken,
        source: SourceFormat,
        model_name: &str,
        raw: &[u8],
        alt: &str,
    ) -> StreamHandles {
        let (data_tx, data_rx) = mpsc::channel::<Bytes>(1);
        let (err_tx, err_rx) = mpsc::channel::<ErrorRecord>(1);
        let handles = StreamHandles {
            data: data_rx,
            errors: err_rx,
        };

        let (providers, req, opts) = match self.prepare(source, model_name, raw, alt, true) {
            Ok(parts) => parts,
            Err(record) => {
                let _ = err_tx.try_send(record);
                return handles;
            }
        };

        let mut chunks = match self
            .manager
            .execute_stream(cancel, &providers, &req, &opts)
            .await
        {
            Ok(chunks) => chunks,
            Err(err) => {
                let _ = err_tx.try_send(ErrorRecord::from(&err));
                return handles;
            }
        };

        let cancel = cancel.clone();
        tokio::spawn(async move {
            // Both channels close when this task drops the senders, on every
            // exit path.
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    next = chunks.recv() => match next {
                        None => return,
                        Some(StreamChunk::Payload(payload)) => {
                            if payload.is_empty() {
                                continue;
                            }
                            if data_tx.send(payload).await.is_err() {
                                return;
                            }
                        }
                        Some(StreamChunk::Err(err)) => {
                            let _ = err_tx.try_send(ErrorRecord::from(&err));
                            return;
                        }
                    },
                }
            }
        });

        handles
    }

    fn prepare(
        &self,
        source: SourceFormat,
        model_name: &str,
        raw: &[u8],
        alt: &str,
        stream: bool,
    ) -> Result<(Vec<String>, Request, Options), ErrorRecord> {
        let resolved = self
            .resolver
            .resolve(model_name)
            .map_err(|err| ErrorRecord::from_failure(&err))?;

        // One defensive copy of the caller's bytes; `Bytes` handles are
        // immutable, so request and options can share it safely.
        let payload = Bytes::copy_from_slice(raw);
        let req = Request {
            model: resolved.model,
            payload: payload.clone(),
            metadata: resolved.metadata.clone(),
        };
        let opts = Options {
            stream,
            alt: alt.to_string(),
            original_request: payload,
            source_format: source,
            metadata: resolved.metadata,
        };
        Ok((resolved.providers, req, opts))
    }
}
