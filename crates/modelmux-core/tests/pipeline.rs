use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use modelmux_core::{
    Auth, AuthManager, CallError, EventHub, MemoryMessageIndex, ModelResolver, Options, Pipeline,
    ProviderExecutor, Request, RouteTable, SourceFormat, StickySelector, StreamChunk,
    StreamReceiver, TransportError, UpstreamHttpError,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Executor that records the payload it was handed and replays a canned
/// stream script.
struct RecordingExecutor {
    payloads: Mutex<Vec<Bytes>>,
    stream_script: Vec<StreamStep>,
}

#[derive(Clone)]
enum StreamStep {
    Chunk(&'static str),
    Fail(u16, &'static str),
    /// Keep the stream open until the sender is dropped by cancellation.
    Hang,
}

impl RecordingExecutor {
    fn new(stream_script: Vec<StreamStep>) -> Arc<Self> {
        Arc::new(Self {
            payloads: Mutex::new(Vec::new()),
            stream_script,
        })
    }

    fn recorded(&self) -> Vec<Bytes> {
        self.payloads.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProviderExecutor for RecordingExecutor {
    async fn call(
        &self,
        _cancel: &CancellationToken,
        _auth: &Auth,
        req: &Request,
        _opts: &Options,
    ) -> Result<Bytes, CallError> {
        self.payloads.lock().unwrap().push(req.payload.clone());
        Ok(Bytes::from_static(b"{\"ok\":true}"))
    }

    async fn call_count(
        &self,
        _cancel: &CancellationToken,
        _auth: &Auth,
        req: &Request,
        _opts: &Options,
    ) -> Result<Bytes, CallError> {
        self.payloads.lock().unwrap().push(req.payload.clone());
        Ok(Bytes::from_static(b"{\"input_tokens\":3}"))
    }

    async fn call_stream(
        &self,
        _cancel: &CancellationToken,
        _auth: &Auth,
        req: &Request,
        _opts: &Options,
    ) -> Result<StreamReceiver, CallError> {
        self.payloads.lock().unwrap().push(req.payload.clone());
        let script = self.stream_script.clone();
        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(async move {
            for step in script {
                match step {
                    StreamStep::Chunk(data) => {
                        if tx.send(StreamChunk::Payload(Bytes::from_static(data.as_bytes())))
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    StreamStep::Fail(status, message) => {
                        let err = UpstreamHttpError::new(status, HeaderMap::new(), message);
                        let _ = tx.send(StreamChunk::Err(err.into())).await;
                        return;
                    }
                    StreamStep::Hang => {
                        tx.closed().await;
                        return;
                    }
                }
            }
        });
        Ok(rx)
    }
}

fn pipeline_with(executor: Arc<RecordingExecutor>) -> Pipeline {
    let selector = StickySelector::new(Arc::new(MemoryMessageIndex::new()));
    let mut executors: HashMap<String, Arc<dyn ProviderExecutor>> = HashMap::new();
    executors.insert("gemini".to_string(), executor);
    let manager = AuthManager::new(executors, selector, EventHub::new(16));
    let resolver = Arc::new(ModelResolver::new(RouteTable::builtin(), Vec::new()));
    Pipeline::new(manager, resolver)
}

async fn seed(pipeline: &Pipeline) {
    pipeline
        .manager()
        .upsert_auth(Auth::new("g-1", "gemini"))
        .await;
}

#[tokio::test]
async fn upstream_payload_is_independent_of_caller_buffer() {
    let executor = RecordingExecutor::new(Vec::new());
    let pipeline = pipeline_with(executor.clone());
    seed(&pipeline).await;

    let mut raw = br#"{"contents":[{"parts":[{"text":"hello"}]}]}"#.to_vec();
    let cancel = CancellationToken::new();
    pipeline
        .execute(&cancel, SourceFormat::Gemini, "gemini-2.5-pro", &raw, "")
        .await
        .unwrap();

    let original = raw.clone();
    raw.fill(0);
    assert_eq!(executor.recorded()[0], Bytes::from(original));
}

#[tokio::test]
async fn unknown_model_becomes_a_400_record() {
    let executor = RecordingExecutor::new(Vec::new());
    let pipeline = pipeline_with(executor);
    seed(&pipeline).await;

    let cancel = CancellationToken::new();
    let record = pipeline
        .execute(&cancel, SourceFormat::OpenAiChat, "mystery-9000", b"{}", "")
        .await
        .unwrap_err();
    assert_eq!(record.status, StatusCode::BAD_REQUEST);
    assert!(record.message.contains("mystery-9000"));
}

#[tokio::test]
async fn count_uses_the_count_entry_point() {
    let executor = RecordingExecutor::new(Vec::new());
    let pipeline = pipeline_with(executor.clone());
    seed(&pipeline).await;

    let cancel = CancellationToken::new();
    let body = pipeline
        .execute_count(&cancel, SourceFormat::Gemini, "gemini-2.5-pro", b"{}", "")
        .await
        .unwrap();
    assert_eq!(&body[..], b"{\"input_tokens\":3}");
}

#[tokio::test]
async fn stream_chunks_arrive_in_order_then_channels_close() {
    let executor = RecordingExecutor::new(vec![
        StreamStep::Chunk("data: one\n\n"),
        StreamStep::Chunk("data: two\n\n"),
    ]);
    let pipeline = pipeline_with(executor);
    seed(&pipeline).await;

    let cancel = CancellationToken::new();
    let mut handles = pipeline
        .execute_stream(&cancel, SourceFormat::Gemini, "gemini-2.5-pro", b"{}", "")
        .await;

    let mut chunks = Vec::new();
    while let Some(chunk) = handles.data.recv().await {
        chunks.push(chunk);
    }
    assert_eq!(chunks, vec![
        Bytes::from_static(b"data: one\n\n"),
        Bytes::from_static(b"data: two\n\n"),
    ]);
    assert!(handles.errors.recv().await.is_none());
}

#[tokio::test]
async fn stream_error_is_reported_once_with_status() {
    let executor = RecordingExecutor::new(vec![
        StreamStep::Chunk("data: one\n\n"),
        StreamStep::Fail(502, "upstream fell over"),
    ]);
    let pipeline = pipeline_with(executor);
    seed(&pipeline).await;

    let cancel = CancellationToken::new();
    let mut handles = pipeline
        .execute_stream(&cancel, SourceFormat::Gemini, "gemini-2.5-pro", b"{}", "")
        .await;

    assert_eq!(
        handles.data.recv().await.unwrap(),
        Bytes::from_static(b"data: one\n\n")
    );
    assert!(handles.data.recv().await.is_none());
    let record = handles.errors.recv().await.unwrap();
    assert_eq!(record.status, StatusCode::BAD_GATEWAY);
    assert!(handles.errors.recv().await.is_none());
}

#[tokio::test]
async fn cancel_mid_stream_closes_both_channels() {
    let executor = RecordingExecutor::new(vec![StreamStep::Chunk("data: one\n\n"), StreamStep::Hang]);
    let pipeline = pipeline_with(executor);
    seed(&pipeline).await;

    let cancel = CancellationToken::new();
    let mut handles = pipeline
        .execute_stream(&cancel, SourceFormat::Gemini, "gemini-2.5-pro", b"{}", "")
        .await;

    assert_eq!(
        handles.data.recv().await.unwrap(),
        Bytes::from_static(b"data: one\n\n")
    );
    cancel.cancel();

    let closed = tokio::time::timeout(Duration::from_secs(1), async {
        assert!(handles.data.recv().await.is_none());
        assert!(handles.errors.recv().await.is_none());
    })
    .await;
    assert!(closed.is_ok(), "channels did not close after cancellation");
}

#[tokio::test]
async fn stream_resolution_failure_preloads_the_error_channel() {
    let executor = RecordingExecutor::new(Vec::new());
    let pipeline = pipeline_with(executor);
    seed(&pipeline).await;

    let cancel = CancellationToken::new();
    let mut handles = pipeline
        .execute_stream(&cancel, SourceFormat::OpenAiChat, "mystery-9000", b"{}", "")
        .await;
    let record = handles.errors.recv().await.unwrap();
    assert_eq!(record.status, StatusCode::BAD_REQUEST);
    assert!(handles.data.recv().await.is_none());
}

#[tokio::test]
async fn transport_error_maps_to_500_record() {
    let err: CallError = TransportError::new("connection refused").into();
    let record = modelmux_core::ErrorRecord::from(&err);
    assert_eq!(record.status, StatusCode::INTERNAL_SERVER_ERROR);
}
