//! # In-memory Collaborators
//!
//! Fakes for the upstream, the catalog, the sink and the summarizer, shared by
//! the integration tests under `tests/`. Every fake records what it was asked
//! so tests can assert on calls as well as on results.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use lib_common::core::registry::normalize_handle;
use lib_common::delivery::{MessageFormat, Sink, SinkError, Summarizer, SummarizerError};
use lib_common::upstream::{
    ChannelCatalog, Difference, PushEvent, PushPayload, RawItem, ResolveError, ResolvedChannel, TransportError,
    UpstreamTransport,
};
use lib_common::{Batch, ChannelId, ChannelIdentity, Cursor, DeliveryTarget, EventKind, NormalizedEvent, Origin};

pub fn identity(id: i64, handle: &str) -> Arc<ChannelIdentity> {
    Arc::new(ChannelIdentity {
        id: ChannelId(id),
        title: handle.to_uppercase(),
        handle: handle.to_string(),
        access_token: format!("token-{id}"),
    })
}

pub fn item(id: i64, text: &str) -> RawItem {
    RawItem { id, text: Some(text.to_string()), entities: Vec::new() }
}

pub fn event(channel: &Arc<ChannelIdentity>, item_id: i64, text: &str) -> NormalizedEvent {
    NormalizedEvent {
        channel: channel.clone(),
        item_id: Some(item_id),
        kind: EventKind::New { text: Some(text.to_string()) },
        urls: Vec::new(),
        observed_at: chrono::Utc::now(),
        origin: Origin::Live,
    }
}

pub fn new_message(channel: i64, item_id: i64, text: &str) -> PushEvent {
    PushEvent { channel_id: ChannelId(channel), payload: PushPayload::NewMessage(item(item_id, text)) }
}

/// One `get_difference` call as the fake saw it.
#[derive(Debug, Clone)]
pub struct DifferenceRequest {
    pub channel: ChannelId,
    pub cursor: Cursor,
    pub at: Instant,
}

/// # Fake Transport
///
/// Scripted difference answers per channel; when a channel's script runs dry
/// it answers an empty page at the requested cursor.
pub struct FakeTransport {
    push: Mutex<Option<mpsc::Sender<PushEvent>>>,
    scripts: Mutex<HashMap<ChannelId, VecDeque<Result<Difference, TransportError>>>>,
    requests: Mutex<Vec<DifferenceRequest>>,
    state: Mutex<Result<Cursor, TransportError>>,
    subscribe_calls: AtomicUsize,
    pings: AtomicUsize,
    connected: AtomicBool,
    closed: CancellationToken,
    disconnects: AtomicUsize,
}

impl Default for FakeTransport {
    fn default() -> Self {
        Self {
            push: Mutex::new(None),
            scripts: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
            state: Mutex::new(Ok(0)),
            subscribe_calls: AtomicUsize::new(0),
            pings: AtomicUsize::new(0),
            connected: AtomicBool::new(true),
            closed: CancellationToken::new(),
            disconnects: AtomicUsize::new(0),
        }
    }
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_state(cursor: Cursor) -> Arc<Self> {
        let transport = Self::default();
        *transport.state.lock().unwrap() = Ok(cursor);
        Arc::new(transport)
    }

    pub fn fail_state(&self, error: TransportError) {
        *self.state.lock().unwrap() = Err(error);
    }

    pub fn script(&self, channel: i64, answer: Result<Difference, TransportError>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(ChannelId(channel))
            .or_default()
            .push_back(answer);
    }

    pub fn requests(&self) -> Vec<DifferenceRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn requests_for(&self, channel: i64) -> Vec<DifferenceRequest> {
        self.requests().into_iter().filter(|r| r.channel == ChannelId(channel)).collect()
    }

    /// Delivers a push event to the current subscriber. Returns `false` when
    /// nobody is subscribed.
    pub async fn push(&self, event: PushEvent) -> bool {
        let sender = self.push.lock().unwrap().clone();
        match sender {
            Some(tx) => tx.send(event).await.is_ok(),
            None => false,
        }
    }

    /// Ends the current push stream, as a dropped connection would.
    pub fn end_stream(&self) {
        self.push.lock().unwrap().take();
    }

    pub fn subscribe_calls(&self) -> usize {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    pub fn pings(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    /// Simulates the upstream going away for good.
    pub fn close(&self) {
        self.closed.cancel();
    }
}

#[async_trait]
impl UpstreamTransport for FakeTransport {
    async fn subscribe(&self, _channels: &[ChannelId]) -> Result<mpsc::Receiver<PushEvent>, TransportError> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(64);
        *self.push.lock().unwrap() = Some(tx);
        Ok(rx)
    }

    async fn get_difference(
        &self,
        channel: &ChannelIdentity,
        cursor: Cursor,
        _limit: u32,
    ) -> Result<Difference, TransportError> {
        self.requests.lock().unwrap().push(DifferenceRequest { channel: channel.id, cursor, at: Instant::now() });
        let scripted = self.scripts.lock().unwrap().get_mut(&channel.id).and_then(|q| q.pop_front());
        scripted.unwrap_or(Ok(Difference::Page { items: Vec::new(), cursor }))
    }

    async fn current_state(&self) -> Result<Cursor, TransportError> {
        self.state.lock().unwrap().clone()
    }

    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn ping(&self) -> Result<(), TransportError> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        self.end_stream();
        self.closed.cancel();
    }

    async fn closed(&self) {
        self.closed.cancelled().await;
    }
}

/// Resolves handles from a fixed table.
#[derive(Default)]
pub struct FakeCatalog {
    channels: HashMap<String, ResolvedChannel>,
}

impl FakeCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_channel(mut self, id: i64, handle: &str) -> Self {
        self.channels.insert(
            normalize_handle(handle),
            ResolvedChannel {
                id: ChannelId(id),
                title: handle.trim_start_matches('@').to_string(),
                access_token: format!("token-{id}"),
            },
        );
        self
    }
}

#[async_trait]
impl ChannelCatalog for FakeCatalog {
    async fn resolve(&self, identifier: &str) -> Result<ResolvedChannel, ResolveError> {
        self.channels
            .get(&normalize_handle(identifier))
            .cloned()
            .ok_or_else(|| ResolveError::NotFound(identifier.to_string()))
    }
}

/// One `deliver` call as the sink saw it.
#[derive(Debug, Clone, PartialEq)]
pub struct SentMessage {
    pub target: String,
    pub text: String,
    pub format: MessageFormat,
}

/// # Recording Sink
///
/// Accepts everything unless told otherwise per target.
#[derive(Default)]
pub struct RecordingSink {
    sent: Mutex<Vec<SentMessage>>,
    reject_rich: HashSet<String>,
    reject_all: HashSet<String>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rich sends to `target` fail with a formatting rejection.
    pub fn rejecting_rich(mut self, target: &str) -> Self {
        self.reject_rich.insert(target.to_string());
        self
    }

    /// Every send to `target` fails: rich with a formatting rejection, plain
    /// with a generic rejection.
    pub fn rejecting_all(mut self, target: &str) -> Self {
        self.reject_all.insert(target.to_string());
        self
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_to(&self, target: &str) -> Vec<SentMessage> {
        self.sent().into_iter().filter(|m| m.target == target).collect()
    }
}

#[async_trait]
impl Sink for RecordingSink {
    async fn deliver(&self, target: &DeliveryTarget, text: &str, format: MessageFormat) -> Result<(), SinkError> {
        self.sent.lock().unwrap().push(SentMessage {
            target: target.id.clone(),
            text: text.to_string(),
            format,
        });
        let rejects_formatting = self.reject_rich.contains(&target.id) || self.reject_all.contains(&target.id);
        match format {
            MessageFormat::Rich if rejects_formatting => {
                Err(SinkError::FormattingRejected {
                    reason: "Bad Request: can't parse entities".into(),
                    delivered: 0,
                })
            }
            MessageFormat::Plain if self.reject_all.contains(&target.id) => Err(SinkError::Rejected {
                status: 403,
                body: "Forbidden: bot was kicked".into(),
            }),
            _ => Ok(()),
        }
    }
}

/// What the scripted summarizer does when called.
#[derive(Debug, Clone)]
pub enum SummaryScript {
    Reply(String),
    Fail(String),
    /// Never answers.
    Hang,
    /// Answers after the given delay.
    Slow(Duration, String),
}

pub struct ScriptedSummarizer {
    script: SummaryScript,
    calls: AtomicUsize,
    seen_sizes: Mutex<Vec<usize>>,
    sink: Option<Arc<RecordingSink>>,
    sends_at_call: Mutex<Vec<usize>>,
}

impl ScriptedSummarizer {
    pub fn new(script: SummaryScript) -> Self {
        Self {
            script,
            calls: AtomicUsize::new(0),
            seen_sizes: Mutex::new(Vec::new()),
            sink: None,
            sends_at_call: Mutex::new(Vec::new()),
        }
    }

    /// Records how many messages `sink` had received whenever a summary is
    /// requested.
    pub fn observing(mut self, sink: Arc<RecordingSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn sends_at_call(&self) -> Vec<usize> {
        self.sends_at_call.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn seen_sizes(&self) -> Vec<usize> {
        self.seen_sizes.lock().unwrap().clone()
    }
}

#[async_trait]
impl Summarizer for ScriptedSummarizer {
    async fn summarize(&self, batch: &Batch) -> Result<String, SummarizerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen_sizes.lock().unwrap().push(batch.len());
        if let Some(sink) = &self.sink {
            self.sends_at_call.lock().unwrap().push(sink.sent().len());
        }
        match &self.script {
            SummaryScript::Reply(text) => Ok(text.clone()),
            SummaryScript::Fail(reason) => Err(SummarizerError::Failed(reason.clone())),
            SummaryScript::Hang => std::future::pending().await,
            SummaryScript::Slow(delay, text) => {
                tokio::time::sleep(*delay).await;
                Ok(text.clone())
            }
        }
    }
}

/// Yields to the scheduler until `condition` holds or `limit` of (possibly
/// paused) time has passed.
pub async fn wait_until(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    while !condition() {
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    true
}
