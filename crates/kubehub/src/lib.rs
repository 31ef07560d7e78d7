//! fnview kubehub – deployment watch subscriptions
//!
//! A [`WatchSource`] opens the raw change stream for one [`WatchFilter`]; the
//! [`ResourceWatchClient`] decodes that stream into [`DeploymentSnapshot`]s and hands them
//! to a caller-supplied handler until the returned [`SubscriptionHandle`] is closed.

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{Context, Result};
use futures::stream::{BoxStream, StreamExt};
use fnview_core::{DecodeError, DeploymentSnapshot, FilterError, WatchFilter, WatchResource};
use kube::{
    api::Api,
    core::{ApiResource, DynamicObject, GroupVersionKind},
    runtime::watcher::{self, Event},
    Client,
};
use metrics::counter;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// One decoded frame of the change stream, before the object is shaped into a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceEvent {
    /// ADDED / MODIFIED / DELETED: the new state of a matching resource.
    Object(serde_json::Value),
    Bookmark,
    /// Frame that could not be decoded; the stream itself is still healthy.
    Malformed(String),
    /// Status reported by the server inside the stream (watch `ERROR` type).
    Status(String),
}

#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("invalid watch filter: {0}")]
    Filter(#[from] FilterError),
    #[error("watch stream failed: {0}")]
    Stream(String),
}

pub type SourceStream = BoxStream<'static, Result<SourceEvent, WatchError>>;

/// Opens a persistent, server-pushed change stream scoped to a filter.
///
/// `open` is lazy: nothing is sent to the server until the stream is first polled.
/// An `Err` item is a transport failure; consumers stop polling after it.
pub trait WatchSource: Send + Sync {
    fn open(&self, filter: &WatchFilter) -> SourceStream;
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    object: Option<serde_json::Value>,
}

/// Decode one raw wire frame `{ "type": ..., "object": { ... } }`.
pub fn decode_envelope(frame: &[u8]) -> SourceEvent {
    let env: Envelope = match serde_json::from_slice(frame) {
        Ok(env) => env,
        Err(e) => return SourceEvent::Malformed(DecodeError::from(e).to_string()),
    };
    match (env.kind.as_deref(), env.object) {
        (Some("BOOKMARK"), _) => SourceEvent::Bookmark,
        (Some("ERROR"), obj) => {
            let msg = obj
                .as_ref()
                .and_then(|o| o.get("message"))
                .and_then(|m| m.as_str())
                .unwrap_or("watch error")
                .to_string();
            SourceEvent::Status(msg)
        }
        (_, Some(obj)) => SourceEvent::Object(obj),
        (_, None) => SourceEvent::Malformed(DecodeError::MissingObject.to_string()),
    }
}

// ----------------- Kube-backed source -----------------

pub async fn kube_client() -> Result<Client> {
    Client::try_default().await.context("building kube client from default config")
}

fn api_resource(res: &WatchResource) -> ApiResource {
    let gvk = GroupVersionKind::gvk(&res.group, &res.version, &res.kind);
    ApiResource::from_gvk_with_plural(&gvk, &res.plural)
}

fn object_event(obj: &DynamicObject) -> SourceEvent {
    match serde_json::to_value(obj) {
        Ok(v) => SourceEvent::Object(v),
        Err(e) => SourceEvent::Malformed(e.to_string()),
    }
}

/// Watcher settings for one filter. No client-side deadline is set: when the server ends a
/// watch call the watcher resumes from the last seen resourceVersion.
pub fn watcher_config(filter: &WatchFilter) -> watcher::Config {
    watcher::Config::default().labels(&filter.label_selector())
}

/// Map one watcher item onto source events.
///
/// Objects that fail to deserialize and errors the server reports inside the stream are
/// non-fatal. Every other watcher error ends the stream.
pub fn source_events(item: Result<Event<DynamicObject>, watcher::Error>) -> Vec<Result<SourceEvent, WatchError>> {
    match item {
        Ok(Event::Applied(o)) | Ok(Event::Deleted(o)) => vec![Ok(object_event(&o))],
        Ok(Event::Restarted(objs)) => objs.iter().map(|o| Ok(object_event(o))).collect(),
        Err(watcher::Error::WatchError(e)) => vec![Ok(SourceEvent::Status(format!("{} ({})", e.message, e.code)))],
        Err(watcher::Error::WatchFailed(kube::Error::SerdeError(e))) => vec![Ok(SourceEvent::Malformed(e.to_string()))],
        Err(e) => vec![Err(WatchError::Stream(e.to_string()))],
    }
}

/// Watches the filter's resource collection through the API server.
#[derive(Clone)]
pub struct KubeWatchSource {
    client: Client,
}

impl KubeWatchSource {
    pub fn new(client: Client) -> Self { Self { client } }

    pub async fn try_default() -> Result<Self> { Ok(Self::new(kube_client().await?)) }
}

impl WatchSource for KubeWatchSource {
    fn open(&self, filter: &WatchFilter) -> SourceStream {
        let ar = api_resource(&filter.resource);
        let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), &filter.namespace, &ar);
        debug!(url = %filter.watch_url(), "kubehub: watch prepared");
        watcher::watcher(api, watcher_config(filter))
            .flat_map(|item| futures::stream::iter(source_events(item)))
            .boxed()
    }
}

// ----------------- Subscriptions -----------------

/// Message handed to a subscription handler, in stream order.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchMessage {
    Snapshot(DeploymentSnapshot),
    DecodeError(String),
    ServerStatus(String),
    /// Transport failure; no further messages follow.
    Disconnected(String),
    /// Server closed the stream cleanly; no further messages follow.
    Ended,
}

pub type SubscriptionId = u64;

/// Live subscription. Closing (or dropping) it invalidates the handler immediately and
/// stops the stream task.
pub struct SubscriptionHandle {
    id: SubscriptionId,
    filter: WatchFilter,
    live: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl SubscriptionHandle {
    pub fn id(&self) -> SubscriptionId { self.id }
    pub fn filter(&self) -> &WatchFilter { &self.filter }
    pub fn is_live(&self) -> bool { self.live.load(Ordering::Acquire) }

    pub fn close(mut self) { self.shutdown(); }

    fn shutdown(&mut self) {
        if self.live.swap(false, Ordering::AcqRel) {
            info!(sub = self.id, filter = %self.filter.key(), "watch: subscription closed");
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) { self.shutdown(); }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.id)
            .field("filter", &self.filter.key())
            .field("live", &self.is_live())
            .finish()
    }
}

/// Opens one subscription per (namespace, function) and forwards decoded snapshots.
pub struct ResourceWatchClient {
    source: Arc<dyn WatchSource>,
    resource: WatchResource,
    next_id: AtomicU64,
}

impl ResourceWatchClient {
    pub fn new(source: Arc<dyn WatchSource>) -> Self {
        Self { source, resource: WatchResource::deployments(), next_id: AtomicU64::new(1) }
    }

    /// Watch a different resource collection than `apps/v1 deployments`.
    pub fn with_resource(mut self, resource: WatchResource) -> Self {
        self.resource = resource;
        self
    }

    /// Subscribe to the resources labelled with `name` inside `namespace`.
    ///
    /// Must be called from within a tokio runtime. The handler runs on the stream task and
    /// is never invoked once the returned handle has been closed.
    pub fn subscribe<H>(&self, namespace: &str, name: &str, handler: H) -> Result<SubscriptionHandle, WatchError>
    where
        H: FnMut(WatchMessage) + Send + 'static,
    {
        let filter = WatchFilter::for_function(namespace, name)?.with_resource(self.resource.clone());
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let live = Arc::new(AtomicBool::new(true));
        let stream = self.source.open(&filter);
        info!(sub = id, url = %filter.watch_url(), "watch: subscription opened");
        counter!("watch_subscriptions_opened", 1u64);
        let task = tokio::spawn(pump(id, stream, Arc::clone(&live), handler));
        Ok(SubscriptionHandle { id, filter, live, task: Some(task) })
    }

    pub fn close(&self, handle: SubscriptionHandle) { handle.close(); }
}

async fn pump<H>(id: SubscriptionId, mut stream: SourceStream, live: Arc<AtomicBool>, mut handler: H)
where
    H: FnMut(WatchMessage),
{
    let t0 = Instant::now();
    let mut delivered = 0usize;
    let mut emit = |msg: WatchMessage| {
        if live.load(Ordering::Acquire) {
            handler(msg);
        }
    };
    while let Some(item) = stream.next().await {
        if !live.load(Ordering::Acquire) {
            return;
        }
        match item {
            Ok(SourceEvent::Object(obj)) => match DeploymentSnapshot::from_object(obj) {
                Ok(snap) => {
                    if delivered == 0 {
                        info!(sub = id, since_ms = %t0.elapsed().as_millis(), "watch: first event received");
                    }
                    delivered += 1;
                    counter!("watch_events", 1u64);
                    emit(WatchMessage::Snapshot(snap));
                }
                Err(e) => {
                    warn!(sub = id, error = %e, "watch: dropping undecodable object");
                    counter!("watch_decode_errors", 1u64);
                    emit(WatchMessage::DecodeError(e.to_string()));
                }
            },
            Ok(SourceEvent::Malformed(reason)) => {
                warn!(sub = id, error = %reason, "watch: dropping malformed frame");
                counter!("watch_decode_errors", 1u64);
                emit(WatchMessage::DecodeError(reason));
            }
            Ok(SourceEvent::Bookmark) => debug!(sub = id, "watch: bookmark"),
            Ok(SourceEvent::Status(msg)) => {
                warn!(sub = id, status = %msg, "watch: server reported error");
                emit(WatchMessage::ServerStatus(msg));
            }
            Err(e) => {
                warn!(sub = id, error = %e, delivered, "watch: stream failed");
                emit(WatchMessage::Disconnected(e.to_string()));
                return;
            }
        }
    }
    info!(sub = id, delivered, ran_ms = %t0.elapsed().as_millis(), "watch: stream ended");
    emit(WatchMessage::Ended);
}

// ----------------- Mock implementation -----------------

type MockSender = mpsc::UnboundedSender<Result<SourceEvent, WatchError>>;

/// In-memory source for tests: every `open` is recorded and gets its own channel that the
/// test feeds through [`MockSource::push`].
#[derive(Default)]
pub struct MockSource {
    opened: Mutex<Vec<(WatchFilter, Option<MockSender>)>>,
}

impl MockSource {
    pub fn new() -> Self { Self::default() }

    pub fn open_count(&self) -> usize { self.opened.lock().unwrap().len() }

    pub fn opened(&self) -> Vec<WatchFilter> {
        self.opened.lock().unwrap().iter().map(|(f, _)| f.clone()).collect()
    }

    /// Send an item on the `idx`-th opened stream. Returns false once that stream is gone.
    pub fn push(&self, idx: usize, item: Result<SourceEvent, WatchError>) -> bool {
        let opened = self.opened.lock().unwrap();
        match opened.get(idx).and_then(|(_, tx)| tx.as_ref()) {
            Some(tx) => tx.send(item).is_ok(),
            None => false,
        }
    }

    pub fn push_object(&self, idx: usize, obj: serde_json::Value) -> bool {
        self.push(idx, Ok(SourceEvent::Object(obj)))
    }

    /// End the `idx`-th stream cleanly, as a server closing the connection would.
    pub fn end(&self, idx: usize) {
        if let Some((_, tx)) = self.opened.lock().unwrap().get_mut(idx) {
            tx.take();
        }
    }

    /// True once the consumer of the `idx`-th stream has been dropped.
    pub fn is_closed(&self, idx: usize) -> bool {
        match self.opened.lock().unwrap().get(idx) {
            Some((_, Some(tx))) => tx.is_closed(),
            Some((_, None)) => true,
            None => false,
        }
    }
}

impl WatchSource for MockSource {
    fn open(&self, filter: &WatchFilter) -> SourceStream {
        let (tx, rx) = mpsc::unbounded_channel();
        self.opened.lock().unwrap().push((filter.clone(), Some(tx)));
        futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) }).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_envelope_forwards_object() {
        let frame = br#"{"type":"MODIFIED","object":{"metadata":{"name":"hello"}}}"#;
        match decode_envelope(frame) {
            SourceEvent::Object(o) => assert_eq!(o.pointer("/metadata/name"), Some(&serde_json::json!("hello"))),
            other => panic!("unexpected {:?}", other),
        }
        // the type field is optional on the wire
        assert!(matches!(decode_envelope(br#"{"object":{}}"#), SourceEvent::Object(_)));
    }

    #[test]
    fn decode_envelope_reports_bad_frames() {
        assert!(matches!(decode_envelope(b"{not json"), SourceEvent::Malformed(_)));
        assert!(matches!(decode_envelope(br#"{"type":"ADDED"}"#), SourceEvent::Malformed(_)));
        assert_eq!(decode_envelope(br#"{"type":"BOOKMARK","object":{}}"#), SourceEvent::Bookmark);
        assert_eq!(
            decode_envelope(br#"{"type":"ERROR","object":{"message":"too old resource version"}}"#),
            SourceEvent::Status("too old resource version".into())
        );
    }

    #[test]
    fn api_resource_uses_plural() {
        let ar = api_resource(&WatchResource::deployments());
        assert_eq!(ar.group, "apps");
        assert_eq!(ar.version, "v1");
        assert_eq!(ar.plural, "deployments");
        assert_eq!(ar.api_version, "apps/v1");
    }

    fn deployment_object(name: &str, rv: &str) -> DynamicObject {
        let mut o = DynamicObject::new(name, &api_resource(&WatchResource::deployments())).within("default");
        o.metadata.resource_version = Some(rv.into());
        o
    }

    #[test]
    fn watcher_config_selects_function_without_deadline() {
        let filter = WatchFilter::for_function("default", "hello").expect("filter");
        let cfg = watcher_config(&filter);
        assert_eq!(cfg.label_selector.as_deref(), Some("function=hello"));
        assert_eq!(cfg.timeout, None);
    }

    #[test]
    fn watcher_events_become_objects() {
        let got = source_events(Ok(Event::Applied(deployment_object("hello", "5"))));
        match got.as_slice() {
            [Ok(SourceEvent::Object(v))] => {
                assert_eq!(v.pointer("/metadata/name"), Some(&serde_json::json!("hello")));
                assert_eq!(v.pointer("/metadata/resourceVersion"), Some(&serde_json::json!("5")));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(source_events(Ok(Event::Deleted(deployment_object("hello", "6")))).len(), 1);

        let relisted = source_events(Ok(Event::Restarted(vec![deployment_object("a", "1"), deployment_object("b", "2")])));
        assert_eq!(relisted.len(), 2);
        assert!(relisted.iter().all(|e| matches!(e, Ok(SourceEvent::Object(_)))));
        assert!(source_events(Ok(Event::Restarted(Vec::new()))).is_empty());
    }

    #[test]
    fn watcher_errors_split_into_reported_and_fatal() {
        let bad_json = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let got = source_events(Err(watcher::Error::WatchFailed(kube::Error::SerdeError(bad_json))));
        assert!(matches!(got.as_slice(), [Ok(SourceEvent::Malformed(_))]));

        let gone = kube::core::ErrorResponse {
            status: "Failure".into(),
            message: "too old resource version".into(),
            reason: "Expired".into(),
            code: 410,
        };
        let got = source_events(Err(watcher::Error::WatchError(gone)));
        assert!(matches!(got.as_slice(), [Ok(SourceEvent::Status(m))] if m == "too old resource version (410)"));

        let got = source_events(Err(watcher::Error::NoResourceVersion));
        assert!(matches!(got.as_slice(), [Err(WatchError::Stream(_))]));
    }

    #[tokio::test]
    async fn malformed_watcher_items_do_not_end_the_pump() {
        let bad_json = serde_json::from_str::<serde_json::Value>("[").unwrap_err();
        let items = vec![
            Ok(Event::Applied(deployment_object("hello", "1"))),
            Err(watcher::Error::WatchFailed(kube::Error::SerdeError(bad_json))),
            Ok(Event::Applied(deployment_object("hello", "2"))),
        ];
        let stream = futures::stream::iter(items).flat_map(|item| futures::stream::iter(source_events(item))).boxed();
        let mut got = Vec::new();
        pump(4, stream, Arc::new(AtomicBool::new(true)), |m| got.push(m)).await;
        assert_eq!(got.len(), 4);
        assert!(matches!(&got[1], WatchMessage::DecodeError(_)));
        assert!(matches!(&got[2], WatchMessage::Snapshot(s) if s.resource_version.as_deref() == Some("2")));
    }

    #[tokio::test]
    async fn pump_delivers_in_order_and_survives_decode_errors() {
        let items = vec![
            Ok(SourceEvent::Object(serde_json::json!({ "metadata": { "name": "a", "resourceVersion": "1" } }))),
            Ok(SourceEvent::Malformed("bad frame".into())),
            Ok(SourceEvent::Object(serde_json::json!({ "metadata": {} }))),
            Ok(SourceEvent::Bookmark),
            Ok(SourceEvent::Object(serde_json::json!({ "metadata": { "name": "a", "resourceVersion": "2" } }))),
        ];
        let mut got = Vec::new();
        let live = Arc::new(AtomicBool::new(true));
        pump(1, futures::stream::iter(items).boxed(), live, |m| got.push(m)).await;

        assert_eq!(got.len(), 5);
        assert!(matches!(&got[0], WatchMessage::Snapshot(s) if s.resource_version.as_deref() == Some("1")));
        assert!(matches!(&got[1], WatchMessage::DecodeError(_)));
        assert!(matches!(&got[2], WatchMessage::DecodeError(_)));
        assert!(matches!(&got[3], WatchMessage::Snapshot(s) if s.resource_version.as_deref() == Some("2")));
        assert_eq!(got[4], WatchMessage::Ended);
    }

    #[tokio::test]
    async fn pump_stops_on_transport_error() {
        let items = vec![
            Err(WatchError::Stream("connection reset".into())),
            Ok(SourceEvent::Object(serde_json::json!({ "metadata": { "name": "late" } }))),
        ];
        let mut got = Vec::new();
        pump(2, futures::stream::iter(items).boxed(), Arc::new(AtomicBool::new(true)), |m| got.push(m)).await;
        assert_eq!(got, vec![WatchMessage::Disconnected("watch stream failed: connection reset".into())]);
    }

    #[tokio::test]
    async fn pump_is_silent_once_invalidated() {
        let items = vec![Ok(SourceEvent::Object(serde_json::json!({ "metadata": { "name": "a" } })))];
        let mut got = Vec::new();
        pump(3, futures::stream::iter(items).boxed(), Arc::new(AtomicBool::new(false)), |m| got.push(m)).await;
        assert!(got.is_empty());
    }
}
