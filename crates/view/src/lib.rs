//! fnview view controller
//!
//! [`FunctionView`] owns one function's watch lifecycle: it fetches the function on mount,
//! subscribes to the deployment stream once the entity is known, folds snapshots into
//! [`ReconciliationState`] and coordinates the editor buffer against entity refreshes.
//!
//! All state lives on one logical thread. Background work (fetch, update, delete, the watch
//! pump) only sends [`ViewUpdate`]s into the view's channel; the embedding shell pumps that
//! channel with [`FunctionView::process_next`] or [`FunctionView::drain_updates`].

#![forbid(unsafe_code)]

use std::sync::Arc;

use fnview_api::FunctionApi;
use fnview_core::{DeploymentSnapshot, FunctionEntity, FunctionTarget, WatchFilter};
use fnview_kubehub::{ResourceWatchClient, SubscriptionHandle, WatchMessage};
use fnview_store::{ReconciliationState, SnapshotPhase};
use metrics::counter;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

pub mod edit;
mod model;

pub use edit::{EditBuffer, EditCoordinator, RefreshOutcome};
pub use model::{
    ApiOp, Controls, DeploymentView, EditorView, FunctionInfo, ReadyView, ViewModel, ViewPhase, ViewUpdate,
    WatchGeneration,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Unmounted,
    Mounted,
    Closed,
}

struct ActiveWatch {
    generation: WatchGeneration,
    handle: SubscriptionHandle,
    open: bool,
}

pub struct FunctionView {
    target: FunctionTarget,
    api: Arc<dyn FunctionApi>,
    watch: Arc<ResourceWatchClient>,
    lifecycle: Lifecycle,
    entity: Option<FunctionEntity>,
    state: ReconciliationState,
    edit: EditCoordinator,
    active: Option<ActiveWatch>,
    generation: WatchGeneration,
    saves_in_flight: usize,
    deleted: bool,
    last_error: Option<String>,
    updates_tx: mpsc::UnboundedSender<ViewUpdate>,
    updates_rx: mpsc::UnboundedReceiver<ViewUpdate>,
    revision_tx: watch::Sender<u64>,
    revision: u64,
}

impl FunctionView {
    pub fn new(target: FunctionTarget, api: Arc<dyn FunctionApi>, watch: Arc<ResourceWatchClient>) -> Self {
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        let (revision_tx, _) = watch::channel(0u64);
        Self {
            target,
            api,
            watch,
            lifecycle: Lifecycle::Unmounted,
            entity: None,
            state: ReconciliationState::new(),
            edit: EditCoordinator::new(),
            active: None,
            generation: 0,
            saves_in_flight: 0,
            deleted: false,
            last_error: None,
            updates_tx,
            updates_rx,
            revision_tx,
            revision: 0,
        }
    }

    // ----------------- Lifecycle -----------------

    /// Mount the view and request the function. The result arrives on the update channel.
    pub fn mount(&mut self) {
        if self.lifecycle != Lifecycle::Unmounted {
            warn!(function = %self.target, "view: mount ignored, already mounted or closed");
            return;
        }
        self.lifecycle = Lifecycle::Mounted;
        info!(function = %self.target, "view: mounted; fetching function");
        let api = Arc::clone(&self.api);
        let target = self.target.clone();
        let tx = self.updates_tx.clone();
        tokio::spawn(async move {
            let update = match api.get_function(&target).await {
                Ok(entity) => ViewUpdate::Entity(entity),
                Err(error) => ViewUpdate::ApiError { op: ApiOp::Get, error },
            };
            let _ = tx.send(update);
        });
        self.bump();
    }

    /// Close the active subscription. Every later update is ignored.
    pub fn unmount(&mut self) {
        if self.lifecycle == Lifecycle::Closed {
            return;
        }
        if let Some(active) = self.active.take() {
            active.handle.close();
        }
        self.lifecycle = Lifecycle::Closed;
        info!(function = %self.target, epoch = self.state.epoch(), "view: unmounted");
        self.bump();
    }

    pub fn is_mounted(&self) -> bool { self.lifecycle == Lifecycle::Mounted }

    pub fn phase(&self) -> ViewPhase {
        match self.lifecycle {
            Lifecycle::Unmounted => ViewPhase::Unmounted,
            Lifecycle::Closed => ViewPhase::Closed,
            Lifecycle::Mounted => match (&self.entity, self.state.phase()) {
                (None, _) => ViewPhase::AwaitingEntity,
                (Some(_), SnapshotPhase::AwaitingFirstSnapshot) => ViewPhase::AwaitingSnapshot,
                (Some(_), SnapshotPhase::SnapshotKnown) => ViewPhase::Live,
            },
        }
    }

    // ----------------- Update pump -----------------

    /// Wait for the next update and apply it. Returns whether the view changed.
    pub async fn process_next(&mut self) -> bool {
        match self.updates_rx.recv().await {
            Some(update) => self.apply(update),
            None => false,
        }
    }

    /// Apply every update already queued, without waiting. Returns how many changed the view.
    pub fn drain_updates(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(update) = self.updates_rx.try_recv() {
            if self.apply(update) {
                applied += 1;
            }
        }
        applied
    }

    /// Apply one update. Returns whether the view changed.
    pub fn apply(&mut self, update: ViewUpdate) -> bool {
        if !self.is_mounted() {
            debug!(?update, "view: update ignored while not mounted");
            return false;
        }
        match update {
            ViewUpdate::Entity(entity) => self.on_entity(entity),
            ViewUpdate::Saved(entity) => {
                self.saves_in_flight = self.saves_in_flight.saturating_sub(1);
                info!(rv = ?entity.metadata.resource_version, "view: save confirmed");
                self.last_error = None;
                self.on_entity(entity);
            }
            ViewUpdate::Watch { generation, message } => {
                if !self.on_watch(generation, message) {
                    return false;
                }
            }
            ViewUpdate::ApiError { op, error } => {
                if op == ApiOp::Update {
                    self.saves_in_flight = self.saves_in_flight.saturating_sub(1);
                }
                warn!(function = %self.target, %op, error = %error, "view: api call failed");
                self.last_error = Some(format!("{} failed: {}", op, error));
            }
            ViewUpdate::Deleted(target) => {
                info!(function = %target, "view: function deleted");
                self.deleted = true;
            }
        }
        self.bump();
        true
    }

    /// Entity pushed by the embedding shell (a prop update).
    pub fn receive_entity(&mut self, entity: FunctionEntity) -> bool {
        self.apply(ViewUpdate::Entity(entity))
    }

    fn on_entity(&mut self, entity: FunctionEntity) {
        let phase = self.state.phase();
        let outcome = self.edit.on_entity_refresh(&entity, phase);
        debug!(?outcome, ?phase, "view: entity refresh");
        // Before the first snapshot every entity update (re)subscribes, identity change or not.
        if phase == SnapshotPhase::AwaitingFirstSnapshot {
            self.resubscribe(&entity);
        }
        self.entity = Some(entity);
    }

    fn resubscribe(&mut self, entity: &FunctionEntity) {
        if let Some(previous) = self.active.take() {
            debug!(generation = previous.generation, "view: closing previous subscription");
            previous.handle.close();
        }
        let namespace = if entity.namespace().is_empty() { self.target.namespace.as_str() } else { entity.namespace() };
        self.generation += 1;
        let generation = self.generation;
        let tx = self.updates_tx.clone();
        let res = self.watch.subscribe(namespace, entity.name(), move |message| {
            let _ = tx.send(ViewUpdate::Watch { generation, message });
        });
        match res {
            Ok(handle) => {
                counter!("view_subscriptions", 1u64);
                info!(generation, filter = %handle.filter().key(), "view: watching deployment");
                self.active = Some(ActiveWatch { generation, handle, open: true });
            }
            Err(e) => {
                warn!(error = %e, "view: cannot subscribe");
                self.last_error = Some(e.to_string());
            }
        }
    }

    fn on_watch(&mut self, generation: WatchGeneration, message: WatchMessage) -> bool {
        let Some(active) = self.active.as_mut().filter(|a| a.generation == generation) else {
            debug!(generation, "view: dropping message from a closed subscription");
            return false;
        };
        match message {
            WatchMessage::Snapshot(snapshot) => {
                let first = self.state.phase() == SnapshotPhase::AwaitingFirstSnapshot;
                let epoch = self.state.on_watch_event(snapshot);
                self.last_error = None;
                if first {
                    info!(epoch, "view: first deployment snapshot");
                }
            }
            WatchMessage::DecodeError(reason) => {
                self.last_error = Some(format!("watch decode error: {}", reason));
            }
            WatchMessage::ServerStatus(status) => {
                self.last_error = Some(format!("watch status: {}", status));
            }
            WatchMessage::Disconnected(reason) => {
                // no reconnect; the last snapshot stays on screen until a resubscribe
                active.open = false;
                self.last_error = Some(format!("watch disconnected: {}", reason));
            }
            WatchMessage::Ended => {
                active.open = false;
                info!(generation, "view: watch stream ended by server");
            }
        }
        true
    }

    // ----------------- User actions -----------------

    /// Editor change. Accepted whenever the view is not closed.
    pub fn edit(&mut self, text: impl Into<String>) {
        if self.lifecycle == Lifecycle::Closed {
            return;
        }
        self.edit.on_edit(text);
        self.bump();
    }

    /// Submit the buffer. Returns false, sending nothing, when no entity is known yet.
    pub fn save(&mut self) -> bool {
        if !self.is_mounted() {
            return false;
        }
        let Some(request) = self.edit.save(self.entity.as_ref()) else {
            debug!("view: save ignored, no function loaded");
            return false;
        };
        counter!("view_saves", 1u64);
        info!(function = %self.target, bytes = request.spec.function.len(), "view: saving function");
        self.saves_in_flight += 1;
        let api = Arc::clone(&self.api);
        let tx = self.updates_tx.clone();
        tokio::spawn(async move {
            let update = match api.update_function(request).await {
                Ok(entity) => ViewUpdate::Saved(entity),
                Err(error) => ViewUpdate::ApiError { op: ApiOp::Update, error },
            };
            let _ = tx.send(update);
        });
        self.bump();
        true
    }

    /// Pass-through to the function API.
    pub fn delete(&mut self) -> bool {
        if !self.is_mounted() {
            return false;
        }
        let target = self.entity.as_ref().map(|e| e.target()).unwrap_or_else(|| self.target.clone());
        info!(function = %target, "view: deleting function");
        let api = Arc::clone(&self.api);
        let tx = self.updates_tx.clone();
        tokio::spawn(async move {
            let update = match api.delete_function(&target).await {
                Ok(()) => ViewUpdate::Deleted(target),
                Err(error) => ViewUpdate::ApiError { op: ApiOp::Delete, error },
            };
            let _ = tx.send(update);
        });
        true
    }

    // ----------------- Reads -----------------

    pub fn target(&self) -> &FunctionTarget { &self.target }
    pub fn entity(&self) -> Option<&FunctionEntity> { self.entity.as_ref() }
    pub fn snapshot(&self) -> Option<&DeploymentSnapshot> { self.state.snapshot() }
    pub fn reconciliation(&self) -> &ReconciliationState { &self.state }
    pub fn buffer(&self) -> &EditBuffer { self.edit.buffer() }
    /// Most recent failure. Cleared by the next snapshot or confirmed save.
    pub fn last_error(&self) -> Option<&str> { self.last_error.as_deref() }
    pub fn is_deleted(&self) -> bool { self.deleted }
    pub fn saves_in_flight(&self) -> usize { self.saves_in_flight }

    /// Filter of the live subscription, if any.
    pub fn watching(&self) -> Option<&WatchFilter> { self.active.as_ref().map(|a| a.handle.filter()) }

    /// Revision counter bumped on every state change, for shells that redraw on change.
    pub fn subscribe_changes(&self) -> watch::Receiver<u64> { self.revision_tx.subscribe() }

    fn bump(&mut self) {
        self.revision = self.revision.wrapping_add(1);
        self.revision_tx.send_replace(self.revision);
    }

    /// Loading until both the entity and a deployment snapshot are present.
    pub fn render(&self) -> ViewModel {
        let (Some(f), Some(d)) = (self.entity.as_ref(), self.state.snapshot()) else {
            return ViewModel::Loading;
        };
        let buffer = self.edit.buffer();
        ViewModel::Ready(ReadyView {
            function: FunctionInfo {
                name: f.name().to_string(),
                namespace: f.namespace().to_string(),
                runtime: f.spec.runtime.clone(),
                handler: f.spec.handler.clone(),
                deps: f.spec.deps.clone(),
            },
            deployment: DeploymentView {
                name: d.name.clone(),
                rollout: d.rollout(),
                observed_at: self.state.observed_at(),
                stream_open: self.active.as_ref().map(|a| a.open).unwrap_or(false),
            },
            controls: Controls { save_enabled: self.edit.save_enabled(), saves_in_flight: self.saves_in_flight },
            editor: EditorView { runtime: f.spec.runtime.clone(), text: buffer.text().to_string() },
        })
    }
}
