#![forbid(unsafe_code)]

use std::fmt;

use chrono::{DateTime, Utc};
use fnview_api::FnError;
use fnview_core::{FunctionEntity, FunctionTarget, RolloutStatus};
use fnview_kubehub::WatchMessage;

/// Generation of the view's watch subscription; bumped on every (re)subscribe.
pub type WatchGeneration = u64;

/// Everything that reaches the view asynchronously, applied strictly in arrival order.
#[derive(Debug)]
pub enum ViewUpdate {
    /// Entity from a fetch, or pushed by the embedding shell.
    Entity(FunctionEntity),
    /// Refreshed entity returned by a successful update.
    Saved(FunctionEntity),
    Watch { generation: WatchGeneration, message: WatchMessage },
    ApiError { op: ApiOp, error: FnError },
    Deleted(FunctionTarget),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiOp {
    Get,
    Update,
    Delete,
}

impl fmt::Display for ApiOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ApiOp::Get => "get",
            ApiOp::Update => "update",
            ApiOp::Delete => "delete",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewPhase {
    Unmounted,
    AwaitingEntity,
    AwaitingSnapshot,
    Live,
    /// Unmounted after having been mounted. Terminal.
    Closed,
}

/// What the view shows. Nothing partial: either a loading indicator or everything.
#[derive(Debug, Clone, PartialEq)]
pub enum ViewModel {
    Loading,
    Ready(ReadyView),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReadyView {
    pub function: FunctionInfo,
    pub deployment: DeploymentView,
    pub controls: Controls,
    pub editor: EditorView,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionInfo {
    pub name: String,
    pub namespace: String,
    pub runtime: String,
    pub handler: String,
    pub deps: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeploymentView {
    pub name: String,
    pub rollout: RolloutStatus,
    pub observed_at: Option<DateTime<Utc>>,
    /// False once the stream disconnected or ended; the snapshot is then stale.
    pub stream_open: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Controls {
    pub save_enabled: bool,
    pub saves_in_flight: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditorView {
    pub runtime: String,
    pub text: String,
}
