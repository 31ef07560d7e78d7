#![forbid(unsafe_code)]

use fnview_core::DeploymentSnapshot;
use fnview_store::{ReconciliationState, SnapshotPhase};

fn obj(rv: &str, ready: i64, extra: Option<(&str, &str)>) -> serde_json::Value {
    let mut v = serde_json::json!({
        "metadata": { "name": "hello", "namespace": "default", "resourceVersion": rv },
        "status": { "readyReplicas": ready }
    });
    if let Some((k, val)) = extra {
        v["metadata"]["annotations"] = serde_json::json!({ k: val });
    }
    v
}

fn snap(v: serde_json::Value) -> DeploymentSnapshot {
    DeploymentSnapshot::from_object(v).expect("snapshot")
}

#[test]
fn replay_is_last_write_wins() {
    let mut st = ReconciliationState::new();

    // Arrival order is authoritative, even when resource versions go "backwards".
    let events = vec![
        obj("10", 0, Some(("note", "first"))),
        obj("12", 1, None),
        obj("11", 2, Some(("other", "x"))),
        obj("13", 3, None),
    ];
    for e in events.iter().cloned() {
        st.on_watch_event(snap(e));
    }

    let last = st.snapshot().expect("snapshot");
    assert_eq!(last, &snap(events[3].clone()));
    assert_eq!(st.epoch(), 4);
    assert_eq!(st.phase(), SnapshotPhase::SnapshotKnown);
}

#[test]
fn replacement_is_wholesale_not_merged() {
    let mut st = ReconciliationState::new();
    st.on_watch_event(snap(obj("1", 1, Some(("keep", "me")))));
    st.on_watch_event(snap(obj("2", 2, None)));

    let last = st.snapshot().expect("snapshot");
    // fields only present in the earlier event must not survive
    assert!(last.raw.pointer("/metadata/annotations").is_none());
    assert_eq!(last.rollout().ready, 2);
}

#[test]
fn identical_events_still_count() {
    let mut st = ReconciliationState::new();
    st.on_watch_event(snap(obj("5", 1, None)));
    st.on_watch_event(snap(obj("5", 1, None)));
    assert_eq!(st.epoch(), 2);
    assert_eq!(st.snapshot().and_then(|s| s.resource_version.as_deref()), Some("5"));
}
