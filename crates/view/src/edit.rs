#![forbid(unsafe_code)]

use fnview_core::FunctionEntity;
use fnview_store::SnapshotPhase;
use tracing::debug;

/// Source text shown in the editor plus whether it diverges from what was last saved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EditBuffer {
    text: String,
    modified: bool,
}

impl EditBuffer {
    pub fn text(&self) -> &str { &self.text }
    pub fn is_modified(&self) -> bool { self.modified }
}

/// What an entity refresh did to the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Text replaced with the entity's source, flag cleared.
    Reloaded,
    /// Treated as a save confirmation: flag cleared, text kept.
    Confirmed,
}

#[derive(Debug, Default)]
pub struct EditCoordinator {
    buffer: EditBuffer,
}

impl EditCoordinator {
    pub fn new() -> Self { Self::default() }

    pub fn buffer(&self) -> &EditBuffer { &self.buffer }

    /// Save control is enabled only while the buffer carries unsaved edits.
    pub fn save_enabled(&self) -> bool { self.buffer.modified }

    /// User edit. Allowed at any time, including while a save or refresh is pending.
    pub fn on_edit(&mut self, text: impl Into<String>) {
        self.buffer.text = text.into();
        self.buffer.modified = true;
    }

    /// A fresh entity arrived from the function API.
    ///
    /// Until the first deployment snapshot is known every entity seeds the editor. Afterwards
    /// a refresh only confirms a save: the text the user may still be typing is left alone.
    pub fn on_entity_refresh(&mut self, entity: &FunctionEntity, phase: SnapshotPhase) -> RefreshOutcome {
        self.buffer.modified = false;
        match phase {
            SnapshotPhase::AwaitingFirstSnapshot => {
                self.buffer.text = entity.spec.function.clone();
                debug!(function = %entity.name(), bytes = self.buffer.text.len(), "edit: buffer reloaded from entity");
                RefreshOutcome::Reloaded
            }
            SnapshotPhase::SnapshotKnown => {
                debug!(function = %entity.name(), "edit: refresh confirmed, buffer kept");
                RefreshOutcome::Confirmed
            }
        }
    }

    /// Build the update request: the current entity with only `spec.function` replaced.
    /// `None` when no entity is known yet, in which case nothing must be sent.
    /// The modified flag is left for the refresh that follows a successful save.
    pub fn save(&self, entity: Option<&FunctionEntity>) -> Option<FunctionEntity> {
        entity.map(|e| e.with_source(self.buffer.text.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fnview_core::{FunctionMeta, FunctionSpec};

    fn entity(source: &str) -> FunctionEntity {
        FunctionEntity {
            metadata: FunctionMeta { name: "hello".into(), namespace: "default".into(), ..Default::default() },
            spec: FunctionSpec {
                runtime: "nodejs8".into(),
                function: source.into(),
                handler: "hello.handler".into(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn edit_always_marks_modified() {
        let mut ed = EditCoordinator::new();
        ed.on_edit("a");
        assert_eq!(ed.buffer().text(), "a");
        assert!(ed.buffer().is_modified());

        // a refresh in between does not make a later edit count less
        ed.on_entity_refresh(&entity("x"), SnapshotPhase::SnapshotKnown);
        ed.on_edit("b");
        assert_eq!(ed.buffer().text(), "b");
        assert!(ed.save_enabled());
    }

    #[test]
    fn refresh_before_snapshot_reloads_text() {
        let mut ed = EditCoordinator::new();
        assert_eq!(ed.on_entity_refresh(&entity("x"), SnapshotPhase::AwaitingFirstSnapshot), RefreshOutcome::Reloaded);
        assert_eq!(ed.buffer().text(), "x");
        ed.on_edit("x-edited");
        assert_eq!(ed.on_entity_refresh(&entity("y"), SnapshotPhase::AwaitingFirstSnapshot), RefreshOutcome::Reloaded);
        assert_eq!(ed.buffer().text(), "y");
        assert!(!ed.buffer().is_modified());
    }

    #[test]
    fn refresh_after_snapshot_only_clears_flag() {
        let mut ed = EditCoordinator::new();
        ed.on_entity_refresh(&entity("y"), SnapshotPhase::AwaitingFirstSnapshot);
        ed.on_edit("y-edited");
        assert_eq!(ed.on_entity_refresh(&entity("z"), SnapshotPhase::SnapshotKnown), RefreshOutcome::Confirmed);
        assert_eq!(ed.buffer().text(), "y-edited");
        assert!(!ed.buffer().is_modified());
    }

    #[test]
    fn save_without_entity_builds_nothing() {
        let mut ed = EditCoordinator::new();
        ed.on_edit("code");
        assert!(ed.save(None).is_none());
        assert!(ed.buffer().is_modified());
    }

    #[test]
    fn save_overrides_only_the_source() {
        let mut ed = EditCoordinator::new();
        let current = entity("old");
        ed.on_edit("new");
        let req = ed.save(Some(&current)).expect("request");
        assert_eq!(req.spec.function, "new");
        assert_eq!(req.spec.runtime, current.spec.runtime);
        assert_eq!(req.spec.handler, current.spec.handler);
        assert_eq!(req.metadata, current.metadata);
        // no optimistic clearing
        assert!(ed.buffer().is_modified());
    }
}
