//! Layer reconciliation store - sole writer of per-subject state.
//!
//! Frames from the router and resync results from the HTTP side both land
//! here. Every mutation returns a [`StoreOutcome`] list so the service can
//! fire callbacks and events from current state without the store knowing
//! about either.
//!
//! Rules:
//! - completed `layer_update`: append new ids, replace known ids in place
//! - at most one overlay per layer id, auto-created with z = overlay count
//! - no frame removes a layer; only a resync replaces the set wholesale

use std::collections::HashMap;

use indexmap::IndexMap;
use log::{debug, info, trace, warn};
use serde_json::Value;

use crate::entities::{
    BlendMode, ConnectionState, DEFAULT_OVERLAY_OPACITY, Layer, Overlay, SubjectId, SubjectState,
};
use crate::error::SyncError;
use crate::net::InboundFrame;
use crate::net::protocol::LayerUpdate;

/// What a store mutation changed.
#[derive(Clone, Debug, PartialEq)]
pub enum StoreOutcome {
    LayerUpserted { layer_id: String, is_new: bool },
    OverlayCreated { layer_id: String },
    ProgressChanged,
    ProgressCleared,
    /// `verification_complete` payload, forwarded untouched
    Completed(Value),
    /// Caller should fetch the authoritative layer list
    ResyncRequested,
    ServerError(SyncError),
}

/// Subject-keyed state, owned by the service.
#[derive(Debug)]
pub struct ReconciliationStore {
    subjects: HashMap<SubjectId, SubjectState>,
    overlay_opacity: f32,
}

impl Default for ReconciliationStore {
    fn default() -> Self {
        Self::new(DEFAULT_OVERLAY_OPACITY)
    }
}

impl ReconciliationStore {
    pub fn new(overlay_opacity: f32) -> Self {
        Self {
            subjects: HashMap::new(),
            overlay_opacity: overlay_opacity.clamp(0.0, 1.0),
        }
    }

    // === Lifecycle ===

    /// Create state for a subject if missing.
    pub fn ensure(&mut self, subject: &SubjectId) -> &mut SubjectState {
        self.subjects.entry(subject.clone()).or_insert_with(|| {
            debug!("Store: new subject {}", subject);
            SubjectState::default()
        })
    }

    pub fn remove(&mut self, subject: &SubjectId) -> Option<SubjectState> {
        debug!("Store: dropping subject {}", subject);
        self.subjects.remove(subject)
    }

    pub fn get(&self, subject: &SubjectId) -> Option<&SubjectState> {
        self.subjects.get(subject)
    }

    pub fn contains(&self, subject: &SubjectId) -> bool {
        self.subjects.contains_key(subject)
    }

    pub fn subjects(&self) -> impl Iterator<Item = &SubjectId> {
        self.subjects.keys()
    }

    // === Stream ===

    /// Apply one decoded frame. Frames for unknown subjects are ignored.
    pub fn apply(&mut self, subject: &SubjectId, frame: InboundFrame) -> Vec<StoreOutcome> {
        let overlay_opacity = self.overlay_opacity;
        let Some(state) = self.subjects.get_mut(subject) else {
            debug!("Store: frame {} for unmounted subject {}", frame.kind(), subject);
            return Vec::new();
        };

        let mut out = Vec::new();
        match frame {
            InboundFrame::LayerUpdate(update) => {
                apply_layer_update(state, &update, overlay_opacity, &mut out)
            }
            InboundFrame::Progress(update) => {
                let snapshot = update.to_snapshot();
                trace!("Subject {} progress {} {}%", subject, snapshot.stage, snapshot.percentage);
                state.progress = Some(snapshot);
                out.push(StoreOutcome::ProgressChanged);
            }
            InboundFrame::VerificationComplete(result) => {
                info!("Subject {}: verification complete", subject);
                state.completed = true;
                if state.progress.take().is_some() {
                    out.push(StoreOutcome::ProgressCleared);
                }
                out.push(StoreOutcome::Completed(result));
                out.push(StoreOutcome::ResyncRequested);
            }
            InboundFrame::Error { message } => {
                warn!("Subject {}: server error: {}", subject, message);
                let err = SyncError::Server(message);
                state.connection.last_error = Some(err.clone());
                out.push(StoreOutcome::ServerError(err));
            }
            InboundFrame::Connected(_) => trace!("Subject {}: connected", subject),
            InboundFrame::Pong => trace!("Subject {}: pong", subject),
            // Answered by the connection manager, never forwarded
            InboundFrame::Ping => {}
            InboundFrame::Unknown(kind) => {
                debug!("Subject {}: ignoring unknown frame type '{}'", subject, kind);
            }
        }
        out
    }

    /// Replace the layer set with the authoritative list.
    ///
    /// Overlays of vanished layers are pruned, unseen layers get an
    /// auto-overlay, surviving overlays keep their user edits.
    pub fn replace_layers(&mut self, subject: &SubjectId, layers: Vec<Layer>) -> Vec<StoreOutcome> {
        let overlay_opacity = self.overlay_opacity;
        let Some(state) = self.subjects.get_mut(subject) else {
            return Vec::new();
        };

        let mut replaced: IndexMap<String, Layer> = IndexMap::with_capacity(layers.len());
        for layer in layers {
            // Duplicate ids in the payload: last one wins, first position kept
            replaced.insert(layer.id.clone(), layer);
        }
        info!(
            "Subject {}: resync replaced {} layers with {}",
            subject,
            state.layers.len(),
            replaced.len()
        );

        let mut out = Vec::new();
        for id in replaced.keys() {
            out.push(StoreOutcome::LayerUpserted {
                layer_id: id.clone(),
                is_new: !state.layers.contains_key(id),
            });
        }
        state.layers = replaced;

        let before = state.overlays.len();
        state.overlays.retain(|o| state.layers.contains_key(&o.layer_id));
        if state.overlays.len() != before {
            debug!("Subject {}: pruned {} dangling overlays", subject, before - state.overlays.len());
        }
        normalize_z(&mut state.overlays);

        let missing: Vec<String> = state
            .layers
            .keys()
            .filter(|id| state.overlay(id).is_none())
            .cloned()
            .collect();
        for layer_id in missing {
            add_auto_overlay(state, &layer_id, overlay_opacity);
            out.push(StoreOutcome::OverlayCreated { layer_id });
        }
        out
    }

    /// Connected clears the error slot; disconnected keeps it for display.
    pub fn set_connected(&mut self, subject: &SubjectId, connected: bool) -> Option<&ConnectionState> {
        let state = self.subjects.get_mut(subject)?;
        state.connection.connected = connected;
        if connected {
            state.connection.last_error = None;
        }
        Some(&state.connection)
    }

    /// Record a non-frame error (transport, protocol, http) in the error slot.
    pub fn record_error(&mut self, subject: &SubjectId, error: SyncError) {
        if let Some(state) = self.subjects.get_mut(subject) {
            state.connection.last_error = Some(error);
        }
    }

    // === Overlay user operations ===

    /// Add an overlay for a known layer. No-op if one exists.
    pub fn add_overlay(&mut self, subject: &SubjectId, layer_id: &str) -> bool {
        let overlay_opacity = self.overlay_opacity;
        let Some(state) = self.subjects.get_mut(subject) else {
            return false;
        };
        if !state.layers.contains_key(layer_id) || state.overlay(layer_id).is_some() {
            return false;
        }
        add_auto_overlay(state, layer_id, overlay_opacity);
        true
    }

    pub fn remove_overlay(&mut self, subject: &SubjectId, layer_id: &str) -> bool {
        let Some(state) = self.subjects.get_mut(subject) else {
            return false;
        };
        let before = state.overlays.len();
        state.overlays.retain(|o| o.layer_id != layer_id);
        normalize_z(&mut state.overlays);
        state.overlays.len() != before
    }

    pub fn set_overlay_opacity(&mut self, subject: &SubjectId, layer_id: &str, opacity: f32) -> bool {
        self.with_overlay(subject, layer_id, |o| o.set_opacity(opacity))
    }

    pub fn set_overlay_visible(&mut self, subject: &SubjectId, layer_id: &str, visible: bool) -> bool {
        self.with_overlay(subject, layer_id, |o| o.visible = visible)
    }

    pub fn set_overlay_blend_mode(&mut self, subject: &SubjectId, layer_id: &str, mode: BlendMode) -> bool {
        self.with_overlay(subject, layer_id, |o| o.blend_mode = mode)
    }

    /// Move one step up (drawn later). False if already on top.
    pub fn raise_overlay(&mut self, subject: &SubjectId, layer_id: &str) -> bool {
        self.swap_z(subject, layer_id, true)
    }

    /// Move one step down. False if already at the bottom.
    pub fn lower_overlay(&mut self, subject: &SubjectId, layer_id: &str) -> bool {
        self.swap_z(subject, layer_id, false)
    }

    fn with_overlay(&mut self, subject: &SubjectId, layer_id: &str, f: impl FnOnce(&mut Overlay)) -> bool {
        match self.subjects.get_mut(subject).and_then(|s| s.overlay_mut(layer_id)) {
            Some(overlay) => {
                f(overlay);
                true
            }
            None => false,
        }
    }

    fn swap_z(&mut self, subject: &SubjectId, layer_id: &str, up: bool) -> bool {
        let Some(state) = self.subjects.get_mut(subject) else {
            return false;
        };
        let Some(z) = state.overlay(layer_id).map(|o| o.z_index) else {
            return false;
        };
        let target = if up {
            z + 1
        } else if z == 0 {
            return false;
        } else {
            z - 1
        };
        let Some(other) = state.overlays.iter().position(|o| o.z_index == target) else {
            return false;
        };
        state.overlays[other].z_index = z;
        if let Some(overlay) = state.overlay_mut(layer_id) {
            overlay.z_index = target;
        }
        true
    }
}

fn apply_layer_update(
    state: &mut SubjectState,
    update: &LayerUpdate,
    overlay_opacity: f32,
    out: &mut Vec<StoreOutcome>,
) {
    if !update.is_complete() {
        debug!("Layer {} status '{}', waiting for completion", update.layer_id, update.status);
        return;
    }

    let layer = update.to_layer();
    let layer_id = layer.id.clone();
    // IndexMap::insert keeps the original position for known keys
    let is_new = state.layers.insert(layer_id.clone(), layer).is_none();
    debug!("Layer {} {}", layer_id, if is_new { "added" } else { "replaced" });
    out.push(StoreOutcome::LayerUpserted { layer_id: layer_id.clone(), is_new });

    if state.overlay(&layer_id).is_none() {
        add_auto_overlay(state, &layer_id, overlay_opacity);
        out.push(StoreOutcome::OverlayCreated { layer_id });
    }
}

fn add_auto_overlay(state: &mut SubjectState, layer_id: &str, opacity: f32) {
    let z_index = state.overlays.len();
    state.overlays.push(Overlay::auto(layer_id, z_index, opacity));
}

/// Re-number z-indices 0..n keeping relative order.
fn normalize_z(overlays: &mut [Overlay]) {
    let mut order: Vec<usize> = (0..overlays.len()).collect();
    order.sort_by_key(|&i| overlays[i].z_index);
    for (z, i) in order.into_iter().enumerate() {
        overlays[i].z_index = z;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{Bounds, LayerMetadata};
    use crate::net::protocol::decode;

    fn subject() -> SubjectId {
        SubjectId::from(42u64)
    }

    fn store() -> ReconciliationStore {
        let mut store = ReconciliationStore::default();
        store.ensure(&subject());
        store
    }

    fn layer_frame(id: &str, status: &str) -> InboundFrame {
        decode(&format!(
            r#"{{"type":"layer_update","layer_id":"{}","layer_type":"ndvi","status":"{}",
                "metadata":{{"bounds":{{"north":1.0,"south":0.0,"east":1.0,"west":0.0}}}}}}"#,
            id, status
        ))
        .unwrap()
    }

    fn layer(id: &str) -> Layer {
        Layer::new(
            id,
            "ndvi",
            LayerMetadata { bounds: Some(Bounds::new(1.0, 0.0, 1.0, 0.0)), ..Default::default() },
            None,
            None,
        )
    }

    #[test]
    fn test_completed_layer_creates_overlay() {
        let mut store = store();
        let out = store.apply(&subject(), layer_frame("7", "complete"));
        assert_eq!(
            out,
            vec![
                StoreOutcome::LayerUpserted { layer_id: "7".into(), is_new: true },
                StoreOutcome::OverlayCreated { layer_id: "7".into() },
            ]
        );
        let state = store.get(&subject()).unwrap();
        let overlay = state.overlay("7").unwrap();
        assert_eq!(overlay.opacity, 0.7);
        assert!(overlay.visible);
        assert_eq!(overlay.blend_mode, BlendMode::Normal);
        assert_eq!(overlay.z_index, 0);
    }

    #[test]
    fn test_pending_status_ignored() {
        let mut store = store();
        assert!(store.apply(&subject(), layer_frame("7", "processing")).is_empty());
        assert_eq!(store.get(&subject()).unwrap().layer_count(), 0);
    }

    #[test]
    fn test_duplicate_delivery_is_idempotent() {
        let mut store = store();
        store.apply(&subject(), layer_frame("7", "complete"));
        store.apply(&subject(), layer_frame("8", "complete"));
        let out = store.apply(&subject(), layer_frame("7", "complete"));
        assert_eq!(out, vec![StoreOutcome::LayerUpserted { layer_id: "7".into(), is_new: false }]);

        let state = store.get(&subject()).unwrap();
        assert_eq!(state.layer_count(), 2);
        assert_eq!(state.layer_at(0).unwrap().id, "7");
        assert_eq!(state.overlays.len(), 2);
        assert_eq!(state.overlay("8").unwrap().z_index, 1);
    }

    #[test]
    fn test_layer_count_bounded_and_monotonic() {
        let mut store = store();
        let ids = ["1", "2", "1", "3", "2", "2", "4", "1"];
        let mut seen = std::collections::HashSet::new();
        let mut last = 0;
        for id in ids {
            seen.insert(id);
            store.apply(&subject(), layer_frame(id, "complete"));
            let state = store.get(&subject()).unwrap();
            assert!(state.layer_count() <= seen.len());
            assert!(state.layer_count() >= last);
            last = state.layer_count();

            let mut overlay_ids: Vec<_> = state.overlays.iter().map(|o| o.layer_id.clone()).collect();
            overlay_ids.sort();
            overlay_ids.dedup();
            assert_eq!(overlay_ids.len(), state.overlays.len());
        }
        assert_eq!(last, 4);
    }

    #[test]
    fn test_degenerate_bounds_still_stored() {
        let mut store = store();
        let frame = decode(
            r#"{"type":"layer_update","layer_id":"9","layer_type":"rgb","status":"complete",
                "metadata":{"bounds":{"north":10,"south":10,"east":5,"west":5}}}"#,
        )
        .unwrap();
        store.apply(&subject(), frame);
        let state = store.get(&subject()).unwrap();
        assert_eq!(state.layer_count(), 1);
        assert!(!state.layer("9").unwrap().is_renderable());
    }

    #[test]
    fn test_progress_and_completion() {
        let mut store = store();
        let progress = decode(r#"{"type":"progress","stage":"geocoding","percentage":10}"#).unwrap();
        assert_eq!(store.apply(&subject(), progress), vec![StoreOutcome::ProgressChanged]);
        assert_eq!(store.get(&subject()).unwrap().progress.as_ref().unwrap().percentage, 10.0);

        let done = decode(r#"{"type":"verification_complete","ok":true}"#).unwrap();
        let out = store.apply(&subject(), done);
        assert_eq!(out[0], StoreOutcome::ProgressCleared);
        assert!(matches!(&out[1], StoreOutcome::Completed(v) if v["ok"] == true));
        assert_eq!(out[2], StoreOutcome::ResyncRequested);

        let state = store.get(&subject()).unwrap();
        assert!(state.progress.is_none());
        assert!(state.completed);
    }

    #[test]
    fn test_server_error_recorded() {
        let mut store = store();
        let out = store.apply(&subject(), InboundFrame::Error { message: "quota".into() });
        assert_eq!(out, vec![StoreOutcome::ServerError(SyncError::Server("quota".into()))]);
        assert_eq!(
            store.get(&subject()).unwrap().connection.last_error,
            Some(SyncError::Server("quota".into()))
        );
    }

    #[test]
    fn test_ack_and_unknown_frames_change_nothing() {
        let mut store = store();
        assert!(store.apply(&subject(), InboundFrame::Pong).is_empty());
        assert!(store.apply(&subject(), InboundFrame::Connected(Value::Null)).is_empty());
        assert!(store.apply(&subject(), InboundFrame::Unknown("x".into())).is_empty());
        let state = store.get(&subject()).unwrap();
        assert_eq!(state.layer_count(), 0);
        assert!(state.progress.is_none());
    }

    #[test]
    fn test_connection_flag() {
        let mut store = store();
        store.record_error(&subject(), SyncError::Transport("reset".into()));
        let conn = store.set_connected(&subject(), false).unwrap();
        assert!(conn.last_error.is_some());
        let conn = store.set_connected(&subject(), true).unwrap();
        assert!(conn.connected);
        assert!(conn.last_error.is_none());
        assert!(store.set_connected(&SubjectId::from("other"), true).is_none());
    }

    #[test]
    fn test_frames_for_unknown_subject_ignored() {
        let mut store = store();
        assert!(store.apply(&SubjectId::from("other"), layer_frame("1", "complete")).is_empty());
        assert!(!store.contains(&SubjectId::from("other")));
    }

    #[test]
    fn test_resync_replaces_and_keeps_overlay_edits() {
        let mut store = store();
        store.apply(&subject(), layer_frame("1", "complete"));
        store.apply(&subject(), layer_frame("2", "complete"));
        store.set_overlay_opacity(&subject(), "2", 0.3);

        let out = store.replace_layers(&subject(), vec![layer("2"), layer("3")]);
        assert!(out.contains(&StoreOutcome::LayerUpserted { layer_id: "3".into(), is_new: true }));
        assert!(out.contains(&StoreOutcome::OverlayCreated { layer_id: "3".into() }));

        let state = store.get(&subject()).unwrap();
        let ids: Vec<_> = state.layers.keys().cloned().collect();
        assert_eq!(ids, vec!["2", "3"]);
        assert!(state.overlay("1").is_none());
        assert_eq!(state.overlay("2").unwrap().opacity, 0.3);
        assert_eq!(state.overlay("2").unwrap().z_index, 0);
        assert_eq!(state.overlay("3").unwrap().z_index, 1);
    }

    #[test]
    fn test_overlay_user_ops() {
        let mut store = store();
        for id in ["1", "2", "3"] {
            store.apply(&subject(), layer_frame(id, "complete"));
        }
        assert!(store.set_overlay_opacity(&subject(), "1", 3.0));
        assert!(store.set_overlay_visible(&subject(), "2", false));
        assert!(store.set_overlay_blend_mode(&subject(), "3", BlendMode::Multiply));
        assert!(!store.set_overlay_visible(&subject(), "missing", false));

        assert!(store.raise_overlay(&subject(), "1"));
        assert!(!store.lower_overlay(&subject(), "2"));
        assert!(!store.raise_overlay(&subject(), "3"));

        let state = store.get(&subject()).unwrap();
        assert_eq!(state.overlay("1").unwrap().opacity, 1.0);
        assert_eq!(state.overlay("1").unwrap().z_index, 1);
        assert_eq!(state.overlay("2").unwrap().z_index, 0);

        assert!(store.remove_overlay(&subject(), "2"));
        assert!(!store.add_overlay(&subject(), "1"));
        assert!(store.add_overlay(&subject(), "2"));
        assert!(!store.add_overlay(&subject(), "nope"));
        let state = store.get(&subject()).unwrap();
        assert_eq!(state.overlays.len(), 3);
        assert_eq!(state.overlay("2").unwrap().z_index, 2);
        assert_eq!(state.overlay("1").unwrap().z_index, 0);
    }
}
