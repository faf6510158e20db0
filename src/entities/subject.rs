//! Verification subject and its per-subject state.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use super::layer::Layer;
use super::overlay::Overlay;
use super::progress::ProgressSnapshot;
use crate::error::SyncError;

/// Key of the asset under verification.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubjectId(String);

impl SubjectId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SubjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SubjectId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for SubjectId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<u64> for SubjectId {
    fn from(id: u64) -> Self {
        Self(id.to_string())
    }
}

/// Connection indicator as shown to the user.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConnectionState {
    pub connected: bool,
    pub last_error: Option<SyncError>,
}

/// Coarse indicator value (connected / disconnected / error).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionIndicator {
    Connected,
    Disconnected,
    Error,
}

impl ConnectionState {
    pub fn indicator(&self) -> ConnectionIndicator {
        if self.connected {
            ConnectionIndicator::Connected
        } else if self.last_error.is_some() {
            ConnectionIndicator::Error
        } else {
            ConnectionIndicator::Disconnected
        }
    }
}

/// Everything the store keeps for one subject.
///
/// Layers are keyed by id in arrival order: re-delivery replaces in place,
/// new ids append.
#[derive(Clone, Debug, Default)]
pub struct SubjectState {
    pub layers: IndexMap<String, Layer>,
    pub overlays: Vec<Overlay>,
    pub progress: Option<ProgressSnapshot>,
    pub connection: ConnectionState,
    /// Set once `verification_complete` arrived
    pub completed: bool,
}

impl SubjectState {
    pub fn layer(&self, id: &str) -> Option<&Layer> {
        self.layers.get(id)
    }

    pub fn layer_at(&self, index: usize) -> Option<&Layer> {
        self.layers.get_index(index).map(|(_, layer)| layer)
    }

    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    pub fn overlay(&self, layer_id: &str) -> Option<&Overlay> {
        self.overlays.iter().find(|o| o.layer_id == layer_id)
    }

    pub(crate) fn overlay_mut(&mut self, layer_id: &str) -> Option<&mut Overlay> {
        self.overlays.iter_mut().find(|o| o.layer_id == layer_id)
    }
}
