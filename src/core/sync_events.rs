//! Events published by the verification service.

use crate::entities::{ConnectionIndicator, SubjectId};
use crate::error::SyncError;

// === Stream ===

#[derive(Clone, Debug)]
pub struct LayerCompletedEvent {
    pub subject: SubjectId,
    pub layer_id: String,
    /// False when the frame replaced an already known layer
    pub is_new: bool,
}

#[derive(Clone, Debug)]
pub struct ProgressChangedEvent(pub SubjectId);

#[derive(Clone, Debug)]
pub struct VerificationCompleteEvent {
    pub subject: SubjectId,
    pub result: serde_json::Value,
}

#[derive(Clone, Debug)]
pub struct ResyncCompletedEvent {
    pub subject: SubjectId,
    pub layer_count: usize,
}

/// The layer list could not be fetched; streamed layers are kept.
#[derive(Clone, Debug)]
pub struct ResyncFailedEvent {
    pub subject: SubjectId,
    pub error: SyncError,
}

// === Connection ===

#[derive(Clone, Debug)]
pub struct ConnectionChangedEvent {
    pub subject: SubjectId,
    pub indicator: ConnectionIndicator,
}

#[derive(Clone, Debug)]
pub struct SyncErrorEvent {
    pub subject: SubjectId,
    pub error: SyncError,
}

// === Playback ===

#[derive(Clone, Debug)]
pub struct LayerSelectedEvent {
    pub subject: SubjectId,
    pub index: usize,
    pub layer_id: String,
}

#[derive(Clone, Debug)]
pub struct PlaybackStateChangedEvent {
    pub subject: SubjectId,
    pub playing: bool,
}
