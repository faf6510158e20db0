//! Entities module - data model of a verification subject
//!
//! Plain data, no I/O:
//! - `Layer` / `Bounds` - completed artifacts and their extents
//! - `Overlay` / `BlendMode` - map placement state per layer
//! - `ProgressSnapshot` / `Stage` - pipeline progress
//! - `SubjectState` - everything the store keeps per subject

pub mod layer;
pub mod overlay;
pub mod progress;
pub mod subject;

pub use layer::{Bounds, GeoBounds, Layer, LayerMetadata};
pub use overlay::{BlendMode, DEFAULT_OVERLAY_OPACITY, Overlay};
pub use progress::{ProgressSnapshot, Stage};
pub use subject::{ConnectionIndicator, ConnectionState, SubjectId, SubjectState};
