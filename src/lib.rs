//! GEOSYNC - real-time sync layer for geospatial verification jobs
//!
//! Re-exports all modules for use by binary targets.

// Core plumbing (events, timers)
pub mod core;

// Domain
pub mod entities;
pub mod error;
pub mod net;
pub mod store;

// Presentation
pub mod compositor;
pub mod hotkeys;
pub mod playback;
pub mod progress;
pub mod raster;

// App modules
pub mod cli;
pub mod config;
pub mod paths;
pub mod server;
pub mod service;

// Re-export commonly used types
pub use core::event_bus::{BoxedEvent, EventBus, downcast_event};
pub use config::SyncConfig;
pub use entities::{Layer, Overlay, SubjectId, SubjectState};
pub use error::SyncError;
pub use service::{SubjectCallbacks, SubjectOptions, VerificationService};
