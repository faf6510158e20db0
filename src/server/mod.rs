//! REST API server for remote control of mounted subjects.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────┐   crossbeam channel   ┌──────────────────────┐
//! │   API Server Thread      │  ──── ApiCommand ───▶ │   Main Loop          │
//! │   (rouille HTTP)         │                       │   (service.tick)     │
//! │                          │                       │                      │
//! │  POST /api/subjects/42/  │                       │  command.execute()   │
//! │       play               │                       │                      │
//! └──────────────────────────┘                       └──────────────────────┘
//!          │                                                   │
//!          │  Arc<SharedApiState>                              │
//!          │◀──────────── read snapshots ──────────────────────│
//!          │                                          updates each tick
//! ```
//!
//! # Endpoints
//!
//! | Method | Path                                        | Description              |
//! |--------|---------------------------------------------|--------------------------|
//! | GET    | `/api/health`                               | Health check             |
//! | GET    | `/api/status`                               | All mounted subjects     |
//! | GET    | `/api/subjects/{id}`                        | One subject snapshot     |
//! | POST   | `/api/subjects/{id}/play`                   | Start playback           |
//! | POST   | `/api/subjects/{id}/pause`                  | Pause playback           |
//! | POST   | `/api/subjects/{id}/toggle-play`            | Play / pause             |
//! | POST   | `/api/subjects/{id}/next`                   | Step forward             |
//! | POST   | `/api/subjects/{id}/previous`               | Step backward            |
//! | POST   | `/api/subjects/{id}/toggle-loop`            | Toggle loop mode         |
//! | POST   | `/api/subjects/{id}/speed/{slow,normal,fast}` | Playback speed         |
//! | POST   | `/api/subjects/{id}/scrub/{pct}`            | Jump to position 0..100  |
//! | POST   | `/api/subjects/{id}/seek/{n}`               | Jump to layer index      |
//! | POST   | `/api/subjects/{id}/start`                  | Send `start_verification`|
//! | POST   | `/api/subjects/{id}/retry`                  | Reconnect after failure  |
//! | POST   | `/api/subjects/{id}/overlays/{layer}/...`   | Overlay edits            |
//! | POST   | `/api/base-map/{satellite,street}`          | Switch base map          |

mod api;

pub use api::{ApiCommand, ApiServer, SharedApiState, StatusResponse, SubjectAction};
