//! Networking: duplex verification channel and HTTP collaborators.
//!
//! - `channel`    - transport-neutral event/command queues + `Connector` trait
//! - `ws`         - tungstenite socket thread (production connector)
//! - `protocol`   - frame decoding / encoding
//! - `connection` - lifecycle, reconnect policy, keepalive
//! - `http`       - layer list fetch for resync

pub mod channel;
pub mod connection;
pub mod http;
pub mod protocol;
pub mod ws;

pub use channel::{Channel, ChannelEvent, ChannelPeer, Connector, channel_pair};
pub use connection::{ChannelPhase, ConnectionEvent, ConnectionManager};
pub use http::{HttpLayerApi, LayerApi, ResyncResult, Resyncer};
pub use protocol::{InboundFrame, OutboundFrame};
pub use ws::WsConnector;
