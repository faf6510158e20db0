//! Connection manager - channel lifecycle, reconnection policy, keepalive.
//!
//! # State machine
//!
//! ```text
//!            open()                Opened
//!   Idle ───────────▶ Connecting ─────────▶ Open
//!    ▲                    │                   │
//!    │     Closed(!=1000) │                   │ Closed(!=1000)
//!    │   retries < max    ▼                   ▼
//!    └──── timer ◀── Reconnecting ◀───────────┘
//!                         │
//!                         │ retries == max
//!                         ▼
//!                     Exhausted ── retry() ──▶ Connecting
//! ```
//!
//! A close with code 1000, or an explicit `close()`, ends in `Closed` and
//! never reconnects.
//!
//! The manager never touches subject state: it turns channel traffic into
//! [`ConnectionEvent`]s and the service hands those to the store.

use std::sync::Arc;
use std::time::Instant;

use log::{debug, error, info, trace, warn};
use serde::Serialize;
use url::Url;

use super::channel::{CLOSE_NORMAL, Channel, ChannelEvent, Connector};
use super::protocol::{InboundFrame, OutboundFrame, decode};
use crate::config::ReconnectPolicy;
use crate::core::Timer;
use crate::error::SyncError;

/// Channel lifecycle phase
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelPhase {
    Idle,
    Connecting,
    Open,
    /// Waiting for the reconnect timer
    Reconnecting,
    /// Closed normally, no reconnect
    Closed,
    /// Reconnect attempts used up
    Exhausted,
}

/// Output of [`ConnectionManager::poll`], in arrival order.
#[derive(Clone, Debug, PartialEq)]
pub enum ConnectionEvent {
    Opened,
    /// Decoded frame for the router (pings are answered here and not forwarded)
    Frame(InboundFrame),
    /// Non-terminal failure: transport error or malformed frame
    Error(SyncError),
    Closed { code: u16 },
    ReconnectScheduled { attempt: u32 },
    /// Terminal: carries `SyncError::ReconnectExhausted`
    Exhausted(SyncError),
}

pub struct ConnectionManager {
    url: Url,
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    channel: Option<Channel>,
    phase: ChannelPhase,
    retries: u32,
    auto_reconnect: bool,
    reconnect_timer: Timer,
    last_error: Option<SyncError>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("path", &self.url.path())
            .field("phase", &self.phase)
            .field("retries", &self.retries)
            .field("auto_reconnect", &self.auto_reconnect)
            .finish()
    }
}

impl ConnectionManager {
    pub fn new(url: Url, connector: Arc<dyn Connector>, policy: ReconnectPolicy) -> Self {
        Self {
            url,
            connector,
            policy,
            channel: None,
            phase: ChannelPhase::Idle,
            retries: 0,
            auto_reconnect: true,
            reconnect_timer: Timer::new(),
            last_error: None,
        }
    }

    pub fn phase(&self) -> ChannelPhase {
        self.phase
    }

    pub fn is_open(&self) -> bool {
        self.phase == ChannelPhase::Open
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn last_error(&self) -> Option<&SyncError> {
        self.last_error.as_ref()
    }

    pub fn reconnect_pending(&self) -> bool {
        self.reconnect_timer.is_armed()
    }

    /// Open the channel. No-op while connecting or open.
    pub fn open(&mut self) {
        if matches!(self.phase, ChannelPhase::Connecting | ChannelPhase::Open) {
            debug!("Channel {} already {:?}, open() ignored", self.url.path(), self.phase);
            return;
        }
        self.auto_reconnect = true;
        self.reconnect_timer.cancel();
        self.connect();
    }

    /// Explicit user retry after the attempts ran out (or any other stop).
    pub fn retry(&mut self) {
        info!("Manual retry for {}", self.url.path());
        self.retries = 0;
        self.last_error = None;
        self.open();
    }

    /// Normal shutdown. Disables auto-reconnect for this instance.
    pub fn close(&mut self) {
        self.auto_reconnect = false;
        self.reconnect_timer.cancel();
        if let Some(channel) = self.channel.take() {
            info!("Closing channel {}", self.url.path());
            channel.close(CLOSE_NORMAL);
        }
        self.phase = ChannelPhase::Closed;
    }

    /// Send a frame. Dropped with a warning unless the channel is open.
    pub fn send(&self, frame: OutboundFrame) -> bool {
        if self.phase != ChannelPhase::Open {
            warn!(
                "Channel {} not open ({:?}), dropping {:?}",
                self.url.path(),
                self.phase,
                frame
            );
            return false;
        }
        match &self.channel {
            Some(channel) => {
                trace!("-> {:?}", frame);
                channel.send_text(frame.encode())
            }
            None => false,
        }
    }

    /// Run reconnect timer and drain channel traffic.
    pub fn poll(&mut self, now: Instant) -> Vec<ConnectionEvent> {
        let mut out = Vec::new();

        if self.reconnect_timer.fire(now) && self.auto_reconnect {
            info!(
                "Reconnecting {} (attempt {}/{})",
                self.url.path(),
                self.retries,
                self.policy.max_attempts
            );
            self.connect();
        }

        let events = match self.channel.as_mut() {
            Some(channel) => channel.drain(),
            None => return out,
        };

        for event in events {
            match event {
                ChannelEvent::Opened => {
                    info!("Channel {} open", self.url.path());
                    self.phase = ChannelPhase::Open;
                    self.retries = 0;
                    self.last_error = None;
                    out.push(ConnectionEvent::Opened);
                }
                ChannelEvent::Text(text) => self.on_text(&text, &mut out),
                ChannelEvent::Error(msg) => {
                    warn!("Channel {} error: {}", self.url.path(), msg);
                    let err = SyncError::Transport(msg);
                    self.last_error = Some(err.clone());
                    out.push(ConnectionEvent::Error(err));
                }
                ChannelEvent::Closed { code, reason } => {
                    self.on_closed(code, &reason, now, &mut out);
                    // Anything after a close belongs to a dead socket
                    break;
                }
            }
        }
        out
    }

    fn connect(&mut self) {
        debug!("Opening channel {}", self.url.path());
        self.channel = Some(self.connector.connect(&self.url));
        self.phase = ChannelPhase::Connecting;
    }

    fn on_text(&mut self, text: &str, out: &mut Vec<ConnectionEvent>) {
        match decode(text) {
            Ok(InboundFrame::Ping) => {
                trace!("ping -> pong");
                self.send(OutboundFrame::Pong);
            }
            Ok(frame) => {
                trace!("<- {}", frame.kind());
                out.push(ConnectionEvent::Frame(frame));
            }
            Err(err) => {
                warn!("Dropping frame on {}: {}", self.url.path(), err);
                out.push(ConnectionEvent::Error(err));
            }
        }
    }

    fn on_closed(&mut self, code: u16, reason: &str, now: Instant, out: &mut Vec<ConnectionEvent>) {
        self.channel = None;
        out.push(ConnectionEvent::Closed { code });

        if code == CLOSE_NORMAL {
            info!("Channel {} closed normally", self.url.path());
            self.phase = ChannelPhase::Closed;
            return;
        }
        warn!("Channel {} closed abnormally: {} {}", self.url.path(), code, reason);

        if !self.auto_reconnect {
            self.phase = ChannelPhase::Closed;
            return;
        }

        if self.retries < self.policy.max_attempts {
            self.retries += 1;
            self.phase = ChannelPhase::Reconnecting;
            self.reconnect_timer.schedule(now, self.policy.delay());
            out.push(ConnectionEvent::ReconnectScheduled { attempt: self.retries });
        } else {
            error!(
                "Channel {} gave up after {} reconnect attempts",
                self.url.path(),
                self.retries
            );
            self.phase = ChannelPhase::Exhausted;
            let err = SyncError::ReconnectExhausted { attempts: self.retries };
            self.last_error = Some(err.clone());
            out.push(ConnectionEvent::Exhausted(err));
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if self.channel.is_some() {
            self.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::channel::testing::MockConnector;
    use crate::net::channel::{CLOSE_ABNORMAL, ChannelCommand};
    use std::time::Duration;

    fn manager(connector: &MockConnector) -> ConnectionManager {
        ConnectionManager::new(
            Url::parse("ws://localhost/ws/verification/42?token=t").unwrap(),
            Arc::new(connector.clone()),
            ReconnectPolicy::default(),
        )
    }

    fn abnormal() -> ChannelEvent {
        ChannelEvent::Closed { code: CLOSE_ABNORMAL, reason: "reset".into() }
    }

    #[test]
    fn test_open_is_idempotent() {
        let connector = MockConnector::default();
        let mut mgr = manager(&connector);
        mgr.open();
        mgr.open();
        assert_eq!(connector.connect_count(), 1);
        assert_eq!(mgr.phase(), ChannelPhase::Connecting);

        connector.last_peer().emit(ChannelEvent::Opened);
        let events = mgr.poll(Instant::now());
        assert_eq!(events, vec![ConnectionEvent::Opened]);
        mgr.open();
        assert_eq!(connector.connect_count(), 1);
    }

    #[test]
    fn test_send_rejected_unless_open() {
        let connector = MockConnector::default();
        let mut mgr = manager(&connector);
        assert!(!mgr.send(OutboundFrame::StartVerification));
        mgr.open();
        assert!(!mgr.send(OutboundFrame::StartVerification));

        let peer = connector.last_peer();
        peer.emit(ChannelEvent::Opened);
        mgr.poll(Instant::now());
        assert!(mgr.send(OutboundFrame::StartVerification));
        assert_eq!(
            MockConnector::sent_texts(&peer),
            vec![r#"{"type":"start_verification"}"#.to_string()]
        );
    }

    #[test]
    fn test_ping_yields_exactly_one_pong() {
        let connector = MockConnector::default();
        let mut mgr = manager(&connector);
        mgr.open();
        let peer = connector.last_peer();
        peer.emit(ChannelEvent::Opened);
        peer.emit(ChannelEvent::Text(r#"{"type":"ping"}"#.into()));

        let events = mgr.poll(Instant::now());
        assert_eq!(events, vec![ConnectionEvent::Opened]);
        assert_eq!(MockConnector::sent_texts(&peer), vec![r#"{"type":"pong"}"#.to_string()]);
    }

    #[test]
    fn test_malformed_frame_keeps_channel_open() {
        let connector = MockConnector::default();
        let mut mgr = manager(&connector);
        mgr.open();
        let peer = connector.last_peer();
        peer.emit(ChannelEvent::Opened);
        peer.emit(ChannelEvent::Text("{oops".into()));
        peer.emit(ChannelEvent::Text(r#"{"type":"pong"}"#.into()));

        let events = mgr.poll(Instant::now());
        assert_eq!(events.len(), 3);
        assert!(matches!(events[1], ConnectionEvent::Error(SyncError::Protocol(_))));
        assert_eq!(events[2], ConnectionEvent::Frame(InboundFrame::Pong));
        assert!(mgr.is_open());
    }

    #[test]
    fn test_normal_close_does_not_reconnect() {
        let connector = MockConnector::default();
        let mut mgr = manager(&connector);
        let t0 = Instant::now();
        mgr.open();
        let peer = connector.last_peer();
        peer.emit(ChannelEvent::Opened);
        peer.emit(ChannelEvent::Closed { code: CLOSE_NORMAL, reason: String::new() });
        mgr.poll(t0);

        assert_eq!(mgr.phase(), ChannelPhase::Closed);
        assert!(!mgr.reconnect_pending());
        mgr.poll(t0 + Duration::from_secs(10));
        assert_eq!(connector.connect_count(), 1);
    }

    #[test]
    fn test_reconnect_after_fixed_delay() {
        let connector = MockConnector::default();
        let mut mgr = manager(&connector);
        let t0 = Instant::now();
        mgr.open();
        connector.last_peer().emit(ChannelEvent::Opened);
        connector.last_peer().emit(abnormal());

        let events = mgr.poll(t0);
        assert!(events.contains(&ConnectionEvent::ReconnectScheduled { attempt: 1 }));
        assert_eq!(mgr.phase(), ChannelPhase::Reconnecting);

        mgr.poll(t0 + Duration::from_millis(2999));
        assert_eq!(connector.connect_count(), 1);
        mgr.poll(t0 + Duration::from_millis(3000));
        assert_eq!(connector.connect_count(), 2);
        assert_eq!(mgr.phase(), ChannelPhase::Connecting);

        // Successful open resets the counter
        connector.last_peer().emit(ChannelEvent::Opened);
        mgr.poll(t0 + Duration::from_millis(3100));
        assert_eq!(mgr.retries(), 0);
        assert!(mgr.last_error().is_none());
    }

    #[test]
    fn test_reconnect_capped_at_five() {
        let connector = MockConnector::default();
        let mut mgr = manager(&connector);
        let mut now = Instant::now();
        mgr.open();

        let mut scheduled = 0;
        let mut exhausted = None;
        for _ in 0..6 {
            connector.last_peer().emit(abnormal());
            for event in mgr.poll(now) {
                match event {
                    ConnectionEvent::ReconnectScheduled { .. } => scheduled += 1,
                    ConnectionEvent::Exhausted(err) => exhausted = Some(err),
                    _ => {}
                }
            }
            now += Duration::from_secs(3);
            mgr.poll(now);
        }

        assert_eq!(scheduled, 5);
        assert_eq!(connector.connect_count(), 6);
        assert_eq!(exhausted, Some(SyncError::ReconnectExhausted { attempts: 5 }));
        assert_eq!(mgr.phase(), ChannelPhase::Exhausted);
        assert!(!mgr.reconnect_pending());

        // Manual retry starts over
        mgr.retry();
        assert_eq!(connector.connect_count(), 7);
        assert_eq!(mgr.retries(), 0);
    }

    #[test]
    fn test_close_cancels_pending_reconnect() {
        let connector = MockConnector::default();
        let mut mgr = manager(&connector);
        let t0 = Instant::now();
        mgr.open();
        connector.last_peer().emit(abnormal());
        mgr.poll(t0);
        assert!(mgr.reconnect_pending());

        mgr.close();
        mgr.poll(t0 + Duration::from_secs(5));
        assert_eq!(connector.connect_count(), 1);
        assert_eq!(mgr.phase(), ChannelPhase::Closed);
    }

    #[test]
    fn test_close_sends_normal_code() {
        let connector = MockConnector::default();
        let mut mgr = manager(&connector);
        mgr.open();
        let peer = connector.last_peer();
        mgr.close();
        assert_eq!(peer.try_command(), Some(ChannelCommand::Close(CLOSE_NORMAL)));
    }

    #[test]
    fn test_transport_error_recorded() {
        let connector = MockConnector::default();
        let mut mgr = manager(&connector);
        mgr.open();
        connector.last_peer().emit(ChannelEvent::Error("refused".into()));
        let events = mgr.poll(Instant::now());
        assert_eq!(events, vec![ConnectionEvent::Error(SyncError::Transport("refused".into()))]);
        assert_eq!(mgr.last_error(), Some(&SyncError::Transport("refused".into())));
    }
}
