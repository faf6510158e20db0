//! Transport-neutral duplex channel.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────┐   ChannelCommand (Send/Close)   ┌────────────────────┐
//! │  ConnectionManager   │  ─────────────────────────────▶ │  transport thread  │
//! │  (owner's loop)      │                                 │  (socket I/O)      │
//! │                      │  ◀───────────────────────────── │                    │
//! └──────────────────────┘   ChannelEvent (Opened/Text/..) └────────────────────┘
//! ```
//!
//! The manager only ever sees a [`Channel`]; whatever sits on the other end
//! holds the matching [`ChannelPeer`]. Production uses a tungstenite socket
//! thread (`net::ws`), tests drive the peer by hand.

use crossbeam_channel::{Receiver, Sender, TryRecvError, unbounded};
use url::Url;

/// Normal closure code (RFC 6455)
pub const CLOSE_NORMAL: u16 = 1000;
/// Abnormal closure, no close frame received
pub const CLOSE_ABNORMAL: u16 = 1006;

/// Transport -> manager
#[derive(Clone, Debug, PartialEq)]
pub enum ChannelEvent {
    Opened,
    Text(String),
    Error(String),
    Closed { code: u16, reason: String },
}

/// Manager -> transport
#[derive(Clone, Debug, PartialEq)]
pub enum ChannelCommand {
    Send(String),
    Close(u16),
}

/// Manager side of a channel.
#[derive(Debug)]
pub struct Channel {
    events: Receiver<ChannelEvent>,
    commands: Sender<ChannelCommand>,
    /// Peer vanished and the synthetic close was already reported
    peer_gone: bool,
}

/// Transport side of a channel.
#[derive(Debug, Clone)]
pub struct ChannelPeer {
    events: Sender<ChannelEvent>,
    commands: Receiver<ChannelCommand>,
}

/// Create a connected channel/peer pair.
pub fn channel_pair() -> (Channel, ChannelPeer) {
    let (event_tx, event_rx) = unbounded();
    let (command_tx, command_rx) = unbounded();
    (
        Channel {
            events: event_rx,
            commands: command_tx,
            peer_gone: false,
        },
        ChannelPeer {
            events: event_tx,
            commands: command_rx,
        },
    )
}

impl Channel {
    /// Queue text for the transport. False if the transport is gone.
    pub fn send_text(&self, text: String) -> bool {
        self.commands.send(ChannelCommand::Send(text)).is_ok()
    }

    pub fn close(&self, code: u16) {
        let _ = self.commands.send(ChannelCommand::Close(code));
    }

    /// Drain pending events without blocking.
    ///
    /// A peer dropped without sending `Closed` is reported once as an
    /// abnormal close.
    pub fn drain(&mut self) -> Vec<ChannelEvent> {
        let mut out = Vec::new();
        loop {
            match self.events.try_recv() {
                Ok(event) => out.push(event),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    if !self.peer_gone {
                        self.peer_gone = true;
                        out.push(ChannelEvent::Closed {
                            code: CLOSE_ABNORMAL,
                            reason: "transport dropped".to_string(),
                        });
                    }
                    break;
                }
            }
        }
        out
    }
}

impl ChannelPeer {
    /// Report an event to the manager. False if the manager dropped the channel.
    pub fn emit(&self, event: ChannelEvent) -> bool {
        self.events.send(event).is_ok()
    }

    pub fn try_command(&self) -> Option<ChannelCommand> {
        self.commands.try_recv().ok()
    }

    pub fn commands(&self) -> &Receiver<ChannelCommand> {
        &self.commands
    }
}

/// Opens channels. The returned channel is not open yet: `Opened` (or an
/// error and `Closed`) arrives later through its events.
pub trait Connector: Send + Sync {
    fn connect(&self, url: &Url) -> Channel;
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory connector recording every connect call.

    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    pub struct MockConnector {
        pub peers: Arc<Mutex<Vec<(Url, ChannelPeer)>>>,
    }

    impl MockConnector {
        pub fn connect_count(&self) -> usize {
            self.peers.lock().unwrap().len()
        }

        pub fn last_peer(&self) -> ChannelPeer {
            self.peers.lock().unwrap().last().expect("no connection attempted").1.clone()
        }

        pub fn last_url(&self) -> Url {
            self.peers.lock().unwrap().last().expect("no connection attempted").0.clone()
        }

        /// All text frames the client sent on the given peer so far.
        pub fn sent_texts(peer: &ChannelPeer) -> Vec<String> {
            let mut out = Vec::new();
            while let Some(cmd) = peer.try_command() {
                if let ChannelCommand::Send(text) = cmd {
                    out.push(text);
                }
            }
            out
        }
    }

    impl Connector for MockConnector {
        fn connect(&self, url: &Url) -> Channel {
            let (channel, peer) = channel_pair();
            self.peers.lock().unwrap().push((url.clone(), peer));
            channel
        }
    }
}
