//! WebSocket transport on a background thread (tungstenite).
//!
//! One thread per channel. The socket gets a short read timeout so the same
//! thread can interleave reads with queued sends; no locking around the
//! socket is needed.

use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;
use std::thread;
use std::time::Duration;

use log::{debug, info, trace, warn};
use tungstenite::protocol::CloseFrame;
use tungstenite::protocol::frame::coding::CloseCode;
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{Message, WebSocket};
use url::Url;

use super::channel::{
    CLOSE_ABNORMAL, CLOSE_NORMAL, Channel, ChannelCommand, ChannelEvent, ChannelPeer, Connector,
    channel_pair,
};

/// Read timeout used to poll for outbound commands
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Connector opening real WebSocket connections.
#[derive(Debug, Default, Clone)]
pub struct WsConnector;

impl Connector for WsConnector {
    fn connect(&self, url: &Url) -> Channel {
        let (channel, peer) = channel_pair();
        let url = url.clone();
        let spawned = thread::Builder::new()
            .name(format!("geosync-ws-{}", url.path()))
            .spawn({
                let peer = peer.clone();
                move || run_socket(url, peer)
            });
        if let Err(e) = spawned {
            peer.emit(ChannelEvent::Error(format!("failed to spawn socket thread: {}", e)));
            peer.emit(ChannelEvent::Closed {
                code: CLOSE_ABNORMAL,
                reason: "spawn failed".to_string(),
            });
        }
        channel
    }
}

/// Socket thread body.
fn run_socket(url: Url, peer: ChannelPeer) {
    // Token lives in the query string: log the path only
    debug!("Connecting to {}{}", url.host_str().unwrap_or(""), url.path());

    let mut socket = match tungstenite::connect(url.as_str()) {
        Ok((socket, _response)) => socket,
        Err(e) => {
            warn!("WebSocket connect failed: {}", e);
            peer.emit(ChannelEvent::Error(e.to_string()));
            peer.emit(ChannelEvent::Closed {
                code: CLOSE_ABNORMAL,
                reason: "connect failed".to_string(),
            });
            return;
        }
    };

    if let Err(e) = set_read_timeout(&mut socket, POLL_INTERVAL) {
        warn!("Failed to set socket read timeout: {}", e);
    }

    info!("WebSocket open: {}", url.path());
    if !peer.emit(ChannelEvent::Opened) {
        let _ = socket.close(None);
        return;
    }
    pump(&mut socket, &peer);
}

/// Interleave queued sends with timed reads until either side closes.
fn pump<S: Read + Write>(socket: &mut WebSocket<S>, peer: &ChannelPeer) {
    loop {
        // 1. Flush queued commands
        while let Some(cmd) = peer.try_command() {
            match cmd {
                ChannelCommand::Send(text) => {
                    trace!("ws -> {}", text);
                    if let Err(e) = socket.send(Message::Text(text)) {
                        // Write side is broken: the frame may be half sent
                        warn!("WebSocket send failed: {}", e);
                        peer.emit(ChannelEvent::Error(e.to_string()));
                        let _ = socket.close(None);
                        peer.emit(ChannelEvent::Closed {
                            code: CLOSE_ABNORMAL,
                            reason: format!("send failed: {}", e),
                        });
                        return;
                    }
                }
                ChannelCommand::Close(code) => {
                    shutdown(socket, code);
                    return;
                }
            }
        }

        // 2. Read with timeout
        match socket.read() {
            Ok(Message::Text(text)) => {
                if !peer.emit(ChannelEvent::Text(text)) {
                    // Manager dropped the channel without closing
                    shutdown(socket, CLOSE_NORMAL);
                    return;
                }
            }
            Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                Ok(text) => {
                    peer.emit(ChannelEvent::Text(text));
                }
                Err(_) => {
                    peer.emit(ChannelEvent::Error("non UTF-8 binary frame".to_string()));
                }
            },
            Ok(Message::Close(frame)) => {
                let (code, reason) = frame
                    .map(|f| (u16::from(f.code), f.reason.to_string()))
                    .unwrap_or((CLOSE_ABNORMAL, String::new()));
                info!("WebSocket closed by server: {} {}", code, reason);
                peer.emit(ChannelEvent::Closed { code, reason });
                return;
            }
            // Protocol-level ping/pong is answered by tungstenite itself
            Ok(_) => {}
            Err(tungstenite::Error::Io(e))
                if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
            Err(tungstenite::Error::ConnectionClosed) | Err(tungstenite::Error::AlreadyClosed) => {
                peer.emit(ChannelEvent::Closed {
                    code: CLOSE_ABNORMAL,
                    reason: "connection closed".to_string(),
                });
                return;
            }
            Err(e) => {
                warn!("WebSocket read failed: {}", e);
                peer.emit(ChannelEvent::Error(e.to_string()));
                peer.emit(ChannelEvent::Closed {
                    code: CLOSE_ABNORMAL,
                    reason: e.to_string(),
                });
                return;
            }
        }
    }
}

/// Send a close frame and drain until the server acknowledges.
fn shutdown<S: Read + Write>(socket: &mut WebSocket<S>, code: u16) {
    let frame = CloseFrame {
        code: CloseCode::from(code),
        reason: "".into(),
    };
    if let Err(e) = socket.close(Some(frame)) {
        debug!("Close handshake failed: {}", e);
        return;
    }
    // Bounded: ~20 read timeouts
    for _ in 0..20 {
        match socket.read() {
            Ok(_) => {}
            Err(tungstenite::Error::Io(e))
                if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
            Err(_) => break,
        }
    }
    debug!("WebSocket closed with code {}", code);
}

fn set_read_timeout(
    socket: &mut WebSocket<MaybeTlsStream<TcpStream>>,
    timeout: Duration,
) -> std::io::Result<()> {
    match socket.get_mut() {
        MaybeTlsStream::Plain(stream) => stream.set_read_timeout(Some(timeout)),
        MaybeTlsStream::Rustls(stream) => stream.sock.set_read_timeout(Some(timeout)),
        _ => Ok(()),
    }
}
