//! REST API implementation using rouille.
//!
//! Handlers read [`SharedApiState`] for GET endpoints and send
//! [`ApiCommand`]s over a channel for POST endpoints. The main loop drains
//! the channel and executes commands against the service, so the HTTP
//! threads never touch sync state directly.
//!
//! CORS headers are added to all responses for browser access.

use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock};
use std::thread::JoinHandle;
use std::time::Instant;

use anyhow::{Result, anyhow};
use crossbeam_channel::{Receiver, Sender, unbounded};
use log::{debug, info};
use rouille::{Request, Response};
use serde::Serialize;

use crate::compositor::BaseMapMode;
use crate::entities::{BlendMode, SubjectId};
use crate::hotkeys::PlaybackAction;
use crate::playback::PlaybackSpeed;
use crate::service::{OverlayOp, SubjectSnapshot, VerificationService};

/// Per-subject action requested over HTTP
#[derive(Debug, Clone, PartialEq)]
pub enum SubjectAction {
    Play,
    Pause,
    TogglePlay,
    Next,
    Previous,
    ToggleLoop,
    /// Send `start_verification`
    Start,
    /// Reconnect after exhaustion
    Retry,
    SetSpeed(PlaybackSpeed),
    /// Position in [0, 100]
    Scrub(f32),
    Seek(usize),
    Overlay(OverlayOp),
}

/// Commands sent from API handlers to the main loop
#[derive(Debug, Clone, PartialEq)]
pub enum ApiCommand {
    Subject { subject: SubjectId, action: SubjectAction },
    SetBaseMap(BaseMapMode),
}

impl ApiCommand {
    /// Run a subject command against the service. Base-map switches belong
    /// to the map owner and return false here.
    pub fn execute(self, service: &mut VerificationService, now: Instant) -> bool {
        let ApiCommand::Subject { subject, action } = self else {
            return false;
        };
        if !service.is_mounted(&subject) {
            debug!("API command for unmounted subject {}", subject);
            return false;
        }
        match action {
            SubjectAction::Play => service.play(&subject, now),
            SubjectAction::Pause => {
                service.pause(&subject);
                true
            }
            SubjectAction::TogglePlay => {
                service.toggle_play(&subject, now);
                true
            }
            SubjectAction::Next => service.next(&subject).is_some(),
            SubjectAction::Previous => service.previous(&subject).is_some(),
            SubjectAction::ToggleLoop => {
                service.playback_action(&subject, PlaybackAction::ToggleLoop, now);
                true
            }
            SubjectAction::Start => service.start_verification(&subject),
            SubjectAction::Retry => service.retry(&subject),
            SubjectAction::SetSpeed(speed) => {
                service.set_speed(&subject, speed, now);
                true
            }
            SubjectAction::Scrub(position) => {
                service.scrub(&subject, position);
                true
            }
            SubjectAction::Seek(index) => {
                service.seek(&subject, index);
                true
            }
            SubjectAction::Overlay(op) => service.edit_overlay(&subject, op),
        }
    }
}

/// Full status response
#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub base_map: BaseMapMode,
    pub subjects: Vec<SubjectSnapshot>,
}

/// Shared state readable by API handlers (updated by main loop)
#[derive(Default)]
pub struct SharedApiState {
    pub subjects: RwLock<Vec<SubjectSnapshot>>,
    pub base_map: RwLock<BaseMapMode>,
}

impl SharedApiState {
    /// Refresh from the service. Called by the main loop after each tick.
    pub fn update(&self, service: &VerificationService, base_map: BaseMapMode) {
        *self.subjects.write().unwrap_or_else(PoisonError::into_inner) = service.snapshots();
        *self.base_map.write().unwrap_or_else(PoisonError::into_inner) = base_map;
    }

    fn status(&self) -> StatusResponse {
        StatusResponse {
            base_map: *self.base_map.read().unwrap_or_else(PoisonError::into_inner),
            subjects: self.subjects.read().unwrap_or_else(PoisonError::into_inner).clone(),
        }
    }

    fn subject(&self, id: &str) -> Option<SubjectSnapshot> {
        self.subjects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|s| s.subject.as_str() == id)
            .cloned()
    }
}

/// Generic API response
#[derive(Serialize)]
struct ApiResponse {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl ApiResponse {
    fn ok() -> Self {
        Self { success: true, message: None, error: None }
    }

    fn ok_msg(msg: &str) -> Self {
        Self { success: true, message: Some(msg.to_string()), error: None }
    }

    fn err(msg: &str) -> Self {
        Self { success: false, message: None, error: Some(msg.to_string()) }
    }
}

fn bad_request(msg: &str) -> Response {
    Response::json(&ApiResponse::err(msg)).with_status_code(400)
}

fn not_found(msg: &str) -> Response {
    Response::json(&ApiResponse::err(msg)).with_status_code(404)
}

/// REST API server running on a background thread
pub struct ApiServer {
    addr: SocketAddr,
    commands: Receiver<ApiCommand>,
    stop: std::sync::mpsc::Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for ApiServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiServer").field("addr", &self.addr).finish()
    }
}

impl ApiServer {
    /// Bind and start serving. Port 0 picks a free port (see [`ApiServer::addr`]).
    pub fn start(addr: &str, state: Arc<SharedApiState>) -> Result<Self> {
        let (tx, rx) = unbounded();
        let server = rouille::Server::new(addr, move |request| handle_request(request, &state, &tx))
            .map_err(|e| anyhow!("Failed to bind API server on {}: {}", addr, e))?;
        let bound = server.server_addr();
        info!("API server listening on http://{}", bound);

        let (handle, stop) = server.stoppable();
        Ok(Self {
            addr: bound,
            commands: rx,
            stop,
            handle: Some(handle),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Pending commands, in arrival order.
    pub fn drain(&self) -> Vec<ApiCommand> {
        self.commands.try_iter().collect()
    }

    pub fn shutdown(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = self.stop.send(());
            let _ = handle.join();
            debug!("API server on {} stopped", self.addr);
        }
    }
}

impl Drop for ApiServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn handle_request(request: &Request, state: &SharedApiState, tx: &Sender<ApiCommand>) -> Response {
    // Preflight
    if request.method() == "OPTIONS" {
        return Response::empty_204()
            .with_additional_header("Access-Control-Allow-Origin", "*")
            .with_additional_header("Access-Control-Allow-Methods", "GET, POST, OPTIONS")
            .with_additional_header("Access-Control-Allow-Headers", "Content-Type");
    }

    let response = route(request, state, tx);
    response.with_additional_header("Access-Control-Allow-Origin", "*")
}

fn route(request: &Request, state: &SharedApiState, tx: &Sender<ApiCommand>) -> Response {
    // Path params parsed manually (router! doesn't capture well)
    let path = request.url();
    if let Some(rest) = path.strip_prefix("/api/subjects/") {
        let parts: Vec<&str> = rest.split('/').filter(|p| !p.is_empty()).collect();
        let Some((id, tail)) = parts.split_first() else {
            return bad_request("Missing subject id");
        };
        let Some(snapshot) = state.subject(id) else {
            return not_found(&format!("Subject {} not mounted", id));
        };
        return match request.method() {
            "GET" if tail.is_empty() => Response::json(&snapshot),
            "POST" => match parse_action(tail) {
                Ok(action) => send_command(tx, ApiCommand::Subject { subject: snapshot.subject, action }),
                Err(msg) => bad_request(&msg),
            },
            _ => not_found("Not found"),
        };
    }
    if request.method() == "POST" {
        if let Some(mode) = path.strip_prefix("/api/base-map/") {
            return match mode.parse::<BaseMapMode>() {
                Ok(mode) => send_command(tx, ApiCommand::SetBaseMap(mode)),
                Err(msg) => bad_request(&msg),
            };
        }
    }

    rouille::router!(request,
        (GET) ["/api/status"] => {
            Response::json(&state.status())
        },
        (GET) ["/api/health"] => {
            Response::json(&ApiResponse::ok_msg("geosync API server"))
        },
        _ => {
            not_found("Not found")
        }
    )
}

/// `play`, `speed/fast`, `scrub/50`, `overlays/7/opacity/0.4`, ...
fn parse_action(parts: &[&str]) -> Result<SubjectAction, String> {
    let action = match parts {
        ["play"] => SubjectAction::Play,
        ["pause"] => SubjectAction::Pause,
        ["toggle-play"] => SubjectAction::TogglePlay,
        ["next"] => SubjectAction::Next,
        ["previous"] => SubjectAction::Previous,
        ["toggle-loop"] => SubjectAction::ToggleLoop,
        ["start"] => SubjectAction::Start,
        ["retry"] => SubjectAction::Retry,
        ["speed", speed] => SubjectAction::SetSpeed(speed.parse()?),
        ["scrub", pct] => {
            let pct = pct.parse::<f32>().map_err(|_| "Invalid scrub position".to_string())?;
            SubjectAction::Scrub(pct)
        }
        ["seek", index] => {
            let index = index.parse::<usize>().map_err(|_| "Invalid layer index".to_string())?;
            SubjectAction::Seek(index)
        }
        ["overlays", layer, rest @ ..] => SubjectAction::Overlay(parse_overlay_op(layer, rest)?),
        _ => return Err(format!("Unknown action '{}'", parts.join("/"))),
    };
    Ok(action)
}

fn parse_overlay_op(layer: &str, parts: &[&str]) -> Result<OverlayOp, String> {
    let id = layer.to_string();
    let op = match parts {
        ["add"] => OverlayOp::Add(id),
        ["remove"] => OverlayOp::Remove(id),
        ["raise"] => OverlayOp::Raise(id),
        ["lower"] => OverlayOp::Lower(id),
        ["show"] => OverlayOp::SetVisible(id, true),
        ["hide"] => OverlayOp::SetVisible(id, false),
        ["opacity", value] => {
            let value = value.parse::<f32>().map_err(|_| "Invalid opacity".to_string())?;
            OverlayOp::SetOpacity(id, value)
        }
        ["blend", mode] => OverlayOp::SetBlendMode(id, mode.parse::<BlendMode>()?),
        _ => return Err(format!("Unknown overlay action '{}'", parts.join("/"))),
    };
    Ok(op)
}

fn send_command(tx: &Sender<ApiCommand>, cmd: ApiCommand) -> Response {
    match tx.send(cmd) {
        Ok(_) => Response::json(&ApiResponse::ok()),
        Err(e) => Response::json(&ApiResponse::err(&format!("Failed to send command: {}", e)))
            .with_status_code(500),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::net::channel::testing::MockConnector;
    use crate::net::http::testing::MockLayerApi;
    use crate::net::ChannelEvent;
    use crate::service::SubjectOptions;
    use std::io::Read;
    use std::time::Duration;

    fn service() -> (VerificationService, MockConnector) {
        let connector = MockConnector::default();
        let svc = VerificationService::new(
            SyncConfig::default(),
            Arc::new(connector.clone()),
            Arc::new(MockLayerApi::default()),
        );
        (svc, connector)
    }

    fn request(server: &ApiServer, method: &str, path: &str) -> (u16, serde_json::Value) {
        let url = format!("http://{}{}", server.addr(), path);
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap();
        let mut response = client.request(method.parse().unwrap(), &url).send().unwrap();
        assert_eq!(
            response.headers().get("access-control-allow-origin").unwrap(),
            "*"
        );
        let status = response.status().as_u16();
        let mut body = String::new();
        response.read_to_string(&mut body).unwrap();
        (status, serde_json::from_str(&body).unwrap_or(serde_json::Value::Null))
    }

    #[test]
    fn test_parse_action() {
        assert_eq!(parse_action(&["play"]), Ok(SubjectAction::Play));
        assert_eq!(parse_action(&["speed", "fast"]), Ok(SubjectAction::SetSpeed(PlaybackSpeed::Fast)));
        assert_eq!(parse_action(&["scrub", "50"]), Ok(SubjectAction::Scrub(50.0)));
        assert_eq!(
            parse_action(&["overlays", "7", "blend", "multiply"]),
            Ok(SubjectAction::Overlay(OverlayOp::SetBlendMode("7".into(), BlendMode::Multiply)))
        );
        assert!(parse_action(&["speed", "warp"]).is_err());
        assert!(parse_action(&["seek", "-1"]).is_err());
        assert!(parse_action(&["dance"]).is_err());
    }

    #[test]
    fn test_routes_and_commands() {
        let (mut svc, connector) = service();
        let subject = SubjectId::from(42u64);
        svc.mount(subject.clone(), SubjectOptions::default()).unwrap();
        connector.last_peer().emit(ChannelEvent::Opened);
        svc.tick(Instant::now());

        let state = Arc::new(SharedApiState::default());
        state.update(&svc, BaseMapMode::Street);
        let mut server = ApiServer::start("127.0.0.1:0", Arc::clone(&state)).unwrap();

        let (status, body) = request(&server, "GET", "/api/health");
        assert_eq!(status, 200);
        assert_eq!(body["success"], true);

        let (_, body) = request(&server, "GET", "/api/status");
        assert_eq!(body["base_map"], "street");
        assert_eq!(body["subjects"][0]["subject"], "42");

        let (status, body) = request(&server, "GET", "/api/subjects/42");
        assert_eq!(status, 200);
        assert_eq!(body["channel"], "open");
        assert_eq!(request(&server, "GET", "/api/subjects/43").0, 404);

        assert_eq!(request(&server, "POST", "/api/subjects/42/start").0, 200);
        assert_eq!(request(&server, "POST", "/api/subjects/42/speed/slow").0, 200);
        assert_eq!(request(&server, "POST", "/api/subjects/42/speed/warp").0, 400);
        assert_eq!(request(&server, "POST", "/api/base-map/satellite").0, 200);
        assert_eq!(request(&server, "GET", "/api/nope").0, 404);

        let commands = server.drain();
        assert_eq!(commands.len(), 3);
        assert_eq!(commands[2], ApiCommand::SetBaseMap(BaseMapMode::Satellite));

        let now = Instant::now();
        let mut executed = Vec::new();
        for command in commands {
            executed.push(command.execute(&mut svc, now));
        }
        assert_eq!(executed, vec![true, true, false]);
        assert_eq!(svc.playback(&subject).unwrap().speed(), PlaybackSpeed::Slow);
        assert_eq!(
            MockConnector::sent_texts(&connector.last_peer()),
            vec![r#"{"type":"start_verification"}"#.to_string()]
        );
        server.shutdown();
    }

    #[test]
    fn test_command_for_unmounted_subject() {
        let (mut svc, _) = service();
        let command = ApiCommand::Subject { subject: SubjectId::from("gone"), action: SubjectAction::Play };
        assert!(!command.execute(&mut svc, Instant::now()));
    }
}
