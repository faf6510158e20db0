//! Verification service - owner of all per-subject sync state.
//!
//! # Architecture
//!
//! ```text
//!   socket threads ──ChannelEvent──▶ ConnectionManager ─┐
//!                                                       │ tick(now)
//!   resync threads ──ResyncResult──────────────────────▶├──▶ ReconciliationStore
//!                                                       │         │
//!                                   PlaybackController ◀┘         ▼
//!                                                       callbacks + EventBus
//! ```
//!
//! One logical loop: the owner calls [`VerificationService::tick`] from its
//! own thread. Each event is handled to completion before the next one, so
//! per-subject state needs no locks. Callbacks are looked up at dispatch
//! time and always see current state.
//!
//! # Lifecycle
//!
//! `mount` creates store state, connection and player for a subject;
//! `unmount` cancels timers, closes the channel with the normal code and
//! drops everything. Each mount gets a fresh generation number; resync
//! answers carrying an older generation are discarded.

use std::sync::Arc;
use std::time::Instant;

use indexmap::IndexMap;
use log::{debug, info, trace, warn};
use serde::Serialize;
use serde_json::Value;

use crate::compositor::{OverlayCompositor, OverlayPlacement, fit_bounds};
use crate::config::SyncConfig;
use crate::core::EventBus;
use crate::core::sync_events::*;
use crate::entities::{
    BlendMode, ConnectionIndicator, GeoBounds, Layer, Overlay, SubjectId, SubjectState,
};
use crate::error::SyncError;
use crate::hotkeys::{HotkeyHandler, PlaybackAction};
use crate::net::{
    ChannelPhase, ConnectionEvent, ConnectionManager, Connector, HttpLayerApi, LayerApi,
    OutboundFrame, ResyncResult, Resyncer, WsConnector,
};
use crate::playback::{AnimationState, PlaybackController, PlaybackPhase, PlaybackSpeed};
use crate::progress::ProgressView;
use crate::store::{ReconciliationStore, StoreOutcome};

type LayerCallback = Box<dyn FnMut(&SubjectId, &Layer)>;
type ProgressCallback = Box<dyn FnMut(&SubjectId, &ProgressView)>;
type CompleteCallback = Box<dyn FnMut(&SubjectId, &Value)>;
type ErrorCallback = Box<dyn FnMut(&SubjectId, &SyncError)>;

/// Optional per-subject callbacks.
#[derive(Default)]
pub struct SubjectCallbacks {
    layer: Option<LayerCallback>,
    progress: Option<ProgressCallback>,
    complete: Option<CompleteCallback>,
    error: Option<ErrorCallback>,
}

impl SubjectCallbacks {
    /// Layer completed (new ids only on resync)
    pub fn on_layer(mut self, f: impl FnMut(&SubjectId, &Layer) + 'static) -> Self {
        self.layer = Some(Box::new(f));
        self
    }

    pub fn on_progress(mut self, f: impl FnMut(&SubjectId, &ProgressView) + 'static) -> Self {
        self.progress = Some(Box::new(f));
        self
    }

    /// Opaque `verification_complete` payload
    pub fn on_complete(mut self, f: impl FnMut(&SubjectId, &Value) + 'static) -> Self {
        self.complete = Some(Box::new(f));
        self
    }

    pub fn on_error(mut self, f: impl FnMut(&SubjectId, &SyncError) + 'static) -> Self {
        self.error = Some(Box::new(f));
        self
    }
}

impl std::fmt::Debug for SubjectCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubjectCallbacks")
            .field("layer", &self.layer.is_some())
            .field("progress", &self.progress.is_some())
            .field("complete", &self.complete.is_some())
            .field("error", &self.error.is_some())
            .finish()
    }
}

/// Mount options, the "view properties" of a subject.
#[derive(Debug)]
pub struct SubjectOptions {
    /// Open the channel right away
    pub enabled: bool,
    pub callbacks: SubjectCallbacks,
    pub speed: PlaybackSpeed,
    pub loop_enabled: bool,
}

impl Default for SubjectOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            callbacks: SubjectCallbacks::default(),
            speed: PlaybackSpeed::Normal,
            loop_enabled: true,
        }
    }
}

/// User edits on the overlay composition.
#[derive(Clone, Debug, PartialEq)]
pub enum OverlayOp {
    Add(String),
    Remove(String),
    SetOpacity(String, f32),
    SetVisible(String, bool),
    SetBlendMode(String, BlendMode),
    Raise(String),
    Lower(String),
}

/// Serializable status of a mounted subject (control API, CLI).
#[derive(Clone, Debug, Serialize)]
pub struct SubjectSnapshot {
    pub subject: SubjectId,
    pub channel: ChannelPhase,
    pub connection: ConnectionIndicator,
    pub last_error: Option<String>,
    pub reconnect_attempts: u32,
    pub progress: Option<ProgressView>,
    pub completed: bool,
    pub layers: Vec<LayerSummary>,
    pub overlays: Vec<Overlay>,
    pub playback: AnimationState,
    pub playback_phase: PlaybackPhase,
    pub selected_layer: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct LayerSummary {
    pub id: String,
    pub name: String,
    pub layer_type: String,
    pub renderable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

impl From<&Layer> for LayerSummary {
    fn from(layer: &Layer) -> Self {
        Self {
            id: layer.id.clone(),
            name: layer.name(),
            layer_type: layer.layer_type.clone(),
            renderable: layer.is_renderable(),
            created_at: layer.created_at.clone(),
        }
    }
}

/// Runtime parts of a mounted subject.
struct Mounted {
    generation: u64,
    connection: ConnectionManager,
    playback: PlaybackController,
    callbacks: SubjectCallbacks,
    selected_layer: Option<String>,
}

pub struct VerificationService {
    config: SyncConfig,
    connector: Arc<dyn Connector>,
    resyncer: Resyncer,
    store: ReconciliationStore,
    compositor: OverlayCompositor,
    hotkeys: HotkeyHandler,
    mounted: IndexMap<SubjectId, Mounted>,
    events: EventBus,
    next_generation: u64,
}

impl std::fmt::Debug for VerificationService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerificationService")
            .field("subjects", &self.mounted.keys().collect::<Vec<_>>())
            .field("events", &self.events)
            .finish()
    }
}

impl VerificationService {
    pub fn new(config: SyncConfig, connector: Arc<dyn Connector>, api: Arc<dyn LayerApi>) -> Self {
        Self {
            store: ReconciliationStore::new(config.overlay_opacity),
            compositor: OverlayCompositor::new(config.clone()),
            resyncer: Resyncer::new(api),
            hotkeys: HotkeyHandler::default(),
            mounted: IndexMap::new(),
            events: EventBus::new(),
            next_generation: 0,
            connector,
            config,
        }
    }

    /// Service with real WebSocket and HTTP collaborators.
    pub fn connect(config: SyncConfig) -> Result<Self, SyncError> {
        let api = HttpLayerApi::new(config.clone())?;
        Ok(Self::new(config, Arc::new(WsConnector), Arc::new(api)))
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.events
    }

    pub fn hotkeys_mut(&mut self) -> &mut HotkeyHandler {
        &mut self.hotkeys
    }

    // === Lifecycle ===

    /// Create per-subject state and open its channel if enabled.
    ///
    /// Mounting an already mounted subject only swaps callbacks and applies
    /// the enabled flag.
    pub fn mount(&mut self, subject: impl Into<SubjectId>, options: SubjectOptions) -> Result<(), SyncError> {
        let subject = subject.into();
        if let Some(mounted) = self.mounted.get_mut(&subject) {
            debug!("Subject {} already mounted, updating options", subject);
            mounted.callbacks = options.callbacks;
            self.set_enabled(&subject, options.enabled);
            return Ok(());
        }

        let url = self
            .config
            .channel_url(&subject)
            .map_err(|e| SyncError::Transport(format!("{:#}", e)))?;
        self.next_generation += 1;

        let mut connection = ConnectionManager::new(url, Arc::clone(&self.connector), self.config.reconnect.clone());
        if options.enabled {
            connection.open();
        }
        self.store.ensure(&subject);
        info!("Mounted subject {} (generation {})", subject, self.next_generation);

        self.mounted.insert(
            subject,
            Mounted {
                generation: self.next_generation,
                connection,
                playback: PlaybackController::new(options.speed, options.loop_enabled),
                callbacks: options.callbacks,
                selected_layer: None,
            },
        );
        Ok(())
    }

    /// Close the channel, cancel timers, discard state.
    pub fn unmount(&mut self, subject: &SubjectId) -> bool {
        let Some(mut mounted) = self.mounted.shift_remove(subject) else {
            return false;
        };
        mounted.playback.dispose();
        mounted.connection.close();
        self.store.remove(subject);
        self.compositor.forget(subject);
        info!("Unmounted subject {}", subject);
        true
    }

    pub fn is_mounted(&self, subject: &SubjectId) -> bool {
        self.mounted.contains_key(subject)
    }

    pub fn subjects(&self) -> impl Iterator<Item = &SubjectId> {
        self.mounted.keys()
    }

    /// Open or close the channel of a mounted subject.
    pub fn set_enabled(&mut self, subject: &SubjectId, enabled: bool) -> bool {
        let Some(mounted) = self.mounted.get_mut(subject) else {
            return false;
        };
        if enabled {
            mounted.connection.open();
        } else {
            mounted.connection.close();
            if let Some(conn) = self.store.set_connected(subject, false) {
                let indicator = conn.indicator();
                self.events.emit(ConnectionChangedEvent { subject: subject.clone(), indicator });
            }
        }
        true
    }

    // === Loop ===

    /// One pass of the event loop. Returns the number of events handled.
    ///
    /// Order: resync answers issued by earlier ticks, then channel traffic
    /// and reconnect timers per subject, then playback timers.
    pub fn tick(&mut self, now: Instant) -> usize {
        let mut handled = 0;

        for result in self.resyncer.drain() {
            handled += 1;
            self.handle_resync(result);
        }

        let subjects: Vec<SubjectId> = self.mounted.keys().cloned().collect();
        for subject in &subjects {
            let events = match self.mounted.get_mut(subject) {
                Some(mounted) => mounted.connection.poll(now),
                None => continue,
            };
            for event in events {
                handled += 1;
                self.handle_connection_event(subject, event);
            }
        }

        for subject in &subjects {
            self.drive_playback(subject, |player| player.tick(now));
        }
        handled
    }

    /// Ask the server to start the job. Only sent while the channel is open.
    pub fn start_verification(&self, subject: &SubjectId) -> bool {
        match self.mounted.get(subject) {
            Some(mounted) => mounted.connection.send(OutboundFrame::StartVerification),
            None => false,
        }
    }

    /// Explicit user retry after the reconnect attempts ran out.
    pub fn retry(&mut self, subject: &SubjectId) -> bool {
        match self.mounted.get_mut(subject) {
            Some(mounted) => {
                mounted.connection.retry();
                true
            }
            None => false,
        }
    }

    // === Read access ===

    pub fn state(&self, subject: &SubjectId) -> Option<&SubjectState> {
        self.store.get(subject)
    }

    pub fn channel_phase(&self, subject: &SubjectId) -> Option<ChannelPhase> {
        self.mounted.get(subject).map(|m| m.connection.phase())
    }

    pub fn progress_view(&self, subject: &SubjectId) -> Option<ProgressView> {
        self.store
            .get(subject)?
            .progress
            .as_ref()
            .map(ProgressView::from_snapshot)
    }

    /// Current map placements (bottom to top).
    pub fn placements(&mut self, subject: &SubjectId) -> Vec<OverlayPlacement> {
        match self.store.get(subject) {
            Some(state) => self.compositor.compose(subject, state),
            None => Vec::new(),
        }
    }

    pub fn fit_bounds(&mut self, subject: &SubjectId) -> Option<GeoBounds> {
        fit_bounds(&self.placements(subject))
    }

    pub fn playback(&self, subject: &SubjectId) -> Option<&PlaybackController> {
        self.mounted.get(subject).map(|m| &m.playback)
    }

    /// Layer the player currently points at.
    pub fn selected_layer(&self, subject: &SubjectId) -> Option<&Layer> {
        let id = self.mounted.get(subject)?.selected_layer.as_deref()?;
        self.store.get(subject)?.layer(id)
    }

    pub fn snapshot(&self, subject: &SubjectId) -> Option<SubjectSnapshot> {
        let mounted = self.mounted.get(subject)?;
        let state = self.store.get(subject)?;
        Some(SubjectSnapshot {
            subject: subject.clone(),
            channel: mounted.connection.phase(),
            connection: state.connection.indicator(),
            last_error: state.connection.last_error.as_ref().map(|e| e.to_string()),
            reconnect_attempts: mounted.connection.retries(),
            progress: state.progress.as_ref().map(ProgressView::from_snapshot),
            completed: state.completed,
            layers: state.layers.values().map(LayerSummary::from).collect(),
            overlays: state.overlays.clone(),
            playback: mounted.playback.state(),
            playback_phase: mounted.playback.phase(),
            selected_layer: mounted.selected_layer.clone(),
        })
    }

    pub fn snapshots(&self) -> Vec<SubjectSnapshot> {
        self.mounted.keys().filter_map(|s| self.snapshot(s)).collect()
    }

    // === Overlays ===

    pub fn edit_overlay(&mut self, subject: &SubjectId, op: OverlayOp) -> bool {
        let store = &mut self.store;
        match op {
            OverlayOp::Add(id) => store.add_overlay(subject, &id),
            OverlayOp::Remove(id) => store.remove_overlay(subject, &id),
            OverlayOp::SetOpacity(id, opacity) => store.set_overlay_opacity(subject, &id, opacity),
            OverlayOp::SetVisible(id, visible) => store.set_overlay_visible(subject, &id, visible),
            OverlayOp::SetBlendMode(id, mode) => store.set_overlay_blend_mode(subject, &id, mode),
            OverlayOp::Raise(id) => store.raise_overlay(subject, &id),
            OverlayOp::Lower(id) => store.lower_overlay(subject, &id),
        }
    }

    // === Playback ===

    pub fn play(&mut self, subject: &SubjectId, now: Instant) -> bool {
        self.drive_playback(subject, |player| {
            player.play(now);
            None
        });
        self.is_playing(subject)
    }

    pub fn pause(&mut self, subject: &SubjectId) {
        self.drive_playback(subject, |player| {
            player.pause();
            None
        });
    }

    pub fn toggle_play(&mut self, subject: &SubjectId, now: Instant) -> bool {
        self.drive_playback(subject, |player| {
            player.toggle_play(now);
            None
        });
        self.is_playing(subject)
    }

    pub fn next(&mut self, subject: &SubjectId) -> Option<usize> {
        self.drive_playback(subject, PlaybackController::next)
    }

    pub fn previous(&mut self, subject: &SubjectId) -> Option<usize> {
        self.drive_playback(subject, PlaybackController::previous)
    }

    pub fn seek(&mut self, subject: &SubjectId, index: usize) -> Option<usize> {
        self.drive_playback(subject, |player| player.seek(index))
    }

    pub fn scrub(&mut self, subject: &SubjectId, position: f32) -> Option<usize> {
        self.drive_playback(subject, |player| player.scrub(position))
    }

    pub fn set_speed(&mut self, subject: &SubjectId, speed: PlaybackSpeed, now: Instant) {
        self.drive_playback(subject, |player| {
            player.set_speed(speed, now);
            None
        });
    }

    pub fn set_loop(&mut self, subject: &SubjectId, enabled: bool, now: Instant) {
        self.drive_playback(subject, |player| {
            player.set_loop(enabled, now);
            None
        });
    }

    pub fn playback_action(&mut self, subject: &SubjectId, action: PlaybackAction, now: Instant) -> Option<usize> {
        self.drive_playback(subject, |player| player.apply(action, now))
    }

    /// Route a key press through the hotkey table. Returns the action taken.
    pub fn handle_key(&mut self, subject: &SubjectId, key: &str, now: Instant) -> Option<PlaybackAction> {
        let action = self.hotkeys.handle_key(key)?;
        if !self.is_mounted(subject) {
            return None;
        }
        trace!("Key {} -> {:?}", key, action);
        self.playback_action(subject, action, now);
        Some(action)
    }

    fn is_playing(&self, subject: &SubjectId) -> bool {
        self.mounted.get(subject).is_some_and(|m| m.playback.is_playing())
    }

    // === Internals ===

    /// Run a player operation, then publish selection / state changes.
    fn drive_playback(
        &mut self,
        subject: &SubjectId,
        op: impl FnOnce(&mut PlaybackController) -> Option<usize>,
    ) -> Option<usize> {
        let mounted = self.mounted.get_mut(subject)?;
        let was_playing = mounted.playback.is_playing();
        let index = op(&mut mounted.playback);
        let playing = mounted.playback.is_playing();

        if let Some(index) = index {
            self.select(subject, index);
        }
        if was_playing != playing {
            self.events.emit(PlaybackStateChangedEvent { subject: subject.clone(), playing });
        }
        index
    }

    /// Re-select the layer at `index` for detail views.
    fn select(&mut self, subject: &SubjectId, index: usize) {
        let Some(layer_id) = self
            .store
            .get(subject)
            .and_then(|s| s.layer_at(index))
            .map(|l| l.id.clone())
        else {
            return;
        };
        if let Some(mounted) = self.mounted.get_mut(subject) {
            mounted.selected_layer = Some(layer_id.clone());
        }
        trace!("Subject {}: selected layer {} at {}", subject, layer_id, index);
        self.events.emit(LayerSelectedEvent { subject: subject.clone(), index, layer_id });
    }

    fn handle_connection_event(&mut self, subject: &SubjectId, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Opened => self.update_connected(subject, true),
            ConnectionEvent::Frame(frame) => {
                let outcomes = self.store.apply(subject, frame);
                self.handle_outcomes(subject, outcomes, false);
            }
            ConnectionEvent::Error(err) => {
                let transport = matches!(err, SyncError::Transport(_));
                self.store.record_error(subject, err.clone());
                if transport {
                    self.update_connected(subject, false);
                }
                self.notify_error(subject, &err);
            }
            ConnectionEvent::Closed { code } => {
                debug!("Subject {}: channel closed ({})", subject, code);
                self.update_connected(subject, false);
            }
            ConnectionEvent::ReconnectScheduled { attempt } => {
                debug!("Subject {}: reconnect attempt {} scheduled", subject, attempt);
            }
            ConnectionEvent::Exhausted(err) => {
                self.store.record_error(subject, err.clone());
                self.update_connected(subject, false);
                self.notify_error(subject, &err);
            }
        }
    }

    fn update_connected(&mut self, subject: &SubjectId, connected: bool) {
        if let Some(conn) = self.store.set_connected(subject, connected) {
            let indicator = conn.indicator();
            self.events.emit(ConnectionChangedEvent { subject: subject.clone(), indicator });
        }
    }

    fn handle_resync(&mut self, result: ResyncResult) {
        let ResyncResult { subject, generation, layers } = result;
        let current = self.mounted.get(&subject).map(|m| m.generation);
        if current != Some(generation) {
            debug!(
                "Dropping resync for subject {} (generation {}, mounted {:?})",
                subject, generation, current
            );
            return;
        }
        match layers {
            Ok(layers) => {
                let outcomes = self.store.replace_layers(&subject, layers);
                self.handle_outcomes(&subject, outcomes, true);
                let layer_count = self.store.get(&subject).map_or(0, |s| s.layer_count());
                self.events.emit(ResyncCompletedEvent { subject, layer_count });
            }
            Err(err) => {
                warn!("Resync for subject {} failed: {}", subject, err);
                self.store.record_error(&subject, err.clone());
                self.notify_error(&subject, &err);
                self.events.emit(ResyncFailedEvent { subject, error: err });
            }
        }
    }

    fn handle_outcomes(&mut self, subject: &SubjectId, outcomes: Vec<StoreOutcome>, from_resync: bool) {
        for outcome in outcomes {
            match outcome {
                StoreOutcome::LayerUpserted { layer_id, is_new } => {
                    if from_resync && !is_new {
                        continue;
                    }
                    let layer = self.store.get(subject).and_then(|s| s.layer(&layer_id));
                    if let (Some(mounted), Some(layer)) = (self.mounted.get_mut(subject), layer) {
                        if let Some(cb) = mounted.callbacks.layer.as_mut() {
                            cb(subject, layer);
                        }
                    }
                    self.events.emit(LayerCompletedEvent { subject: subject.clone(), layer_id, is_new });
                }
                StoreOutcome::OverlayCreated { layer_id } => {
                    trace!("Subject {}: overlay for {} created", subject, layer_id);
                }
                StoreOutcome::ProgressChanged => {
                    let view = self.progress_view(subject);
                    if let (Some(mounted), Some(view)) = (self.mounted.get_mut(subject), view) {
                        if let Some(cb) = mounted.callbacks.progress.as_mut() {
                            cb(subject, &view);
                        }
                    }
                    self.events.emit(ProgressChangedEvent(subject.clone()));
                }
                StoreOutcome::ProgressCleared => {
                    self.events.emit(ProgressChangedEvent(subject.clone()));
                }
                StoreOutcome::Completed(result) => {
                    if let Some(cb) = self.mounted.get_mut(subject).and_then(|m| m.callbacks.complete.as_mut()) {
                        cb(subject, &result);
                    }
                    self.events.emit(VerificationCompleteEvent { subject: subject.clone(), result });
                }
                StoreOutcome::ResyncRequested => {
                    if let Some(mounted) = self.mounted.get(subject) {
                        self.resyncer.request(subject.clone(), mounted.generation);
                    }
                }
                StoreOutcome::ServerError(err) => self.notify_error(subject, &err),
            }
        }
        self.sync_playback(subject);
    }

    /// Keep the player's layer count in step with the store.
    fn sync_playback(&mut self, subject: &SubjectId) {
        let len = self.store.get(subject).map_or(0, |s| s.layer_count());
        let Some(mounted) = self.mounted.get_mut(subject) else {
            return;
        };
        let was_playing = mounted.playback.is_playing();
        let index = mounted.playback.sync_layers(len);
        if len == 0 {
            mounted.selected_layer = None;
        }
        let playing = mounted.playback.is_playing();

        if let Some(index) = index {
            self.select(subject, index);
        } else if len > 0 {
            // Resync may have replaced the layer under the current index
            let current = self.mounted.get(subject).and_then(|m| m.playback.current_index());
            let selected = self.mounted.get(subject).and_then(|m| m.selected_layer.clone());
            let expected = current
                .and_then(|i| self.store.get(subject).and_then(|s| s.layer_at(i)))
                .map(|l| l.id.clone());
            if let Some(i) = current.filter(|_| selected != expected) {
                self.select(subject, i);
            }
        }
        if was_playing != playing {
            self.events.emit(PlaybackStateChangedEvent { subject: subject.clone(), playing });
        }
    }

    fn notify_error(&mut self, subject: &SubjectId, err: &SyncError) {
        if let Some(cb) = self.mounted.get_mut(subject).and_then(|m| m.callbacks.error.as_mut()) {
            cb(subject, err);
        }
        self.events.emit(SyncErrorEvent { subject: subject.clone(), error: err.clone() });
    }
}

impl Drop for VerificationService {
    fn drop(&mut self) {
        let subjects: Vec<SubjectId> = self.mounted.keys().cloned().collect();
        for subject in &subjects {
            self.unmount(subject);
        }
    }
}
