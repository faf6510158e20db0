//! Playback controller - time-series player over a subject's layers.
//!
//! # Timing Model
//!
//! Fixed period per speed preset (slow 2000 ms, normal 1000 ms, fast 500 ms).
//! The period runs on an explicit [`Timer`]; the owner calls `tick(now)` from
//! its loop and gets the new index back when it changed.
//!
//! # States
//!
//! ```text
//!   Idle ──first layer──▶ Stopped ──play()──▶ Playing
//!                            ▲                   │
//!                            └──pause() / end────┘
//! ```
//!
//! With loop off, a tick at the last index stops playback instead of
//! advancing. With loop on, it wraps to 0. Playback works the same whether
//! the stream is still live or finished.

use std::str::FromStr;
use std::time::{Duration, Instant};

use log::{debug, trace};
use serde::{Deserialize, Serialize};

use crate::core::Timer;
use crate::hotkeys::PlaybackAction;

/// Speed presets.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackSpeed {
    Slow,
    #[default]
    Normal,
    Fast,
}

impl PlaybackSpeed {
    /// Time between two layers.
    pub fn period(&self) -> Duration {
        match self {
            PlaybackSpeed::Slow => Duration::from_millis(2000),
            PlaybackSpeed::Normal => Duration::from_millis(1000),
            PlaybackSpeed::Fast => Duration::from_millis(500),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PlaybackSpeed::Slow => "slow",
            PlaybackSpeed::Normal => "normal",
            PlaybackSpeed::Fast => "fast",
        }
    }
}

impl std::fmt::Display for PlaybackSpeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlaybackSpeed {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "slow" => Ok(PlaybackSpeed::Slow),
            "normal" => Ok(PlaybackSpeed::Normal),
            "fast" => Ok(PlaybackSpeed::Fast),
            other => Err(format!("unknown speed '{}', expected slow, normal or fast", other)),
        }
    }
}

/// Animation state of one subject.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnimationState {
    pub current_index: usize,
    pub speed: PlaybackSpeed,
    pub loop_enabled: bool,
    pub playing: bool,
}

impl Default for AnimationState {
    fn default() -> Self {
        Self {
            current_index: 0,
            speed: PlaybackSpeed::Normal,
            loop_enabled: true,
            playing: false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackPhase {
    /// No layers yet
    Idle,
    Stopped,
    Playing,
}

/// Player over `len` layers. Does not own the layers, only their count.
#[derive(Debug, Default)]
pub struct PlaybackController {
    state: AnimationState,
    len: usize,
    timer: Timer,
}

impl PlaybackController {
    pub fn new(speed: PlaybackSpeed, loop_enabled: bool) -> Self {
        Self {
            state: AnimationState {
                speed,
                loop_enabled,
                ..Default::default()
            },
            len: 0,
            timer: Timer::new(),
        }
    }

    // === Accessors ===

    pub fn state(&self) -> AnimationState {
        self.state
    }

    pub fn phase(&self) -> PlaybackPhase {
        if self.len == 0 {
            PlaybackPhase::Idle
        } else if self.state.playing {
            PlaybackPhase::Playing
        } else {
            PlaybackPhase::Stopped
        }
    }

    pub fn current_index(&self) -> Option<usize> {
        (self.len > 0).then_some(self.state.current_index)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_playing(&self) -> bool {
        self.state.playing
    }

    pub fn speed(&self) -> PlaybackSpeed {
        self.state.speed
    }

    pub fn loop_enabled(&self) -> bool {
        self.state.loop_enabled
    }

    /// When the next automatic advance is due.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timer.deadline()
    }

    // === Layer set ===

    /// Follow the size of the layer collection. Returns the index if the
    /// clamp moved it.
    pub fn sync_layers(&mut self, len: usize) -> Option<usize> {
        if len == self.len {
            return None;
        }
        let was_idle = self.len == 0;
        self.len = len;

        if len == 0 {
            debug!("Playback: layers gone, back to idle");
            self.stop();
            self.state.current_index = 0;
            return None;
        }
        if was_idle {
            debug!("Playback: {} layer(s), ready", len);
            self.state.current_index = 0;
            return Some(0);
        }
        if self.state.current_index >= len {
            self.state.current_index = len - 1;
            return Some(self.state.current_index);
        }
        None
    }

    // === Transport ===

    /// Start playing. Does nothing without layers.
    pub fn play(&mut self, now: Instant) -> bool {
        if self.len == 0 {
            debug!("Playback: nothing to play");
            return false;
        }
        if !self.state.playing {
            debug!("Playback: play at {} ({})", self.state.current_index, self.state.speed);
            self.state.playing = true;
            self.timer.start_interval(now, self.state.speed.period());
        }
        true
    }

    pub fn pause(&mut self) {
        if self.state.playing {
            debug!("Playback: pause at {}", self.state.current_index);
        }
        self.stop();
    }

    pub fn toggle_play(&mut self, now: Instant) -> bool {
        if self.state.playing {
            self.pause();
            false
        } else {
            self.play(now)
        }
    }

    /// Advance if the period elapsed. Returns the new index when it changed.
    pub fn tick(&mut self, now: Instant) -> Option<usize> {
        if !self.state.playing || !self.timer.fire(now) {
            return None;
        }
        let last = self.len.saturating_sub(1);
        let current = self.state.current_index;

        let next = if current < last {
            current + 1
        } else if self.state.loop_enabled {
            0
        } else {
            debug!("Playback: reached last layer, stopping");
            self.stop();
            return None;
        };
        trace!("Playback: tick {} -> {}", current, next);
        self.set_index(next)
    }

    // === Navigation ===

    pub fn next(&mut self) -> Option<usize> {
        self.step(1)
    }

    pub fn previous(&mut self) -> Option<usize> {
        self.step(-1)
    }

    /// Step by `delta`. Wraps only with loop on, clamps otherwise.
    pub fn step(&mut self, delta: i64) -> Option<usize> {
        if self.len == 0 {
            return None;
        }
        let len = self.len as i64;
        let target = self.state.current_index as i64 + delta;
        let target = if self.state.loop_enabled {
            target.rem_euclid(len)
        } else {
            target.clamp(0, len - 1)
        };
        self.set_index(target as usize)
    }

    /// Jump to an absolute index (clamped).
    pub fn seek(&mut self, index: usize) -> Option<usize> {
        if self.len == 0 {
            return None;
        }
        self.set_index(index.min(self.len - 1))
    }

    /// Map a normalized position in [0, 100] to an index.
    pub fn scrub(&mut self, position: f32) -> Option<usize> {
        if self.len == 0 {
            return None;
        }
        let position = if position.is_finite() { position.clamp(0.0, 100.0) } else { 0.0 };
        let index = (position / 100.0 * (self.len - 1) as f32).round() as usize;
        self.seek(index)
    }

    // === Settings ===

    /// Change speed. While playing the timer restarts with the new period.
    pub fn set_speed(&mut self, speed: PlaybackSpeed, now: Instant) {
        self.state.speed = speed;
        self.restart_timer(now);
    }

    pub fn set_loop(&mut self, enabled: bool, now: Instant) {
        self.state.loop_enabled = enabled;
        self.restart_timer(now);
    }

    pub fn toggle_loop(&mut self, now: Instant) -> bool {
        self.set_loop(!self.state.loop_enabled, now);
        self.state.loop_enabled
    }

    /// Run a keyboard / remote action. Returns the new index when it changed.
    pub fn apply(&mut self, action: PlaybackAction, now: Instant) -> Option<usize> {
        match action {
            PlaybackAction::TogglePlay => {
                self.toggle_play(now);
                None
            }
            PlaybackAction::StepForward => self.next(),
            PlaybackAction::StepBackward => self.previous(),
            PlaybackAction::ToggleLoop => {
                self.toggle_loop(now);
                None
            }
        }
    }

    /// Cancel the timer (unmount).
    pub fn dispose(&mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.state.playing = false;
        self.timer.cancel();
    }

    fn restart_timer(&mut self, now: Instant) {
        if self.state.playing {
            trace!("Playback: restart timer ({}, loop={})", self.state.speed, self.state.loop_enabled);
            self.timer.start_interval(now, self.state.speed.period());
        }
    }

    fn set_index(&mut self, index: usize) -> Option<usize> {
        if index == self.state.current_index {
            return None;
        }
        self.state.current_index = index;
        Some(index)
    }
}
