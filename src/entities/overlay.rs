//! Overlay - visual placement of a Layer on the map.
//!
//! Overlays reference layers by id only. A dangling overlay (layer gone after
//! a resync) is pruned by the store; the compositor skips any it still sees.

use serde::{Deserialize, Serialize};

/// Default opacity for auto-created overlays
pub const DEFAULT_OVERLAY_OPACITY: f32 = 0.7;

/// Supported blend modes for overlay compositing on the map.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlendMode {
    #[default]
    Normal,
    Multiply,
    Screen,
    Overlay,
    Darken,
    Lighten,
    Difference,
}

impl BlendMode {
    pub const ALL: [BlendMode; 7] = [
        BlendMode::Normal,
        BlendMode::Multiply,
        BlendMode::Screen,
        BlendMode::Overlay,
        BlendMode::Darken,
        BlendMode::Lighten,
        BlendMode::Difference,
    ];

    /// CSS `mix-blend-mode` keyword
    pub fn as_css(&self) -> &'static str {
        match self {
            BlendMode::Normal => "normal",
            BlendMode::Multiply => "multiply",
            BlendMode::Screen => "screen",
            BlendMode::Overlay => "overlay",
            BlendMode::Darken => "darken",
            BlendMode::Lighten => "lighten",
            BlendMode::Difference => "difference",
        }
    }
}

impl std::fmt::Display for BlendMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_css())
    }
}

impl std::str::FromStr for BlendMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BlendMode::ALL
            .into_iter()
            .find(|m| m.as_css().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown blend mode '{}'", s))
    }
}

/// Placement state for one layer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Overlay {
    pub layer_id: String,
    pub opacity: f32,
    pub visible: bool,
    pub blend_mode: BlendMode,
    pub z_index: usize,
}

impl Overlay {
    /// Overlay as auto-created on layer completion.
    pub fn auto(layer_id: impl Into<String>, z_index: usize, opacity: f32) -> Self {
        Self {
            layer_id: layer_id.into(),
            opacity: opacity.clamp(0.0, 1.0),
            visible: true,
            blend_mode: BlendMode::Normal,
            z_index,
        }
    }

    pub fn set_opacity(&mut self, opacity: f32) {
        self.opacity = if opacity.is_nan() { 0.0 } else { opacity.clamp(0.0, 1.0) };
    }
}
