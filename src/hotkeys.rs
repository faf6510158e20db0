//! Hotkey system - playback keyboard shortcuts.
//!
//! Keys are plain names (`"Space"`, `"ArrowLeft"`, `"L"`), optionally with
//! `Ctrl+` / `Shift+` / `Alt+` prefixes. Single letters match either case.
//! While focus sits in a text field nothing fires, so typing a name into a
//! search box never toggles playback.

use std::collections::HashMap;

use log::trace;
use serde::{Deserialize, Serialize};

/// Playback actions reachable from the keyboard (and the control API).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackAction {
    TogglePlay,
    StepForward,
    StepBackward,
    ToggleLoop,
}

/// Where keyboard focus currently is.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum InputFocus {
    #[default]
    Map,
    /// Text input: all shortcuts suppressed
    TextField,
}

/// Hotkey handler for playback shortcuts
#[derive(Debug, Clone)]
pub struct HotkeyHandler {
    bindings: HashMap<String, PlaybackAction>,
    focus: InputFocus,
}

impl Default for HotkeyHandler {
    fn default() -> Self {
        let mut handler = Self::new();
        handler.setup_default_bindings();
        handler
    }
}

impl HotkeyHandler {
    /// Handler without bindings
    pub fn new() -> Self {
        Self {
            bindings: HashMap::new(),
            focus: InputFocus::Map,
        }
    }

    /// Space = play/pause, arrows = step, L = loop
    pub fn setup_default_bindings(&mut self) {
        use PlaybackAction::*;

        self.add_binding("Space", TogglePlay);
        self.add_binding("ArrowLeft", StepBackward);
        self.add_binding("ArrowRight", StepForward);
        self.add_binding("L", ToggleLoop);
    }

    pub fn add_binding(&mut self, key: &str, action: PlaybackAction) {
        self.bindings.insert(normalize(key), action);
    }

    pub fn remove_binding(&mut self, key: &str) {
        self.bindings.remove(&normalize(key));
    }

    pub fn bindings(&self) -> impl Iterator<Item = (&str, PlaybackAction)> {
        self.bindings.iter().map(|(k, a)| (k.as_str(), *a))
    }

    pub fn set_focus(&mut self, focus: InputFocus) {
        self.focus = focus;
    }

    pub fn focus(&self) -> InputFocus {
        self.focus
    }

    /// Handle a key press
    pub fn handle_key(&self, key: &str) -> Option<PlaybackAction> {
        if self.focus == InputFocus::TextField {
            trace!("Hotkey {} suppressed (text field focused)", key);
            return None;
        }
        self.bindings.get(&normalize(key)).copied()
    }

    /// Handle a key press with modifiers
    pub fn handle_key_with_modifiers(
        &self,
        key: &str,
        ctrl: bool,
        shift: bool,
        alt: bool,
    ) -> Option<PlaybackAction> {
        let mut combo = String::new();
        if ctrl {
            combo.push_str("Ctrl+");
        }
        if shift {
            combo.push_str("Shift+");
        }
        if alt {
            combo.push_str("Alt+");
        }
        combo.push_str(key);
        self.handle_key(&combo)
    }
}

/// Upper-case single-character key names, keep the rest as given.
fn normalize(key: &str) -> String {
    let (prefix, name) = match key.rfind('+') {
        Some(i) if i + 1 < key.len() => key.split_at(i + 1),
        _ => ("", key),
    };
    let name = match name {
        " " => "Space".to_string(),
        "Left" => "ArrowLeft".to_string(),
        "Right" => "ArrowRight".to_string(),
        n if n.chars().count() == 1 => n.to_uppercase(),
        n => n.to_string(),
    };
    format!("{}{}", prefix, name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_bindings() {
        let handler = HotkeyHandler::default();
        assert_eq!(handler.handle_key("Space"), Some(PlaybackAction::TogglePlay));
        assert_eq!(handler.handle_key(" "), Some(PlaybackAction::TogglePlay));
        assert_eq!(handler.handle_key("ArrowLeft"), Some(PlaybackAction::StepBackward));
        assert_eq!(handler.handle_key("Right"), Some(PlaybackAction::StepForward));
        assert_eq!(handler.handle_key("l"), Some(PlaybackAction::ToggleLoop));
        assert_eq!(handler.handle_key("L"), Some(PlaybackAction::ToggleLoop));
        assert_eq!(handler.handle_key("x"), None);
    }

    #[test]
    fn test_text_field_suppresses() {
        let mut handler = HotkeyHandler::default();
        handler.set_focus(InputFocus::TextField);
        assert_eq!(handler.handle_key("Space"), None);
        assert_eq!(handler.handle_key("l"), None);
        handler.set_focus(InputFocus::Map);
        assert_eq!(handler.handle_key("Space"), Some(PlaybackAction::TogglePlay));
    }

    #[test]
    fn test_modifiers_and_rebinding() {
        let mut handler = HotkeyHandler::default();
        assert_eq!(handler.handle_key_with_modifiers("l", true, false, false), None);

        handler.add_binding("Ctrl+l", PlaybackAction::StepForward);
        assert_eq!(
            handler.handle_key_with_modifiers("L", true, false, false),
            Some(PlaybackAction::StepForward)
        );

        handler.remove_binding("Space");
        assert_eq!(handler.handle_key("Space"), None);
        assert_eq!(handler.bindings().count(), 4);
    }
}
