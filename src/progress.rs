//! Progress presenter: display view of a progress snapshot, plus a terminal
//! progress bar for the watcher binary.

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use serde::Serialize;

use crate::entities::{ProgressSnapshot, Stage};

/// Normalized, display-ready progress.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ProgressView {
    pub stage: String,
    pub label: String,
    /// (k, of) for known stages
    pub step: Option<(usize, usize)>,
    /// 0..=100
    pub percentage: u8,
    pub eta: Option<String>,
    pub detail: Option<String>,
    pub message: Option<String>,
}

impl ProgressView {
    /// Stages are shown as reported, even out of nominal order.
    pub fn from_snapshot(snapshot: &ProgressSnapshot) -> Self {
        let pct = snapshot.percentage;
        let percentage = if pct.is_finite() { pct.clamp(0.0, 100.0).round() as u8 } else { 0 };
        Self {
            stage: snapshot.stage.as_str().to_string(),
            label: snapshot.stage.label(),
            step: snapshot.stage.step().map(|k| (k, Stage::PIPELINE.len())),
            percentage,
            eta: snapshot.eta_seconds.map(format_eta),
            detail: detail(snapshot),
            message: snapshot.message.clone(),
        }
    }

    /// One-line summary, e.g. `[2/6] Fetching satellite bands 40% ~1m 5s - band B04 (3/12)`
    pub fn status_line(&self) -> String {
        let mut line = String::new();
        if let Some((k, of)) = self.step {
            line.push_str(&format!("[{}/{}] ", k, of));
        }
        line.push_str(&format!("{} {}%", self.label, self.percentage));
        if let Some(eta) = &self.eta {
            line.push(' ');
            line.push_str(eta);
        }
        if let Some(detail) = &self.detail {
            line.push_str(" - ");
            line.push_str(detail);
        }
        line
    }
}

/// "~45s", "~2m 5s", "~1h 3m"
pub fn format_eta(seconds: f64) -> String {
    let total = seconds.max(0.0).round() as u64;
    let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
    if h > 0 {
        format!("~{}h {}m", h, m)
    } else if m > 0 {
        format!("~{}m {}s", m, s)
    } else {
        format!("~{}s", s)
    }
}

fn detail(snapshot: &ProgressSnapshot) -> Option<String> {
    let counter = match (snapshot.current, snapshot.total) {
        (Some(current), Some(total)) => Some(format!("({}/{})", current, total)),
        _ => None,
    };
    match (&snapshot.band, counter) {
        (Some(band), Some(counter)) => Some(format!("band {} {}", band, counter)),
        (Some(band), None) => Some(format!("band {}", band)),
        (None, Some(counter)) => Some(counter),
        (None, None) => None,
    }
}

/// Terminal progress: log line on top, percentage bar below.
/// Clones share the same bars.
#[derive(Debug, Clone)]
pub struct TerminalProgress {
    multi: MultiProgress,
    log_line: ProgressBar,
    bar: ProgressBar,
}

impl Default for TerminalProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl TerminalProgress {
    pub fn new() -> Self {
        let multi = MultiProgress::new();

        let log_line = multi.add(ProgressBar::new_spinner());
        log_line.set_style(
            ProgressStyle::default_spinner()
                .template("{msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        log_line.set_message("Waiting for progress...");

        let bar = multi.add(ProgressBar::new(100));
        bar.set_style(
            ProgressStyle::default_bar()
                .template("[{bar:40.cyan/blue}] {pos:>3}% | {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("█▓░"),
        );

        Self { multi, log_line, bar }
    }

    pub fn update(&self, view: &ProgressView) {
        let header = match view.step {
            Some((k, of)) => format!("[{}/{}] {}", k, of, view.label),
            None => view.label.clone(),
        };
        let header = match &view.message {
            Some(message) => format!("{}: {}", header, message),
            None => header,
        };
        self.log_line.set_message(header);

        self.bar.set_position(view.percentage as u64);
        let mut tail = Vec::new();
        if let Some(eta) = &view.eta {
            tail.push(eta.clone());
        }
        if let Some(detail) = &view.detail {
            tail.push(detail.clone());
        }
        self.bar.set_message(tail.join(" | "));
    }

    /// Print a line above the bars without tearing them.
    pub fn println(&self, line: impl AsRef<str>) {
        if self.multi.println(line.as_ref()).is_err() {
            self.log_line.set_message(line.as_ref().to_string());
        }
    }

    pub fn finish(&self, message: impl Into<String>) {
        self.bar.set_position(100);
        self.bar.finish_with_message("");
        self.log_line.finish_with_message(message.into());
    }

    pub fn clear(&self) {
        self.bar.set_position(0);
        self.bar.set_message("");
        self.log_line.set_message("Ready");
    }
}
