//! Progress snapshot and pipeline stages.

use serde::{Deserialize, Serialize};

/// Named phase of the server-side verification pipeline.
///
/// Unknown stage names are kept verbatim so newer servers still display.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Stage {
    Geocoding,
    FetchingBands,
    CalculatingNdvi,
    Classifying,
    GeneratingLayers,
    Complete,
    Other(String),
}

impl Stage {
    /// Nominal order. Reported stages are not checked against it.
    pub const PIPELINE: [Stage; 6] = [
        Stage::Geocoding,
        Stage::FetchingBands,
        Stage::CalculatingNdvi,
        Stage::Classifying,
        Stage::GeneratingLayers,
        Stage::Complete,
    ];

    pub fn as_str(&self) -> &str {
        match self {
            Stage::Geocoding => "geocoding",
            Stage::FetchingBands => "fetching_bands",
            Stage::CalculatingNdvi => "calculating_ndvi",
            Stage::Classifying => "classifying",
            Stage::GeneratingLayers => "generating_layers",
            Stage::Complete => "complete",
            Stage::Other(raw) => raw.as_str(),
        }
    }

    /// 1-based position in the nominal pipeline, None for unknown stages.
    pub fn step(&self) -> Option<usize> {
        Self::PIPELINE.iter().position(|s| s == self).map(|i| i + 1)
    }

    pub fn label(&self) -> String {
        match self {
            Stage::Geocoding => "Geocoding address".to_string(),
            Stage::FetchingBands => "Fetching satellite bands".to_string(),
            Stage::CalculatingNdvi => "Calculating NDVI".to_string(),
            Stage::Classifying => "Classifying land use".to_string(),
            Stage::GeneratingLayers => "Generating layers".to_string(),
            Stage::Complete => "Complete".to_string(),
            Stage::Other(raw) => super::layer::humanize(raw),
        }
    }
}

impl From<String> for Stage {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "geocoding" => Stage::Geocoding,
            "fetching_bands" => Stage::FetchingBands,
            "calculating_ndvi" => Stage::CalculatingNdvi,
            "classifying" => Stage::Classifying,
            "generating_layers" => Stage::GeneratingLayers,
            "complete" => Stage::Complete,
            _ => Stage::Other(raw),
        }
    }
}

impl From<&str> for Stage {
    fn from(raw: &str) -> Self {
        Stage::from(raw.to_string())
    }
}

impl From<Stage> for String {
    fn from(stage: Stage) -> Self {
        stage.as_str().to_string()
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current progress of a subject. Replaced wholesale by every progress frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub stage: Stage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Always within [0, 100]
    pub percentage: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub band: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<u32>,
}

impl ProgressSnapshot {
    pub fn new(stage: impl Into<Stage>, percentage: f32) -> Self {
        Self {
            stage: stage.into(),
            message: None,
            percentage: clamp_percentage(percentage),
            eta_seconds: None,
            band: None,
            current: None,
            total: None,
        }
    }
}

pub(crate) fn clamp_percentage(p: f32) -> f32 {
    if p.is_nan() { 0.0 } else { p.clamp(0.0, 100.0) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_roundtrip_unknown() {
        let s: Stage = serde_json::from_str("\"reticulating\"").unwrap();
        assert_eq!(s, Stage::Other("reticulating".into()));
        assert_eq!(s.step(), None);
        assert_eq!(serde_json::to_string(&s).unwrap(), "\"reticulating\"");
    }

    #[test]
    fn test_stage_steps() {
        assert_eq!(Stage::Geocoding.step(), Some(1));
        assert_eq!(Stage::from("generating_layers").step(), Some(5));
    }

    #[test]
    fn test_percentage_clamped() {
        assert_eq!(ProgressSnapshot::new("geocoding", 140.0).percentage, 100.0);
        assert_eq!(ProgressSnapshot::new("geocoding", -3.0).percentage, 0.0);
    }
}
