//! Layer - one completed analytical artifact of a verification job.
//!
//! # Architecture
//!
//! A `Layer` is created once per (subject, completed stage) and never mutated
//! afterwards. The store owns the ordered collection; everything else reads.
//! Two wire shapes produce layers:
//! - live `layer_update` frames (bounds nested in `metadata`)
//! - resync payloads from the layer list endpoint (bounds at top level)
//!
//! Both funnel through [`Layer::new`] so naming and bounds rules match.
//!
//! # Bounds
//!
//! Bounds are kept exactly as reported, including missing coordinates.
//! Rendering decides via [`Bounds::validate`]; the data model never drops a
//! layer because of its bounds.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Geographic extent as reported by the server. Any coordinate may be missing.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    #[serde(default)]
    pub north: Option<f64>,
    #[serde(default)]
    pub south: Option<f64>,
    #[serde(default)]
    pub east: Option<f64>,
    #[serde(default)]
    pub west: Option<f64>,
}

/// Fully defined bounds, safe to hand to a map.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeoBounds {
    pub north: f64,
    pub south: f64,
    pub east: f64,
    pub west: f64,
}

impl Bounds {
    pub fn new(north: f64, south: f64, east: f64, west: f64) -> Self {
        Self {
            north: Some(north),
            south: Some(south),
            east: Some(east),
            west: Some(west),
        }
    }

    /// Check that all four coordinates exist and span a non-empty area.
    /// Returns the reason on failure (used for the one-time render warning).
    pub fn validate(&self) -> Result<GeoBounds, String> {
        let (Some(north), Some(south), Some(east), Some(west)) =
            (self.north, self.south, self.east, self.west)
        else {
            return Err("missing coordinate".to_string());
        };
        if ![north, south, east, west].iter().all(|v| v.is_finite()) {
            return Err("non-finite coordinate".to_string());
        }
        if north == south {
            return Err(format!("north == south ({})", north));
        }
        if east == west {
            return Err(format!("east == west ({})", east));
        }
        Ok(GeoBounds { north, south, east, west })
    }

    pub fn is_renderable(&self) -> bool {
        self.validate().is_ok()
    }
}

impl GeoBounds {
    /// Smallest extent covering both.
    pub fn union(&self, other: &GeoBounds) -> GeoBounds {
        GeoBounds {
            north: self.north.max(other.north),
            south: self.south.min(other.south),
            east: self.east.max(other.east),
            west: self.west.min(other.west),
        }
    }

    pub fn center(&self) -> (f64, f64) {
        ((self.north + self.south) / 2.0, (self.east + self.west) / 2.0)
    }
}

/// Layer metadata. `name` and `bounds` are typed, everything else is kept
/// verbatim in `extra` for detail panels.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LayerMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounds: Option<Bounds>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Single completed layer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Layer {
    pub id: String,
    pub layer_type: String,
    pub metadata: LayerMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
    /// Server timestamp. Live frames usually omit it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

impl Layer {
    pub fn new(
        id: impl Into<String>,
        layer_type: impl Into<String>,
        metadata: LayerMetadata,
        thumbnail_url: Option<String>,
        created_at: Option<String>,
    ) -> Self {
        let thumbnail_url = thumbnail_url.filter(|u| !u.trim().is_empty());
        Self {
            id: id.into(),
            layer_type: layer_type.into(),
            metadata,
            thumbnail_url,
            created_at,
        }
    }

    /// Display name: explicit metadata name, else the humanized layer type.
    pub fn name(&self) -> String {
        match self.metadata.name.as_deref() {
            Some(name) if !name.trim().is_empty() => name.to_string(),
            _ => humanize(&self.layer_type),
        }
    }

    pub fn bounds(&self) -> Bounds {
        self.metadata.bounds.unwrap_or_default()
    }

    pub fn is_renderable(&self) -> bool {
        self.bounds().is_renderable()
    }
}

/// "calculating_ndvi" -> "Calculating Ndvi"
pub fn humanize(raw: &str) -> String {
    raw.split(['_', '-', ' '])
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Accept ids sent either as JSON strings or numbers.
pub(crate) fn de_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number id, got {}",
            other
        ))),
    }
}

/// `null` and a missing field both mean `T::default()`.
pub(crate) fn de_or_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Counter sent as an integer, a whole float (`3.0`) or a numeric string.
/// Negative, fractional or non-finite values are dropped.
pub(crate) fn de_count<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    let count = match Option::<Value>::deserialize(deserializer)? {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    Ok(count
        .filter(|c| c.is_finite() && *c >= 0.0 && c.fract() == 0.0 && *c <= u32::MAX as f64)
        .map(|c| c as u32))
}
