//! Wire protocol of the verification channel.
//!
//! Inbound frames are JSON objects with a required string `type`. Decoding
//! is two-step: parse to `Value`, then pick the shape by `type`. That keeps
//! unknown types decodable (forward compatible) while a missing `type` or
//! broken JSON is a protocol error.
//!
//! | type                    | payload                                           |
//! |-------------------------|---------------------------------------------------|
//! | `connected`             | opaque                                            |
//! | `layer_update`          | layer_id, layer_type, status, metadata, thumbnail |
//! | `progress`              | stage, message, percentage, eta, band, counters   |
//! | `verification_complete` | opaque result                                     |
//! | `error`                 | message                                           |
//! | `ping` / `pong`         | none                                              |

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::entities::layer::{de_count, de_id, de_or_default};
use crate::entities::progress::clamp_percentage;
use crate::entities::{Layer, LayerMetadata, ProgressSnapshot, Stage};
use crate::error::SyncError;

/// Status value marking a finished layer
pub const STATUS_COMPLETE: &str = "complete";

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct LayerUpdate {
    #[serde(deserialize_with = "de_id")]
    pub layer_id: String,
    #[serde(default, deserialize_with = "de_or_default")]
    pub layer_type: String,
    #[serde(default, deserialize_with = "de_or_default")]
    pub status: String,
    #[serde(default, deserialize_with = "de_or_default")]
    pub metadata: LayerMetadata,
    #[serde(default)]
    pub thumbnail_url: Option<String>,
}

impl LayerUpdate {
    pub fn is_complete(&self) -> bool {
        self.status.eq_ignore_ascii_case(STATUS_COMPLETE)
    }

    pub fn to_layer(&self) -> Layer {
        let created_at = self
            .metadata
            .extra
            .get("created_at")
            .and_then(Value::as_str)
            .map(str::to_string);
        Layer::new(
            self.layer_id.clone(),
            self.layer_type.clone(),
            self.metadata.clone(),
            self.thumbnail_url.clone(),
            created_at,
        )
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct ProgressUpdate {
    pub stage: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default, deserialize_with = "de_or_default")]
    pub percentage: f32,
    #[serde(default)]
    pub estimated_seconds_remaining: Option<f64>,
    #[serde(default)]
    pub band: Option<String>,
    #[serde(default, deserialize_with = "de_count")]
    pub current: Option<u32>,
    #[serde(default, deserialize_with = "de_count")]
    pub total: Option<u32>,
}

impl ProgressUpdate {
    pub fn to_snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            stage: Stage::from(self.stage.as_str()),
            message: self.message.clone().filter(|m| !m.is_empty()),
            percentage: clamp_percentage(self.percentage),
            eta_seconds: self
                .estimated_seconds_remaining
                .filter(|s| s.is_finite() && *s >= 0.0),
            band: self.band.clone(),
            current: self.current,
            total: self.total,
        }
    }
}

/// Decoded inbound frame.
#[derive(Clone, Debug, PartialEq)]
pub enum InboundFrame {
    Connected(Value),
    LayerUpdate(LayerUpdate),
    Progress(ProgressUpdate),
    VerificationComplete(Value),
    Error { message: String },
    Ping,
    Pong,
    /// Type this client doesn't know yet
    Unknown(String),
}

impl InboundFrame {
    pub fn kind(&self) -> &str {
        match self {
            InboundFrame::Connected(_) => "connected",
            InboundFrame::LayerUpdate(_) => "layer_update",
            InboundFrame::Progress(_) => "progress",
            InboundFrame::VerificationComplete(_) => "verification_complete",
            InboundFrame::Error { .. } => "error",
            InboundFrame::Ping => "ping",
            InboundFrame::Pong => "pong",
            InboundFrame::Unknown(kind) => kind,
        }
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
}

/// Decode one text frame.
pub fn decode(text: &str) -> Result<InboundFrame, SyncError> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| SyncError::Protocol(format!("invalid JSON: {}", e)))?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| SyncError::Protocol("missing `type` field".to_string()))?
        .to_string();

    let shape_err = |e: serde_json::Error| SyncError::Protocol(format!("bad `{}` frame: {}", kind, e));

    let frame = match kind.as_str() {
        "connected" => InboundFrame::Connected(value),
        "layer_update" => InboundFrame::LayerUpdate(serde_json::from_value(value).map_err(shape_err)?),
        "progress" => InboundFrame::Progress(serde_json::from_value(value).map_err(shape_err)?),
        "verification_complete" => InboundFrame::VerificationComplete(value),
        "error" => {
            let body: ErrorBody = serde_json::from_value(value).map_err(shape_err)?;
            InboundFrame::Error {
                message: body.message.unwrap_or_else(|| "unknown server error".to_string()),
            }
        }
        "ping" => InboundFrame::Ping,
        "pong" => InboundFrame::Pong,
        _ => InboundFrame::Unknown(kind.clone()),
    };
    Ok(frame)
}

/// Frames this client sends.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    Pong,
    StartVerification,
}

impl OutboundFrame {
    pub fn encode(&self) -> String {
        match self {
            OutboundFrame::Pong => r#"{"type":"pong"}"#.to_string(),
            OutboundFrame::StartVerification => r#"{"type":"start_verification"}"#.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_layer_update_numeric_id() {
        let frame = decode(
            r#"{"type":"layer_update","layer_id":7,"layer_type":"ndvi","status":"complete",
                "metadata":{"name":"NDVI","bounds":{"north":1.0,"south":0.5,"east":2.0,"west":1.5}},
                "thumbnail_url":"/t/7.png"}"#,
        )
        .unwrap();
        let InboundFrame::LayerUpdate(update) = frame else {
            panic!("expected layer_update");
        };
        assert_eq!(update.layer_id, "7");
        assert!(update.is_complete());
        let layer = update.to_layer();
        assert_eq!(layer.name(), "NDVI");
        assert!(layer.is_renderable());
        assert_eq!(layer.thumbnail_url.as_deref(), Some("/t/7.png"));
    }

    #[test]
    fn test_decode_progress() {
        let frame = decode(
            r#"{"type":"progress","stage":"fetching_bands","percentage":130,"band":"B04","current":3,"total":12,
                "estimated_seconds_remaining":-1}"#,
        )
        .unwrap();
        let InboundFrame::Progress(update) = frame else {
            panic!("expected progress");
        };
        let snapshot = update.to_snapshot();
        assert_eq!(snapshot.stage, Stage::FetchingBands);
        assert_eq!(snapshot.percentage, 100.0);
        assert_eq!(snapshot.eta_seconds, None);
        assert_eq!(snapshot.band.as_deref(), Some("B04"));
    }

    #[test]
    fn test_decode_tolerates_nulls_and_float_counts() {
        let frame = decode(
            r#"{"type":"layer_update","layer_id":"7","layer_type":null,"status":"complete","metadata":null}"#,
        )
        .unwrap();
        let InboundFrame::LayerUpdate(update) = frame else {
            panic!("expected layer_update");
        };
        assert!(update.is_complete());
        assert_eq!(update.layer_type, "");
        assert_eq!(update.metadata, LayerMetadata::default());
        assert!(!update.to_layer().is_renderable());

        let frame = decode(
            r#"{"type":"progress","stage":"fetching_bands","percentage":null,"current":3.0,"total":12.0}"#,
        )
        .unwrap();
        let InboundFrame::Progress(update) = frame else {
            panic!("expected progress");
        };
        let snapshot = update.to_snapshot();
        assert_eq!((snapshot.current, snapshot.total), (Some(3), Some(12)));
        assert_eq!(snapshot.percentage, 0.0);
    }

    #[test]
    fn test_decode_simple_frames() {
        assert_eq!(decode(r#"{"type":"ping"}"#).unwrap(), InboundFrame::Ping);
        assert_eq!(decode(r#"{"type":"pong"}"#).unwrap(), InboundFrame::Pong);
        assert_eq!(
            decode(r#"{"type":"error","message":"quota exceeded"}"#).unwrap(),
            InboundFrame::Error { message: "quota exceeded".into() }
        );
        assert!(matches!(
            decode(r#"{"type":"verification_complete","score":0.9}"#).unwrap(),
            InboundFrame::VerificationComplete(v) if v["score"] == 0.9
        ));
    }

    #[test]
    fn test_unknown_type_is_not_an_error() {
        assert_eq!(
            decode(r#"{"type":"heartbeat_v2"}"#).unwrap(),
            InboundFrame::Unknown("heartbeat_v2".into())
        );
    }

    #[test]
    fn test_malformed_frames() {
        assert!(matches!(decode("not json"), Err(SyncError::Protocol(_))));
        assert!(matches!(decode(r#"{"layer_id":1}"#), Err(SyncError::Protocol(_))));
        assert!(matches!(decode(r#"{"type":5}"#), Err(SyncError::Protocol(_))));
        assert!(matches!(decode(r#"{"type":"layer_update"}"#), Err(SyncError::Protocol(_))));
    }

    #[test]
    fn test_outbound_encoding_matches_serde() {
        for frame in [OutboundFrame::Pong, OutboundFrame::StartVerification] {
            assert_eq!(frame.encode(), serde_json::to_string(&frame).unwrap());
        }
    }
}
