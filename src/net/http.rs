//! HTTP collaborators: authoritative layer list (resync).
//!
//! Requests run on short-lived background threads; results come back through
//! a crossbeam channel tagged with the subject and the mount generation that
//! asked for them, so the loop can drop answers nobody is waiting for.

use std::sync::Arc;
use std::thread;

use crossbeam_channel::{Receiver, Sender, unbounded};
use log::{debug, info, warn};
use reqwest::blocking::Client;
use serde::Deserialize;
use serde_json::Value;

use crate::config::SyncConfig;
use crate::entities::layer::{de_id, de_or_default};
use crate::entities::{Bounds, Layer, LayerMetadata, SubjectId};
use crate::error::SyncError;

/// Source of the authoritative layer set for a subject.
pub trait LayerApi: Send + Sync {
    fn fetch_layers(&self, subject: &SubjectId) -> Result<Vec<Layer>, SyncError>;
}

/// One entry of the layer list response. Bounds may sit at top level or in
/// metadata; top level wins.
#[derive(Debug, Deserialize)]
struct LayerRecord {
    #[serde(deserialize_with = "de_id")]
    id: String,
    #[serde(default, deserialize_with = "de_or_default")]
    layer_type: String,
    #[serde(default)]
    metadata: Option<LayerMetadata>,
    #[serde(default)]
    bounds: Option<Bounds>,
    #[serde(default)]
    thumbnail_url: Option<String>,
    #[serde(default)]
    created_at: Option<Value>,
}

impl LayerRecord {
    fn into_layer(self) -> Layer {
        let mut metadata = self.metadata.unwrap_or_default();
        if self.bounds.is_some() {
            metadata.bounds = self.bounds;
        }
        // Timestamps arrive as ISO strings or epoch numbers
        let created_at = match self.created_at {
            Some(Value::String(s)) => Some(s),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        };
        Layer::new(self.id, self.layer_type, metadata, self.thumbnail_url, created_at)
    }
}

#[derive(Debug, Deserialize)]
struct LayerList {
    #[serde(default)]
    layers: Vec<LayerRecord>,
}

/// Parse a layer list response body.
pub fn parse_layer_list(body: &str) -> Result<Vec<Layer>, SyncError> {
    let list: LayerList = serde_json::from_str(body)
        .map_err(|e| SyncError::Http(format!("bad layer list: {}", e)))?;
    Ok(list.layers.into_iter().map(LayerRecord::into_layer).collect())
}

/// `LayerApi` over reqwest (blocking client, bearer auth).
pub struct HttpLayerApi {
    client: Client,
    config: SyncConfig,
}

impl HttpLayerApi {
    pub fn new(config: SyncConfig) -> Result<Self, SyncError> {
        let client = Client::builder()
            .timeout(config.http_timeout())
            .user_agent(concat!("geosync/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client, config })
    }
}

impl LayerApi for HttpLayerApi {
    fn fetch_layers(&self, subject: &SubjectId) -> Result<Vec<Layer>, SyncError> {
        let url = self
            .config
            .layers_url(subject)
            .map_err(|e| SyncError::Http(e.to_string()))?;
        debug!("GET {}", url);

        let mut request = self.client.get(url);
        if let Some(token) = self.config.token.as_deref().filter(|t| !t.is_empty()) {
            request = request.bearer_auth(token);
        }
        let body = request.send()?.error_for_status()?.text()?;
        parse_layer_list(&body)
    }
}

/// Answer to one resync request.
#[derive(Debug)]
pub struct ResyncResult {
    pub subject: SubjectId,
    /// Mount generation that issued the request
    pub generation: u64,
    pub layers: Result<Vec<Layer>, SyncError>,
}

/// Runs resync requests off the loop thread.
pub struct Resyncer {
    api: Arc<dyn LayerApi>,
    tx: Sender<ResyncResult>,
    rx: Receiver<ResyncResult>,
}

impl Resyncer {
    pub fn new(api: Arc<dyn LayerApi>) -> Self {
        let (tx, rx) = unbounded();
        Self { api, tx, rx }
    }

    /// Fire a request. The result shows up in a later [`Resyncer::drain`].
    pub fn request(&self, subject: SubjectId, generation: u64) {
        info!("Resync requested for subject {}", subject);
        let api = Arc::clone(&self.api);
        let tx = self.tx.clone();
        let spawned = thread::Builder::new()
            .name(format!("geosync-resync-{}", subject))
            .spawn({
                let subject = subject.clone();
                move || {
                    let layers = api.fetch_layers(&subject);
                    let _ = tx.send(ResyncResult { subject, generation, layers });
                }
            });
        if let Err(e) = spawned {
            warn!("Failed to spawn resync thread: {}", e);
            let _ = self.tx.send(ResyncResult {
                subject,
                generation,
                layers: Err(SyncError::Http(format!("spawn failed: {}", e))),
            });
        }
    }

    pub fn drain(&self) -> Vec<ResyncResult> {
        self.rx.try_iter().collect()
    }

    /// Block until one result arrives (CLI shutdown, tests).
    pub fn recv_timeout(&self, timeout: std::time::Duration) -> Option<ResyncResult> {
        self.rx.recv_timeout(timeout).ok()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::MockLayerApi;
    use super::*;
    use std::time::Duration;

    const BODY: &str = r#"{"layers":[
        {"id":7,"layer_type":"ndvi","metadata":{"name":"NDVI","bounds":{"north":0,"south":0,"east":0,"west":0}},
         "bounds":{"north":1.0,"south":0.5,"east":2.0,"west":1.5},"thumbnail_url":"/t/7.png","created_at":"2026-01-02T03:04:05Z"},
        {"id":"8","layer_type":"land_use","metadata":{},"bounds":null,"thumbnail_url":""}
    ]}"#;

    #[test]
    fn test_parse_layer_list_with_null_fields() {
        let layers = parse_layer_list(
            r#"{"layers":[{"id":9,"layer_type":null,"metadata":null,"thumbnail_url":null,"created_at":null}]}"#,
        )
        .unwrap();
        assert_eq!(layers.len(), 1);
        assert_eq!(layers[0].layer_type, "");
        assert_eq!(layers[0].created_at, None);
    }

    #[test]
    fn test_parse_layer_list() {
        let layers = parse_layer_list(BODY).unwrap();
        assert_eq!(layers.len(), 2);
        assert_eq!(layers[0].id, "7");
        // Top-level bounds override metadata bounds
        assert!(layers[0].is_renderable());
        assert_eq!(layers[0].created_at.as_deref(), Some("2026-01-02T03:04:05Z"));
        assert_eq!(layers[1].name(), "Land Use");
        assert!(!layers[1].is_renderable());
        assert_eq!(layers[1].thumbnail_url, None);
    }

    #[test]
    fn test_parse_layer_list_rejects_garbage() {
        assert!(matches!(parse_layer_list("\"42\""), Err(SyncError::Http(_))));
        assert!(parse_layer_list("{}").unwrap().is_empty());
    }

    #[test]
    fn test_http_api_against_local_server() {
        let server = rouille::Server::new("127.0.0.1:0", |request| {
            let authorized = request.header("Authorization") == Some("Bearer secret");
            if request.url() == "/api/v1/verification/42/layers" && authorized {
                rouille::Response::from_data("application/json", BODY)
            } else {
                rouille::Response::empty_404()
            }
        })
        .unwrap();
        let addr = server.server_addr();
        let (handle, stop) = server.stoppable();

        let config = SyncConfig {
            api_base_url: format!("http://{}", addr),
            token: Some("secret".into()),
            ..Default::default()
        };
        let api = HttpLayerApi::new(config.clone()).unwrap();
        let layers = api.fetch_layers(&SubjectId::from(42u64)).unwrap();
        assert_eq!(layers.len(), 2);

        let missing = api.fetch_layers(&SubjectId::from(43u64));
        assert!(matches!(missing, Err(SyncError::Http(_))));

        let anonymous = HttpLayerApi::new(SyncConfig { token: None, ..config }).unwrap();
        assert!(anonymous.fetch_layers(&SubjectId::from(42u64)).is_err());

        let _ = stop.send(());
        let _ = handle.join();
    }

    #[test]
    fn test_resyncer_tags_results() {
        let api = Arc::new(MockLayerApi::with_layers(parse_layer_list(BODY).unwrap()));
        let resyncer = Resyncer::new(api.clone());
        resyncer.request(SubjectId::from("42"), 3);

        let result = resyncer.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(result.subject, SubjectId::from("42"));
        assert_eq!(result.generation, 3);
        assert_eq!(result.layers.unwrap().len(), 2);
        assert_eq!(api.call_count(), 1);
        assert!(resyncer.drain().is_empty());
    }
}
