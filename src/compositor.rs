//! Overlay compositor - turns the overlay composition of a subject into
//! positioned image placements for an interactive map.
//!
//! Read-only over subject state. Per visible overlay:
//! 1. layer must exist (dangling overlays are skipped)
//! 2. bounds must be fully defined, else excluded and warned once
//! 3. image source: thumbnail if present, else the raster endpoint
//!
//! The base map is a single enum per [`MapView`]; switching it bumps the
//! tile layer key so cached tiles of one mode are never shown in the other.

use std::collections::HashSet;
use std::str::FromStr;

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::config::SyncConfig;
use crate::entities::{BlendMode, GeoBounds, Layer, SubjectId, SubjectState};
use crate::error::SyncError;

/// Base map tiles under the overlays.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BaseMapMode {
    #[default]
    Satellite,
    Street,
}

impl BaseMapMode {
    /// XYZ tile template with `{z}`, `{x}`, `{y}` placeholders
    pub fn tile_url_template(&self) -> &'static str {
        match self {
            BaseMapMode::Satellite => {
                "https://server.arcgisonline.com/ArcGIS/rest/services/World_Imagery/MapServer/tile/{z}/{y}/{x}"
            }
            BaseMapMode::Street => "https://tile.openstreetmap.org/{z}/{x}/{y}.png",
        }
    }

    pub fn attribution(&self) -> &'static str {
        match self {
            BaseMapMode::Satellite => "Tiles © Esri",
            BaseMapMode::Street => "© OpenStreetMap contributors",
        }
    }

    pub fn tile_url(&self, z: u32, x: u32, y: u32) -> String {
        self.tile_url_template()
            .replace("{z}", &z.to_string())
            .replace("{x}", &x.to_string())
            .replace("{y}", &y.to_string())
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BaseMapMode::Satellite => "satellite",
            BaseMapMode::Street => "street",
        }
    }
}

impl std::fmt::Display for BaseMapMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BaseMapMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "satellite" | "sat" => Ok(BaseMapMode::Satellite),
            "street" | "streets" | "osm" => Ok(BaseMapMode::Street),
            other => Err(format!("unknown base map '{}', expected satellite or street", other)),
        }
    }
}

/// Per-map view state.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct MapView {
    base_map: BaseMapMode,
    /// Bumped on every base-map switch; the tile layer remounts on change
    tile_layer_key: u64,
}

impl MapView {
    pub fn new(base_map: BaseMapMode) -> Self {
        Self { base_map, tile_layer_key: 0 }
    }

    pub fn base_map(&self) -> BaseMapMode {
        self.base_map
    }

    pub fn tile_layer_key(&self) -> u64 {
        self.tile_layer_key
    }

    /// Identity of the mounted tile layer, e.g. `street-2`.
    pub fn tile_layer_id(&self) -> String {
        format!("{}-{}", self.base_map, self.tile_layer_key)
    }

    /// Switch base map. Returns true if the tile layer must remount.
    pub fn set_base_map(&mut self, mode: BaseMapMode) -> bool {
        if self.base_map == mode {
            return false;
        }
        debug!("Base map {} -> {}", self.base_map, mode);
        self.base_map = mode;
        self.tile_layer_key += 1;
        true
    }
}

/// Where the overlay image comes from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "url", rename_all = "snake_case")]
pub enum ImageSource {
    Thumbnail(Url),
    Raster(Url),
}

impl ImageSource {
    pub fn url(&self) -> &Url {
        match self {
            ImageSource::Thumbnail(url) | ImageSource::Raster(url) => url,
        }
    }
}

/// One image positioned on the map.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct OverlayPlacement {
    pub layer_id: String,
    pub name: String,
    pub bounds: GeoBounds,
    pub image: ImageSource,
    pub opacity: f32,
    pub blend_mode: BlendMode,
    pub z_index: usize,
}

#[derive(Debug)]
pub struct OverlayCompositor {
    config: SyncConfig,
    /// (subject, layer) pairs already warned about
    warned: HashSet<(SubjectId, String)>,
}

impl OverlayCompositor {
    pub fn new(config: SyncConfig) -> Self {
        Self {
            config,
            warned: HashSet::new(),
        }
    }

    /// Placements for all renderable visible overlays, bottom to top.
    pub fn compose(&mut self, subject: &SubjectId, state: &SubjectState) -> Vec<OverlayPlacement> {
        let mut placements = Vec::new();
        for overlay in state.overlays.iter().filter(|o| o.visible) {
            let Some(layer) = state.layer(&overlay.layer_id) else {
                debug!("Overlay {} has no layer, skipped", overlay.layer_id);
                continue;
            };
            let bounds = match layer.bounds().validate() {
                Ok(bounds) => bounds,
                Err(reason) => {
                    self.warn_once(subject, SyncError::Render { layer_id: layer.id.clone(), reason });
                    continue;
                }
            };
            let image = match self.image_source(subject, layer) {
                Ok(image) => image,
                Err(err) => {
                    self.warn_once(subject, err);
                    continue;
                }
            };
            if !self.warned.is_empty() {
                // Renders again: a later regression warns anew
                self.warned.remove(&(subject.clone(), layer.id.clone()));
            }
            placements.push(OverlayPlacement {
                layer_id: layer.id.clone(),
                name: layer.name(),
                bounds,
                image,
                opacity: overlay.opacity,
                blend_mode: overlay.blend_mode,
                z_index: overlay.z_index,
            });
        }
        placements.sort_by_key(|p| p.z_index);
        placements
    }

    /// Thumbnail first, raster endpoint as fallback.
    pub fn image_source(&self, subject: &SubjectId, layer: &Layer) -> Result<ImageSource, SyncError> {
        if let Some(thumb) = layer.thumbnail_url.as_deref() {
            match self.config.resolve(thumb) {
                Ok(url) => return Ok(ImageSource::Thumbnail(url)),
                Err(e) => debug!("Layer {} thumbnail unusable ({}), using raster", layer.id, e),
            }
        }
        self.config
            .raster_url(subject, &layer.id)
            .map(ImageSource::Raster)
            .map_err(|e| SyncError::Render {
                layer_id: layer.id.clone(),
                reason: e.to_string(),
            })
    }

    /// Forget warnings for a subject (unmount).
    pub fn forget(&mut self, subject: &SubjectId) {
        self.warned.retain(|(s, _)| s != subject);
    }

    fn warn_once(&mut self, subject: &SubjectId, err: SyncError) {
        let layer_id = match &err {
            SyncError::Render { layer_id, .. } => layer_id.clone(),
            other => other.to_string(),
        };
        if self.warned.insert((subject.clone(), layer_id)) {
            warn!("Subject {}: {}", subject, err);
        }
    }
}

/// Extent covering every placement, for auto-fit.
pub fn fit_bounds(placements: &[OverlayPlacement]) -> Option<GeoBounds> {
    placements
        .iter()
        .map(|p| p.bounds)
        .reduce(|acc, b| acc.union(&b))
}
