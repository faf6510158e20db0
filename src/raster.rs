//! Raster cache - fetched and decoded overlay images / base map tiles.
//!
//! Key format: (scope, url) -> RGBA image. Overlay images live in the
//! `overlay` scope; tiles live in the scope of the tile layer that requested
//! them (`MapView::tile_layer_id`), so a base-map switch never serves a tile
//! of the previous mode. Old tile scopes are purged on switch.
//!
//! Thread-safe: the cache can be shared with fetch workers.

use std::io::Cursor;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use image::{ImageReader, RgbaImage};
use log::{debug, trace};
use lru::LruCache;
use reqwest::blocking::Client;

use crate::compositor::{ImageSource, MapView};
use crate::config::SyncConfig;
use crate::error::SyncError;

/// Scope for overlay images
pub const OVERLAY_SCOPE: &str = "overlay";

type RasterKey = (String, String);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RasterStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
    /// Decoded bytes held
    pub bytes: usize,
}

pub struct RasterCache {
    client: Client,
    token: Option<String>,
    cache: Mutex<LruCache<RasterKey, Arc<RgbaImage>>>,
    stats: Mutex<RasterStats>,
}

impl std::fmt::Debug for RasterCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RasterCache").field("stats", &self.stats()).finish()
    }
}

impl RasterCache {
    pub fn new(config: &SyncConfig) -> Result<Self, SyncError> {
        let capacity = NonZeroUsize::new(config.raster_cache_size).unwrap_or(NonZeroUsize::MIN);
        let client = Client::builder().timeout(config.http_timeout()).build()?;
        debug!("RasterCache created: capacity={}", capacity);
        Ok(Self {
            client,
            token: config.token.clone().filter(|t| !t.is_empty()),
            cache: Mutex::new(LruCache::new(capacity)),
            stats: Mutex::new(RasterStats::default()),
        })
    }

    /// Image for an overlay placement.
    pub fn fetch(&self, source: &ImageSource) -> Result<Arc<RgbaImage>, SyncError> {
        self.fetch_scoped(OVERLAY_SCOPE, source.url().as_str())
    }

    /// Base map tile at `url`, cached under the view's current tile layer.
    pub fn fetch_tile(&self, view: &MapView, url: &str) -> Result<Arc<RgbaImage>, SyncError> {
        self.fetch_scoped(&view.tile_layer_id(), url)
    }

    /// Drop every tile scope except the view's current one.
    pub fn retain_tiles_for(&self, view: &MapView) {
        let keep = view.tile_layer_id();
        let removed = self.remove_where(|scope| scope != OVERLAY_SCOPE && scope != keep);
        if removed > 0 {
            debug!("RasterCache: purged {} stale tiles (now {})", removed, keep);
        }
    }

    pub fn contains(&self, scope: &str, url: &str) -> bool {
        let key = (scope.to_string(), url.to_string());
        self.lock_cache().peek(&key).is_some()
    }

    pub fn clear(&self) {
        self.lock_cache().clear();
        let mut stats = self.lock_stats();
        stats.entries = 0;
        stats.bytes = 0;
    }

    pub fn stats(&self) -> RasterStats {
        *self.lock_stats()
    }

    fn fetch_scoped(&self, scope: &str, url: &str) -> Result<Arc<RgbaImage>, SyncError> {
        let key = (scope.to_string(), url.to_string());
        if let Some(image) = self.lock_cache().get(&key).cloned() {
            trace!("RasterCache hit: {}", url);
            self.lock_stats().hits += 1;
            return Ok(image);
        }
        self.lock_stats().misses += 1;

        debug!("GET {}", url);
        let mut request = self.client.get(url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let bytes = request.send()?.error_for_status()?.bytes()?;
        let image = Arc::new(decode(&bytes)?);
        self.insert(key, Arc::clone(&image));
        Ok(image)
    }

    fn insert(&self, key: RasterKey, image: Arc<RgbaImage>) {
        let size = image.as_raw().len();
        let evicted = self.lock_cache().push(key.clone(), image);
        let mut stats = self.lock_stats();
        stats.bytes += size;
        match evicted {
            // Same key replaced or LRU entry pushed out
            Some((_, old)) => stats.bytes = stats.bytes.saturating_sub(old.as_raw().len()),
            None => stats.entries += 1,
        }
        trace!("Cached raster {}:{} ({} bytes)", key.0, key.1, size);
    }

    fn remove_where(&self, drop_scope: impl Fn(&str) -> bool) -> usize {
        let mut cache = self.lock_cache();
        let to_remove: Vec<RasterKey> = cache
            .iter()
            .filter(|((scope, _), _)| drop_scope(scope))
            .map(|(key, _)| key.clone())
            .collect();

        let mut freed = 0;
        for key in &to_remove {
            if let Some(image) = cache.pop(key) {
                freed += image.as_raw().len();
            }
        }
        let mut stats = self.lock_stats();
        stats.entries = cache.len();
        stats.bytes = stats.bytes.saturating_sub(freed);
        to_remove.len()
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, LruCache<RasterKey, Arc<RgbaImage>>> {
        self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_stats(&self) -> std::sync::MutexGuard<'_, RasterStats> {
        self.stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Decode PNG / JPEG / TIFF bytes into RGBA8.
pub fn decode(bytes: &[u8]) -> Result<RgbaImage, SyncError> {
    let reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| SyncError::Http(format!("unreadable image: {}", e)))?;
    let image = reader
        .decode()
        .map_err(|e| SyncError::Http(format!("image decode failed: {}", e)))?;
    Ok(image.to_rgba8())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compositor::BaseMapMode;
    use image::{ImageFormat, Rgba};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use url::Url;

    fn png_bytes() -> Vec<u8> {
        let image = RgbaImage::from_pixel(2, 3, Rgba([10, 200, 30, 255]));
        let mut buf = Vec::new();
        image.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png).unwrap();
        buf
    }

    #[test]
    fn test_decode_png() {
        let image = decode(&png_bytes()).unwrap();
        assert_eq!(image.dimensions(), (2, 3));
        assert_eq!(image.get_pixel(1, 2), &Rgba([10, 200, 30, 255]));
        assert!(decode(b"not an image").is_err());
    }

    #[test]
    fn test_fetch_caches_by_url() {
        let hits = Arc::new(AtomicUsize::new(0));
        let body = png_bytes();
        let server = rouille::Server::new("127.0.0.1:0", {
            let hits = Arc::clone(&hits);
            move |request| {
                hits.fetch_add(1, Ordering::SeqCst);
                if request.url().ends_with("/raster") {
                    rouille::Response::from_data("image/png", body.clone())
                } else {
                    rouille::Response::empty_404()
                }
            }
        })
        .unwrap();
        let addr = server.server_addr();
        let (handle, stop) = server.stoppable();

        let cache = RasterCache::new(&SyncConfig::default()).unwrap();
        let url = Url::parse(&format!("http://{}/api/v1/verification/42/layers/7/raster", addr)).unwrap();
        let source = ImageSource::Raster(url.clone());

        let first = cache.fetch(&source).unwrap();
        let second = cache.fetch(&source).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(cache.contains(OVERLAY_SCOPE, url.as_str()));

        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.entries), (1, 1, 1));
        assert_eq!(stats.bytes, 2 * 3 * 4);

        let missing = Url::parse(&format!("http://{}/nope.png", addr)).unwrap();
        assert!(cache.fetch(&ImageSource::Thumbnail(missing)).is_err());

        let _ = stop.send(());
        let _ = handle.join();
    }

    #[test]
    fn test_tile_scopes_purged_on_switch() {
        let cache = RasterCache::new(&SyncConfig::default()).unwrap();
        let mut view = MapView::default();
        let image = Arc::new(RgbaImage::new(1, 1));
        cache.insert((view.tile_layer_id(), "t1".into()), Arc::clone(&image));
        cache.insert((OVERLAY_SCOPE.into(), "o1".into()), Arc::clone(&image));

        view.set_base_map(BaseMapMode::Street);
        cache.insert((view.tile_layer_id(), "t2".into()), image);
        cache.retain_tiles_for(&view);

        assert!(!cache.contains("satellite-0", "t1"));
        assert!(cache.contains("street-1", "t2"));
        assert!(cache.contains(OVERLAY_SCOPE, "o1"));
        assert_eq!(cache.stats().entries, 2);
    }

    #[test]
    fn test_fetch_tile_scoped_to_view() {
        let body = png_bytes();
        let server = rouille::Server::new("127.0.0.1:0", move |_| {
            rouille::Response::from_data("image/png", body.clone())
        })
        .unwrap();
        let addr = server.server_addr();
        let (handle, stop) = server.stoppable();

        let cache = RasterCache::new(&SyncConfig::default()).unwrap();
        let mut view = MapView::default();
        let url = format!("http://{}/tiles/0/0/0.png", addr);

        let tile = cache.fetch_tile(&view, &url).unwrap();
        assert_eq!(tile.dimensions(), (2, 3));
        assert!(cache.contains("satellite-0", &url));
        assert!(!cache.contains(OVERLAY_SCOPE, &url));

        // Same URL after a switch is a miss in the new scope
        view.set_base_map(BaseMapMode::Street);
        cache.fetch_tile(&view, &url).unwrap();
        cache.retain_tiles_for(&view);
        assert!(cache.contains("street-1", &url));
        assert!(!cache.contains("satellite-0", &url));
        assert_eq!(cache.stats().misses, 2);

        let _ = stop.send(());
        let _ = handle.join();
    }

    #[test]
    fn test_capacity_evicts_lru() {
        let config = SyncConfig { raster_cache_size: 1, ..Default::default() };
        let cache = RasterCache::new(&config).unwrap();
        let image = Arc::new(RgbaImage::new(2, 2));
        cache.insert((OVERLAY_SCOPE.into(), "a".into()), Arc::clone(&image));
        cache.insert((OVERLAY_SCOPE.into(), "b".into()), image);
        assert!(!cache.contains(OVERLAY_SCOPE, "a"));
        let stats = cache.stats();
        assert_eq!((stats.entries, stats.bytes), (1, 16));
    }
}
