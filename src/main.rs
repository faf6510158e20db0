use geosync::cli::Args;
use geosync::compositor::{ImageSource, MapView, OverlayPlacement};
use geosync::config::SyncConfig;
use geosync::core::{BoxedEvent, downcast_event};
use geosync::core::sync_events::*;
use geosync::entities::{ConnectionIndicator, SubjectId};
use geosync::net::ChannelPhase;
use geosync::paths::{self, PathConfig};
use geosync::progress::TerminalProgress;
use geosync::raster::RasterCache;
use geosync::server::{ApiCommand, ApiServer, SharedApiState};
use geosync::service::{SubjectCallbacks, SubjectOptions, VerificationService};

use anyhow::{Context, Result};
use clap::Parser;
use crossbeam_channel::{Sender, unbounded};
use log::{debug, info, warn};
use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Main loop period
const TICK: Duration = Duration::from_millis(16);

fn init_logging(args: &Args, path_config: &PathConfig) -> Result<()> {
    // 0 (default) = warn, 1 (-v) = info, 2 (-vv) = debug, 3+ (-vvv) = trace
    let log_level = match args.verbosity {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    if let Some(log_path_opt) = &args.log_file {
        let log_path = log_path_opt
            .as_ref()
            .cloned()
            .unwrap_or_else(|| paths::data_file(paths::LOG_FILE, path_config));
        let file = std::fs::File::create(&log_path)
            .with_context(|| format!("Failed to create log file {}", log_path.display()))?;

        env_logger::Builder::new()
            .filter_level(log_level)
            .filter_module("rustls", log::LevelFilter::Info)
            .filter_module("tungstenite", log::LevelFilter::Info)
            .format_timestamp_millis()
            .target(env_logger::Target::Pipe(Box::new(file)))
            .init();

        info!("Logging to file: {} (level: {:?})", log_path.display(), log_level);
    } else {
        // Respects RUST_LOG if set
        let default_level = match args.verbosity {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        };
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
            .filter_module("rustls", log::LevelFilter::Info)
            .format_timestamp_millis()
            .init();
    }
    Ok(())
}

fn load_config(args: &Args, path_config: &PathConfig) -> Result<SyncConfig> {
    let path = paths::config_file(paths::CONFIG_FILE, path_config);
    let mut config = if path.exists() {
        info!("Config: {}", path.display());
        SyncConfig::load(&path)?
    } else {
        debug!("No config at {}, using defaults", path.display());
        SyncConfig::default()
    };

    if let Some(url) = &args.ws_url {
        config.ws_base_url = url.clone();
    }
    if let Some(url) = &args.api_url {
        config.api_base_url = url.clone();
    }
    if let Some(token) = &args.token {
        config.token = Some(token.clone());
    }
    Ok(config)
}

/// Work for the raster worker.
#[derive(Debug)]
enum Prefetch {
    Overlay { layer_id: String, source: ImageSource },
    /// World tile (z0) of the view's tile layer
    BaseMap(MapView),
}

/// Background worker decoding overlay images and base tiles into the raster cache.
fn spawn_prefetcher(cache: Arc<RasterCache>, progress: TerminalProgress) -> Result<Sender<Prefetch>> {
    let (tx, rx) = unbounded::<Prefetch>();
    thread::Builder::new()
        .name("geosync-prefetch".into())
        .spawn(move || {
            for job in rx {
                match job {
                    Prefetch::Overlay { layer_id, source } => match cache.fetch(&source) {
                        Ok(image) => {
                            let (w, h) = image.dimensions();
                            debug!("Layer {} raster ready: {}x{}", layer_id, w, h);
                        }
                        Err(e) => progress.println(format!("  ! layer {} image unavailable: {}", layer_id, e)),
                    },
                    Prefetch::BaseMap(view) => {
                        let url = view.base_map().tile_url(0, 0, 0);
                        match cache.fetch_tile(&view, &url) {
                            Ok(_) => debug!("Base tile ready: {}", view.tile_layer_id()),
                            Err(e) => warn!("Base tile {} unavailable: {}", url, e),
                        }
                        // Jobs run in order, so the last switch wins
                        cache.retain_tiles_for(&view);
                    }
                }
            }
            debug!("Prefetch worker stopped ({:?})", cache.stats());
        })
        .context("Failed to spawn prefetch worker")?;
    Ok(tx)
}

fn queue(prefetch: &Sender<Prefetch>, job: Prefetch) {
    if let Err(e) = prefetch.send(job) {
        warn!("Prefetch worker gone, dropping {:?}", e.into_inner());
    }
}

/// Overlay jobs for images not queued yet. A layer whose image URL changed
/// is fetched again.
fn unseen_images(seen: &mut HashSet<(String, String)>, placements: Vec<OverlayPlacement>) -> Vec<Prefetch> {
    placements
        .into_iter()
        .filter(|p| seen.insert((p.layer_id.clone(), p.image.url().to_string())))
        .map(|p| Prefetch::Overlay { layer_id: p.layer_id, source: p.image })
        .collect()
}

/// Outcome of the resync that follows completion, if `event` is one.
fn final_layer_count(event: &BoxedEvent) -> Option<Result<usize>> {
    if let Some(e) = downcast_event::<ResyncCompletedEvent>(event) {
        Some(Ok(e.layer_count))
    } else {
        downcast_event::<ResyncFailedEvent>(event).map(|e| {
            Err(anyhow::anyhow!("final layer list for subject {} unavailable: {}", e.subject, e.error))
        })
    }
}

fn subject_callbacks(progress: &TerminalProgress) -> SubjectCallbacks {
    let on_progress = progress.clone();
    let on_layer = progress.clone();
    let on_complete = progress.clone();
    let on_error = progress.clone();

    SubjectCallbacks::default()
        .on_progress(move |_, view| on_progress.update(view))
        .on_layer(move |_, layer| {
            let renderable = if layer.is_renderable() { "" } else { " (no bounds)" };
            on_layer.println(format!("+ {} [{}]{}", layer.name(), layer.id, renderable));
        })
        .on_complete(move |subject, result| {
            on_complete.finish(format!("Verification of {} complete", subject));
            on_complete.println(format!("= {}", result));
        })
        .on_error(move |subject, err| on_error.println(format!("! {}: {}", subject, err)))
}

fn main() -> Result<()> {
    let args = Args::parse();

    let path_config = PathConfig::from_env_and_cli(args.config_dir.clone());
    if let Err(e) = paths::ensure_dirs(&path_config) {
        eprintln!("Warning: Failed to create application directories: {}", e);
    }
    init_logging(&args, &path_config)?;

    info!("geosync {} starting", env!("CARGO_PKG_VERSION"));
    debug!("Command-line args: {:?}", args);

    let config = load_config(&args, &path_config)?;
    let subject = SubjectId::new(args.subject.clone());
    let progress = TerminalProgress::new();

    let raster = Arc::new(RasterCache::new(&config)?);
    let prefetch = spawn_prefetcher(Arc::clone(&raster), progress.clone())?;
    let mut view = MapView::new(args.base_map);
    queue(&prefetch, Prefetch::BaseMap(view.clone()));

    let mut service = VerificationService::connect(config)?;
    service.mount(
        subject.clone(),
        SubjectOptions {
            enabled: true,
            callbacks: subject_callbacks(&progress),
            speed: args.speed,
            loop_enabled: !args.no_loop,
        },
    )?;

    let api_state = Arc::new(SharedApiState::default());
    let api = match args.api_port {
        Some(port) => Some(ApiServer::start(&format!("0.0.0.0:{}", port), Arc::clone(&api_state))?),
        None => None,
    };

    let mut started = false;
    let mut completed = false;
    // (layer id, image url): a resync can swap a layer's thumbnail
    let mut prefetched: HashSet<(String, String)> = HashSet::new();

    loop {
        let now = Instant::now();
        service.tick(now);

        for event in service.event_bus().poll() {
            if let Some(e) = downcast_event::<ConnectionChangedEvent>(&event) {
                debug!("Connection {}: {:?}", e.subject, e.indicator);
                if e.indicator == ConnectionIndicator::Connected && args.start && !started {
                    started = service.start_verification(&e.subject);
                    if started {
                        progress.println(format!("> start_verification sent for {}", e.subject));
                    }
                }
            } else if let Some(e) = downcast_event::<LayerCompletedEvent>(&event) {
                if args.autoplay && e.is_new {
                    service.play(&e.subject, now);
                }
            } else if let Some(e) = downcast_event::<LayerSelectedEvent>(&event) {
                if let Some(layer) = service.selected_layer(&e.subject) {
                    debug!("Showing {} ({}/{})", layer.name(), e.index + 1, service.state(&e.subject).map_or(0, |s| s.layer_count()));
                }
            } else if downcast_event::<VerificationCompleteEvent>(&event).is_some() {
                completed = true;
            } else if let Some(e) = downcast_event::<ResyncCompletedEvent>(&event) {
                info!("Resync for {}: {} layer(s)", e.subject, e.layer_count);
            }

            if args.exit_on_complete && completed {
                match final_layer_count(&event) {
                    Some(Ok(count)) => {
                        progress.println(format!("{} layer(s) final", count));
                        return Ok(());
                    }
                    Some(Err(e)) => {
                        progress.clear();
                        return Err(e);
                    }
                    None => {}
                }
            }
        }

        // Queue images for overlays that became visible
        for job in unseen_images(&mut prefetched, service.placements(&subject)) {
            queue(&prefetch, job);
        }

        if let Some(api) = &api {
            for command in api.drain() {
                match command {
                    ApiCommand::SetBaseMap(mode) => {
                        if view.set_base_map(mode) {
                            raster.retain_tiles_for(&view);
                            queue(&prefetch, Prefetch::BaseMap(view.clone()));
                            progress.println(format!("Base map: {} ({})", mode, mode.attribution()));
                        }
                    }
                    command => {
                        if !command.clone().execute(&mut service, now) {
                            debug!("API command had no effect: {:?}", command);
                        }
                    }
                }
            }
            api_state.update(&service, view.base_map());
        }

        if service.channel_phase(&subject) == Some(ChannelPhase::Exhausted) && api.is_none() {
            warn!("Giving up on subject {}", subject);
            progress.clear();
            anyhow::bail!("connection to subject {} lost: reconnect attempts exhausted", subject);
        }

        thread::sleep(TICK);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geosync::entities::{BlendMode, GeoBounds};
    use geosync::error::SyncError;
    use url::Url;

    fn placement(layer_id: &str, url: &str) -> OverlayPlacement {
        OverlayPlacement {
            layer_id: layer_id.to_string(),
            name: layer_id.to_string(),
            bounds: GeoBounds { north: 1.0, south: 0.0, east: 1.0, west: 0.0 },
            image: ImageSource::Thumbnail(Url::parse(url).unwrap()),
            opacity: 0.7,
            blend_mode: BlendMode::default(),
            z_index: 0,
        }
    }

    #[test]
    fn test_unseen_images_keyed_by_layer_and_url() {
        let mut seen = HashSet::new();
        let first = unseen_images(&mut seen, vec![placement("7", "http://x.test/a.png"), placement("8", "http://x.test/b.png")]);
        assert_eq!(first.len(), 2);
        assert!(unseen_images(&mut seen, vec![placement("7", "http://x.test/a.png")]).is_empty());

        // Resync swapped the thumbnail
        let again = unseen_images(&mut seen, vec![placement("7", "http://x.test/a2.png")]);
        assert!(matches!(
            again.as_slice(),
            [Prefetch::Overlay { layer_id, source }] if layer_id == "7" && source.url().path() == "/a2.png"
        ));
    }

    #[test]
    fn test_queue_survives_dead_worker() {
        let (tx, rx) = unbounded::<Prefetch>();
        drop(rx);
        queue(&tx, Prefetch::BaseMap(MapView::default()));
    }

    #[test]
    fn test_final_layer_count() {
        let subject = SubjectId::from("42");
        let done: BoxedEvent = Box::new(ResyncCompletedEvent { subject: subject.clone(), layer_count: 3 });
        assert_eq!(final_layer_count(&done).unwrap().unwrap(), 3);

        let failed: BoxedEvent = Box::new(ResyncFailedEvent {
            subject: subject.clone(),
            error: SyncError::Http("HTTP 502".into()),
        });
        let err = final_layer_count(&failed).unwrap().unwrap_err();
        assert!(err.to_string().contains("HTTP 502"));

        let other: BoxedEvent = Box::new(ProgressChangedEvent(subject));
        assert!(final_layer_count(&other).is_none());
    }
}
