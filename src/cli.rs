use clap::Parser;
use std::path::PathBuf;

use crate::compositor::BaseMapMode;
use crate::playback::PlaybackSpeed;

// Build version with transport info
const VERSION_INFO: &str = const_format::concatcp!(
    env!("CARGO_PKG_VERSION"), "\n",
    "Socket: tungstenite 0.24 (rustls)\n",
    "HTTP:   reqwest 0.12 (blocking)\n",
    "Target: ", std::env::consts::ARCH, "-", std::env::consts::OS
);

/// Watch a geospatial verification job: live layers, progress and playback
#[derive(Parser, Debug)]
#[command(author, version = VERSION_INFO, about, long_about = None)]
pub struct Args {
    /// Subject (asset) id to watch
    #[arg(value_name = "SUBJECT_ID")]
    pub subject: String,

    /// WebSocket base URL (overrides config file)
    #[arg(long = "ws-url", value_name = "URL", env = "GEOSYNC_WS_URL")]
    pub ws_url: Option<String>,

    /// REST API base URL (overrides config file)
    #[arg(long = "api-url", value_name = "URL", env = "GEOSYNC_API_URL")]
    pub api_url: Option<String>,

    /// Bearer token, also sent as `token` query parameter on the socket
    #[arg(long = "token", value_name = "TOKEN", env = "GEOSYNC_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Send start_verification once the channel is open
    #[arg(short = 's', long = "start")]
    pub start: bool,

    /// Auto-play layers as they arrive
    #[arg(short = 'a', long = "autoplay")]
    pub autoplay: bool,

    /// Playback speed: slow, normal, fast
    #[arg(long = "speed", value_name = "SPEED", default_value = "normal")]
    pub speed: PlaybackSpeed,

    /// Stop at the last layer instead of wrapping around
    #[arg(long = "no-loop")]
    pub no_loop: bool,

    /// Base map under the overlays: satellite, street
    #[arg(long = "base-map", value_name = "MODE", default_value = "satellite")]
    pub base_map: BaseMapMode,

    /// Serve the control API on this port (disabled when absent)
    #[arg(long = "api-port", value_name = "PORT", env = "GEOSYNC_API_PORT")]
    pub api_port: Option<u16>,

    /// Exit once verification completes and layers are resynced
    #[arg(short = 'x', long = "exit-on-complete")]
    pub exit_on_complete: bool,

    /// Enable debug logging to file (default: geosync.log)
    #[arg(short = 'l', long = "log", value_name = "LOG_FILE")]
    pub log_file: Option<Option<PathBuf>>,

    /// Increase logging verbosity (default: warn, -v: info, -vv: debug, -vvv+: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbosity: u8,

    /// Custom configuration directory (overrides default platform paths)
    #[arg(short = 'c', long = "config-dir", value_name = "DIR")]
    pub config_dir: Option<PathBuf>,
}
