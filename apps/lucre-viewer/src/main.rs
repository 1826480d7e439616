//! Lucre Demo Viewer
//!
//! Renders a lit cube on a ground plane through the full frame graph: a
//! shadow-casting directional light, a point light, deferred lighting, bloom,
//! and post-processing.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p lucre-viewer -- [OPTIONS]
//! ```
//!
//! ## Options
//!
//! - `-c, --config <PATH>`: Renderer config file (default: `lucre.toml`)
//! - `--no-vsync`: Disable vsync
//! - `-h, --help`: Print help message
//!
//! ## Controls
//!
//! - `Space`: Pause or resume the animation
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level (e.g., info, debug, trace)

mod app;

use lucre_app::{run_app, AppConfig};

use crate::app::Viewer;

const WIDTH: u32 = 1280;
const HEIGHT: u32 = 720;
const DEFAULT_CONFIG: &str = "lucre.toml";

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();

    // Check for help flag before starting the app
    if args.iter().any(|arg| arg == "-h" || arg == "--help") {
        print_help();
        return Ok(());
    }

    let config_path = args
        .iter()
        .position(|arg| arg == "-c" || arg == "--config")
        .and_then(|i| args.get(i + 1))
        .map_or(DEFAULT_CONFIG, String::as_str);

    let mut config = AppConfig::new("Lucre - Demo Viewer")
        .with_size(WIDTH, HEIGHT)
        .with_renderer_config_file(config_path)?;
    if args.iter().any(|arg| arg == "--no-vsync") {
        config = config.with_vsync(false);
    }

    run_app::<Viewer>(config)
}

fn print_help() {
    eprintln!(
        "Lucre Demo Viewer

USAGE:
    cargo run -p lucre-viewer -- [OPTIONS]

OPTIONS:
    -c, --config <PATH>     Renderer config file (default: {DEFAULT_CONFIG})
    --no-vsync              Disable vsync
    -h, --help              Print this help message

CONTROLS:
    Space                   Pause or resume the animation

ENVIRONMENT VARIABLES:
    RUST_LOG                Set log level (e.g., info, debug, trace)"
    );
}
