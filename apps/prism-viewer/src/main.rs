//! Prism viewer
//!
//! Opens a window and ray traces a single triangle into it every frame, with
//! a small imgui window drawn on top.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p prism-viewer -- [OPTIONS]
//! ```
//!
//! The compiled shader stages, including the overlay's `imgui.vert.spv` and
//! `imgui.frag.spv`, are read from `shaders/spv` unless
//! `--shader-dir` or `PRISM_SHADER_DIR` says otherwise.
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level (e.g., info, debug, trace)
//! - `PRISM_SHADER_DIR`: Directory holding the compiled `.spv` stages

mod args;

use std::path::PathBuf;

use prism_app::run_app;

use crate::args::{ViewerArgs, SHADER_DIR_ENV};

fn main() -> anyhow::Result<()> {
    let args = ViewerArgs::parse(std::env::args().skip(1))?;
    if args.help {
        print_help();
        return Ok(());
    }

    let env_shader_dir = std::env::var_os(SHADER_DIR_ENV).map(PathBuf::from);
    run_app(args.into_config(env_shader_dir))
}

fn print_help() {
    eprintln!(
        "Prism viewer: a ray traced triangle

USAGE:
    cargo run -p prism-viewer -- [OPTIONS]

OPTIONS:
    --width <N>             Window width in pixels (default: 800)
    --height <N>            Window height in pixels (default: 600)
    --shader-dir <DIR>      Directory with raygen.rgen.spv, miss.rmiss.spv,
                            closesthit.rchit.spv, imgui.vert.spv and
                            imgui.frag.spv (default: shaders/spv)
    --validation            Enable Vulkan validation layers
    --no-validation         Disable Vulkan validation layers
                            (default: enabled in debug builds)
    --no-overlay            Skip the imgui overlay window
    -h, --help              Print this help message

ENVIRONMENT VARIABLES:
    RUST_LOG                Set log level (e.g., info, debug, trace)
    PRISM_SHADER_DIR        Shader directory when --shader-dir is not given"
    );
}
