//! Application runner and event loop.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use glam::Vec3;
use prism_core::constants::{DEFAULT_HEIGHT, DEFAULT_WIDTH};
use prism_core::InstanceTransform;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::{Event, WindowEvent};
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::window::{Window, WindowId};

use crate::gui::ImguiOverlay;
use crate::overlay::{NoOverlay, Overlay};
use crate::renderer::{Renderer, RendererConfig};

/// Default location of the compiled shader stages.
pub const DEFAULT_SHADER_DIR: &str = "shaders/spv";

/// Application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Window title.
    pub title: String,
    /// Window width; the window is not resizable.
    pub width: u32,
    /// Window height.
    pub height: u32,
    /// Enable Vulkan validation layers (default: debug builds only).
    pub validation: bool,
    /// Directory holding the compiled ray tracing stages.
    pub shader_dir: PathBuf,
    /// Translation of the triangle instance.
    pub translation: Vec3,
    /// Draw the imgui overlay window.
    pub overlay: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            title: "Prism".to_string(),
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            validation: cfg!(debug_assertions),
            shader_dir: PathBuf::from(DEFAULT_SHADER_DIR),
            translation: Vec3::ZERO,
            overlay: true,
        }
    }
}

impl AppConfig {
    /// Create a new config with the given title.
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }

    /// Set the window dimensions.
    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Enable or disable validation layers.
    pub fn with_validation(mut self, validation: bool) -> Self {
        self.validation = validation;
        self
    }

    /// Set the shader directory.
    pub fn with_shader_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.shader_dir = dir.into();
        self
    }

    /// Move the triangle instance.
    pub fn with_translation(mut self, translation: Vec3) -> Self {
        self.translation = translation;
        self
    }

    /// Enable or disable the imgui overlay.
    pub fn with_overlay(mut self, overlay: bool) -> Self {
        self.overlay = overlay;
        self
    }

    /// The overlay `run_app` draws with this config.
    pub fn make_overlay(&self) -> Box<dyn Overlay> {
        if self.overlay {
            Box::new(ImguiOverlay::new(self.shader_dir.clone()))
        } else {
            Box::new(NoOverlay)
        }
    }

    /// Check the config before anything is created.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.width == 0 || self.height == 0 {
            anyhow::bail!("window size must be non-zero, got {}x{}", self.width, self.height);
        }
        if !self.translation.is_finite() {
            anyhow::bail!("instance translation must be finite, got {}", self.translation);
        }
        Ok(())
    }

    /// Renderer settings derived from this config.
    pub fn renderer_config(&self) -> RendererConfig {
        RendererConfig {
            app_name: self.title.clone(),
            width: self.width,
            height: self.height,
            validation: self.validation,
            shader_dir: self.shader_dir.clone(),
            transform: InstanceTransform::from_translation(self.translation),
        }
    }
}

/// Initialize the global `tracing` subscriber. `RUST_LOG` overrides the `info` default.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init();
}

/// Run the viewer with the overlay picked by `config`.
pub fn run_app(config: AppConfig) -> anyhow::Result<()> {
    let overlay = config.make_overlay();
    run_app_with_overlay(config, overlay)
}

/// Run the viewer, drawing `overlay` over every frame.
///
/// Initializes logging, opens the window, builds the renderer and renders
/// until the window closes or a frame fails. Any failure is returned.
pub fn run_app_with_overlay(config: AppConfig, overlay: Box<dyn Overlay>) -> anyhow::Result<()> {
    init_logging();
    config.validate()?;

    info!("{} starting...", config.title);

    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut runner = AppRunner {
        config,
        overlay: Some(overlay),
        state: None,
        error: None,
    };

    event_loop.run_app(&mut runner)?;

    match runner.error.take() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Internal application runner that implements winit's ApplicationHandler.
struct AppRunner {
    config: AppConfig,
    overlay: Option<Box<dyn Overlay>>,
    state: Option<AppState>,
    error: Option<anyhow::Error>,
}

/// Internal application state.
struct AppState {
    // Dropped before the window the surface was created from.
    renderer: Renderer,
    window: Arc<Window>,
    started: Instant,
}

impl ApplicationHandler for AppRunner {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.state.is_some() || self.error.is_some() {
            return;
        }

        info!("Creating renderer...");

        match self.create_state(event_loop) {
            Ok(state) => {
                self.state = Some(state);
                info!("Renderer ready");
            }
            Err(e) => self.fail(event_loop, e.context("failed to initialize renderer")),
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, id: WindowId, event: WindowEvent) {
        if let Some(state) = &mut self.state {
            let wrapped = Event::WindowEvent {
                window_id: id,
                event: event.clone(),
            };
            state
                .renderer
                .overlay_mut()
                .handle_event(&state.window, &wrapped);
        }

        match event {
            WindowEvent::CloseRequested => {
                info!("Close requested");
                if let Some(state) = self.state.take() {
                    state.cleanup();
                }
                event_loop.exit();
            }
            WindowEvent::RedrawRequested => {
                let Some(state) = &mut self.state else {
                    return;
                };
                if let Err(e) = state.renderer.render_frame(&state.window) {
                    self.fail(event_loop, anyhow::Error::new(e).context("frame failed"));
                }
            }
            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(state) = &self.state {
            state.window.request_redraw();
        }
    }
}

impl AppRunner {
    fn create_state(&mut self, event_loop: &ActiveEventLoop) -> anyhow::Result<AppState> {
        let window_attrs = Window::default_attributes()
            .with_title(&self.config.title)
            .with_inner_size(PhysicalSize::new(self.config.width, self.config.height))
            .with_resizable(false);

        let window = Arc::new(event_loop.create_window(window_attrs)?);

        let mut overlay = self.overlay.take().unwrap_or_else(|| Box::new(NoOverlay));
        overlay.attach(&window);
        let renderer = Renderer::new(window.as_ref(), &self.config.renderer_config(), overlay)?;

        Ok(AppState {
            renderer,
            window,
            started: Instant::now(),
        })
    }

    /// Log a fatal error, tear down and stop the event loop.
    fn fail(&mut self, event_loop: &ActiveEventLoop, e: anyhow::Error) {
        error!("{e:#}");
        if let Some(state) = self.state.take() {
            state.cleanup();
        }
        self.error = Some(e);
        event_loop.exit();
    }
}

impl AppState {
    fn cleanup(self) {
        let frames = self.renderer.frames_presented();
        let elapsed = self.started.elapsed().as_secs_f64();
        if frames > 0 && elapsed > 0.0 {
            info!(
                "Presented {} frames in {:.1}s ({:.1} fps)",
                frames,
                elapsed,
                frames as f64 / elapsed
            );
        }

        info!("Starting cleanup...");
        drop(self.renderer);
        drop(self.window);
        info!("Cleanup complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = AppConfig::default();
        assert_eq!(config.width, 800);
        assert_eq!(config.height, 600);
        assert_eq!(config.shader_dir, PathBuf::from("shaders/spv"));
        assert_eq!(config.translation, Vec3::ZERO);
        assert!(config.overlay);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn builder_overrides() {
        let config = AppConfig::new("test")
            .with_size(1024, 768)
            .with_validation(true)
            .with_shader_dir("/tmp/spv")
            .with_translation(Vec3::new(0.0, 0.0, -2.0))
            .with_overlay(false);

        assert_eq!(config.title, "test");
        assert!(!config.overlay);
        assert_eq!((config.width, config.height), (1024, 768));
        assert!(config.validation);

        let renderer = config.renderer_config();
        assert_eq!(renderer.app_name, "test");
        assert_eq!(renderer.shader_dir, PathBuf::from("/tmp/spv"));
        assert_eq!(
            renderer.transform,
            InstanceTransform::from_translation(Vec3::new(0.0, 0.0, -2.0))
        );
    }

    #[test]
    fn rejects_bad_config() {
        assert!(AppConfig::default().with_size(0, 600).validate().is_err());
        assert!(AppConfig::default()
            .with_translation(Vec3::new(f32::NAN, 0.0, 0.0))
            .validate()
            .is_err());
    }
}
