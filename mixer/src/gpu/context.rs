/// GPU context management - handles wgpu device/queue and the window surface
use anyhow::{Context, Result};
use std::sync::Arc;
use winit::window::Window;

use crate::error::RenderError;

/// GPU context containing device, queue, adapter info and the presentation
/// surface
pub struct GpuContext {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub adapter_info: wgpu::AdapterInfo,
    pub limits: wgpu::Limits,
    /// Device opened with the extensions for binding DMA-BUFs to textures
    pub dmabuf_import: bool,
    surface: wgpu::Surface<'static>,
    config: wgpu::SurfaceConfiguration,
}

impl GpuContext {
    /// Create a context presenting to `window`.
    ///
    /// On Linux this will typically use Vulkan.
    pub async fn new(window: Arc<Window>) -> Result<Self> {
        log::info!("Initializing GPU context...");

        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let size = window.inner_size();
        let surface = instance
            .create_surface(window)
            .context("Failed to create window surface")?;

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: Some(&surface),
                force_fallback_adapter: false,
            })
            .await
            .context("Failed to find suitable GPU adapter")?;

        let adapter_info = adapter.get_info();
        log::info!(
            "Selected GPU adapter: {} ({:?})",
            adapter_info.name,
            adapter_info.backend
        );

        let descriptor = wgpu::DeviceDescriptor {
            label: Some("vmix device"),
            required_features: wgpu::Features::empty(),
            required_limits: adapter.limits(),
            ..Default::default()
        };
        let (device, queue, dmabuf_import) =
            match super::dmabuf::request_device(&adapter, &descriptor) {
                Some((device, queue)) => (device, queue, true),
                None => {
                    let (device, queue) = adapter
                        .request_device(&descriptor)
                        .await
                        .context("Failed to create GPU device")?;
                    (device, queue, false)
                }
            };

        let limits = device.limits();

        let capabilities = surface.get_capabilities(&adapter);
        // Video values are written as-is, so avoid an sRGB encode on store
        let format = capabilities
            .formats
            .iter()
            .copied()
            .find(|f| !f.is_srgb())
            .or_else(|| capabilities.formats.first().copied())
            .context("Surface reports no formats")?;
        let alpha_mode = capabilities
            .alpha_modes
            .first()
            .copied()
            .unwrap_or(wgpu::CompositeAlphaMode::Auto);

        let config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format,
            width: size.width.max(1),
            height: size.height.max(1),
            present_mode: wgpu::PresentMode::Fifo,
            desired_maximum_frame_latency: 2,
            alpha_mode,
            view_formats: vec![],
        };
        surface.configure(&device, &config);

        log::info!("GPU context initialized successfully");
        log::info!("  Backend: {:?}", adapter_info.backend);
        log::info!("  Surface: {}x{} {:?}", config.width, config.height, format);
        log::info!(
            "  Max Texture Size: {}x{}",
            limits.max_texture_dimension_2d,
            limits.max_texture_dimension_2d
        );

        Ok(Self {
            device,
            queue,
            adapter_info,
            limits,
            dmabuf_import,
            surface,
            config,
        })
    }

    pub fn resize(&mut self, width: u32, height: u32) {
        if width == 0 || height == 0 {
            return;
        }
        self.config.width = width;
        self.config.height = height;
        self.surface.configure(&self.device, &self.config);
        log::debug!("Surface resized to {}x{}", width, height);
    }

    pub fn surface_format(&self) -> wgpu::TextureFormat {
        self.config.format
    }

    pub fn size(&self) -> (u32, u32) {
        (self.config.width, self.config.height)
    }

    /// Next texture to draw into, reconfiguring once if the surface went
    /// stale
    pub fn acquire(&mut self) -> Result<wgpu::SurfaceTexture, RenderError> {
        match self.surface.get_current_texture() {
            Ok(frame) => Ok(frame),
            Err(wgpu::SurfaceError::Lost | wgpu::SurfaceError::Outdated) => {
                log::debug!("Surface lost or outdated, reconfiguring");
                self.surface.configure(&self.device, &self.config);
                self.surface
                    .get_current_texture()
                    .map_err(|e| RenderError::Backend(e.to_string()))
            }
            Err(e) => Err(RenderError::Backend(e.to_string())),
        }
    }
}

impl std::fmt::Debug for GpuContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuContext")
            .field("adapter", &self.adapter_info.name)
            .field("backend", &self.adapter_info.backend)
            .field("format", &self.config.format)
            .finish()
    }
}
