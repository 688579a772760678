//! What the GPU context can import, decided once at startup

use crate::error::ImportError;
use crate::media::{DecodedFrame, PixelFormat};

#[derive(Debug, Clone, PartialEq)]
pub struct ImportCapabilities {
    /// Largest texture edge the device accepts
    pub max_texture_dimension: u32,
    /// Whether DMA-BUF planes are accepted at all
    pub dmabuf_mapping: bool,
    /// Whether DMA-BUF planes are bound to textures without a copy.
    /// Without it they are read back through a CPU mapping.
    pub dmabuf_import: bool,
    pub formats: Vec<PixelFormat>,
}

impl Default for ImportCapabilities {
    fn default() -> Self {
        Self {
            max_texture_dimension: 8192,
            dmabuf_mapping: true,
            dmabuf_import: false,
            formats: vec![
                PixelFormat::Rgba8,
                PixelFormat::Bgra8,
                PixelFormat::R8,
                PixelFormat::Rg8,
                PixelFormat::Uyvy,
            ],
        }
    }
}

impl ImportCapabilities {
    #[cfg(feature = "gpu")]
    pub fn from_context(context: &super::GpuContext, allow_dmabuf: bool) -> Self {
        let caps = Self {
            max_texture_dimension: context.limits.max_texture_dimension_2d,
            dmabuf_mapping: allow_dmabuf,
            dmabuf_import: allow_dmabuf && context.dmabuf_import,
            ..Self::default()
        };
        caps.log_info(&context.adapter_info.name);
        caps
    }

    pub fn log_info(&self, adapter: &str) {
        log::info!("Import capabilities ({}):", adapter);
        log::info!(
            "  Max Texture Size: {}x{}",
            self.max_texture_dimension,
            self.max_texture_dimension
        );
        log::info!(
            "  DMA-BUF mapping: {}",
            if self.dmabuf_mapping { "Yes" } else { "No" }
        );
        log::info!(
            "  DMA-BUF import: {}",
            if self.dmabuf_import {
                "Zero-copy"
            } else {
                "Upload"
            }
        );
        log::info!("  Formats: {:?}", self.formats);
    }

    /// Reject frames this device cannot take before touching any memory
    pub fn check(&self, frame: &DecodedFrame) -> Result<(), ImportError> {
        let layout = PlaneLayout::detect(frame)?;
        for plane in &frame.planes {
            if !self.formats.contains(&plane.format) {
                return Err(ImportError::UnsupportedFormat(format!(
                    "{:?} planes are not supported",
                    plane.format
                )));
            }
            if plane.width == 0 || plane.height == 0 {
                return Err(ImportError::UnsupportedFormat(format!(
                    "empty {}x{} plane",
                    plane.width, plane.height
                )));
            }
            let max = self.max_texture_dimension;
            let texture_width = layout.texture_width(plane.width);
            if texture_width > max || plane.height > max {
                return Err(ImportError::TooLarge {
                    width: plane.width,
                    height: plane.height,
                    max,
                });
            }
            if plane.pitch < plane.format.min_pitch(plane.width) {
                return Err(ImportError::UnsupportedFormat(format!(
                    "pitch {} too small for {} {:?} pixels",
                    plane.pitch, plane.width, plane.format
                )));
            }
            if plane.is_dmabuf() && !self.dmabuf_mapping {
                return Err(ImportError::UnsupportedFormat(
                    "DMA-BUF planes disabled".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// How the planes of a frame combine into one picture
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaneLayout {
    Rgba,
    Bgra,
    /// Luma plane plus half-resolution interleaved chroma
    Nv12,
    Uyvy,
}

impl PlaneLayout {
    pub fn detect(frame: &DecodedFrame) -> Result<Self, ImportError> {
        let formats: Vec<PixelFormat> = frame.planes.iter().map(|p| p.format).collect();
        match formats.as_slice() {
            [] => Err(ImportError::NoPlanes),
            [PixelFormat::Rgba8] => Ok(Self::Rgba),
            [PixelFormat::Bgra8] => Ok(Self::Bgra),
            [PixelFormat::Uyvy] => Ok(Self::Uyvy),
            [PixelFormat::R8, PixelFormat::Rg8] => Ok(Self::Nv12),
            other => Err(ImportError::UnsupportedFormat(format!(
                "plane combination {:?}",
                other
            ))),
        }
    }

    /// Code the mix shader uses to pick a conversion
    pub fn shader_code(&self) -> u32 {
        match self {
            Self::Rgba | Self::Bgra => 1,
            Self::Nv12 => 2,
            Self::Uyvy => 3,
        }
    }

    /// Texel width of the texture backing a plane of `width` pixels
    pub fn texture_width(&self, width: u32) -> u32 {
        match self {
            // two pixels per RGBA texel
            Self::Uyvy => width.div_ceil(2),
            _ => width,
        }
    }
}
