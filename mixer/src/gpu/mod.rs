/// GPU side of the mixer
///
/// The engine talks to the GPU through two small traits so it can run
/// headless in tests:
/// - `GpuBackend`: turns decoded frames into images and hands out fences
/// - `Compositor`: blends two images into an output plane
///
/// With the `gpu` feature the wgpu implementations are available:
/// - `context`: instance/surface/device/queue management
/// - `backend`: plane import and fences (`WgpuBackend`)
/// - `dmabuf`: binding DMA-BUF planes to textures on Vulkan
/// - `renderer`: the crossfade pipeline (`PlaneRenderer`)
/// - `texture_pool`: texture recycling keyed by format and size
pub mod capabilities;
pub mod slot;

#[cfg(feature = "gpu")]
pub mod backend;
#[cfg(feature = "gpu")]
pub mod context;
#[cfg(feature = "gpu")]
pub mod dmabuf;
#[cfg(feature = "gpu")]
pub mod renderer;
#[cfg(feature = "gpu")]
pub mod texture;
#[cfg(feature = "gpu")]
pub mod texture_pool;

pub use capabilities::{ImportCapabilities, PlaneLayout};
pub use slot::ImageSlot;

#[cfg(feature = "gpu")]
pub use backend::{WgpuBackend, WgpuImage};
#[cfg(feature = "gpu")]
pub use context::GpuContext;
#[cfg(feature = "gpu")]
pub use renderer::PlaneRenderer;

use crate::error::{ImportError, RenderError};
use crate::media::DecodedFrame;
use std::time::Duration;

/// Imports decoded frames and tracks GPU progress
pub trait GpuBackend {
    /// A sampled image, possibly made of several plane textures
    type Image;
    /// Marks a point in the GPU command stream
    type Fence;

    fn import(&mut self, frame: &DecodedFrame) -> Result<Self::Image, ImportError>;

    fn destroy_image(&mut self, image: Self::Image);

    /// Fence covering all work submitted so far
    fn create_fence(&mut self) -> Self::Fence;

    /// Wait up to `timeout`; `true` once the fence has signalled
    fn wait_fence(&mut self, fence: &Self::Fence, timeout: Duration) -> bool;

    fn destroy_fence(&mut self, fence: Self::Fence);
}

/// Draws one output plane
pub trait Compositor<I> {
    /// Blend `from` and `to` by `mix` (0 shows `from`, 1 shows `to`).
    /// A missing image renders as black.
    fn composite(
        &mut self,
        output: usize,
        from: Option<&I>,
        to: Option<&I>,
        mix: f32,
    ) -> Result<(), RenderError>;
}
