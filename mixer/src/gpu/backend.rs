//! wgpu implementation of the import layer

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use super::capabilities::{ImportCapabilities, PlaneLayout};
use super::dmabuf::DmaBufImporter;
use super::texture::{dmabuf_len, plane_extent, texture_format, upload_plane};
use super::texture_pool::TexturePool;
use super::{GpuBackend, GpuContext};
use crate::error::ImportError;
use crate::media::{DecodedFrame, PlaneDescriptor, PlaneMemory};

/// One texture per plane of an imported frame
pub struct PlaneTexture {
    pub texture: wgpu::Texture,
    pub view: wgpu::TextureView,
    /// Bound to the decoder's buffer rather than taken from the pool
    pub imported: bool,
}

/// An imported frame ready for sampling
pub struct WgpuImage {
    pub layout: PlaneLayout,
    pub planes: Vec<PlaneTexture>,
    pub width: u32,
    pub height: u32,
    /// Holds the decoder's buffers while imported planes sample them
    keepalive: Option<Arc<dyn Any + Send + Sync>>,
}

impl WgpuImage {
    pub fn luma(&self) -> Option<&wgpu::TextureView> {
        self.planes.first().map(|p| &p.view)
    }

    pub fn chroma(&self) -> Option<&wgpu::TextureView> {
        self.planes.get(1).map(|p| &p.view)
    }
}

pub struct WgpuBackend {
    device: wgpu::Device,
    queue: wgpu::Queue,
    capabilities: ImportCapabilities,
    pool: TexturePool,
    importer: Option<DmaBufImporter>,
    live_images: usize,
}

impl WgpuBackend {
    pub fn new(context: &GpuContext, capabilities: ImportCapabilities) -> Self {
        let importer = if capabilities.dmabuf_import {
            DmaBufImporter::new(&context.device)
        } else {
            None
        };
        Self {
            device: context.device.clone(),
            queue: context.queue.clone(),
            capabilities,
            pool: TexturePool::new(),
            importer,
            live_images: 0,
        }
    }

    pub fn capabilities(&self) -> &ImportCapabilities {
        &self.capabilities
    }

    /// Images imported and not yet destroyed
    pub fn live_images(&self) -> usize {
        self.live_images
    }

    /// Whether DMA-BUF planes are currently bound without a copy
    pub fn zero_copy(&self) -> bool {
        self.importer.is_some()
    }

    /// Bind a DMA-BUF plane directly. `None` means it has to be uploaded;
    /// after the first failure every later frame is uploaded too.
    fn import_plane(
        &mut self,
        plane: &PlaneDescriptor,
        layout: PlaneLayout,
    ) -> Option<Result<wgpu::Texture, ImportError>> {
        let (Some(importer), PlaneMemory::DmaBuf(fd)) = (&self.importer, &plane.memory) else {
            return None;
        };

        let needed = plane.required_len();
        match dmabuf_len(fd) {
            Ok(available) if available < needed => {
                return Some(Err(ImportError::Truncated { needed, available }));
            }
            Err(e) => return Some(Err(e)),
            Ok(_) => {}
        }

        let format = texture_format(plane.format);
        match importer.import_plane(fd, plane, format, plane_extent(plane, layout)) {
            Ok(texture) => Some(Ok(texture)),
            Err(e) => {
                log::warn!(
                    "DMA-BUF import failed, uploading through the CPU from now on: {}",
                    e
                );
                self.importer = None;
                None
            }
        }
    }

    fn release_planes(&mut self, planes: Vec<PlaneTexture>) {
        for plane in planes {
            if !plane.imported {
                self.pool.recycle(plane.texture);
            }
        }
    }

    fn upload(&mut self, frame: &DecodedFrame, layout: PlaneLayout) -> Result<Vec<PlaneTexture>, ImportError> {
        let mut planes = Vec::with_capacity(frame.planes.len());
        for plane in &frame.planes {
            let imported = match self.import_plane(plane, layout) {
                Some(Ok(texture)) => Some(texture),
                Some(Err(e)) => {
                    self.release_planes(planes);
                    return Err(e);
                }
                None => None,
            };

            let (texture, imported) = match imported {
                Some(texture) => (texture, true),
                None => {
                    let extent = plane_extent(plane, layout);
                    let texture = self.pool.acquire(
                        &self.device,
                        texture_format(plane.format),
                        extent.width,
                        extent.height,
                    );
                    if let Err(e) = upload_plane(&self.queue, &texture, plane, layout) {
                        // Nothing was submitted that samples these yet
                        self.pool.recycle(texture);
                        self.release_planes(planes);
                        return Err(e);
                    }
                    (texture, false)
                }
            };
            let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
            planes.push(PlaneTexture {
                texture,
                view,
                imported,
            });
        }
        Ok(planes)
    }
}

impl GpuBackend for WgpuBackend {
    type Image = WgpuImage;
    type Fence = wgpu::SubmissionIndex;

    fn import(&mut self, frame: &DecodedFrame) -> Result<WgpuImage, ImportError> {
        self.capabilities.check(frame)?;
        let layout = PlaneLayout::detect(frame)?;
        let (width, height) = frame.dimensions().ok_or(ImportError::NoPlanes)?;

        let planes = profile_scope!("import", self.upload(frame, layout))?;
        let keepalive = if planes.iter().any(|p| p.imported) {
            frame.keepalive.clone()
        } else {
            None
        };
        self.live_images += 1;
        Ok(WgpuImage {
            layout,
            planes,
            width,
            height,
            keepalive,
        })
    }

    fn destroy_image(&mut self, image: WgpuImage) {
        self.live_images = self.live_images.saturating_sub(1);
        let WgpuImage {
            planes, keepalive, ..
        } = image;
        // Imported textures go before the buffers they alias
        self.release_planes(planes);
        drop(keepalive);
    }

    fn create_fence(&mut self) -> wgpu::SubmissionIndex {
        self.queue.submit(std::iter::empty())
    }

    fn wait_fence(&mut self, fence: &wgpu::SubmissionIndex, timeout: Duration) -> bool {
        self.device
            .poll(wgpu::PollType::Wait {
                submission_index: Some(fence.clone()),
                timeout: Some(timeout),
            })
            .is_ok()
    }

    fn destroy_fence(&mut self, _fence: wgpu::SubmissionIndex) {}
}

impl Drop for WgpuBackend {
    fn drop(&mut self) {
        if self.live_images > 0 {
            log::warn!("WgpuBackend dropped with {} live images", self.live_images);
        }
    }
}
