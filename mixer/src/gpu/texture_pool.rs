//! Recycles plane textures between frames of the same shape
//!
//! Every imported frame needs one texture per plane. Sources keep
//! producing frames of the same format and size, so textures freed by
//! `destroy_image` go back into a per-key free list instead of being
//! dropped.

use std::collections::HashMap;

/// Free textures kept per key
const MAX_FREE_PER_KEY: usize = 6;

type Key = (wgpu::TextureFormat, u32, u32);

#[derive(Default)]
pub struct TexturePool {
    free: HashMap<Key, Vec<wgpu::Texture>>,
    created: u64,
    reused: u64,
}

impl TexturePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// A texture of the given shape, usable as an upload target and for
    /// sampling
    pub fn acquire(
        &mut self,
        device: &wgpu::Device,
        format: wgpu::TextureFormat,
        width: u32,
        height: u32,
    ) -> wgpu::Texture {
        if let Some(texture) = self
            .free
            .get_mut(&(format, width, height))
            .and_then(Vec::pop)
        {
            self.reused += 1;
            return texture;
        }

        self.created += 1;
        log::debug!(
            "Creating plane texture {}x{} {:?} (#{})",
            width,
            height,
            format,
            self.created
        );
        device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Plane Texture"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        })
    }

    /// Return a texture whose last use has completed on the GPU
    pub fn recycle(&mut self, texture: wgpu::Texture) {
        let key = (texture.format(), texture.width(), texture.height());
        let list = self.free.entry(key).or_default();
        if list.len() < MAX_FREE_PER_KEY {
            list.push(texture);
        } else {
            texture.destroy();
        }
    }

    /// Drop every free texture, e.g. after a source changed resolution
    pub fn clear(&mut self) {
        let count: usize = self.free.values().map(Vec::len).sum();
        for texture in self.free.drain().flat_map(|(_, list)| list) {
            texture.destroy();
        }
        if count > 0 {
            log::debug!("Released {} pooled plane textures", count);
        }
    }

    pub fn free_count(&self) -> usize {
        self.free.values().map(Vec::len).sum()
    }

    /// (created, reused) totals
    pub fn stats(&self) -> (u64, u64) {
        (self.created, self.reused)
    }
}

impl Drop for TexturePool {
    fn drop(&mut self) {
        let (created, reused) = self.stats();
        log::debug!(
            "TexturePool dropped ({} created, {} reused)",
            created,
            reused
        );
        self.clear();
    }
}
