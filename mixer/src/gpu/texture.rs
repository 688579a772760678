//! Uploading decoded planes into textures

use std::fs::File;
use std::io::{Seek, SeekFrom};
use std::os::fd::{AsFd, AsRawFd, OwnedFd};

use super::capabilities::PlaneLayout;
use super::dmabuf::CpuAccess;
use crate::error::ImportError;
use crate::media::{PixelFormat, PlaneDescriptor, PlaneMemory};

/// Texture format backing a plane
pub fn texture_format(format: PixelFormat) -> wgpu::TextureFormat {
    match format {
        PixelFormat::Rgba8 => wgpu::TextureFormat::Rgba8Unorm,
        PixelFormat::Bgra8 => wgpu::TextureFormat::Bgra8Unorm,
        PixelFormat::R8 => wgpu::TextureFormat::R8Unorm,
        PixelFormat::Rg8 => wgpu::TextureFormat::Rg8Unorm,
        // Two pixels per texel: U Y0 V Y1 lands in r g b a
        PixelFormat::Uyvy => wgpu::TextureFormat::Rgba8Unorm,
    }
}

/// Texel extent of the texture backing `plane`
pub fn plane_extent(plane: &PlaneDescriptor, layout: PlaneLayout) -> wgpu::Extent3d {
    wgpu::Extent3d {
        width: layout.texture_width(plane.width),
        height: plane.height,
        depth_or_array_layers: 1,
    }
}

/// Size of a DMA-BUF, as reported by seeking to its end
pub fn dmabuf_len(fd: &OwnedFd) -> Result<usize, ImportError> {
    let dup = fd
        .try_clone()
        .map_err(|e| ImportError::Map(format!("failed to dup fd: {}", e)))?;
    let mut file = File::from(dup);
    let len = file
        .seek(SeekFrom::End(0))
        .map_err(|e| ImportError::Map(format!("failed to size DMA-BUF: {}", e)))?;
    Ok(len as usize)
}

/// Copy one plane into `texture`.
///
/// This is the path for host planes, and the fallback for DMA-BUF planes
/// when they cannot be bound directly. Those are mapped read-only inside a
/// CPU access window for the duration of the copy; `write_texture` stages
/// the bytes, so the mapping can go right after.
pub fn upload_plane(
    queue: &wgpu::Queue,
    texture: &wgpu::Texture,
    plane: &PlaneDescriptor,
    layout: PlaneLayout,
) -> Result<(), ImportError> {
    let needed = plane.required_len();
    let data_layout = wgpu::TexelCopyBufferLayout {
        offset: plane.offset as u64,
        bytes_per_row: Some(plane.pitch),
        rows_per_image: Some(plane.height),
    };
    let extent = plane_extent(plane, layout);

    match &plane.memory {
        PlaneMemory::Host(data) => {
            if data.len() < needed {
                return Err(ImportError::Truncated {
                    needed,
                    available: data.len(),
                });
            }
            queue.write_texture(texture.as_image_copy(), data.as_slice(), data_layout, extent);
        }
        PlaneMemory::DmaBuf(fd) => {
            let available = dmabuf_len(fd)?;
            if available < needed {
                return Err(ImportError::Truncated { needed, available });
            }
            let _access = CpuAccess::begin(fd.as_fd())?;
            // SAFETY: the mapping is read-only and dropped before returning;
            // the frame's keepalive holds the exporting buffer until then
            let map = unsafe {
                memmap2::MmapOptions::new()
                    .len(needed)
                    .map(fd.as_raw_fd())
            }
            .map_err(|e| ImportError::Map(e.to_string()))?;
            queue.write_texture(texture.as_image_copy(), &map[..], data_layout, extent);
            drop(map);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_formats() {
        assert_eq!(
            texture_format(PixelFormat::R8),
            wgpu::TextureFormat::R8Unorm
        );
        assert_eq!(
            texture_format(PixelFormat::Uyvy),
            wgpu::TextureFormat::Rgba8Unorm
        );
    }

    #[test]
    fn test_uyvy_extent_is_halved() {
        let plane = PlaneDescriptor::host(vec![0u8; 3 * 4 * 2], 5, 2, PixelFormat::Uyvy);
        let extent = plane_extent(&plane, PlaneLayout::Uyvy);
        assert_eq!(extent.width, 3);
        assert_eq!(extent.height, 2);
    }
}
