//! Decoded picture descriptions passed from decode threads to the importer

use std::any::Any;
use std::fmt;
use std::ops::Deref;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::Arc;

/// Pixel layout of a single plane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    Rgba8,
    Bgra8,
    /// Single 8-bit channel (NV12 luma)
    R8,
    /// Two interleaved 8-bit channels (NV12 chroma)
    Rg8,
    /// Packed 4:2:2 as delivered by capture hardware
    Uyvy,
}

const fn fourcc(code: &[u8; 4]) -> u32 {
    (code[0] as u32)
        | ((code[1] as u32) << 8)
        | ((code[2] as u32) << 16)
        | ((code[3] as u32) << 24)
}

impl PixelFormat {
    /// DRM fourcc code describing this plane
    pub fn drm_fourcc(&self) -> u32 {
        match self {
            Self::Rgba8 => fourcc(b"AB24"),
            Self::Bgra8 => fourcc(b"AR24"),
            Self::R8 => fourcc(b"R8  "),
            Self::Rg8 => fourcc(b"GR88"),
            Self::Uyvy => fourcc(b"UYVY"),
        }
    }

    /// Bytes per pixel along a row (UYVY carries two pixels per four bytes)
    pub fn bytes_per_pixel(&self) -> u32 {
        match self {
            Self::Rgba8 | Self::Bgra8 => 4,
            Self::R8 => 1,
            Self::Rg8 | Self::Uyvy => 2,
        }
    }

    /// Minimum pitch for `width` pixels
    pub fn min_pitch(&self, width: u32) -> u32 {
        match self {
            // pixels come in pairs
            Self::Uyvy => width.div_ceil(2) * 4,
            _ => width * self.bytes_per_pixel(),
        }
    }
}

/// Read-only host bytes shared by reference with whatever owns them: a
/// vector, a pattern cache or a mapped decoder buffer
#[derive(Clone)]
pub struct HostBytes(Arc<dyn AsRef<[u8]> + Send + Sync>);

impl HostBytes {
    pub fn new(owner: impl AsRef<[u8]> + Send + Sync + 'static) -> Self {
        Self(Arc::new(owner))
    }

    pub fn as_slice(&self) -> &[u8] {
        AsRef::<[u8]>::as_ref(&*self.0)
    }
}

impl Deref for HostBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl From<Vec<u8>> for HostBytes {
    fn from(bytes: Vec<u8>) -> Self {
        Self::new(bytes)
    }
}

impl From<Arc<[u8]>> for HostBytes {
    fn from(bytes: Arc<[u8]>) -> Self {
        Self::new(bytes)
    }
}

/// Where a plane's bytes live
#[derive(Clone)]
pub enum PlaneMemory {
    /// Duplicated DMA-BUF descriptor owned by this frame
    DmaBuf(Arc<OwnedFd>),
    /// Host memory (system-memory decoders, generated patterns)
    Host(HostBytes),
}

impl fmt::Debug for PlaneMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DmaBuf(fd) => write!(f, "DmaBuf(fd={})", fd.as_raw_fd()),
            Self::Host(data) => write!(f, "Host({} bytes)", data.len()),
        }
    }
}

/// One plane of a decoded picture
#[derive(Debug, Clone)]
pub struct PlaneDescriptor {
    pub memory: PlaneMemory,
    /// Byte offset of the first row inside `memory`
    pub offset: usize,
    /// Bytes per row
    pub pitch: u32,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

impl PlaneDescriptor {
    /// Tightly packed host plane
    pub fn host(data: impl Into<HostBytes>, width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            memory: PlaneMemory::Host(data.into()),
            offset: 0,
            pitch: format.min_pitch(width),
            width,
            height,
            format,
        }
    }

    /// Bytes spanned by this plane, counted from the start of its memory
    pub fn required_len(&self) -> usize {
        if self.height == 0 {
            return self.offset;
        }
        self.offset
            + self.pitch as usize * (self.height as usize - 1)
            + self.format.min_pitch(self.width) as usize
    }

    pub fn is_dmabuf(&self) -> bool {
        matches!(self.memory, PlaneMemory::DmaBuf(_))
    }
}

/// A picture ready for import
pub struct DecodedFrame {
    pub planes: Vec<PlaneDescriptor>,
    /// Seconds since the first picture of the current playback session
    pub timestamp: f64,
    /// Set on the first picture of a session; restarts the pacing clock
    pub first_frame: bool,
    /// Keeps the decoder-owned buffer behind the plane handles alive
    pub keepalive: Option<Arc<dyn Any + Send + Sync>>,
}

impl DecodedFrame {
    pub fn new(planes: Vec<PlaneDescriptor>, timestamp: f64) -> Self {
        Self {
            planes,
            timestamp,
            first_frame: false,
            keepalive: None,
        }
    }

    pub fn with_keepalive(mut self, keepalive: Arc<dyn Any + Send + Sync>) -> Self {
        self.keepalive = Some(keepalive);
        self
    }

    /// Dimensions of the first plane
    pub fn dimensions(&self) -> Option<(u32, u32)> {
        self.planes.first().map(|p| (p.width, p.height))
    }
}

impl fmt::Debug for DecodedFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodedFrame")
            .field("planes", &self.planes)
            .field("timestamp", &self.timestamp)
            .field("first_frame", &self.first_frame)
            .field("keepalive", &self.keepalive.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fourcc_codes() {
        assert_eq!(PixelFormat::Uyvy.drm_fourcc(), 0x5956_5955);
        assert_eq!(PixelFormat::Bgra8.drm_fourcc(), 0x3432_5241);
    }

    #[test]
    fn test_required_len() {
        let plane = PlaneDescriptor {
            memory: PlaneMemory::Host(vec![0u8; 16].into()),
            offset: 8,
            pitch: 64,
            width: 10,
            height: 4,
            format: PixelFormat::Rgba8,
        };
        // three full rows plus the used part of the last one
        assert_eq!(plane.required_len(), 8 + 64 * 3 + 40);
    }

    #[test]
    fn test_host_bytes_share_their_owner() {
        let pattern: Arc<[u8]> = Arc::from(vec![7u8; 12]);
        let bytes = HostBytes::from(Arc::clone(&pattern));
        assert_eq!(bytes.as_ptr(), pattern.as_ptr());
        assert_eq!(bytes.len(), 12);

        let copy = bytes.clone();
        assert_eq!(copy.as_slice().as_ptr(), pattern.as_ptr());
    }

    #[test]
    fn test_host_plane_is_tightly_packed() {
        let plane = PlaneDescriptor::host(vec![0u8; 8 * 2 * 2], 8, 2, PixelFormat::Uyvy);
        assert_eq!(plane.pitch, 16);
        assert_eq!(plane.required_len(), 32);
        assert!(!plane.is_dmabuf());
    }
}
