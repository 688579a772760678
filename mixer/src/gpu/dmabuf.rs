//! DMA-BUF planes on the GPU
//!
//! On Vulkan the device is opened with the external memory extensions and
//! each plane's buffer is bound to a `VkImage` that wgpu samples directly.
//! Elsewhere planes are read by the CPU, bracketed by the kernel's
//! `DMA_BUF_IOCTL_SYNC` so caches are coherent for the duration.

use std::ffi::CStr;
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, IntoRawFd, OwnedFd};

use ash::vk;
use wgpu::hal::api::Vulkan;

use crate::error::ImportError;
use crate::media::PlaneDescriptor;

/// Device extensions needed to bind a DMA-BUF to an image
const REQUIRED_EXTENSIONS: [&CStr; 3] = [
    ash::khr::external_memory_fd::NAME,
    ash::ext::external_memory_dma_buf::NAME,
    ash::ext::image_drm_format_modifier::NAME,
];

/// Decoders hand out linear buffers unless caps negotiate a modifier
const DRM_FORMAT_MOD_LINEAR: u64 = 0;

const DMA_BUF_SYNC_READ: u64 = 1;
const DMA_BUF_SYNC_START: u64 = 0;
const DMA_BUF_SYNC_END: u64 = 1 << 2;
/// `_IOW('b', 0, struct dma_buf_sync)`
const DMA_BUF_IOCTL_SYNC: libc::c_ulong = 0x4008_6200;

#[repr(C)]
struct DmaBufSync {
    flags: u64,
}

fn dma_buf_sync(fd: BorrowedFd<'_>, flags: u64) -> io::Result<()> {
    let sync = DmaBufSync { flags };
    loop {
        // SAFETY: `sync` matches the kernel's struct dma_buf_sync and
        // outlives the call
        let ret = unsafe {
            libc::ioctl(
                fd.as_raw_fd(),
                DMA_BUF_IOCTL_SYNC as _,
                &sync as *const DmaBufSync,
            )
        };
        if ret == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if !matches!(err.raw_os_error(), Some(libc::EINTR) | Some(libc::EAGAIN)) {
            return Err(err);
        }
    }
}

/// CPU read access to a DMA-BUF, ended on drop
pub struct CpuAccess<'fd> {
    fd: BorrowedFd<'fd>,
}

impl<'fd> CpuAccess<'fd> {
    pub fn begin(fd: BorrowedFd<'fd>) -> Result<Self, ImportError> {
        dma_buf_sync(fd, DMA_BUF_SYNC_READ | DMA_BUF_SYNC_START)
            .map_err(|e| ImportError::Map(format!("DMA-BUF sync start failed: {}", e)))?;
        Ok(Self { fd })
    }
}

impl Drop for CpuAccess<'_> {
    fn drop(&mut self) {
        if let Err(e) = dma_buf_sync(self.fd, DMA_BUF_SYNC_READ | DMA_BUF_SYNC_END) {
            log::warn!("DMA-BUF sync end failed: {}", e);
        }
    }
}

fn vk_format(format: wgpu::TextureFormat) -> Option<vk::Format> {
    match format {
        wgpu::TextureFormat::R8Unorm => Some(vk::Format::R8_UNORM),
        wgpu::TextureFormat::Rg8Unorm => Some(vk::Format::R8G8_UNORM),
        wgpu::TextureFormat::Rgba8Unorm => Some(vk::Format::R8G8B8A8_UNORM),
        wgpu::TextureFormat::Bgra8Unorm => Some(vk::Format::B8G8R8A8_UNORM),
        _ => None,
    }
}

fn external(context: &str, result: vk::Result) -> ImportError {
    ImportError::External(format!("{}: {}", context, result))
}

/// Open a Vulkan device with DMA-BUF import enabled. Returns `None` when
/// the adapter is not Vulkan or lacks the extensions, so the caller can
/// fall back to a plain device.
pub fn request_device(
    adapter: &wgpu::Adapter,
    desc: &wgpu::DeviceDescriptor<'_>,
) -> Option<(wgpu::Device, wgpu::Queue)> {
    let open = {
        // SAFETY: the hal adapter is only used inside this block
        let hal_adapter = unsafe { adapter.as_hal::<Vulkan>() }?;
        let instance = hal_adapter.shared_instance().raw_instance();
        // SAFETY: the physical device belongs to this instance
        let available = unsafe {
            instance.enumerate_device_extension_properties(hal_adapter.raw_physical_device())
        }
        .ok()?;

        let missing: Vec<&CStr> = REQUIRED_EXTENSIONS
            .into_iter()
            .filter(|name| {
                !available
                    .iter()
                    .any(|p| p.extension_name_as_c_str() == Ok(*name))
            })
            .collect();
        if !missing.is_empty() {
            log::info!("DMA-BUF import unavailable, missing {:?}", missing);
            return None;
        }

        // SAFETY: the callback only appends extensions that were just
        // checked to be supported
        let opened = unsafe {
            hal_adapter.open_with_callback(
                desc.required_features,
                &desc.memory_hints,
                Some(Box::new(|args| {
                    for name in REQUIRED_EXTENSIONS {
                        if !args.extensions.contains(&name) {
                            args.extensions.push(name);
                        }
                    }
                })),
            )
        };
        match opened {
            Ok(open) => open,
            Err(e) => {
                log::warn!("Vulkan device with DMA-BUF import failed: {}", e);
                return None;
            }
        }
    };

    // SAFETY: `open` was created from this adapter
    match unsafe { adapter.create_device_from_hal(open, desc) } {
        Ok(pair) => Some(pair),
        Err(e) => {
            log::warn!("Failed to wrap Vulkan device: {}", e);
            None
        }
    }
}

/// Binds DMA-BUF planes to sampled textures
pub struct DmaBufImporter {
    device: wgpu::Device,
}

impl DmaBufImporter {
    /// Available when the device was opened by [`request_device`]
    pub fn new(device: &wgpu::Device) -> Option<Self> {
        // SAFETY: only the extension list is read
        let enabled = unsafe { device.as_hal::<Vulkan>() }.is_some_and(|hal| {
            let extensions = hal.enabled_device_extensions();
            REQUIRED_EXTENSIONS
                .iter()
                .all(|name| extensions.contains(name))
        });
        enabled.then(|| Self {
            device: device.clone(),
        })
    }

    /// Wrap one plane as a texture of `format` and `extent` without
    /// copying. The driver takes its own reference on the buffer.
    pub fn import_plane(
        &self,
        fd: &OwnedFd,
        plane: &PlaneDescriptor,
        format: wgpu::TextureFormat,
        extent: wgpu::Extent3d,
    ) -> Result<wgpu::Texture, ImportError> {
        let vk_format = vk_format(format).ok_or_else(|| {
            ImportError::UnsupportedFormat(format!("{:?} has no external image format", format))
        })?;

        // SAFETY: the raw handles are used while `hal_device` is alive; the
        // image and memory are handed to wgpu, which destroys them through
        // the drop callback
        let hal_texture = unsafe {
            let hal_device = self
                .device
                .as_hal::<Vulkan>()
                .ok_or_else(|| ImportError::External("device is not Vulkan".to_string()))?;
            let raw = hal_device.raw_device();
            let fd_device = ash::khr::external_memory_fd::Device::new(
                hal_device.shared_instance().raw_instance(),
                raw,
            );

            let plane_layouts = [vk::SubresourceLayout {
                offset: plane.offset as u64,
                size: 0,
                row_pitch: u64::from(plane.pitch),
                array_pitch: 0,
                depth_pitch: 0,
            }];
            let mut modifier_info = vk::ImageDrmFormatModifierExplicitCreateInfoEXT::default()
                .drm_format_modifier(DRM_FORMAT_MOD_LINEAR)
                .plane_layouts(&plane_layouts);
            let mut external_info = vk::ExternalMemoryImageCreateInfo::default()
                .handle_types(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT);
            let image_info = vk::ImageCreateInfo::default()
                .image_type(vk::ImageType::TYPE_2D)
                .format(vk_format)
                .extent(vk::Extent3D {
                    width: extent.width,
                    height: extent.height,
                    depth: 1,
                })
                .mip_levels(1)
                .array_layers(1)
                .samples(vk::SampleCountFlags::TYPE_1)
                .tiling(vk::ImageTiling::DRM_FORMAT_MODIFIER_EXT)
                .usage(vk::ImageUsageFlags::SAMPLED)
                .sharing_mode(vk::SharingMode::EXCLUSIVE)
                .initial_layout(vk::ImageLayout::UNDEFINED)
                .push_next(&mut external_info)
                .push_next(&mut modifier_info);
            let image = raw
                .create_image(&image_info, None)
                .map_err(|e| external("create image", e))?;

            let requirements = raw.get_image_memory_requirements(image);
            let mut fd_properties = vk::MemoryFdPropertiesKHR::default();
            if let Err(e) = fd_device.get_memory_fd_properties(
                vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT,
                fd.as_raw_fd(),
                &mut fd_properties,
            ) {
                raw.destroy_image(image, None);
                return Err(external("query fd memory", e));
            }
            let type_bits = requirements.memory_type_bits & fd_properties.memory_type_bits;
            let Some(memory_type) = (0..32).find(|i| type_bits & (1 << i) != 0) else {
                raw.destroy_image(image, None);
                return Err(ImportError::External(
                    "no memory type fits the DMA-BUF".to_string(),
                ));
            };

            // A successful import takes ownership of the descriptor
            let import_fd = match fd.try_clone() {
                Ok(dup) => dup,
                Err(e) => {
                    raw.destroy_image(image, None);
                    return Err(ImportError::Map(format!("failed to dup fd: {}", e)));
                }
            };
            let mut import_info = vk::ImportMemoryFdInfoKHR::default()
                .handle_type(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT)
                .fd(import_fd.as_raw_fd());
            let mut dedicated = vk::MemoryDedicatedAllocateInfo::default().image(image);
            let allocate_info = vk::MemoryAllocateInfo::default()
                .allocation_size(requirements.size)
                .memory_type_index(memory_type)
                .push_next(&mut import_info)
                .push_next(&mut dedicated);
            let memory = match raw.allocate_memory(&allocate_info, None) {
                Ok(memory) => {
                    let _ = import_fd.into_raw_fd();
                    memory
                }
                Err(e) => {
                    raw.destroy_image(image, None);
                    return Err(external("import memory", e));
                }
            };
            if let Err(e) = raw.bind_image_memory(image, memory, 0) {
                raw.free_memory(memory, None);
                raw.destroy_image(image, None);
                return Err(external("bind memory", e));
            }

            let release = raw.clone();
            let drop_callback: wgpu::hal::DropCallback = Box::new(move || {
                release.destroy_image(image, None);
                release.free_memory(memory, None);
            });
            let hal_desc = wgpu::hal::TextureDescriptor {
                label: Some("DMA-BUF Plane"),
                size: extent,
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format,
                usage: wgpu::TextureUses::RESOURCE,
                memory_flags: wgpu::hal::MemoryFlags::empty(),
                view_formats: Vec::new(),
            };
            hal_device.texture_from_raw(
                image,
                &hal_desc,
                Some(drop_callback),
                wgpu::hal::vulkan::TextureMemory::External,
            )
        };

        // SAFETY: the hal texture was created on this device with the
        // matching descriptor
        let texture = unsafe {
            self.device.create_texture_from_hal::<Vulkan>(
                hal_texture,
                &wgpu::TextureDescriptor {
                    label: Some("DMA-BUF Plane"),
                    size: extent,
                    mip_level_count: 1,
                    sample_count: 1,
                    dimension: wgpu::TextureDimension::D2,
                    format,
                    usage: wgpu::TextureUsages::TEXTURE_BINDING,
                    view_formats: &[],
                },
            )
        };
        Ok(texture)
    }
}
