use crate::error::RenderError;
use crate::gpu::backend::WgpuImage;
use crate::gpu::{Compositor, GpuContext};

use wgpu::util::DeviceExt;

#[repr(C)]
#[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct MixUniforms {
    mix_value: f32,
    a_format: u32,
    b_format: u32,
    _pad: u32,
}

/// Surface texture the current frame draws into
struct FrameTarget {
    view: wgpu::TextureView,
    width: u32,
    height: u32,
    cleared: bool,
}

/// Draws crossfades of imported images into side-by-side output viewports
pub struct PlaneRenderer {
    device: wgpu::Device,
    queue: wgpu::Queue,
    pipeline: wgpu::RenderPipeline,
    bind_group_layout: wgpu::BindGroupLayout,
    sampler: wgpu::Sampler,
    /// 1x1 black stand-in for missing images and planes
    placeholder: wgpu::TextureView,
    /// One uniform buffer per output
    uniforms: Vec<wgpu::Buffer>,
    target: Option<FrameTarget>,
}

impl PlaneRenderer {
    pub fn new(context: &GpuContext, outputs: usize) -> Self {
        let device = context.device.clone();

        let bind_group_layout = mix_bind_group_layout(&device);

        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Plane Sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            mipmap_filter: wgpu::MipmapFilterMode::Nearest,
            ..Default::default()
        });

        let pipeline = mix_pipeline(&device, &bind_group_layout, context.surface_format());

        let placeholder = device
            .create_texture_with_data(
                &context.queue,
                &wgpu::TextureDescriptor {
                    label: Some("Black Placeholder"),
                    size: wgpu::Extent3d {
                        width: 1,
                        height: 1,
                        depth_or_array_layers: 1,
                    },
                    mip_level_count: 1,
                    sample_count: 1,
                    dimension: wgpu::TextureDimension::D2,
                    format: wgpu::TextureFormat::Rgba8Unorm,
                    usage: wgpu::TextureUsages::TEXTURE_BINDING,
                    view_formats: &[],
                },
                wgpu::util::TextureDataOrder::LayerMajor,
                &[0, 0, 0, 255],
            )
            .create_view(&wgpu::TextureViewDescriptor::default());

        let uniforms = (0..outputs.max(1))
            .map(|i| {
                device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some(&format!("Mix Uniforms {}", i)),
                    size: std::mem::size_of::<MixUniforms>() as wgpu::BufferAddress,
                    usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                    mapped_at_creation: false,
                })
            })
            .collect();

        log::info!("Mix renderer ready for {} outputs", outputs);

        Self {
            device,
            queue: context.queue.clone(),
            pipeline,
            bind_group_layout,
            sampler,
            placeholder,
            uniforms,
            target: None,
        }
    }

    /// Draw subsequent outputs into `view`
    pub fn begin_frame(&mut self, view: wgpu::TextureView, width: u32, height: u32) {
        self.target = Some(FrameTarget {
            view,
            width,
            height,
            cleared: false,
        });
    }

    pub fn end_frame(&mut self) {
        self.target = None;
    }

    pub fn outputs(&self) -> usize {
        self.uniforms.len()
    }

    /// Viewport of `output`: outputs sit side by side across the surface
    fn viewport(&self, output: usize, width: u32, height: u32) -> (f32, f32, f32, f32) {
        let slice = width as f32 / self.outputs() as f32;
        (slice * output as f32, 0.0, slice, height as f32)
    }

    fn views<'a>(&'a self, image: Option<&'a WgpuImage>) -> (u32, &'a wgpu::TextureView, &'a wgpu::TextureView) {
        match image {
            Some(image) => (
                image.layout.shader_code(),
                image.luma().unwrap_or(&self.placeholder),
                image.chroma().unwrap_or(&self.placeholder),
            ),
            None => (0, &self.placeholder, &self.placeholder),
        }
    }
}

impl Compositor<WgpuImage> for PlaneRenderer {
    fn composite(
        &mut self,
        output: usize,
        from: Option<&WgpuImage>,
        to: Option<&WgpuImage>,
        mix: f32,
    ) -> Result<(), RenderError> {
        let buffer = self
            .uniforms
            .get(output)
            .ok_or(RenderError::NoSuchOutput(output))?;
        let target = self.target.as_ref().ok_or(RenderError::NoTarget)?;

        let (a_format, a_luma, a_chroma) = self.views(from);
        let (b_format, b_luma, b_chroma) = self.views(to);
        let uniforms = MixUniforms {
            mix_value: mix.clamp(0.0, 1.0),
            a_format,
            b_format,
            _pad: 0,
        };
        self.queue
            .write_buffer(buffer, 0, bytemuck::cast_slice(&[uniforms]));

        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Mix Bind Group"),
            layout: &self.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(a_luma),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::TextureView(a_chroma),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: wgpu::BindingResource::TextureView(b_luma),
                },
                wgpu::BindGroupEntry {
                    binding: 4,
                    resource: wgpu::BindingResource::TextureView(b_chroma),
                },
                wgpu::BindGroupEntry {
                    binding: 5,
                    resource: wgpu::BindingResource::Sampler(&self.sampler),
                },
            ],
        });

        let load = if target.cleared {
            wgpu::LoadOp::Load
        } else {
            wgpu::LoadOp::Clear(wgpu::Color::BLACK)
        };
        let (x, y, w, h) = self.viewport(output, target.width, target.height);

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Mix Encoder"),
            });
        {
            let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Mix Pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &target.view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load,
                        store: wgpu::StoreOp::Store,
                    },
                    depth_slice: None,
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
                multiview_mask: None,
            });

            render_pass.set_viewport(x, y, w, h, 0.0, 1.0);
            render_pass.set_pipeline(&self.pipeline);
            render_pass.set_bind_group(0, &bind_group, &[]);
            render_pass.draw(0..3, 0..1); // Full-screen triangle
        }

        self.queue.submit(std::iter::once(encoder.finish()));
        if let Some(target) = self.target.as_mut() {
            target.cleared = true;
        }
        Ok(())
    }
}

/// Bindings of the mix shader: uniforms, then luma and chroma of side A,
/// luma and chroma of side B, then the shared sampler
fn mix_bind_group_layout(device: &wgpu::Device) -> wgpu::BindGroupLayout {
    let plane = |binding| wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::FRAGMENT,
        ty: wgpu::BindingType::Texture {
            sample_type: wgpu::TextureSampleType::Float { filterable: true },
            view_dimension: wgpu::TextureViewDimension::D2,
            multisampled: false,
        },
        count: None,
    };

    device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some("Mix Bind Group Layout"),
        entries: &[
            wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: wgpu::BufferSize::new(
                        std::mem::size_of::<MixUniforms>() as u64
                    ),
                },
                count: None,
            },
            plane(1),
            plane(2),
            plane(3),
            plane(4),
            wgpu::BindGroupLayoutEntry {
                binding: 5,
                visibility: wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                count: None,
            },
        ],
    })
}

/// Full-screen triangle writing straight into the surface format. The
/// shader converts YUV and blends, so no fixed-function blending is used.
fn mix_pipeline(
    device: &wgpu::Device,
    bind_group_layout: &wgpu::BindGroupLayout,
    surface_format: wgpu::TextureFormat,
) -> wgpu::RenderPipeline {
    let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some("Mix Shader"),
        source: wgpu::ShaderSource::Wgsl(include_str!("shaders/mix.wgsl").into()),
    });
    let layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some("Mix Pipeline Layout"),
        bind_group_layouts: &[bind_group_layout],
        immediate_size: 0,
    });

    device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
        label: Some("Mix Pipeline"),
        layout: Some(&layout),
        vertex: wgpu::VertexState {
            module: &shader,
            entry_point: Some("vs_main"),
            buffers: &[],
            compilation_options: wgpu::PipelineCompilationOptions::default(),
        },
        fragment: Some(wgpu::FragmentState {
            module: &shader,
            entry_point: Some("fs_main"),
            targets: &[Some(wgpu::ColorTargetState {
                format: surface_format,
                blend: None,
                write_mask: wgpu::ColorWrites::ALL,
            })],
            compilation_options: wgpu::PipelineCompilationOptions::default(),
        }),
        primitive: wgpu::PrimitiveState::default(),
        depth_stencil: None,
        multisample: wgpu::MultisampleState::default(),
        multiview_mask: None,
        cache: None,
    })
}

impl std::fmt::Debug for PlaneRenderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaneRenderer")
            .field("outputs", &self.uniforms.len())
            .field("has_target", &self.target.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bindings_match_shader() {
        // One std140 vec4 worth of uniforms
        assert_eq!(std::mem::size_of::<MixUniforms>(), 16);

        let shader = include_str!("shaders/mix.wgsl");
        for (binding, name) in ["u", "a_luma", "a_chroma", "b_luma", "b_chroma", "samp"]
            .iter()
            .enumerate()
        {
            let declaration = format!("@group(0) @binding({}) var", binding);
            let line = shader
                .lines()
                .find(|l| l.starts_with(&declaration))
                .unwrap_or_else(|| panic!("binding {} missing", binding));
            assert!(line.contains(&format!(" {}:", name)), "{}", line);
        }
    }
}
