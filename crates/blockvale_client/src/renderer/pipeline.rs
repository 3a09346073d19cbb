use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};
use wgpu::util::DeviceExt;

use crate::renderer::chunk_renderer::{ChunkPassStats, WgpuChunkBuffers};
use crate::renderer::mesh::ChunkVertex;
use crate::renderer::ChunkDrawer;

pub const COLOR_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8UnormSrgb;
pub const DEPTH_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Depth32Float;

const NEAR_PLANE: f32 = 0.1;

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
struct CameraUniform {
    view_proj: [[f32; 4]; 4],
    // w carries the fog distance.
    camera_pos: [f32; 4],
}

/// Perspective camera for one chunk pass.
#[derive(Debug, Clone, Copy)]
pub struct FrameCamera {
    pub eye: Vec3,
    pub forward: Vec3,
    pub fov_y_radians: f32,
    pub far: f32,
}

impl FrameCamera {
    pub fn looking(eye: Vec3, forward: Vec3, far: f32) -> Self {
        Self {
            eye,
            forward,
            fov_y_radians: 70.0_f32.to_radians(),
            far,
        }
    }

    pub fn view_projection(&self, aspect: f32) -> Mat4 {
        let forward = self.forward.try_normalize().unwrap_or(Vec3::X);
        let far = self.far.max(NEAR_PLANE * 2.0);
        let proj = Mat4::perspective_rh(self.fov_y_radians, aspect, NEAR_PLANE, far);
        let view = Mat4::look_to_rh(self.eye, forward, Vec3::Y);
        proj * view
    }

    fn uniform(&self, aspect: f32) -> CameraUniform {
        CameraUniform {
            view_proj: self.view_projection(aspect).to_cols_array_2d(),
            camera_pos: [self.eye.x, self.eye.y, self.eye.z, self.far],
        }
    }
}

#[derive(Debug)]
pub struct ChunkPipeline {
    pipeline: wgpu::RenderPipeline,
    pub camera_bind_group_layout: wgpu::BindGroupLayout,
}

impl ChunkPipeline {
    pub fn new(
        device: &wgpu::Device,
        color_format: wgpu::TextureFormat,
        depth_format: wgpu::TextureFormat,
    ) -> Self {
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Chunk Opaque Shader"),
            source: wgpu::ShaderSource::Wgsl(
                include_str!(concat!(
                    env!("CARGO_MANIFEST_DIR"),
                    "/../../assets/shaders/chunk_opaque.wgsl"
                ))
                .into(),
            ),
        });

        let camera_bind_group_layout =
            device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("Chunk Camera Bind Group Layout"),
                entries: &[wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                }],
            });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Chunk Pipeline Layout"),
            bind_group_layouts: &[&camera_bind_group_layout],
            push_constant_ranges: &[],
        });

        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("Chunk Opaque Pipeline"),
            layout: Some(&pipeline_layout),
            vertex: wgpu::VertexState {
                module: &shader,
                entry_point: Some("vs_main"),
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                buffers: &[ChunkVertex::desc()],
            },
            fragment: Some(wgpu::FragmentState {
                module: &shader,
                entry_point: Some("fs_main"),
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                targets: &[Some(wgpu::ColorTargetState {
                    format: color_format,
                    blend: Some(wgpu::BlendState::REPLACE),
                    write_mask: wgpu::ColorWrites::ALL,
                })],
            }),
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleList,
                strip_index_format: None,
                front_face: wgpu::FrontFace::Ccw,
                cull_mode: Some(wgpu::Face::Back),
                unclipped_depth: false,
                polygon_mode: wgpu::PolygonMode::Fill,
                conservative: false,
            },
            depth_stencil: Some(wgpu::DepthStencilState {
                format: depth_format,
                depth_write_enabled: true,
                depth_compare: wgpu::CompareFunction::Less,
                stencil: wgpu::StencilState::default(),
                bias: wgpu::DepthBiasState::default(),
            }),
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
            cache: None,
        });

        Self {
            pipeline,
            camera_bind_group_layout,
        }
    }

    pub fn pipeline(&self) -> &wgpu::RenderPipeline {
        &self.pipeline
    }
}

fn create_target(
    device: &wgpu::Device,
    label: &str,
    width: u32,
    height: u32,
    format: wgpu::TextureFormat,
    usage: wgpu::TextureUsages,
) -> (wgpu::Texture, wgpu::TextureView) {
    let texture = device.create_texture(&wgpu::TextureDescriptor {
        label: Some(label),
        size: wgpu::Extent3d {
            width: width.max(1),
            height: height.max(1),
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format,
        usage,
        view_formats: &[],
    });
    let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
    (texture, view)
}

/// Offscreen color and depth target that chunk passes render into.
pub struct ChunkFrame {
    pipeline: ChunkPipeline,
    width: u32,
    height: u32,
    _color_texture: wgpu::Texture,
    color_view: wgpu::TextureView,
    _depth_texture: wgpu::Texture,
    depth_view: wgpu::TextureView,
    camera_uniform_buffer: wgpu::Buffer,
    camera_bind_group: wgpu::BindGroup,
}

impl ChunkFrame {
    pub fn new(device: &wgpu::Device, width: u32, height: u32) -> Self {
        let pipeline = ChunkPipeline::new(device, COLOR_FORMAT, DEPTH_FORMAT);
        let (color_texture, color_view) = create_target(
            device,
            "Chunk Frame Color",
            width,
            height,
            COLOR_FORMAT,
            wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
        );
        let (depth_texture, depth_view) = create_target(
            device,
            "Chunk Frame Depth",
            width,
            height,
            DEPTH_FORMAT,
            wgpu::TextureUsages::RENDER_ATTACHMENT,
        );

        let initial = CameraUniform {
            view_proj: Mat4::IDENTITY.to_cols_array_2d(),
            camera_pos: [0.0; 4],
        };
        let camera_uniform_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Chunk Camera Uniform Buffer"),
            contents: bytemuck::bytes_of(&initial),
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        });
        let camera_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Chunk Camera Bind Group"),
            layout: &pipeline.camera_bind_group_layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: camera_uniform_buffer.as_entire_binding(),
            }],
        });

        Self {
            pipeline,
            width: width.max(1),
            height: height.max(1),
            _color_texture: color_texture,
            color_view,
            _depth_texture: depth_texture,
            depth_view,
            camera_uniform_buffer,
            camera_bind_group,
        }
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Records one opaque pass; `draw` issues chunk draws by handle.
    pub fn render(
        &self,
        buffers: &WgpuChunkBuffers,
        camera: &FrameCamera,
        draw: impl FnOnce(&mut dyn ChunkDrawer),
    ) -> ChunkPassStats {
        let aspect = self.width as f32 / self.height as f32;
        buffers.queue().write_buffer(
            &self.camera_uniform_buffer,
            0,
            bytemuck::bytes_of(&camera.uniform(aspect)),
        );

        let mut encoder = buffers
            .device()
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Chunk Frame Encoder"),
            });

        let stats = {
            let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Chunk Opaque Pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &self.color_view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color {
                            r: 0.62,
                            g: 0.76,
                            b: 0.92,
                            a: 1.0,
                        }),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                    view: &self.depth_view,
                    depth_ops: Some(wgpu::Operations {
                        load: wgpu::LoadOp::Clear(1.0),
                        store: wgpu::StoreOp::Store,
                    }),
                    stencil_ops: None,
                }),
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            render_pass.set_pipeline(self.pipeline.pipeline());
            render_pass.set_bind_group(0, &self.camera_bind_group, &[]);

            let mut chunk_pass = buffers.begin_pass(&mut render_pass);
            draw(&mut chunk_pass);
            chunk_pass.stats()
        };

        buffers.queue().submit(std::iter::once(encoder.finish()));
        stats
    }
}
