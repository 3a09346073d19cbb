use std::mem;

use rustc_hash::FxHashMap;
use tracing::debug;

use crate::renderer::mesh::{ChunkMesh, ChunkVertex};
use crate::renderer::{ChunkDrawer, GpuBackend, GpuError, GpuHandle};

#[derive(Debug, Clone, Copy, Default)]
pub struct MeshUploadStats {
    pub uploaded_bytes: u64,
    pub buffer_reallocations: u32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ChunkPassStats {
    pub draw_calls: u32,
    pub rendered_indices: u64,
    pub rendered_vertices: u64,
}

pub struct ChunkRenderData {
    pub vertex_buffer: wgpu::Buffer,
    pub index_buffer: wgpu::Buffer,
    pub index_count: u32,
    pub vertex_count: u32,
    pub vertex_capacity_bytes: u64,
    pub index_capacity_bytes: u64,
}

/// Vertex and index buffers for every uploaded chunk, keyed by handle.
pub struct WgpuChunkBuffers {
    device: wgpu::Device,
    queue: wgpu::Queue,
    chunks: FxHashMap<GpuHandle, ChunkRenderData>,
    next_handle: u64,
    stats: MeshUploadStats,
}

impl WgpuChunkBuffers {
    pub fn new(device: wgpu::Device, queue: wgpu::Queue) -> Self {
        Self {
            device,
            queue,
            chunks: FxHashMap::default(),
            next_handle: 0,
            stats: MeshUploadStats::default(),
        }
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    pub fn get(&self, handle: GpuHandle) -> Option<&ChunkRenderData> {
        self.chunks.get(&handle)
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn upload_stats(&self) -> MeshUploadStats {
        self.stats
    }

    /// Starts a draw recorder over an open render pass.
    pub fn begin_pass<'p, 'e>(&'p self, pass: &'p mut wgpu::RenderPass<'e>) -> WgpuChunkPass<'p, 'e> {
        WgpuChunkPass {
            pass,
            buffers: self,
            stats: ChunkPassStats::default(),
        }
    }

    fn check_limits(&self, mesh: &ChunkMesh) -> Result<(), GpuError> {
        let max = self.device.limits().max_buffer_size;
        if mesh_vertex_bytes(mesh) > max || mesh_index_bytes(mesh) > max {
            return Err(GpuError::MeshTooLarge {
                vertices: mesh.vertices.len(),
                indices: mesh.indices.len(),
            });
        }
        Ok(())
    }
}

impl GpuBackend for WgpuChunkBuffers {
    fn create_vertex_buffer(&mut self, mesh: &ChunkMesh) -> Result<GpuHandle, GpuError> {
        self.check_limits(mesh)?;

        let vertex_bytes = mesh_vertex_bytes(mesh);
        let index_bytes = mesh_index_bytes(mesh);
        let vertex_capacity_bytes = grow_capacity(vertex_bytes);
        let index_capacity_bytes = grow_capacity(index_bytes);

        let vertex_buffer = create_vertex_buffer(&self.device, vertex_capacity_bytes);
        let index_buffer = create_index_buffer(&self.device, index_capacity_bytes);

        if vertex_bytes > 0 {
            self.queue
                .write_buffer(&vertex_buffer, 0, bytemuck::cast_slice(&mesh.vertices));
        }
        if index_bytes > 0 {
            self.queue
                .write_buffer(&index_buffer, 0, bytemuck::cast_slice(&mesh.indices));
        }

        self.next_handle += 1;
        let handle = GpuHandle(self.next_handle);
        self.chunks.insert(
            handle,
            ChunkRenderData {
                vertex_buffer,
                index_buffer,
                index_count: mesh.indices.len() as u32,
                vertex_count: mesh.vertices.len() as u32,
                vertex_capacity_bytes,
                index_capacity_bytes,
            },
        );
        self.stats.uploaded_bytes += vertex_bytes + index_bytes;
        self.stats.buffer_reallocations += 2;
        Ok(handle)
    }

    fn update_vertex_buffer(&mut self, handle: GpuHandle, mesh: &ChunkMesh) -> Result<(), GpuError> {
        self.check_limits(mesh)?;

        let chunk = self
            .chunks
            .get_mut(&handle)
            .ok_or(GpuError::UnknownHandle(handle))?;
        let vertex_bytes = mesh_vertex_bytes(mesh);
        let index_bytes = mesh_index_bytes(mesh);

        if vertex_bytes > chunk.vertex_capacity_bytes {
            chunk.vertex_capacity_bytes = grow_capacity(vertex_bytes);
            chunk.vertex_buffer = create_vertex_buffer(&self.device, chunk.vertex_capacity_bytes);
            self.stats.buffer_reallocations += 1;
        }

        if index_bytes > chunk.index_capacity_bytes {
            chunk.index_capacity_bytes = grow_capacity(index_bytes);
            chunk.index_buffer = create_index_buffer(&self.device, chunk.index_capacity_bytes);
            self.stats.buffer_reallocations += 1;
        }

        if vertex_bytes > 0 {
            self.queue
                .write_buffer(&chunk.vertex_buffer, 0, bytemuck::cast_slice(&mesh.vertices));
        }
        if index_bytes > 0 {
            self.queue
                .write_buffer(&chunk.index_buffer, 0, bytemuck::cast_slice(&mesh.indices));
        }

        chunk.vertex_count = mesh.vertices.len() as u32;
        chunk.index_count = mesh.indices.len() as u32;
        self.stats.uploaded_bytes += vertex_bytes + index_bytes;
        Ok(())
    }

    fn destroy(&mut self, handle: GpuHandle) {
        if let Some(chunk) = self.chunks.remove(&handle) {
            chunk.vertex_buffer.destroy();
            chunk.index_buffer.destroy();
            debug!("Destroyed chunk buffers {}", handle.0);
        }
    }
}

/// Issues indexed draws for chunk handles into an open render pass.
pub struct WgpuChunkPass<'p, 'e> {
    pass: &'p mut wgpu::RenderPass<'e>,
    buffers: &'p WgpuChunkBuffers,
    stats: ChunkPassStats,
}

impl WgpuChunkPass<'_, '_> {
    pub fn stats(&self) -> ChunkPassStats {
        self.stats
    }
}

impl ChunkDrawer for WgpuChunkPass<'_, '_> {
    fn draw(&mut self, handle: GpuHandle, _vertex_count: u32) {
        let Some(chunk) = self.buffers.chunks.get(&handle) else {
            return;
        };
        if chunk.index_count == 0 {
            return;
        }

        self.pass.set_vertex_buffer(0, chunk.vertex_buffer.slice(..));
        self.pass
            .set_index_buffer(chunk.index_buffer.slice(..), wgpu::IndexFormat::Uint32);
        self.pass.draw_indexed(0..chunk.index_count, 0, 0..1);

        self.stats.draw_calls += 1;
        self.stats.rendered_indices += u64::from(chunk.index_count);
        self.stats.rendered_vertices += u64::from(chunk.vertex_count);
    }
}

fn mesh_vertex_bytes(mesh: &ChunkMesh) -> u64 {
    (mesh.vertices.len() * mem::size_of::<ChunkVertex>()) as u64
}

fn mesh_index_bytes(mesh: &ChunkMesh) -> u64 {
    (mesh.indices.len() * mem::size_of::<u32>()) as u64
}

fn grow_capacity(required: u64) -> u64 {
    required.max(4).next_power_of_two()
}

fn create_vertex_buffer(device: &wgpu::Device, size: u64) -> wgpu::Buffer {
    device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("Chunk Vertex Buffer"),
        size,
        usage: wgpu::BufferUsages::VERTEX | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    })
}

fn create_index_buffer(device: &wgpu::Device, size: u64) -> wgpu::Buffer {
    device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("Chunk Index Buffer"),
        size,
        usage: wgpu::BufferUsages::INDEX | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    })
}
