pub mod chunk_renderer;
pub mod context;
pub mod mesh;
pub mod pipeline;

use std::fmt;

use rustc_hash::FxHashMap;

use crate::renderer::mesh::ChunkMesh;

/// Opaque identifier for a chunk's GPU resources.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GpuHandle(pub u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GpuError {
    UnknownHandle(GpuHandle),
    MeshTooLarge { vertices: usize, indices: usize },
    Backend(String),
}

impl fmt::Display for GpuError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownHandle(handle) => write!(f, "unknown gpu handle {}", handle.0),
            Self::MeshTooLarge { vertices, indices } => write!(
                f,
                "mesh with {vertices} vertices and {indices} indices exceeds buffer limits"
            ),
            Self::Backend(reason) => write!(f, "gpu backend error: {reason}"),
        }
    }
}

impl std::error::Error for GpuError {}

/// Owner of per-chunk vertex resources. Only the ticking thread calls into it.
pub trait GpuBackend {
    fn create_vertex_buffer(&mut self, mesh: &ChunkMesh) -> Result<GpuHandle, GpuError>;

    fn update_vertex_buffer(&mut self, handle: GpuHandle, mesh: &ChunkMesh) -> Result<(), GpuError>;

    fn destroy(&mut self, handle: GpuHandle);
}

pub trait ChunkDrawer {
    fn draw(&mut self, handle: GpuHandle, vertex_count: u32);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeadlessBuffer {
    pub vertex_count: u32,
    pub index_count: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeadlessStats {
    pub creates: u32,
    pub updates: u32,
    pub destroys: u32,
    pub draws: u32,
}

/// CPU-side bookkeeping backend with the same contract as the wgpu one.
#[derive(Debug, Default)]
pub struct HeadlessBackend {
    buffers: FxHashMap<GpuHandle, HeadlessBuffer>,
    next_handle: u64,
    pending_failures: u32,
    stats: HeadlessStats,
    drawn: Vec<GpuHandle>,
}

impl HeadlessBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `count` create/update calls return an error.
    pub fn fail_next(&mut self, count: u32) {
        self.pending_failures = count;
    }

    /// Rewinds handle allocation so subsequent creates reuse low ids.
    pub fn reset_handle_counter(&mut self) {
        self.next_handle = 0;
    }

    pub fn buffer(&self, handle: GpuHandle) -> Option<&HeadlessBuffer> {
        self.buffers.get(&handle)
    }

    pub fn live_buffers(&self) -> usize {
        self.buffers.len()
    }

    pub fn stats(&self) -> HeadlessStats {
        self.stats
    }

    pub fn drawn(&self) -> &[GpuHandle] {
        &self.drawn
    }

    pub fn clear_drawn(&mut self) {
        self.drawn.clear();
    }

    fn take_failure(&mut self) -> Result<(), GpuError> {
        if self.pending_failures > 0 {
            self.pending_failures -= 1;
            return Err(GpuError::Backend("injected failure".to_string()));
        }
        Ok(())
    }
}

impl GpuBackend for HeadlessBackend {
    fn create_vertex_buffer(&mut self, mesh: &ChunkMesh) -> Result<GpuHandle, GpuError> {
        self.take_failure()?;

        self.next_handle += 1;
        let handle = GpuHandle(self.next_handle);
        self.buffers.insert(
            handle,
            HeadlessBuffer {
                vertex_count: mesh.vertices.len() as u32,
                index_count: mesh.indices.len() as u32,
            },
        );
        self.stats.creates += 1;
        Ok(handle)
    }

    fn update_vertex_buffer(&mut self, handle: GpuHandle, mesh: &ChunkMesh) -> Result<(), GpuError> {
        self.take_failure()?;

        let buffer = self
            .buffers
            .get_mut(&handle)
            .ok_or(GpuError::UnknownHandle(handle))?;
        buffer.vertex_count = mesh.vertices.len() as u32;
        buffer.index_count = mesh.indices.len() as u32;
        self.stats.updates += 1;
        Ok(())
    }

    fn destroy(&mut self, handle: GpuHandle) {
        if self.buffers.remove(&handle).is_some() {
            self.stats.destroys += 1;
        }
    }
}

impl ChunkDrawer for HeadlessBackend {
    fn draw(&mut self, handle: GpuHandle, _vertex_count: u32) {
        if self.buffers.contains_key(&handle) {
            self.stats.draws += 1;
            self.drawn.push(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{GpuBackend, GpuError, GpuHandle, HeadlessBackend};
    use crate::renderer::mesh::ChunkMesh;

    #[test]
    fn headless_backend_tracks_buffer_lifecycle() {
        let mut backend = HeadlessBackend::new();
        let mesh = ChunkMesh::default();

        let a = backend.create_vertex_buffer(&mesh).expect("create a");
        let b = backend.create_vertex_buffer(&mesh).expect("create b");
        assert_ne!(a, b);
        assert_eq!(backend.live_buffers(), 2);

        backend.update_vertex_buffer(a, &mesh).expect("update");
        backend.destroy(a);
        backend.destroy(a);

        assert_eq!(backend.live_buffers(), 1);
        assert_eq!(backend.stats().destroys, 1);
        assert_eq!(
            backend.update_vertex_buffer(a, &mesh),
            Err(GpuError::UnknownHandle(a))
        );
        assert!(backend.buffer(b).is_some());
        assert!(backend.buffer(GpuHandle(99)).is_none());
    }

    #[test]
    fn injected_failures_are_consumed_in_order() {
        let mut backend = HeadlessBackend::new();
        backend.fail_next(1);

        assert!(backend.create_vertex_buffer(&ChunkMesh::default()).is_err());
        assert!(backend.create_vertex_buffer(&ChunkMesh::default()).is_ok());
    }
}
