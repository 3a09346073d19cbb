use std::time::{Duration, Instant};

use bitflags::bitflags;
use blockvale_shared::chunk::ChunkData;
use blockvale_shared::coords::ColumnPos;
use glam::Vec3;

use crate::renderer::mesh::ChunkMesh;
use crate::renderer::GpuHandle;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ChunkFlags: u8 {
        const DIRTY          = 0b0000_0001;
        const UPLOADED       = 0b0000_0010;
        const POST_PROCESSED = 0b0000_0100;
        const MESH_IN_FLIGHT = 0b0000_1000;
    }
}

/// A finished CPU mesh waiting for the context thread to upload it.
#[derive(Debug, Clone)]
pub struct PendingMesh {
    pub mesh: ChunkMesh,
    pub version: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeshOffer {
    Accepted,
    /// The mesh was built for a job this chunk no longer waits on.
    Stale,
    /// A previous mesh has not been consumed yet.
    Occupied,
}

/// One loaded column: block storage plus its render lifecycle state.
#[derive(Debug)]
pub struct Chunk {
    pos: ColumnPos,
    data: ChunkData,
    flags: ChunkFlags,
    pending_mesh: Option<PendingMesh>,
    gpu_handle: Option<GpuHandle>,
    vertex_count: u32,
    mesh_version: u64,
    created_at: Instant,
}

impl Chunk {
    /// Freshly generated chunks start dirty so they get meshed once eligible.
    pub fn new(pos: ColumnPos, data: ChunkData) -> Self {
        Self::created_at(pos, data, Instant::now())
    }

    pub fn created_at(pos: ColumnPos, data: ChunkData, created_at: Instant) -> Self {
        Self {
            pos,
            data,
            flags: ChunkFlags::DIRTY,
            pending_mesh: None,
            gpu_handle: None,
            vertex_count: 0,
            mesh_version: 0,
            created_at,
        }
    }

    pub fn pos(&self) -> ColumnPos {
        self.pos
    }

    pub fn data(&self) -> &ChunkData {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut ChunkData {
        &mut self.data
    }

    pub fn flags(&self) -> ChunkFlags {
        self.flags
    }

    pub fn is_dirty(&self) -> bool {
        self.flags.contains(ChunkFlags::DIRTY)
    }

    pub fn mark_dirty(&mut self) {
        self.flags.insert(ChunkFlags::DIRTY);
    }

    pub fn is_uploaded(&self) -> bool {
        self.flags.contains(ChunkFlags::UPLOADED)
    }

    pub fn is_post_processed(&self) -> bool {
        self.flags.contains(ChunkFlags::POST_PROCESSED)
    }

    pub fn mark_post_processed(&mut self) {
        self.flags.insert(ChunkFlags::POST_PROCESSED);
    }

    pub fn is_mesh_in_flight(&self) -> bool {
        self.flags.contains(ChunkFlags::MESH_IN_FLIGHT)
    }

    pub fn has_pending_mesh(&self) -> bool {
        self.pending_mesh.is_some()
    }

    /// True when neither a mesh job nor an unconsumed mesh exists.
    pub fn is_mesh_idle(&self) -> bool {
        !self.is_mesh_in_flight() && !self.has_pending_mesh()
    }

    pub fn mesh_version(&self) -> u64 {
        self.mesh_version
    }

    /// Records a submitted mesh job. Edits made after this point dirty the chunk again.
    pub fn begin_mesh(&mut self, version: u64) {
        self.mesh_version = version;
        self.flags.remove(ChunkFlags::DIRTY);
        self.flags.insert(ChunkFlags::MESH_IN_FLIGHT);
    }

    pub fn offer_mesh(&mut self, version: u64, mesh: ChunkMesh) -> MeshOffer {
        if version != self.mesh_version || !self.is_mesh_in_flight() {
            return MeshOffer::Stale;
        }

        self.flags.remove(ChunkFlags::MESH_IN_FLIGHT);
        if self.pending_mesh.is_some() {
            self.mark_dirty();
            return MeshOffer::Occupied;
        }

        self.pending_mesh = Some(PendingMesh { mesh, version });
        MeshOffer::Accepted
    }

    /// Gives up on the in-flight job `version` and queues a rebuild. Returns
    /// `false` when the chunk no longer waits on that job.
    pub fn abort_mesh(&mut self, version: u64) -> bool {
        if version != self.mesh_version || !self.is_mesh_in_flight() {
            return false;
        }
        self.flags.remove(ChunkFlags::MESH_IN_FLIGHT);
        self.mark_dirty();
        true
    }

    pub fn take_pending_mesh(&mut self) -> Option<PendingMesh> {
        self.pending_mesh.take()
    }

    pub fn gpu_handle(&self) -> Option<GpuHandle> {
        self.gpu_handle
    }

    pub fn vertex_count(&self) -> u32 {
        self.vertex_count
    }

    pub fn mark_uploaded(&mut self, handle: GpuHandle, vertex_count: u32) {
        self.gpu_handle = Some(handle);
        self.vertex_count = vertex_count;
        self.flags.insert(ChunkFlags::UPLOADED);
    }

    /// Drops the upload state and hands back the handle so the caller can free it.
    pub fn clear_upload(&mut self) -> Option<GpuHandle> {
        self.flags.remove(ChunkFlags::UPLOADED);
        self.vertex_count = 0;
        self.gpu_handle.take()
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
    }

    /// Horizontal distance culling against the column centre, in blocks.
    pub fn is_visible(&self, observer: Vec3, render_distance: f32) -> bool {
        let size = self.data.shape().size as f32;
        let center_x = self.pos.x as f32 * size + size * 0.5;
        let center_z = self.pos.z as f32 * size + size * 0.5;
        let dx = center_x - observer.x;
        let dz = center_z - observer.z;
        dx * dx + dz * dz <= render_distance * render_distance
    }
}
