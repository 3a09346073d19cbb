use std::sync::Arc;

use blockvale_core::events::{self, EventReceiver, EventSender};
use blockvale_core::jobs::{catch_job, JobSystem};
use blockvale_shared::block::BlockRegistry;
use blockvale_shared::chunk::ChunkData;
use blockvale_shared::coords::ColumnPos;

use crate::renderer::mesh::{build_chunk_mesh, ChunkMesh, ChunkNeighbors, MeshingMode};

pub struct MeshRequest {
    pub chunk_pos: ColumnPos,
    pub chunk: ChunkData,
    // Neighbor order: +X, -X, +Z, -Z
    pub neighbors: [Option<ChunkData>; 4],
    pub registry: Arc<BlockRegistry>,
    pub mode: MeshingMode,
    pub version: u64,
}

/// `Err` carries the panic message of a mesh job that did not finish.
#[derive(Debug)]
pub struct MeshResult {
    pub chunk_pos: ColumnPos,
    pub mesh: Result<ChunkMesh, String>,
    pub version: u64,
}

pub type MeshBuilder = Arc<dyn Fn(&MeshRequest) -> ChunkMesh + Send + Sync>;

impl MeshRequest {
    /// Builds the mesh on the calling thread.
    pub fn build(&self) -> ChunkMesh {
        let neighbors = neighbors_from_array(&self.neighbors);
        build_chunk_mesh(
            self.mode,
            &self.chunk,
            &self.registry,
            &neighbors,
            self.chunk_pos,
        )
    }
}

pub struct MeshWorker {
    jobs: Arc<JobSystem>,
    builder: MeshBuilder,
    completed_rx: EventReceiver<MeshResult>,
    completed_tx: EventSender<MeshResult>,
}

impl MeshWorker {
    pub fn new(jobs: Arc<JobSystem>) -> Self {
        Self::with_builder(jobs, Arc::new(|request: &MeshRequest| request.build()))
    }

    pub fn with_builder(jobs: Arc<JobSystem>, builder: MeshBuilder) -> Self {
        let (completed_tx, completed_rx) = events::channel();

        Self {
            jobs,
            builder,
            completed_rx,
            completed_tx,
        }
    }

    /// Every submitted request produces exactly one result, even when the build panics.
    pub fn submit(&self, request: MeshRequest) {
        let completed_tx = self.completed_tx.clone();
        let builder = Arc::clone(&self.builder);
        self.jobs.spawn(move || {
            let mesh = catch_job(|| builder(&request));
            let _ = completed_tx.send(MeshResult {
                chunk_pos: request.chunk_pos,
                mesh,
                version: request.version,
            });
        });
    }

    pub fn poll(&self) -> Vec<MeshResult> {
        self.completed_rx.drain()
    }
}

pub fn neighbors_from_array(arr: &[Option<ChunkData>; 4]) -> ChunkNeighbors<'_> {
    ChunkNeighbors {
        pos_x: arr[0].as_ref(),
        neg_x: arr[1].as_ref(),
        pos_z: arr[2].as_ref(),
        neg_z: arr[3].as_ref(),
    }
}
