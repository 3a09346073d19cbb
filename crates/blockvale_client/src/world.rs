use std::time::Instant;

use blockvale_shared::block::BlockId;
use blockvale_shared::chunk::ChunkData;
use blockvale_shared::coords::{column_of, world_to_local, ColumnPos, ColumnShape};
use blockvale_shared::worldgen::VoxelAccess;
use glam::{IVec3, Vec2, Vec3};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, info};

use crate::chunk::Chunk;
use crate::config::PipelineSettings;
use crate::pipeline::PipelineManager;
use crate::renderer::{ChunkDrawer, GpuBackend, GpuHandle};
use crate::streaming::{horizontal_forward, StreamingConfig};

/// What a single `update_streaming` call changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamingUpdate {
    pub desired: usize,
    pub requested: usize,
    pub unloaded: usize,
    pub dropped_writes: usize,
}

/// Loaded columns and everything the context thread tracks about them.
pub struct World {
    shape: ColumnShape,
    streaming: StreamingConfig,
    chunks: FxHashMap<ColumnPos, Chunk>,
    queued_writes: FxHashMap<ColumnPos, Vec<(IVec3, BlockId)>>,
    handle_owners: FxHashMap<GpuHandle, ColumnPos>,
    desired: Option<FxHashSet<ColumnPos>>,
    center: Option<ColumnPos>,
}

impl World {
    pub fn new(shape: ColumnShape, streaming: StreamingConfig) -> Self {
        Self {
            shape,
            streaming,
            chunks: FxHashMap::default(),
            queued_writes: FxHashMap::default(),
            handle_owners: FxHashMap::default(),
            desired: None,
            center: None,
        }
    }

    pub fn from_settings(settings: &PipelineSettings) -> Self {
        Self::new(settings.column_shape(), StreamingConfig::from_settings(settings))
    }

    pub fn shape(&self) -> ColumnShape {
        self.shape
    }

    pub fn streaming(&self) -> &StreamingConfig {
        &self.streaming
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn contains(&self, pos: ColumnPos) -> bool {
        self.chunks.contains_key(&pos)
    }

    pub fn chunk(&self, pos: ColumnPos) -> Option<&Chunk> {
        self.chunks.get(&pos)
    }

    pub fn chunk_mut(&mut self, pos: ColumnPos) -> Option<&mut Chunk> {
        self.chunks.get_mut(&pos)
    }

    pub fn loaded_positions(&self) -> Vec<ColumnPos> {
        self.chunks.keys().copied().collect()
    }

    pub fn for_each_loaded_chunk(&self, mut f: impl FnMut(&Chunk)) {
        for chunk in self.chunks.values() {
            f(chunk);
        }
    }

    /// Column the observer stood in at the last streaming update.
    pub fn center(&self) -> Option<ColumnPos> {
        self.center
    }

    /// Before the first streaming update every column counts as wanted.
    pub fn is_wanted(&self, pos: ColumnPos) -> bool {
        self.desired
            .as_ref()
            .map_or(true, |desired| desired.contains(&pos))
    }

    pub fn neighbours_present(&self, pos: ColumnPos) -> bool {
        pos.ring_neighbors()
            .iter()
            .all(|neighbor| self.chunks.contains_key(neighbor))
    }

    /// Air for unloaded columns and positions outside the vertical range.
    pub fn get_block(&self, pos: IVec3) -> BlockId {
        let Some((column, local)) = world_to_local(pos, self.shape) else {
            return BlockId::AIR;
        };
        self.chunks
            .get(&column)
            .map_or(BlockId::AIR, |chunk| chunk.data().get(local))
    }

    /// Writes into a loaded column and dirties it together with any face
    /// neighbour sharing the edited boundary. Writes to columns that are not
    /// loaded yet are queued and replayed right after their terrain fill.
    pub fn set_block(&mut self, pos: IVec3, block: BlockId) {
        let Some((column, local)) = world_to_local(pos, self.shape) else {
            debug!("Ignoring write outside the vertical range at {pos:?}");
            return;
        };

        let Some(chunk) = self.chunks.get_mut(&column) else {
            self.queued_writes
                .entry(column)
                .or_default()
                .push((pos, block));
            return;
        };

        if chunk.data().get(local) == block {
            return;
        }
        chunk.data_mut().set(local, block);
        chunk.mark_dirty();

        let edge = self.shape.size as u8 - 1;
        let mut touched = Vec::with_capacity(2);
        if local.x == 0 {
            touched.push(column + ColumnPos::new(-1, 0));
        } else if local.x == edge {
            touched.push(column + ColumnPos::new(1, 0));
        }
        if local.z == 0 {
            touched.push(column + ColumnPos::new(0, -1));
        } else if local.z == edge {
            touched.push(column + ColumnPos::new(0, 1));
        }
        for neighbor in touched {
            if let Some(chunk) = self.chunks.get_mut(&neighbor) {
                chunk.mark_dirty();
            }
        }
    }

    pub fn surface_height(&self, world_x: i32, world_z: i32) -> Option<i32> {
        let (column, local) = world_to_local(IVec3::new(world_x, 0, world_z), self.shape)?;
        self.chunks
            .get(&column)?
            .data()
            .surface_y(i32::from(local.x), i32::from(local.z))
    }

    pub fn queued_write_count(&self, pos: ColumnPos) -> usize {
        self.queued_writes.get(&pos).map_or(0, Vec::len)
    }

    /// Registers freshly generated terrain. Queued writes for the column are
    /// applied to `data` first, in issue order, and then forgotten. Returns the
    /// number of replayed writes.
    pub fn insert_generated(&mut self, pos: ColumnPos, mut data: ChunkData) -> usize {
        let replayed = self.queued_writes.remove(&pos).unwrap_or_default();
        for (world_pos, block) in &replayed {
            if let Some((_, local)) = world_to_local(*world_pos, data.shape()) {
                data.set(local, *block);
            }
        }
        if !replayed.is_empty() {
            debug!("Replayed {} queued write(s) into chunk {pos:?}", replayed.len());
        }

        self.chunks.insert(pos, Chunk::new(pos, data));
        for neighbor in pos.face_neighbors() {
            if let Some(chunk) = self.chunks.get_mut(&neighbor) {
                chunk.mark_dirty();
            }
        }
        replayed.len()
    }

    /// Frees the column's GPU resources and forgets it. Face neighbours are
    /// dirtied so their border faces come back.
    pub fn remove_chunk(&mut self, pos: ColumnPos, gpu: &mut dyn GpuBackend) -> Option<Chunk> {
        let mut chunk = self.chunks.remove(&pos)?;
        if let Some(handle) = chunk.clear_upload() {
            gpu.destroy(handle);
            self.release_handle(handle, pos);
        }

        for neighbor in pos.face_neighbors() {
            if let Some(chunk) = self.chunks.get_mut(&neighbor) {
                chunk.mark_dirty();
            }
        }

        info!("Unloaded chunk {pos:?}");
        Some(chunk)
    }

    /// Records `pos` as the owner of `handle`. Fails with the current owner when
    /// another loaded chunk still holds the same handle.
    pub fn claim_handle(&mut self, handle: GpuHandle, pos: ColumnPos) -> Result<(), ColumnPos> {
        if let Some(&owner) = self.handle_owners.get(&handle) {
            let still_held = owner != pos
                && self
                    .chunks
                    .get(&owner)
                    .is_some_and(|chunk| chunk.gpu_handle() == Some(handle));
            if still_held {
                return Err(owner);
            }
        }
        self.handle_owners.insert(handle, pos);
        Ok(())
    }

    pub fn release_handle(&mut self, handle: GpuHandle, pos: ColumnPos) {
        if self.handle_owners.get(&handle) == Some(&pos) {
            self.handle_owners.remove(&handle);
        }
    }

    /// Owned copies of the column and its four face neighbours (+X, -X, +Z, -Z).
    pub fn snapshot_with_neighbors(
        &self,
        pos: ColumnPos,
    ) -> Option<(ChunkData, [Option<ChunkData>; 4])> {
        let chunk = self.chunks.get(&pos)?;
        let neighbors = pos
            .face_neighbors()
            .map(|neighbor| self.chunks.get(&neighbor).map(|chunk| chunk.data().clone()));
        Some((chunk.data().clone(), neighbors))
    }

    pub fn render_distance(&self) -> f32 {
        ((self.streaming.load_radius + self.streaming.forward_bonus) as usize * self.shape.size) as f32
    }

    /// Issues one draw per uploaded, non-empty chunk in range. Returns the draw count.
    pub fn draw_visible(&self, observer: Vec3, drawer: &mut dyn ChunkDrawer) -> usize {
        let render_distance = self.render_distance();
        let mut draws = 0;
        for chunk in self.chunks.values() {
            let Some(handle) = chunk.gpu_handle() else {
                continue;
            };
            if !chunk.is_uploaded()
                || chunk.vertex_count() == 0
                || !chunk.is_visible(observer, render_distance)
            {
                continue;
            }
            drawer.draw(handle, chunk.vertex_count());
            draws += 1;
        }
        draws
    }

    /// Recomputes the desired set around the observer, requests missing columns
    /// nearest first and unloads columns past the unload radius whose grace
    /// period has elapsed.
    pub fn update_streaming(
        &mut self,
        observer: Vec3,
        forward: Vec3,
        pipeline: &PipelineManager,
        gpu: &mut dyn GpuBackend,
    ) -> StreamingUpdate {
        let size = self.shape.size;
        let observer_block = observer.floor().as_ivec3();
        let center = column_of(observer_block.x, observer_block.z, size);
        let forward = horizontal_forward(forward);

        let desired = self.streaming.desired_columns(center, forward);
        let desired_set: FxHashSet<ColumnPos> = desired.iter().copied().collect();
        pipeline.cancel_unwanted(|pos| desired_set.contains(&pos));

        let mut update = StreamingUpdate {
            desired: desired.len(),
            ..StreamingUpdate::default()
        };
        for pos in desired {
            if !self.chunks.contains_key(&pos) && pipeline.request_generation(pos) {
                update.requested += 1;
            }
        }

        let now = Instant::now();
        let grace = self.streaming.unload_grace;
        let mut to_remove: Vec<ColumnPos> = self
            .chunks
            .values()
            .filter(|chunk| {
                self.streaming.should_unload(center, chunk.pos(), forward) && chunk.age(now) >= grace
            })
            .map(Chunk::pos)
            .collect();
        to_remove.sort_by_key(|pos| (pos.x, pos.z));
        for pos in to_remove {
            if self.remove_chunk(pos, gpu).is_some() {
                update.unloaded += 1;
            }
        }

        update.dropped_writes = self.prune_queued_writes(center, forward);

        if self.center != Some(center) {
            debug!(
                "Streaming around {center:?}: desired={} requested={} unloaded={} dropped_writes={}",
                update.desired, update.requested, update.unloaded, update.dropped_writes
            );
        }
        self.center = Some(center);
        self.desired = Some(desired_set);
        update
    }

    /// Forgets queued writes for columns past the unload radius or the world limit.
    fn prune_queued_writes(&mut self, center: ColumnPos, forward: Vec2) -> usize {
        let streaming = &self.streaming;
        let mut dropped = 0;
        self.queued_writes.retain(|pos, writes| {
            let keep = !streaming.should_unload(center, *pos, forward);
            if !keep {
                dropped += writes.len();
            }
            keep
        });
        dropped
    }
}

impl VoxelAccess for World {
    fn shape(&self) -> ColumnShape {
        self.shape
    }

    fn is_column_loaded(&self, pos: ColumnPos) -> bool {
        self.contains(pos)
    }

    fn get_if_loaded(&self, pos: IVec3) -> Option<BlockId> {
        let (column, local) = world_to_local(pos, self.shape)?;
        self.chunks.get(&column).map(|chunk| chunk.data().get(local))
    }

    fn set_block(&mut self, pos: IVec3, block: BlockId) {
        World::set_block(self, pos, block);
    }

    fn surface_height(&self, world_x: i32, world_z: i32) -> Option<i32> {
        World::surface_height(self, world_x, world_z)
    }
}

#[cfg(test)]
mod tests {
    use blockvale_shared::block::BlockId;
    use blockvale_shared::chunk::ChunkData;
    use blockvale_shared::coords::{ColumnPos, ColumnShape};
    use glam::{IVec3, Vec2, Vec3};

    use super::World;
    use crate::renderer::{GpuBackend, GpuHandle, HeadlessBackend};
    use crate::renderer::mesh::ChunkMesh;
    use crate::streaming::StreamingConfig;

    fn shape() -> ColumnShape {
        ColumnShape::new(16, 64)
    }

    fn world_with(columns: &[(i32, i32)]) -> World {
        let mut world = World::new(shape(), StreamingConfig::default());
        for &(x, z) in columns {
            world.insert_generated(ColumnPos::new(x, z), ChunkData::new_empty(shape()));
        }
        world
    }

    fn clear_dirty(world: &mut World) {
        for pos in world.loaded_positions() {
            let chunk = world.chunk_mut(pos).expect("loaded");
            chunk.begin_mesh(1);
            let _ = chunk.offer_mesh(1, ChunkMesh::default());
            let _ = chunk.take_pending_mesh();
        }
    }

    #[test]
    fn unloaded_and_out_of_range_reads_are_air() {
        let world = world_with(&[(0, 0)]);
        assert_eq!(world.get_block(IVec3::new(100, 10, 100)), BlockId::AIR);
        assert_eq!(world.get_block(IVec3::new(0, -1, 0)), BlockId::AIR);
        assert_eq!(world.get_block(IVec3::new(0, 64, 0)), BlockId::AIR);
        assert_eq!(world.surface_height(100, 100), None);
    }

    #[test]
    fn set_block_round_trips_and_dirties_boundary_neighbours() {
        let mut world = world_with(&[(0, 0), (-1, 0), (1, 0), (0, -1), (0, 1)]);
        clear_dirty(&mut world);

        let interior = IVec3::new(5, 20, 5);
        world.set_block(interior, BlockId::STONE);
        assert_eq!(world.get_block(interior), BlockId::STONE);
        assert!(world.chunk(ColumnPos::new(0, 0)).expect("owner").is_dirty());
        assert!(!world.chunk(ColumnPos::new(-1, 0)).expect("west").is_dirty());

        clear_dirty(&mut world);
        let corner = IVec3::new(0, 20, 15);
        world.set_block(corner, BlockId::GLASS);
        assert_eq!(world.get_block(corner), BlockId::GLASS);
        assert!(world.chunk(ColumnPos::new(0, 0)).expect("owner").is_dirty());
        assert!(world.chunk(ColumnPos::new(-1, 0)).expect("west").is_dirty());
        assert!(world.chunk(ColumnPos::new(0, 1)).expect("south").is_dirty());
        assert!(!world.chunk(ColumnPos::new(1, 0)).expect("east").is_dirty());
        assert!(!world.chunk(ColumnPos::new(0, -1)).expect("north").is_dirty());
    }

    #[test]
    fn negative_coordinates_map_to_the_right_column() {
        let mut world = world_with(&[(-1, -1)]);
        world.set_block(IVec3::new(-1, 3, -16), BlockId::DIRT);
        let chunk = world.chunk(ColumnPos::new(-1, -1)).expect("loaded");
        assert_eq!(chunk.data().get_xyz(15, 3, 0), Some(BlockId::DIRT));
        assert_eq!(world.surface_height(-1, -16), Some(3));
    }

    #[test]
    fn queued_writes_replay_once_in_issue_order() {
        let mut world = world_with(&[]);
        let pos = IVec3::new(20, 10, 4);
        world.set_block(pos, BlockId::STONE);
        world.set_block(pos, BlockId::GLASS);
        world.set_block(IVec3::new(21, 10, 4), BlockId::SAND);
        assert_eq!(world.queued_write_count(ColumnPos::new(1, 0)), 3);
        assert_eq!(world.get_block(pos), BlockId::AIR);

        let filled = ChunkData::new_filled(shape(), BlockId::DIRT);
        assert_eq!(world.insert_generated(ColumnPos::new(1, 0), filled), 3);
        assert_eq!(world.get_block(pos), BlockId::GLASS);
        assert_eq!(world.get_block(IVec3::new(21, 10, 4)), BlockId::SAND);
        assert_eq!(world.queued_write_count(ColumnPos::new(1, 0)), 0);

        world.remove_chunk(ColumnPos::new(1, 0), &mut HeadlessBackend::new());
        let again = ChunkData::new_filled(shape(), BlockId::DIRT);
        assert_eq!(world.insert_generated(ColumnPos::new(1, 0), again), 0);
        assert_eq!(world.get_block(pos), BlockId::DIRT);
    }

    #[test]
    fn queued_writes_for_far_columns_are_dropped() {
        let mut world = world_with(&[]);
        world.set_block(IVec3::new(20, 10, 4), BlockId::STONE);
        world.set_block(IVec3::new(16 * 40, 10, 0), BlockId::STONE);
        world.set_block(IVec3::new(16 * 40 + 1, 10, 0), BlockId::GLASS);

        assert_eq!(world.prune_queued_writes(ColumnPos::new(0, 0), Vec2::X), 2);
        assert_eq!(world.queued_write_count(ColumnPos::new(1, 0)), 1);
        assert_eq!(world.queued_write_count(ColumnPos::new(40, 0)), 0);
        assert_eq!(world.prune_queued_writes(ColumnPos::new(0, 0), Vec2::X), 0);
    }

    #[test]
    fn for_each_loaded_chunk_visits_every_column() {
        let world = world_with(&[(0, 0), (3, -2), (-7, 9)]);
        let mut seen = Vec::new();
        world.for_each_loaded_chunk(|chunk| seen.push(chunk.pos()));
        seen.sort_by_key(|pos| (pos.x, pos.z));
        assert_eq!(
            seen,
            vec![ColumnPos::new(-7, 9), ColumnPos::new(0, 0), ColumnPos::new(3, -2)]
        );
    }

    #[test]
    fn handle_claims_reject_handles_held_by_another_chunk() {
        let mut world = world_with(&[(0, 0), (1, 0)]);
        let a = ColumnPos::new(0, 0);
        let b = ColumnPos::new(1, 0);

        assert_eq!(world.claim_handle(GpuHandle(1), a), Ok(()));
        world.chunk_mut(a).expect("a").mark_uploaded(GpuHandle(1), 6);
        assert_eq!(world.claim_handle(GpuHandle(1), b), Err(a));
        assert_eq!(world.claim_handle(GpuHandle(1), a), Ok(()));

        let mut gpu = HeadlessBackend::new();
        world.remove_chunk(a, &mut gpu);
        assert_eq!(world.claim_handle(GpuHandle(1), b), Ok(()));
    }

    #[test]
    fn draw_visible_skips_empty_and_unuploaded_chunks() {
        let mut world = world_with(&[(0, 0), (1, 0), (2, 0)]);
        let mut gpu = HeadlessBackend::new();
        let mesh = ChunkMesh::default();

        let empty = gpu.create_vertex_buffer(&mesh).expect("create");
        world.chunk_mut(ColumnPos::new(0, 0)).expect("loaded").mark_uploaded(empty, 0);
        let full = gpu.create_vertex_buffer(&mesh).expect("create");
        world.chunk_mut(ColumnPos::new(1, 0)).expect("loaded").mark_uploaded(full, 36);

        let draws = world.draw_visible(Vec3::new(8.0, 40.0, 8.0), &mut gpu);
        assert_eq!(draws, 1);
        assert_eq!(gpu.drawn(), &[full]);
    }
}
