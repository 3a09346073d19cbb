use std::collections::HashMap;

use glam::IVec3;

use crate::block::BlockId;
use crate::chunk::ChunkData;
use crate::coords::{world_to_local, ColumnPos, ColumnShape};
use crate::worldgen::VoxelAccess;

/// Map-backed world used by generator tests.
pub(crate) struct ColumnMap {
    pub shape: ColumnShape,
    pub columns: HashMap<ColumnPos, ChunkData>,
}

impl ColumnMap {
    pub fn new(shape: ColumnShape) -> Self {
        Self {
            shape,
            columns: HashMap::new(),
        }
    }

    /// Fills a `(2 * radius + 1)^2` block of columns around `center` using `fill`.
    pub fn filled_around(
        shape: ColumnShape,
        center: ColumnPos,
        radius: i32,
        mut fill: impl FnMut(ColumnPos) -> ChunkData,
    ) -> Self {
        let mut map = Self::new(shape);
        for dz in -radius..=radius {
            for dx in -radius..=radius {
                let pos = ColumnPos::new(center.x + dx, center.z + dz);
                map.columns.insert(pos, fill(pos));
            }
        }
        map
    }
}

impl VoxelAccess for ColumnMap {
    fn shape(&self) -> ColumnShape {
        self.shape
    }

    fn is_column_loaded(&self, pos: ColumnPos) -> bool {
        self.columns.contains_key(&pos)
    }

    fn get_if_loaded(&self, pos: IVec3) -> Option<BlockId> {
        let (column, local) = world_to_local(pos, self.shape)?;
        self.columns.get(&column).map(|chunk| chunk.get(local))
    }

    fn set_block(&mut self, pos: IVec3, block: BlockId) {
        let Some((column, local)) = world_to_local(pos, self.shape) else {
            return;
        };
        if let Some(chunk) = self.columns.get_mut(&column) {
            chunk.set(local, block);
        }
    }

    fn surface_height(&self, world_x: i32, world_z: i32) -> Option<i32> {
        let (column, local) = world_to_local(IVec3::new(world_x, 0, world_z), self.shape)?;
        self.columns
            .get(&column)?
            .surface_y(i32::from(local.x), i32::from(local.z))
    }
}
