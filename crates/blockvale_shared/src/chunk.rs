use crate::block::BlockId;
use crate::coords::{ColumnShape, LocalPos};

/// Dense block storage for one full-height column, laid out `x + S * (z + S * y)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkData {
    shape: ColumnShape,
    blocks: Box<[BlockId]>,
}

impl ChunkData {
    pub fn new_empty(shape: ColumnShape) -> Self {
        Self::new_filled(shape, BlockId::AIR)
    }

    pub fn new_filled(shape: ColumnShape, block: BlockId) -> Self {
        Self {
            shape,
            blocks: vec![block; shape.volume()].into_boxed_slice(),
        }
    }

    pub fn shape(&self) -> ColumnShape {
        self.shape
    }

    pub fn get(&self, local: LocalPos) -> BlockId {
        self.blocks[self.shape.local_to_index(local)]
    }

    pub fn set(&mut self, local: LocalPos, block: BlockId) {
        let index = self.shape.local_to_index(local);
        self.blocks[index] = block;
    }

    /// Signed lookup; `None` outside the column.
    pub fn get_xyz(&self, x: i32, y: i32, z: i32) -> Option<BlockId> {
        if !self.shape.contains(x, y, z) {
            return None;
        }
        let size = self.shape.size;
        Some(self.blocks[x as usize + size * (z as usize + size * y as usize)])
    }

    /// Signed write; returns `false` without touching storage outside the column.
    pub fn set_xyz(&mut self, x: i32, y: i32, z: i32, block: BlockId) -> bool {
        if !self.shape.contains(x, y, z) {
            return false;
        }
        let size = self.shape.size;
        self.blocks[x as usize + size * (z as usize + size * y as usize)] = block;
        true
    }

    pub fn get_index(&self, index: usize) -> BlockId {
        self.blocks[index]
    }

    pub fn set_index(&mut self, index: usize, block: BlockId) {
        self.blocks[index] = block;
    }

    /// Highest non-air y in the column at `(x, z)`, scanning from `height - 2` down to 1.
    pub fn surface_y(&self, x: i32, z: i32) -> Option<i32> {
        let top = self.shape.height as i32 - 2;
        (1..=top)
            .rev()
            .find(|&y| self.get_xyz(x, y, z).is_some_and(|block| !block.is_air()))
    }

    pub fn blocks(&self) -> &[BlockId] {
        &self.blocks
    }
}

impl Default for ChunkData {
    fn default() -> Self {
        Self::new_empty(ColumnShape::default())
    }
}
