use std::fmt;

use glam::IVec3;
use tracing::debug;

use crate::biome::BiomeClassifier;
use crate::block::{register_default_blocks, BlockId, BlockRegistry};
use crate::caves::CaveCarver;
use crate::chunk::ChunkData;
use crate::coords::{column_origin, ColumnPos, ColumnShape};
use crate::ores::OreDistributor;
use crate::terrain::TerrainModel;
use crate::trees::TreePlacer;

pub const SEA_LEVEL: i32 = 60;
pub const MAX_COLUMN_SIZE: usize = 256;
pub const MIN_COLUMN_HEIGHT: usize = 8;

/// Block-level read/write over whatever columns are currently registered.
pub trait VoxelAccess {
    fn shape(&self) -> ColumnShape;

    fn is_column_loaded(&self, pos: ColumnPos) -> bool;

    /// `None` when the owning column is not loaded or `pos.y` is out of range.
    fn get_if_loaded(&self, pos: IVec3) -> Option<BlockId>;

    fn set_block(&mut self, pos: IVec3, block: BlockId);

    fn surface_height(&self, world_x: i32, world_z: i32) -> Option<i32>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationError {
    InvalidShape(ColumnShape),
    Failed(String),
    Panicked(String),
}

impl fmt::Display for GenerationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidShape(shape) => write!(
                f,
                "invalid column shape {}x{}x{}",
                shape.size, shape.height, shape.size
            ),
            Self::Failed(reason) => write!(f, "chunk generation failed: {reason}"),
            Self::Panicked(reason) => write!(f, "chunk generation panicked: {reason}"),
        }
    }
}

impl std::error::Error for GenerationError {}

/// Produces terrain for a column and decorates it once its neighbourhood exists.
pub trait ChunkSource: Send + Sync {
    fn generate(&self, pos: ColumnPos, shape: ColumnShape) -> Result<ChunkData, GenerationError>;

    /// Mutates the 3x3 neighbourhood around `pos`. Returns `false` with no writes
    /// when any of the nine columns is missing.
    fn post_process(&self, world: &mut dyn VoxelAccess, pos: ColumnPos) -> bool;
}

pub fn neighbourhood_loaded(world: &dyn VoxelAccess, pos: ColumnPos) -> bool {
    world.is_column_loaded(pos)
        && pos
            .ring_neighbors()
            .iter()
            .all(|neighbor| world.is_column_loaded(*neighbor))
}

#[derive(Debug, Clone)]
pub struct WorldGenerator {
    pub seed: u64,
    registry: BlockRegistry,
    biomes: BiomeClassifier,
    terrain: TerrainModel,
    caves: CaveCarver,
    ores: OreDistributor,
    trees: TreePlacer,
}

impl WorldGenerator {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            registry: register_default_blocks(),
            biomes: BiomeClassifier::new(seed),
            terrain: TerrainModel::new(seed),
            caves: CaveCarver::new(seed),
            ores: OreDistributor::new(seed),
            trees: TreePlacer::new(seed),
        }
    }

    pub fn biomes(&self) -> &BiomeClassifier {
        &self.biomes
    }

    pub fn terrain(&self) -> &TerrainModel {
        &self.terrain
    }

    pub fn terrain_height(&self, world_x: i32, world_z: i32, world_height: usize) -> i32 {
        self.terrain
            .height_at(&self.biomes, world_x, world_z, world_height)
    }

    /// Writes one full-height column. Depends only on the seed and `(world_x, world_z)`.
    pub fn generate_column(
        &self,
        chunk: &mut ChunkData,
        local_x: i32,
        local_z: i32,
        world_x: i32,
        world_z: i32,
    ) {
        let shape = chunk.shape();
        let biome = self.biomes.biome_at(world_x, world_z);
        let descriptor = biome.descriptor();
        let height = self.terrain.height(biome, world_x, world_z, shape.height);
        let surface_depth = self.terrain.surface_depth(biome, world_x, world_z);
        let subsurface_depth = self.terrain.subsurface_depth(world_x, world_z);

        for y in 0..shape.height as i32 {
            let block = if y == 0 {
                BlockId::BEDROCK
            } else if y < height - surface_depth - subsurface_depth {
                descriptor.stone
            } else if y < height - surface_depth {
                descriptor.subsurface
            } else if y < height {
                descriptor.surface
            } else if y < SEA_LEVEL {
                BlockId::WATER
            } else {
                BlockId::AIR
            };
            chunk.set_xyz(local_x, y, local_z, block);
        }
    }

    pub fn fill_chunk(&self, pos: ColumnPos, shape: ColumnShape) -> Result<ChunkData, GenerationError> {
        if shape.size == 0 || shape.size > MAX_COLUMN_SIZE || shape.height < MIN_COLUMN_HEIGHT {
            return Err(GenerationError::InvalidShape(shape));
        }

        let mut chunk = ChunkData::new_empty(shape);
        let origin = column_origin(pos, shape.size);
        let size = shape.size as i32;

        for local_x in 0..size {
            for local_z in 0..size {
                self.generate_column(
                    &mut chunk,
                    local_x,
                    local_z,
                    origin.x + local_x,
                    origin.z + local_z,
                );
            }
        }

        Ok(chunk)
    }

    /// Caves, then ores, then trees. Returns `false` without side effects
    /// unless all eight neighbours are present.
    pub fn post_process_chunk(&self, world: &mut dyn VoxelAccess, pos: ColumnPos) -> bool {
        if !neighbourhood_loaded(world, pos) {
            return false;
        }

        let carved = self.caves.carve(world, &self.registry, pos);
        let ores = self.ores.distribute(world, pos);
        let trees = self.trees.place(world, &self.biomes, pos);
        debug!("Post-processed chunk {pos:?}: carved {carved}, ores {ores}, trees {trees}");
        true
    }
}

impl ChunkSource for WorldGenerator {
    fn generate(&self, pos: ColumnPos, shape: ColumnShape) -> Result<ChunkData, GenerationError> {
        self.fill_chunk(pos, shape)
    }

    fn post_process(&self, world: &mut dyn VoxelAccess, pos: ColumnPos) -> bool {
        self.post_process_chunk(world, pos)
    }
}
