use std::f64::consts::PI;

use glam::{DVec3, IVec3};

use crate::block::BlockId;
use crate::coords::{column_origin, ColumnPos};
use crate::noise_field::chunk_seed;
use crate::worldgen::VoxelAccess;

const STEP_LENGTH: f64 = 0.7;
const ANGLE_JITTER: f64 = 0.3;
const MAX_DISPLACEMENT_FACTOR: f64 = 0.8;
const ORE_SALT: u64 = 0x0BE5;

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct OreConfig {
    pub block: BlockId,
    pub min_y: i32,
    pub max_y: i32,
    pub vein_size: u32,
    pub veins_per_chunk: u32,
    pub rarity: f64,
}

pub const DEFAULT_ORES: [OreConfig; 4] = [
    OreConfig {
        block: BlockId::COAL_ORE,
        min_y: 5,
        max_y: 128,
        vein_size: 8,
        veins_per_chunk: 20,
        rarity: 1.0,
    },
    OreConfig {
        block: BlockId::IRON_ORE,
        min_y: 5,
        max_y: 64,
        vein_size: 6,
        veins_per_chunk: 15,
        rarity: 0.9,
    },
    OreConfig {
        block: BlockId::COPPER_ORE,
        min_y: 5,
        max_y: 96,
        vein_size: 7,
        veins_per_chunk: 12,
        rarity: 0.85,
    },
    OreConfig {
        block: BlockId::DIAMOND_ORE,
        min_y: 5,
        max_y: 16,
        vein_size: 4,
        veins_per_chunk: 3,
        rarity: 0.6,
    },
];

impl OreConfig {
    pub fn contains_y(&self, y: i32) -> bool {
        (self.min_y..=self.max_y).contains(&y)
    }
}

#[derive(Clone, Debug)]
pub struct OreDistributor {
    seed: u64,
    ores: Vec<OreConfig>,
}

impl OreDistributor {
    pub fn new(seed: u64) -> Self {
        Self::with_ores(seed, DEFAULT_ORES.to_vec())
    }

    pub fn with_ores(seed: u64, ores: Vec<OreConfig>) -> Self {
        Self { seed, ores }
    }

    pub fn ores(&self) -> &[OreConfig] {
        &self.ores
    }

    /// Seeds every configured vein for the column at `pos`. Returns the number of ore blocks placed.
    pub fn distribute(&self, world: &mut dyn VoxelAccess, pos: ColumnPos) -> usize {
        let size = world.shape().size as i32;
        let origin = column_origin(pos, world.shape().size);
        let mut rng = fastrand::Rng::with_seed(chunk_seed(self.seed, pos.x, pos.z, ORE_SALT));
        let mut placed = 0;

        for config in &self.ores {
            for _ in 0..config.veins_per_chunk {
                if rng.f64() > config.rarity {
                    continue;
                }

                let start = IVec3::new(
                    origin.x + rng.i32(0..size),
                    rng.i32(config.min_y..=config.max_y),
                    origin.z + rng.i32(0..size),
                );
                placed += generate_vein(world, &mut rng, start, config);
            }
        }

        placed
    }
}

/// Random walk from `start` that replaces stone with ore.
fn generate_vein(
    world: &mut dyn VoxelAccess,
    rng: &mut fastrand::Rng,
    start: IVec3,
    config: &OreConfig,
) -> usize {
    if !config.contains_y(start.y) {
        return 0;
    }

    let mut pitch = rng.f64() * PI;
    let mut heading = rng.f64() * PI * 2.0;
    let origin = start.as_dvec3();
    let mut cursor = origin;
    let limit = f64::from(config.vein_size) * MAX_DISPLACEMENT_FACTOR;
    let mut placed = 0;

    for _ in 0..config.vein_size {
        let cell = cursor.round().as_ivec3();
        if config.contains_y(cell.y) && world.get_if_loaded(cell) == Some(BlockId::STONE) {
            world.set_block(cell, config.block);
            placed += 1;
        }

        cursor += DVec3::new(
            pitch.sin() * heading.cos(),
            pitch.cos(),
            pitch.sin() * heading.sin(),
        ) * STEP_LENGTH;

        pitch += (rng.f64() - 0.5) * ANGLE_JITTER;
        heading += (rng.f64() - 0.5) * ANGLE_JITTER;

        if cursor.distance(origin) > limit {
            break;
        }
    }

    placed
}
