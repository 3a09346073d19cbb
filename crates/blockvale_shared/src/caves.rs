use glam::IVec3;

use crate::block::{BlockId, BlockRegistry};
use crate::coords::{column_origin, ColumnPos};
use crate::noise_field::{chunk_seed, OctaveNoise};
use crate::worldgen::VoxelAccess;

const WORM_SCALE: f64 = 40.0;
const WORM_PERSISTENCE: f64 = 0.6;
const WORM_THRESHOLD: f64 = 0.6;
const WORM_MIN_Y: i32 = 5;
const WORM_SURFACE_MARGIN: i32 = 5;
const WORM_BIAS_CENTER: f64 = 64.0;

const CAVERN_CHANCE: f64 = 0.05;
const CAVERN_SCALE: f64 = 80.0;
const CAVERN_THRESHOLD: f64 = 0.65;
const CAVERN_HEIGHT_SCALE: f64 = 30.0;
const CAVERN_MIN_Y: i32 = 5;
const CAVERN_SALT: u64 = 0xCA7E;

/// Worm tunnels plus rare large caverns, carved into already generated terrain.
#[derive(Clone, Debug)]
pub struct CaveCarver {
    seed: u64,
    worm: OctaveNoise,
    cavern: OctaveNoise,
    cavern_height: OctaveNoise,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Cavern {
    pub center_y: i32,
    pub height: i32,
}

impl CaveCarver {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            worm: OctaveNoise::new(seed, 4),
            cavern: OctaveNoise::new(seed.wrapping_add(1000), 3),
            cavern_height: OctaveNoise::new(seed.wrapping_add(2000), 2),
        }
    }

    /// Carves worm caves then caverns for the column at `pos`. Returns the number of blocks removed.
    pub fn carve(&self, world: &mut dyn VoxelAccess, registry: &BlockRegistry, pos: ColumnPos) -> usize {
        self.carve_worms(world, registry, pos) + self.carve_cavern(world, registry, pos)
    }

    /// Height-biased worm density; tunnels form where this exceeds the carve threshold.
    pub fn worm_density(&self, world_x: i32, y: i32, world_z: i32) -> f64 {
        let noise = self.worm.sample_3d(
            f64::from(world_x),
            f64::from(y),
            f64::from(world_z),
            WORM_SCALE,
            WORM_PERSISTENCE,
        );
        let vertical_bias = 1.0 - ((f64::from(y) - WORM_BIAS_CENTER) / WORM_BIAS_CENTER).abs();
        noise * vertical_bias
    }

    pub fn cavern_for(&self, pos: ColumnPos) -> Option<Cavern> {
        let mut rng = fastrand::Rng::with_seed(chunk_seed(self.seed, pos.x, pos.z, CAVERN_SALT));
        if rng.f64() > CAVERN_CHANCE {
            return None;
        }
        Some(Cavern {
            center_y: 20 + rng.i32(0..40),
            height: 15 + rng.i32(0..15),
        })
    }

    fn carve_worms(&self, world: &mut dyn VoxelAccess, registry: &BlockRegistry, pos: ColumnPos) -> usize {
        let size = world.shape().size as i32;
        let origin = column_origin(pos, world.shape().size);
        let mut carved = 0;

        for x in 0..size {
            for z in 0..size {
                let wx = origin.x + x;
                let wz = origin.z + z;
                let Some(surface) = world.surface_height(wx, wz) else {
                    continue;
                };

                for y in WORM_MIN_Y..surface - WORM_SURFACE_MARGIN {
                    if self.worm_density(wx, y, wz) > WORM_THRESHOLD {
                        carved += carve_block(world, registry, IVec3::new(wx, y, wz));
                    }
                }
            }
        }

        carved
    }

    fn carve_cavern(&self, world: &mut dyn VoxelAccess, registry: &BlockRegistry, pos: ColumnPos) -> usize {
        let Some(cavern) = self.cavern_for(pos) else {
            return 0;
        };

        let shape = world.shape();
        let size = shape.size as i32;
        let max_y = shape.height as i32 - 6;
        let origin = column_origin(pos, shape.size);
        let mut carved = 0;

        for x in 0..size {
            for z in 0..size {
                let wx = origin.x + x;
                let wz = origin.z + z;
                let strength = self
                    .cavern
                    .sample_2d(f64::from(wx), f64::from(wz), CAVERN_SCALE, 0.5);
                if strength <= CAVERN_THRESHOLD {
                    continue;
                }

                let variation = self.cavern_height.sample_2d(
                    f64::from(wx),
                    f64::from(wz),
                    CAVERN_HEIGHT_SCALE,
                    0.5,
                );
                let local_height = cavern.height + (variation * 5.0) as i32;
                let min_y = (cavern.center_y - local_height / 2).max(CAVERN_MIN_Y);
                let top_y = (cavern.center_y + local_height / 2).min(max_y);

                for y in min_y..top_y {
                    carved += carve_block(world, registry, IVec3::new(wx, y, wz));
                }
            }
        }

        carved
    }
}

fn carve_block(world: &mut dyn VoxelAccess, registry: &BlockRegistry, pos: IVec3) -> usize {
    match world.get_if_loaded(pos) {
        Some(block) if registry.is_solid(block) => {
            world.set_block(pos, BlockId::AIR);
            1
        }
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::CaveCarver;
    use crate::block::{register_default_blocks, BlockId};
    use crate::chunk::ChunkData;
    use crate::coords::{ColumnPos, ColumnShape};
    use crate::test_world::ColumnMap;

    fn stone_column(shape: ColumnShape, surface: i32) -> ChunkData {
        let mut chunk = ChunkData::new_empty(shape);
        for y in 0..=surface {
            for z in 0..shape.size as i32 {
                for x in 0..shape.size as i32 {
                    let block = if y == 0 { BlockId::BEDROCK } else { BlockId::STONE };
                    chunk.set_xyz(x, y, z, block);
                }
            }
        }
        chunk
    }

    #[test]
    fn carving_only_turns_solid_blocks_into_air_above_the_floor() {
        let shape = ColumnShape::new(16, 128);
        let registry = register_default_blocks();
        let carver = CaveCarver::new(2024);

        for cx in 0..6 {
            let pos = ColumnPos::new(cx, -cx);
            let mut world = ColumnMap::filled_around(shape, pos, 1, |_| stone_column(shape, 100));
            let before = world.columns.get(&pos).cloned().expect("center column");

            carver.carve(&mut world, &registry, pos);

            let after = world.columns.get(&pos).expect("center column");
            for (index, (old, new)) in before.blocks().iter().zip(after.blocks()).enumerate() {
                if old != new {
                    assert_eq!(*new, BlockId::AIR);
                    assert!(registry.is_solid(*old));
                    let local = shape.index_to_local(index);
                    assert!(local.y >= 5, "carved below the cave floor at {local:?}");
                }
            }
        }
    }

    #[test]
    fn carving_is_deterministic_for_a_seed() {
        let shape = ColumnShape::new(16, 128);
        let registry = register_default_blocks();
        let pos = ColumnPos::new(3, 7);

        let mut first = ColumnMap::filled_around(shape, pos, 1, |_| stone_column(shape, 90));
        let mut second = ColumnMap::filled_around(shape, pos, 1, |_| stone_column(shape, 90));

        let a = CaveCarver::new(77).carve(&mut first, &registry, pos);
        let b = CaveCarver::new(77).carve(&mut second, &registry, pos);

        assert_eq!(a, b);
        assert_eq!(first.columns.get(&pos), second.columns.get(&pos));
    }

    #[test]
    fn caverns_are_rare_and_within_bounds() {
        let carver = CaveCarver::new(9);
        let mut found = 0;
        for cx in -40..40 {
            for cz in -10..10 {
                if let Some(cavern) = carver.cavern_for(ColumnPos::new(cx, cz)) {
                    found += 1;
                    assert!((20..60).contains(&cavern.center_y));
                    assert!((15..30).contains(&cavern.height));
                }
            }
        }
        assert!(found > 0);
        assert!(found < 1600 / 5, "caverns should be rare, found {found}");
    }
}
