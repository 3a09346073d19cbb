use glam::IVec3;

use crate::biome::{BiomeClassifier, TreeSpecies};
use crate::block::BlockId;
use crate::coords::{column_origin, ColumnPos};
use crate::noise_field::chunk_seed;
use crate::worldgen::VoxelAccess;

const ATTEMPTS_PER_CHUNK: u32 = 8;
const TREE_SALT: u64 = 0x7EE5;
const CANOPY_HEADROOM: i32 = 6;
const SURFACE_HEADROOM: i32 = 16;

/// Builds one tree whose trunk starts at `base`.
pub trait TreeShape {
    /// Returns `false` without writing anything when the site is unsuitable.
    fn grow(&self, world: &mut dyn VoxelAccess, rng: &mut fastrand::Rng, base: IVec3) -> bool;
}

#[derive(Copy, Clone, Debug, Default)]
pub struct OakTree;

#[derive(Copy, Clone, Debug, Default)]
pub struct SpruceTree;

impl TreeSpecies {
    pub fn shape(self) -> &'static dyn TreeShape {
        match self {
            TreeSpecies::Oak => &OakTree,
            TreeSpecies::Spruce => &SpruceTree,
        }
    }
}

fn can_place_tree(world: &dyn VoxelAccess, base: IVec3, height: i32) -> bool {
    let ceiling = world.shape().height as i32 - CANOPY_HEADROOM;
    if base.y < 1 || base.y + height > ceiling {
        return false;
    }

    let ground = world.get_if_loaded(base - IVec3::Y);
    if !matches!(ground, Some(BlockId::GRASS) | Some(BlockId::DIRT)) {
        return false;
    }

    (0..height).all(|dy| world.get_if_loaded(base + IVec3::Y * dy) == Some(BlockId::AIR))
}

fn place_log(world: &mut dyn VoxelAccess, pos: IVec3, log: BlockId) {
    world.set_block(pos, log);
}

fn place_leaves(world: &mut dyn VoxelAccess, pos: IVec3, leaves: BlockId) {
    if world.get_if_loaded(pos) == Some(BlockId::AIR) {
        world.set_block(pos, leaves);
    }
}

impl TreeShape for OakTree {
    fn grow(&self, world: &mut dyn VoxelAccess, rng: &mut fastrand::Rng, base: IVec3) -> bool {
        let trunk_height = 4 + rng.i32(0..3);
        if !can_place_tree(world, base, trunk_height + 4) {
            return false;
        }

        for dy in 0..trunk_height {
            place_log(world, base + IVec3::Y * dy, BlockId::OAK_LOG);
        }

        let leaf_start = trunk_height - 2;
        let leaf_layers = 4;
        for layer in 0..leaf_layers {
            let y = base.y + leaf_start + layer;
            let radius = if layer == leaf_layers - 1 { 1 } else { 2 };

            for dx in -radius..=radius {
                for dz in -radius..=radius {
                    // Trim the ring tips so canopies are not perfect squares.
                    if dx * dx + dz * dz == radius * radius && rng.f32() < 0.3 {
                        continue;
                    }
                    place_leaves(world, IVec3::new(base.x + dx, y, base.z + dz), BlockId::OAK_LEAVES);
                }
            }
        }

        true
    }
}

impl TreeShape for SpruceTree {
    fn grow(&self, world: &mut dyn VoxelAccess, rng: &mut fastrand::Rng, base: IVec3) -> bool {
        let trunk_height = 6 + rng.i32(0..4);
        if !can_place_tree(world, base, trunk_height + 3) {
            return false;
        }

        for dy in 0..trunk_height {
            place_log(world, base + IVec3::Y * dy, BlockId::SPRUCE_LOG);
        }

        for dy in 2..trunk_height {
            let layers_from_top = trunk_height - dy;
            let radius = ((layers_from_top + 1) / 2).min(2);

            for dx in -radius..=radius {
                for dz in -radius..=radius {
                    if dx == 0 && dz == 0 {
                        continue;
                    }
                    place_leaves(
                        world,
                        IVec3::new(base.x + dx, base.y + dy, base.z + dz),
                        BlockId::SPRUCE_LEAVES,
                    );
                }
            }
        }
        place_leaves(world, base + IVec3::Y * trunk_height, BlockId::SPRUCE_LEAVES);

        true
    }
}

#[derive(Clone, Debug)]
pub struct TreePlacer {
    seed: u64,
}

impl TreePlacer {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    /// Tries a fixed number of candidate columns in `pos`. Returns how many trees grew.
    pub fn place(&self, world: &mut dyn VoxelAccess, biomes: &BiomeClassifier, pos: ColumnPos) -> usize {
        let shape = world.shape();
        let size = shape.size as i32;
        let surface_limit = shape.height as i32 - SURFACE_HEADROOM;
        let origin = column_origin(pos, shape.size);
        let mut rng = fastrand::Rng::with_seed(chunk_seed(self.seed, pos.x, pos.z, TREE_SALT));
        let mut grown = 0;

        for _ in 0..ATTEMPTS_PER_CHUNK {
            let x = origin.x + rng.i32(0..size);
            let z = origin.z + rng.i32(0..size);
            let descriptor = biomes.biome_at(x, z).descriptor();

            if rng.f64() >= descriptor.tree_density {
                continue;
            }
            let Some(species) = descriptor.tree_species else {
                continue;
            };
            let Some(surface) = world.surface_height(x, z) else {
                continue;
            };
            if surface <= 0 || surface >= surface_limit {
                continue;
            }

            if species.shape().grow(world, &mut rng, IVec3::new(x, surface + 1, z)) {
                grown += 1;
            }
        }

        grown
    }
}
