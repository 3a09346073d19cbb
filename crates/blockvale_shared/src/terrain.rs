use crate::biome::{Biome, BiomeClassifier};
use crate::noise_field::OctaveNoise;

const CONTINENT_SCALE: f64 = 2000.0;
const TERRAIN_SCALE: f64 = 300.0;
const DETAIL_SCALE: f64 = 80.0;
const RIDGE_SCALE: f64 = 200.0;

/// Column height model layered on top of the biome classifier.
#[derive(Clone, Debug)]
pub struct TerrainModel {
    continent: OctaveNoise,
    terrain: OctaveNoise,
    detail: OctaveNoise,
}

impl TerrainModel {
    pub fn new(seed: u64) -> Self {
        Self {
            continent: OctaveNoise::new(seed, 4),
            terrain: OctaveNoise::new(seed.wrapping_add(100), 5),
            detail: OctaveNoise::new(seed.wrapping_add(200), 3),
        }
    }

    /// Terrain height for a column already classified as `biome`, clamped to `[1, world_height - 2]`.
    pub fn height(&self, biome: Biome, world_x: i32, world_z: i32, world_height: usize) -> i32 {
        let x = f64::from(world_x);
        let z = f64::from(world_z);
        let descriptor = biome.descriptor();

        let mut height = descriptor.base_height;
        height += self.continent.sample_2d(x, z, CONTINENT_SCALE, 0.5) * 15.0;
        height += self.terrain.sample_2d(x, z, TERRAIN_SCALE, 0.55) * descriptor.height_variation;
        height += self.detail.sample_2d(x, z, DETAIL_SCALE, 0.6) * 4.0;

        if biome == Biome::Mountains {
            let ridge = self.terrain.sample_2d(x, z, RIDGE_SCALE, 0.65);
            height += (ridge * 30.0).max(0.0);
        }

        let top = (world_height as i32 - 2).max(1);
        (height as i32).clamp(1, top)
    }

    pub fn surface_depth(&self, biome: Biome, world_x: i32, world_z: i32) -> i32 {
        if biome != Biome::Desert {
            return 1;
        }
        let n = self
            .detail
            .sample_2d(f64::from(world_x), f64::from(world_z), 50.0, 0.5);
        4 + (n * 2.0) as i32
    }

    pub fn subsurface_depth(&self, world_x: i32, world_z: i32) -> i32 {
        let n = self.detail.sample_2d(
            f64::from(world_x) + 1000.0,
            f64::from(world_z) + 1000.0,
            40.0,
            0.5,
        );
        3 + (n * 2.0) as i32
    }

    /// Convenience wrapper that classifies the column first.
    pub fn height_at(&self, biomes: &BiomeClassifier, world_x: i32, world_z: i32, world_height: usize) -> i32 {
        self.height(biomes.biome_at(world_x, world_z), world_x, world_z, world_height)
    }
}
