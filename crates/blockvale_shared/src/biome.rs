use crate::block::BlockId;
use crate::noise_field::OctaveNoise;

const TEMPERATURE_SCALE: f64 = 800.0;
const MOISTURE_SCALE: f64 = 600.0;
const VARIATION_SCALE: f64 = 400.0;
const MOUNTAIN_VARIATION: f64 = 0.55;
const OCEAN_VARIATION: f64 = -0.55;
const BLEND_RADIUS: i32 = 8;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum TreeSpecies {
    Oak,
    Spruce,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Biome {
    Ocean,
    Plains,
    Forest,
    Desert,
    Mountains,
    Taiga,
    Swamp,
    SnowyTundra,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct BiomeDescriptor {
    pub surface: BlockId,
    pub subsurface: BlockId,
    pub stone: BlockId,
    pub base_height: f64,
    pub height_variation: f64,
    pub tree_density: f64,
    pub tree_species: Option<TreeSpecies>,
}

const fn descriptor(
    surface: BlockId,
    subsurface: BlockId,
    base_height: f64,
    height_variation: f64,
    tree_density: f64,
    tree_species: Option<TreeSpecies>,
) -> BiomeDescriptor {
    BiomeDescriptor {
        surface,
        subsurface,
        stone: BlockId::STONE,
        base_height,
        height_variation,
        tree_density,
        tree_species,
    }
}

const OCEAN: BiomeDescriptor = descriptor(BlockId::SAND, BlockId::SAND, 55.0, 5.0, 0.0, None);
const PLAINS: BiomeDescriptor = descriptor(
    BlockId::GRASS,
    BlockId::DIRT,
    65.0,
    8.0,
    0.02,
    Some(TreeSpecies::Oak),
);
const FOREST: BiomeDescriptor = descriptor(
    BlockId::GRASS,
    BlockId::DIRT,
    67.0,
    12.0,
    0.15,
    Some(TreeSpecies::Oak),
);
const DESERT: BiomeDescriptor = descriptor(BlockId::SAND, BlockId::SAND, 64.0, 15.0, 0.0, None);
const MOUNTAINS: BiomeDescriptor =
    descriptor(BlockId::STONE, BlockId::STONE, 80.0, 40.0, 0.0, None);
const TAIGA: BiomeDescriptor = descriptor(
    BlockId::GRASS,
    BlockId::DIRT,
    66.0,
    10.0,
    0.12,
    Some(TreeSpecies::Spruce),
);
const SWAMP: BiomeDescriptor = descriptor(
    BlockId::GRASS,
    BlockId::DIRT,
    62.0,
    4.0,
    0.08,
    Some(TreeSpecies::Oak),
);
const SNOWY_TUNDRA: BiomeDescriptor =
    descriptor(BlockId::SNOW, BlockId::DIRT, 63.0, 6.0, 0.0, None);

impl Biome {
    pub const ALL: [Biome; 8] = [
        Biome::Ocean,
        Biome::Plains,
        Biome::Forest,
        Biome::Desert,
        Biome::Mountains,
        Biome::Taiga,
        Biome::Swamp,
        Biome::SnowyTundra,
    ];

    pub fn descriptor(self) -> &'static BiomeDescriptor {
        match self {
            Biome::Ocean => &OCEAN,
            Biome::Plains => &PLAINS,
            Biome::Forest => &FOREST,
            Biome::Desert => &DESERT,
            Biome::Mountains => &MOUNTAINS,
            Biome::Taiga => &TAIGA,
            Biome::Swamp => &SWAMP,
            Biome::SnowyTundra => &SNOWY_TUNDRA,
        }
    }
}

/// Climate sample at one column. Temperature and moisture are in [0, 1];
/// variation is the raw field in [-1, 1].
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Climate {
    pub temperature: f64,
    pub moisture: f64,
    pub variation: f64,
}

impl Climate {
    pub fn classify(&self) -> Biome {
        let t = self.temperature;
        let m = self.moisture;

        if t < 0.25 {
            if self.variation > MOUNTAIN_VARIATION {
                Biome::Mountains
            } else if m < 0.33 {
                Biome::SnowyTundra
            } else {
                Biome::Taiga
            }
        } else if t < 0.75 {
            if self.variation > MOUNTAIN_VARIATION {
                Biome::Mountains
            } else if self.variation < OCEAN_VARIATION {
                Biome::Ocean
            } else if m < 0.33 {
                Biome::Desert
            } else if m < 0.66 {
                Biome::Plains
            } else {
                Biome::Forest
            }
        } else if self.variation < OCEAN_VARIATION {
            Biome::Ocean
        } else if m < 0.5 {
            Biome::Desert
        } else if m < 0.75 {
            Biome::Plains
        } else {
            Biome::Swamp
        }
    }
}

#[derive(Clone, Debug)]
pub struct BiomeClassifier {
    temperature: OctaveNoise,
    moisture: OctaveNoise,
    variation: OctaveNoise,
}

impl BiomeClassifier {
    pub fn new(seed: u64) -> Self {
        Self {
            temperature: OctaveNoise::new(seed, 4),
            moisture: OctaveNoise::new(seed.wrapping_add(1000), 4),
            variation: OctaveNoise::new(seed.wrapping_add(2000), 3),
        }
    }

    pub fn climate(&self, world_x: i32, world_z: i32) -> Climate {
        let x = f64::from(world_x);
        let z = f64::from(world_z);
        Climate {
            temperature: self.temperature.sample_2d_unit(x, z, TEMPERATURE_SCALE, 0.5),
            moisture: self.moisture.sample_2d_unit(x, z, MOISTURE_SCALE, 0.5),
            variation: self.variation.sample_2d(x, z, VARIATION_SCALE, 0.6),
        }
    }

    pub fn biome_at(&self, world_x: i32, world_z: i32) -> Biome {
        self.climate(world_x, world_z).classify()
    }

    /// Inverse-distance weighted base height over the surrounding biomes.
    pub fn blended_height(&self, world_x: i32, world_z: i32) -> i32 {
        let mut total_height = 0.0;
        let mut total_weight = 0.0;

        for dx in -BLEND_RADIUS..=BLEND_RADIUS {
            for dz in -BLEND_RADIUS..=BLEND_RADIUS {
                let biome = self.biome_at(world_x + dx, world_z + dz);
                let distance = f64::from(dx * dx + dz * dz).sqrt();
                let weight = 1.0 / (1.0 + distance);

                total_height += biome.descriptor().base_height * weight;
                total_weight += weight;
            }
        }

        (total_height / total_weight) as i32
    }
}
