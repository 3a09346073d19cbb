pub mod biome;
pub mod block;
pub mod caves;
pub mod chunk;
pub mod coords;
pub mod noise_field;
pub mod ores;
pub mod terrain;
pub mod trees;
pub mod worldgen;

#[cfg(test)]
mod test_world;
