pub mod app;
pub mod chunk;
pub mod config;
pub mod mesh_worker;
pub mod pipeline;
pub mod renderer;
pub mod streaming;
pub mod world;
