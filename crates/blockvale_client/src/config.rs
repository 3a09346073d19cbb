use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;

use blockvale_shared::coords::ColumnShape;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::renderer::mesh::MeshingMode;

const MIN_CHUNK_SIZE: usize = 4;
const MAX_CHUNK_SIZE: usize = 64;
const MIN_WORLD_HEIGHT: usize = 16;
const MAX_WORLD_HEIGHT: usize = 1024;
const MIN_LOAD_RADIUS: i32 = 1;
const MAX_LOAD_RADIUS: i32 = 32;
const MIN_UNLOAD_MARGIN: i32 = 1;
const MAX_UNLOAD_MARGIN: i32 = 16;
const MAX_RADIUS_BIAS: i32 = 16;
const MIN_WORLD_LIMIT: i32 = 1;
const MAX_WORLD_LIMIT: i32 = 1 << 20;
const MAX_RETRIES: u32 = 10;
const MAX_RETRY_BACKOFF_MS: u64 = 60_000;
const MIN_PER_TICK: usize = 1;
const MAX_GENERATION_STARTS_PER_TICK: usize = 64;
const MAX_UPLOADS_PER_TICK: usize = 256;
const MAX_REBUILDS_PER_TICK: usize = 64;
const MIN_LIVENESS_SWEEP_INTERVAL: u32 = 1;
const MAX_LIVENESS_SWEEP_INTERVAL: u32 = 10_000;
const MAX_UNLOAD_GRACE_MS: u64 = 600_000;
const MAX_WORKER_THREADS: usize = 64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineSettings {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_world_height")]
    pub world_height: usize,
    #[serde(default = "default_load_radius")]
    pub load_radius: i32,
    #[serde(default = "default_unload_margin")]
    pub unload_margin: i32,
    #[serde(default = "default_forward_bonus")]
    pub forward_bonus: i32,
    #[serde(default = "default_backward_penalty")]
    pub backward_penalty: i32,
    #[serde(default = "default_world_limit")]
    pub world_limit: i32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: Vec<u64>,
    #[serde(default = "default_max_generation_starts_per_tick")]
    pub max_generation_starts_per_tick: usize,
    #[serde(default = "default_max_uploads_per_tick")]
    pub max_uploads_per_tick: usize,
    #[serde(default = "default_max_rebuilds_per_tick")]
    pub max_rebuilds_per_tick: usize,
    #[serde(default = "default_liveness_sweep_interval")]
    pub liveness_sweep_interval: u32,
    #[serde(default = "default_unload_grace_ms")]
    pub unload_grace_ms: u64,
    #[serde(default = "default_greedy_meshing")]
    pub greedy_meshing: bool,
    #[serde(default)]
    pub worker_threads: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            world_height: default_world_height(),
            load_radius: default_load_radius(),
            unload_margin: default_unload_margin(),
            forward_bonus: default_forward_bonus(),
            backward_penalty: default_backward_penalty(),
            world_limit: default_world_limit(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            max_generation_starts_per_tick: default_max_generation_starts_per_tick(),
            max_uploads_per_tick: default_max_uploads_per_tick(),
            max_rebuilds_per_tick: default_max_rebuilds_per_tick(),
            liveness_sweep_interval: default_liveness_sweep_interval(),
            unload_grace_ms: default_unload_grace_ms(),
            greedy_meshing: default_greedy_meshing(),
            worker_threads: 0,
            seed: default_seed(),
        }
    }
}

impl PipelineSettings {
    pub fn sanitize(mut self) -> Self {
        self.chunk_size = self.chunk_size.clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE);
        self.world_height = self.world_height.clamp(MIN_WORLD_HEIGHT, MAX_WORLD_HEIGHT);
        self.load_radius = self.load_radius.clamp(MIN_LOAD_RADIUS, MAX_LOAD_RADIUS);
        self.unload_margin = self.unload_margin.clamp(MIN_UNLOAD_MARGIN, MAX_UNLOAD_MARGIN);
        self.forward_bonus = self.forward_bonus.clamp(0, MAX_RADIUS_BIAS);
        // The backward load radius never drops below one column.
        self.backward_penalty = self
            .backward_penalty
            .clamp(0, (self.load_radius - 1).min(MAX_RADIUS_BIAS));
        self.world_limit = self.world_limit.clamp(MIN_WORLD_LIMIT, MAX_WORLD_LIMIT);
        self.max_retries = self.max_retries.min(MAX_RETRIES);
        if self.retry_backoff_ms.is_empty() {
            self.retry_backoff_ms = default_retry_backoff_ms();
        }
        for backoff in &mut self.retry_backoff_ms {
            *backoff = (*backoff).min(MAX_RETRY_BACKOFF_MS);
        }
        self.max_generation_starts_per_tick = self
            .max_generation_starts_per_tick
            .clamp(MIN_PER_TICK, MAX_GENERATION_STARTS_PER_TICK);
        self.max_uploads_per_tick = self
            .max_uploads_per_tick
            .clamp(MIN_PER_TICK, MAX_UPLOADS_PER_TICK);
        self.max_rebuilds_per_tick = self
            .max_rebuilds_per_tick
            .clamp(MIN_PER_TICK, MAX_REBUILDS_PER_TICK);
        self.liveness_sweep_interval = self
            .liveness_sweep_interval
            .clamp(MIN_LIVENESS_SWEEP_INTERVAL, MAX_LIVENESS_SWEEP_INTERVAL);
        self.unload_grace_ms = self.unload_grace_ms.min(MAX_UNLOAD_GRACE_MS);
        self.worker_threads = self.worker_threads.min(MAX_WORKER_THREADS);
        self
    }

    pub fn load(path: &Path) -> io::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let parsed = toml::from_str::<Self>(&contents).map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("failed to deserialize settings: {e}"),
            )
        })?;
        Ok(parsed.sanitize())
    }

    pub fn save(&self, path: &Path) -> io::Result<()> {
        let settings = self.clone().sanitize();
        let serialized = toml::to_string_pretty(&settings).map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("failed to serialize settings: {e}"),
            )
        })?;
        fs::write(path, serialized)
    }

    pub fn column_shape(&self) -> ColumnShape {
        ColumnShape::new(self.chunk_size, self.world_height)
    }

    pub fn meshing_mode(&self) -> MeshingMode {
        if self.greedy_meshing {
            MeshingMode::Greedy
        } else {
            MeshingMode::Naive
        }
    }

    pub fn unload_grace(&self) -> Duration {
        Duration::from_millis(self.unload_grace_ms)
    }

    pub fn worker_threads(&self) -> Option<usize> {
        (self.worker_threads > 0).then_some(self.worker_threads)
    }
}

fn default_chunk_size() -> usize {
    16
}

fn default_world_height() -> usize {
    256
}

fn default_load_radius() -> i32 {
    8
}

fn default_unload_margin() -> i32 {
    2
}

fn default_forward_bonus() -> i32 {
    4
}

fn default_backward_penalty() -> i32 {
    3
}

fn default_world_limit() -> i32 {
    2048
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> Vec<u64> {
    vec![1000, 2000, 4000]
}

fn default_max_generation_starts_per_tick() -> usize {
    2
}

fn default_max_uploads_per_tick() -> usize {
    8
}

fn default_max_rebuilds_per_tick() -> usize {
    4
}

fn default_liveness_sweep_interval() -> u32 {
    30
}

fn default_unload_grace_ms() -> u64 {
    3000
}

fn default_greedy_meshing() -> bool {
    true
}

fn default_seed() -> u64 {
    0x5EED
}

pub fn load_or_create_settings(path: &Path) -> PipelineSettings {
    match PipelineSettings::load(path) {
        Ok(settings) => settings,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            let settings = PipelineSettings::default();
            if let Err(save_err) = settings.save(path) {
                warn!(
                    "Failed to create default settings at {}: {save_err}",
                    path.display()
                );
            }
            settings
        }
        Err(err) => {
            warn!("Failed to load settings from {}: {err}", path.display());
            PipelineSettings::default()
        }
    }
}
