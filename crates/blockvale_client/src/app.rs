use std::path::PathBuf;

use glam::Vec3;
use tracing::{info, warn};

use crate::config::{load_or_create_settings, PipelineSettings};
use crate::pipeline::{PipelineManager, TickStats};
use crate::renderer::chunk_renderer::{ChunkPassStats, WgpuChunkBuffers};
use crate::renderer::context::GpuContext;
use crate::renderer::pipeline::{ChunkFrame, FrameCamera};
use crate::renderer::{GpuBackend, HeadlessBackend};
use crate::world::World;

const STATS_INTERVAL_TICKS: u64 = 60;
const WALK_SPEED_PER_TICK: f32 = 0.5;
const OBSERVER_EYE_HEIGHT: f32 = 1.6;
const FRAME_WIDTH: u32 = 320;
const FRAME_HEIGHT: u32 = 180;

#[derive(Debug, Clone)]
pub struct DemoOptions {
    pub config_path: PathBuf,
    pub seed: Option<u64>,
    pub ticks: u64,
    pub headless: bool,
}

impl Default for DemoOptions {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from("blockvale.toml"),
            seed: None,
            ticks: 600,
            headless: false,
        }
    }
}

enum DemoBackend {
    Wgpu {
        buffers: WgpuChunkBuffers,
        frame: ChunkFrame,
    },
    Headless(HeadlessBackend),
}

impl DemoBackend {
    fn select(headless: bool) -> Self {
        if headless {
            info!("Running with the CPU-side buffer backend");
            return Self::Headless(HeadlessBackend::new());
        }

        match GpuContext::new_headless() {
            Ok(context) => {
                let frame = ChunkFrame::new(&context.device, FRAME_WIDTH, FRAME_HEIGHT);
                Self::Wgpu {
                    buffers: WgpuChunkBuffers::new(context.device, context.queue),
                    frame,
                }
            }
            Err(err) => {
                warn!("No GPU available ({err}); falling back to the CPU-side buffer backend");
                Self::Headless(HeadlessBackend::new())
            }
        }
    }

    fn gpu(&mut self) -> &mut dyn GpuBackend {
        match self {
            Self::Wgpu { buffers, .. } => buffers,
            Self::Headless(backend) => backend,
        }
    }

    fn live_buffers(&self) -> usize {
        match self {
            Self::Wgpu { buffers, .. } => buffers.len(),
            Self::Headless(backend) => backend.live_buffers(),
        }
    }

    fn draw(&mut self, world: &World, observer: Vec3, forward: Vec3) -> ChunkPassStats {
        match self {
            Self::Wgpu { buffers, frame } => {
                let camera = FrameCamera::looking(observer, forward, world.render_distance());
                frame.render(buffers, &camera, |drawer| {
                    world.draw_visible(observer, drawer);
                })
            }
            Self::Headless(backend) => {
                backend.clear_drawn();
                let draws = world.draw_visible(observer, backend);
                ChunkPassStats {
                    draw_calls: draws as u32,
                    ..ChunkPassStats::default()
                }
            }
        }
    }

    fn log_upload_stats(&self) {
        if let Self::Wgpu { buffers, .. } = self {
            let upload = buffers.upload_stats();
            info!(
                "GPU uploads: {} byte(s), {} buffer allocation(s)",
                upload.uploaded_bytes, upload.buffer_reallocations
            );
        }
    }
}

/// Walks an observer east across the world for `options.ticks` frames.
pub fn run(options: DemoOptions) {
    let _ = tracing_subscriber::fmt().with_target(false).try_init();

    let mut settings: PipelineSettings = load_or_create_settings(&options.config_path);
    if let Some(seed) = options.seed {
        settings.seed = seed;
    }

    let mut pipeline = match PipelineManager::with_world_generator(settings) {
        Ok(pipeline) => pipeline,
        Err(err) => {
            eprintln!("Failed to start chunk pipeline: {err}");
            return;
        }
    };
    let mut world = World::from_settings(pipeline.settings());
    let mut backend = DemoBackend::select(options.headless);

    info!(
        "Blockvale demo: seed {} for {} tick(s)",
        pipeline.settings().seed,
        options.ticks
    );

    let forward = Vec3::X;
    let mut observer = Vec3::new(0.5, 0.0, 0.5);
    let mut window = TickStats::default();
    let mut total = TickStats::default();

    for tick in 1..=options.ticks {
        if let Some(surface) = world.surface_height(observer.x.floor() as i32, observer.z.floor() as i32) {
            observer.y = surface as f32 + 1.0 + OBSERVER_EYE_HEIGHT;
        }

        world.update_streaming(observer, forward, &pipeline, backend.gpu());
        let stats = pipeline.tick(&mut world, backend.gpu());
        window.accumulate(stats);
        total.accumulate(stats);

        let pass = backend.draw(&world, observer, forward);

        if tick % STATS_INTERVAL_TICKS == 0 {
            let mut uploaded = 0;
            world.for_each_loaded_chunk(|chunk| {
                if chunk.is_uploaded() {
                    uploaded += 1;
                }
            });
            info!(
                "Tick {tick}: observer at ({:.1}, {:.1}, {:.1}), loaded={} uploaded={} buffers={} pending={} uploads_queued={} draws={} | {window:?}",
                observer.x,
                observer.y,
                observer.z,
                world.len(),
                uploaded,
                backend.live_buffers(),
                pipeline.pending_requests(),
                pipeline.upload_queue_len(),
                pass.draw_calls
            );
            backend.log_upload_stats();
            window = TickStats::default();
        }

        observer += forward * WALK_SPEED_PER_TICK;
        std::thread::sleep(std::time::Duration::from_millis(16));
    }

    info!("Demo finished: {total:?}");
}
