use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use blockvale_core::events::{self, EventReceiver, EventSender};
use blockvale_core::jobs::{catch_job, JobSystem};
use blockvale_shared::block::{register_default_blocks, BlockRegistry};
use blockvale_shared::chunk::ChunkData;
use blockvale_shared::coords::{ColumnPos, ColumnShape};
use blockvale_shared::worldgen::{ChunkSource, GenerationError, WorldGenerator};
use rustc_hash::FxHashMap;
use tracing::{debug, error, info, warn};

use crate::chunk::MeshOffer;
use crate::config::PipelineSettings;
use crate::mesh_worker::{MeshBuilder, MeshRequest, MeshWorker};
use crate::renderer::mesh::{ChunkMesh, MeshingMode};
use crate::renderer::{GpuBackend, GpuError, GpuHandle};
use crate::world::World;

/// Fresh handles requested before giving up on a colliding backend.
const MAX_HANDLE_ATTEMPTS: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    WorkerPool(String),
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WorkerPool(reason) => write!(f, "failed to start worker pool: {reason}"),
        }
    }
}

impl std::error::Error for PipelineError {}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RequestState {
    Queued,
    Generating,
}

#[derive(Default)]
struct RequestBook {
    queue: VecDeque<ColumnPos>,
    in_flight: FxHashMap<ColumnPos, RequestState>,
}

/// Request queue plus in-flight registry. At most one outstanding generation per column.
#[derive(Default)]
pub struct GenerationRequests {
    book: Mutex<RequestBook>,
}

impl GenerationRequests {
    fn lock(&self) -> MutexGuard<'_, RequestBook> {
        self.book.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueues `pos` unless it is already queued or generating.
    pub(crate) fn request(&self, pos: ColumnPos) -> bool {
        let mut book = self.lock();
        if book.in_flight.contains_key(&pos) {
            return false;
        }
        book.in_flight.insert(pos, RequestState::Queued);
        book.queue.push_back(pos);
        true
    }

    pub fn state(&self, pos: ColumnPos) -> Option<RequestState> {
        self.lock().in_flight.get(&pos).copied()
    }

    pub fn is_in_flight(&self, pos: ColumnPos) -> bool {
        self.lock().in_flight.contains_key(&pos)
    }

    pub fn queued(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn in_flight(&self) -> usize {
        self.lock().in_flight.len()
    }

    /// Pops the oldest queued column. It stays registered as queued until the
    /// caller either starts it or releases it.
    fn pop_queued(&self) -> Option<ColumnPos> {
        self.lock().queue.pop_front()
    }

    fn mark_generating(&self, pos: ColumnPos) {
        self.lock().in_flight.insert(pos, RequestState::Generating);
    }

    fn release(&self, pos: ColumnPos) {
        self.lock().in_flight.remove(&pos);
    }

    /// Drops queued columns rejected by `keep`. Running generations are untouched.
    fn retain_queued(&self, mut keep: impl FnMut(ColumnPos) -> bool) -> usize {
        let mut book = self.lock();
        let RequestBook { queue, in_flight } = &mut *book;
        let before = queue.len();
        queue.retain(|pos| {
            if keep(*pos) {
                return true;
            }
            in_flight.remove(pos);
            false
        });
        before - queue.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Vec<Duration>,
}

impl RetryPolicy {
    pub fn from_settings(settings: &PipelineSettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            backoff: settings
                .retry_backoff_ms
                .iter()
                .map(|millis| Duration::from_millis(*millis))
                .collect(),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    /// Delay after failed attempt number `attempt` (one-based). The last entry repeats.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let index = attempt.saturating_sub(1) as usize;
        self.backoff
            .get(index)
            .or_else(|| self.backoff.last())
            .copied()
            .unwrap_or_default()
    }
}

#[derive(Debug)]
pub struct GenerationOutcome {
    pub pos: ColumnPos,
    pub attempts: u32,
    pub result: Result<ChunkData, GenerationError>,
}

/// Runs `source` until it succeeds or the retry budget is spent, sleeping
/// between attempts. Panics count as failed attempts.
pub fn generate_with_retry(
    source: &dyn ChunkSource,
    pos: ColumnPos,
    shape: ColumnShape,
    policy: &RetryPolicy,
) -> GenerationOutcome {
    let max_attempts = policy.max_attempts();
    let mut attempt = 0;

    loop {
        attempt += 1;
        let result = match catch_job(|| source.generate(pos, shape)) {
            Ok(Ok(data)) if data.shape() != shape => Err(GenerationError::InvalidShape(data.shape())),
            Ok(result) => result,
            Err(message) => Err(GenerationError::Panicked(message)),
        };

        match result {
            Ok(data) => {
                return GenerationOutcome {
                    pos,
                    attempts: attempt,
                    result: Ok(data),
                }
            }
            Err(err) if attempt < max_attempts => {
                let delay = policy.delay_after(attempt);
                debug!("Generation of chunk {pos:?} failed on attempt {attempt}: {err}; retrying in {delay:?}");
                std::thread::sleep(delay);
            }
            Err(err) => {
                return GenerationOutcome {
                    pos,
                    attempts: attempt,
                    result: Err(err),
                }
            }
        }
    }
}

/// Per-tick counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickStats {
    pub generation_starts: usize,
    pub generation_completions: usize,
    pub generation_failures: usize,
    pub post_processed: usize,
    pub mesh_submissions: usize,
    pub mesh_failures: usize,
    pub uploads: usize,
    pub discarded_results: usize,
}

impl TickStats {
    pub fn accumulate(&mut self, other: TickStats) {
        self.generation_starts += other.generation_starts;
        self.generation_completions += other.generation_completions;
        self.generation_failures += other.generation_failures;
        self.post_processed += other.post_processed;
        self.mesh_submissions += other.mesh_submissions;
        self.mesh_failures += other.mesh_failures;
        self.uploads += other.uploads;
        self.discarded_results += other.discarded_results;
    }
}

/// Drives columns from request to uploaded mesh. `tick` must be called from
/// the thread that owns the GPU backend; `request_generation` may be called
/// from anywhere.
pub struct PipelineManager {
    settings: PipelineSettings,
    shape: ColumnShape,
    meshing: MeshingMode,
    retry: RetryPolicy,
    source: Arc<dyn ChunkSource>,
    registry: Arc<BlockRegistry>,
    jobs: Arc<JobSystem>,
    requests: GenerationRequests,
    generated_tx: EventSender<GenerationOutcome>,
    generated_rx: EventReceiver<GenerationOutcome>,
    mesh_worker: MeshWorker,
    post_process_queue: Vec<ColumnPos>,
    upload_queue: VecDeque<ColumnPos>,
    next_mesh_version: u64,
    tick_count: u64,
}

impl PipelineManager {
    pub fn new(
        settings: PipelineSettings,
        source: Arc<dyn ChunkSource>,
        registry: Arc<BlockRegistry>,
    ) -> Result<Self, PipelineError> {
        let settings = settings.sanitize();
        let jobs = JobSystem::new(settings.worker_threads(), "chunk-worker")
            .map_err(|e| PipelineError::WorkerPool(e.to_string()))?;
        let jobs = Arc::new(jobs);
        let (generated_tx, generated_rx) = events::channel();

        info!(
            "Chunk pipeline ready: {}x{} columns, {} meshing, {} retries",
            settings.chunk_size,
            settings.world_height,
            if settings.greedy_meshing { "greedy" } else { "naive" },
            settings.max_retries
        );

        Ok(Self {
            shape: settings.column_shape(),
            meshing: settings.meshing_mode(),
            retry: RetryPolicy::from_settings(&settings),
            mesh_worker: MeshWorker::new(Arc::clone(&jobs)),
            settings,
            source,
            registry,
            jobs,
            requests: GenerationRequests::default(),
            generated_tx,
            generated_rx,
            post_process_queue: Vec::new(),
            upload_queue: VecDeque::new(),
            next_mesh_version: 0,
            tick_count: 0,
        })
    }

    /// Pipeline over the procedural generator seeded from `settings.seed`.
    pub fn with_world_generator(settings: PipelineSettings) -> Result<Self, PipelineError> {
        let generator = WorldGenerator::new(settings.seed);
        Self::new(settings, Arc::new(generator), Arc::new(register_default_blocks()))
    }

    /// Replaces the mesher run on the worker pool. Call before the first tick.
    pub fn with_mesh_builder(mut self, builder: MeshBuilder) -> Self {
        self.mesh_worker = MeshWorker::with_builder(Arc::clone(&self.jobs), builder);
        self
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn registry(&self) -> &Arc<BlockRegistry> {
        &self.registry
    }

    pub fn requests(&self) -> &GenerationRequests {
        &self.requests
    }

    /// Idempotent and callable from any thread. A column that is already loaded
    /// is accepted here but never started: `tick` drops it when the queue drains.
    pub fn request_generation(&self, pos: ColumnPos) -> bool {
        self.requests.request(pos)
    }

    pub fn is_in_flight(&self, pos: ColumnPos) -> bool {
        self.requests.is_in_flight(pos)
    }

    pub fn pending_requests(&self) -> usize {
        self.requests.queued()
    }

    pub fn upload_queue_len(&self) -> usize {
        self.upload_queue.len()
    }

    pub fn post_process_backlog(&self) -> usize {
        self.post_process_queue.len()
    }

    /// Forgets queued requests for columns streaming no longer wants.
    pub fn cancel_unwanted(&self, keep: impl FnMut(ColumnPos) -> bool) -> usize {
        let dropped = self.requests.retain_queued(keep);
        if dropped > 0 {
            debug!("Dropped {dropped} queued generation request(s)");
        }
        dropped
    }

    pub fn tick(&mut self, world: &mut World, gpu: &mut dyn GpuBackend) -> TickStats {
        self.tick_count += 1;
        let mut stats = TickStats::default();

        self.collect_generated(world, &mut stats);
        self.run_post_processing(world, &mut stats);
        self.start_generation(world, &mut stats);
        self.collect_meshes(world, &mut stats);
        self.drain_uploads(world, gpu, &mut stats);
        if self.tick_count % u64::from(self.settings.liveness_sweep_interval) == 0 {
            self.sweep_liveness(world);
        }
        self.submit_rebuilds(world, &mut stats);

        stats
    }

    fn collect_generated(&mut self, world: &mut World, stats: &mut TickStats) {
        for outcome in self.generated_rx.drain() {
            let pos = outcome.pos;
            self.requests.release(pos);

            match outcome.result {
                Ok(data) => {
                    if world.contains(pos) || !world.is_wanted(pos) {
                        debug!("Discarding generated chunk {pos:?}");
                        stats.discarded_results += 1;
                        continue;
                    }

                    let replayed = world.insert_generated(pos, data);
                    self.post_process_queue.push(pos);
                    stats.generation_completions += 1;
                    debug!(
                        "Generated chunk {pos:?} in {} attempt(s), replayed {replayed} write(s)",
                        outcome.attempts
                    );
                }
                Err(err) => {
                    stats.generation_failures += 1;
                    warn!(
                        "Generation of chunk {pos:?} failed after {} attempt(s): {err}",
                        outcome.attempts
                    );
                }
            }
        }
    }

    fn run_post_processing(&mut self, world: &mut World, stats: &mut TickStats) {
        let queue = std::mem::take(&mut self.post_process_queue);
        for pos in queue {
            if !world.contains(pos) {
                continue;
            }
            if !world.neighbours_present(pos) || !self.source.post_process(world, pos) {
                self.post_process_queue.push(pos);
                continue;
            }

            if let Some(chunk) = world.chunk_mut(pos) {
                chunk.mark_post_processed();
                chunk.mark_dirty();
            }
            stats.post_processed += 1;
        }
    }

    fn start_generation(&mut self, world: &World, stats: &mut TickStats) {
        while stats.generation_starts < self.settings.max_generation_starts_per_tick {
            let Some(pos) = self.requests.pop_queued() else {
                break;
            };
            if world.contains(pos) || !world.is_wanted(pos) {
                self.requests.release(pos);
                continue;
            }

            self.requests.mark_generating(pos);
            let source = Arc::clone(&self.source);
            let generated_tx = self.generated_tx.clone();
            let policy = self.retry.clone();
            let shape = self.shape;
            self.jobs.spawn(move || {
                let outcome = generate_with_retry(source.as_ref(), pos, shape, &policy);
                let _ = generated_tx.send(outcome);
            });
            stats.generation_starts += 1;
        }
    }

    fn collect_meshes(&mut self, world: &mut World, stats: &mut TickStats) {
        for result in self.mesh_worker.poll() {
            let pos = result.chunk_pos;
            let Some(chunk) = world.chunk_mut(pos) else {
                stats.discarded_results += 1;
                continue;
            };

            let mesh = match result.mesh {
                Ok(mesh) => mesh,
                Err(reason) => {
                    warn!("Mesh job v{} for chunk {pos:?} panicked: {reason}", result.version);
                    stats.mesh_failures += 1;
                    chunk.abort_mesh(result.version);
                    continue;
                }
            };

            match chunk.offer_mesh(result.version, mesh) {
                MeshOffer::Accepted => self.upload_queue.push_back(pos),
                MeshOffer::Stale => {
                    debug!("Dropping stale mesh v{} for chunk {pos:?}", result.version);
                    stats.discarded_results += 1;
                }
                MeshOffer::Occupied => {
                    warn!("Chunk {pos:?} still holds an unconsumed mesh; dropping v{}", result.version);
                    stats.discarded_results += 1;
                }
            }
        }
    }

    fn drain_uploads(&mut self, world: &mut World, gpu: &mut dyn GpuBackend, stats: &mut TickStats) {
        let mut attempts = 0;
        while attempts < self.settings.max_uploads_per_tick {
            let Some(pos) = self.upload_queue.pop_front() else {
                break;
            };
            let Some(chunk) = world.chunk_mut(pos) else {
                continue;
            };
            let Some(pending) = chunk.take_pending_mesh() else {
                continue;
            };
            let existing = chunk.gpu_handle();
            attempts += 1;

            let mesh = pending.mesh;
            if mesh.is_empty() {
                debug!("Chunk {pos:?} has nothing to draw (mesh v{})", pending.version);
            }
            let vertex_count = mesh.vertex_count() as u32;
            let uploaded = match existing {
                Some(handle) => gpu.update_vertex_buffer(handle, &mesh).map(|()| handle),
                None => create_unique_buffer(world, gpu, pos, &mesh),
            };

            match uploaded {
                Ok(handle) => {
                    if let Some(chunk) = world.chunk_mut(pos) {
                        chunk.mark_uploaded(handle, vertex_count);
                    }
                    stats.uploads += 1;
                }
                Err(err) => {
                    warn!("Upload of chunk {pos:?} failed: {err}");
                    if let GpuError::UnknownHandle(handle) = err {
                        if let Some(chunk) = world.chunk_mut(pos) {
                            chunk.clear_upload();
                        }
                        world.release_handle(handle, pos);
                    }
                    if let Some(chunk) = world.chunk_mut(pos) {
                        chunk.mark_dirty();
                    }
                }
            }
        }
    }

    fn sweep_liveness(&mut self, world: &mut World) {
        let stalled: Vec<ColumnPos> = world
            .loaded_positions()
            .into_iter()
            .filter(|pos| {
                world.chunk(*pos).is_some_and(|chunk| {
                    chunk.is_post_processed()
                        && !chunk.is_uploaded()
                        && !chunk.is_dirty()
                        && chunk.is_mesh_idle()
                }) && world.neighbours_present(*pos)
            })
            .collect();

        for pos in &stalled {
            if let Some(chunk) = world.chunk_mut(*pos) {
                chunk.mark_dirty();
            }
        }
        if !stalled.is_empty() {
            debug!("Liveness sweep re-queued {} chunk(s)", stalled.len());
        }
    }

    fn submit_rebuilds(&mut self, world: &mut World, stats: &mut TickStats) {
        let center = world.center().unwrap_or_default();
        let mut candidates: Vec<ColumnPos> = world
            .loaded_positions()
            .into_iter()
            .filter(|pos| {
                world.chunk(*pos).is_some_and(|chunk| {
                    chunk.is_dirty() && chunk.is_post_processed() && chunk.is_mesh_idle()
                }) && world.neighbours_present(*pos)
            })
            .collect();
        candidates.sort_by_key(|pos| (pos.distance_sq(center), pos.z, pos.x));

        for pos in candidates
            .into_iter()
            .take(self.settings.max_rebuilds_per_tick)
        {
            let Some((chunk_data, neighbors)) = world.snapshot_with_neighbors(pos) else {
                continue;
            };
            let Some(chunk) = world.chunk_mut(pos) else {
                continue;
            };

            self.next_mesh_version += 1;
            let version = self.next_mesh_version;
            chunk.begin_mesh(version);
            self.mesh_worker.submit(MeshRequest {
                chunk_pos: pos,
                chunk: chunk_data,
                neighbors,
                registry: Arc::clone(&self.registry),
                mode: self.meshing,
                version,
            });
            stats.mesh_submissions += 1;
        }
    }
}

/// Creates a buffer whose handle no other loaded chunk still holds. Colliding
/// handles are left to their owner and a new one is requested.
pub fn create_unique_buffer(
    world: &mut World,
    gpu: &mut dyn GpuBackend,
    pos: ColumnPos,
    mesh: &ChunkMesh,
) -> Result<GpuHandle, GpuError> {
    for _ in 0..MAX_HANDLE_ATTEMPTS {
        let handle = gpu.create_vertex_buffer(mesh)?;
        match world.claim_handle(handle, pos) {
            Ok(()) => return Ok(handle),
            Err(owner) => {
                error!("GPU handle {handle:?} for chunk {pos:?} collides with chunk {owner:?}; regenerating");
            }
        }
    }

    Err(GpuError::Backend(format!(
        "no unique buffer handle for chunk {pos:?} after {MAX_HANDLE_ATTEMPTS} attempts"
    )))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};

    use blockvale_shared::block::{register_default_blocks, BlockId};
    use blockvale_shared::chunk::ChunkData;
    use blockvale_shared::coords::{ColumnPos, ColumnShape};
    use blockvale_shared::worldgen::{neighbourhood_loaded, ChunkSource, GenerationError, VoxelAccess};
    use glam::{IVec3, Vec3};

    use super::{
        create_unique_buffer, generate_with_retry, GenerationRequests, PipelineManager, RequestState,
        RetryPolicy, TickStats,
    };
    use crate::config::PipelineSettings;
    use crate::mesh_worker::MeshRequest;
    use crate::renderer::mesh::ChunkMesh;
    use crate::renderer::HeadlessBackend;
    use crate::streaming::StreamingConfig;
    use crate::world::World;

    /// Stone up to `floor`, air above. Records every call.
    struct FlatSource {
        floor: i32,
        generated: AtomicUsize,
        post_processed: Mutex<Vec<ColumnPos>>,
    }

    impl FlatSource {
        fn new(floor: i32) -> Self {
            Self {
                floor,
                generated: AtomicUsize::new(0),
                post_processed: Mutex::new(Vec::new()),
            }
        }
    }

    impl ChunkSource for FlatSource {
        fn generate(&self, _pos: ColumnPos, shape: ColumnShape) -> Result<ChunkData, GenerationError> {
            self.generated.fetch_add(1, Ordering::SeqCst);
            let mut chunk = ChunkData::new_empty(shape);
            let size = shape.size as i32;
            for y in 0..self.floor {
                for z in 0..size {
                    for x in 0..size {
                        chunk.set_xyz(x, y, z, BlockId::STONE);
                    }
                }
            }
            Ok(chunk)
        }

        fn post_process(&self, world: &mut dyn VoxelAccess, pos: ColumnPos) -> bool {
            if !neighbourhood_loaded(world, pos) {
                return false;
            }
            self.post_processed.lock().expect("lock").push(pos);
            true
        }
    }

    /// Fails `failures` times (every other failure is a panic) before succeeding.
    struct FlakySource {
        failures: usize,
        attempts: AtomicUsize,
    }

    impl FlakySource {
        fn new(failures: usize) -> Self {
            Self {
                failures,
                attempts: AtomicUsize::new(0),
            }
        }
    }

    impl ChunkSource for FlakySource {
        fn generate(&self, pos: ColumnPos, shape: ColumnShape) -> Result<ChunkData, GenerationError> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.failures {
                if attempt % 2 == 1 {
                    panic!("flaky source panicked at {pos:?}");
                }
                return Err(GenerationError::Failed("flaky".to_string()));
            }
            Ok(ChunkData::new_empty(shape))
        }

        fn post_process(&self, _world: &mut dyn VoxelAccess, _pos: ColumnPos) -> bool {
            true
        }
    }

    fn settings() -> PipelineSettings {
        PipelineSettings {
            chunk_size: 8,
            world_height: 16,
            retry_backoff_ms: vec![0],
            max_generation_starts_per_tick: 64,
            max_uploads_per_tick: 64,
            max_rebuilds_per_tick: 64,
            liveness_sweep_interval: 5,
            worker_threads: 2,
            ..PipelineSettings::default()
        }
    }

    fn pipeline_with(settings: PipelineSettings, source: Arc<dyn ChunkSource>) -> PipelineManager {
        PipelineManager::new(settings, source, Arc::new(register_default_blocks())).expect("pipeline")
    }

    fn run_until(
        pipeline: &mut PipelineManager,
        world: &mut World,
        gpu: &mut HeadlessBackend,
        mut done: impl FnMut(&World, &PipelineManager, &TickStats) -> bool,
    ) -> TickStats {
        let deadline = Instant::now() + Duration::from_secs(20);
        let mut total = TickStats::default();
        while Instant::now() < deadline {
            total.accumulate(pipeline.tick(world, gpu));
            if done(world, pipeline, &total) {
                return total;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        panic!("pipeline did not settle in time: {total:?}");
    }

    fn request_block(pipeline: &PipelineManager, center: ColumnPos, radius: i32) {
        for dz in -radius..=radius {
            for dx in -radius..=radius {
                pipeline.request_generation(center + ColumnPos::new(dx, dz));
            }
        }
    }

    #[test]
    fn requests_coalesce_until_released() {
        let requests = GenerationRequests::default();
        let pos = ColumnPos::new(3, 4);

        assert!(requests.request(pos));
        assert!(!requests.request(pos));
        assert_eq!(requests.state(pos), Some(RequestState::Queued));
        assert_eq!(requests.pop_queued(), Some(pos));

        requests.mark_generating(pos);
        assert!(!requests.request(pos));
        assert_eq!(requests.state(pos), Some(RequestState::Generating));
        assert_eq!(requests.queued(), 0);

        requests.release(pos);
        assert!(!requests.is_in_flight(pos));
        assert!(requests.request(pos));
    }

    #[test]
    fn retain_queued_only_drops_queued_columns() {
        let requests = GenerationRequests::default();
        let running = ColumnPos::new(0, 0);
        requests.request(running);
        requests.pop_queued();
        requests.mark_generating(running);
        requests.request(ColumnPos::new(1, 0));
        requests.request(ColumnPos::new(2, 0));

        assert_eq!(requests.retain_queued(|pos| pos.x == 1), 1);
        assert!(requests.is_in_flight(running));
        assert!(requests.is_in_flight(ColumnPos::new(1, 0)));
        assert!(!requests.is_in_flight(ColumnPos::new(2, 0)));
        assert_eq!(requests.in_flight(), 2);
    }

    #[test]
    fn retry_loop_attempts_max_retries_plus_one_times() {
        let policy = RetryPolicy {
            max_retries: 3,
            backoff: vec![Duration::ZERO],
        };
        let shape = ColumnShape::new(4, 16);

        let doomed = FlakySource::new(usize::MAX);
        let outcome = generate_with_retry(&doomed, ColumnPos::new(0, 0), shape, &policy);
        assert_eq!(outcome.attempts, 4);
        assert_eq!(doomed.attempts.load(Ordering::SeqCst), 4);
        assert!(outcome.result.is_err());

        let recovering = FlakySource::new(2);
        let outcome = generate_with_retry(&recovering, ColumnPos::new(0, 0), shape, &policy);
        assert_eq!(outcome.attempts, 3);
        assert!(outcome.result.is_ok());
    }

    #[test]
    fn retry_backoff_follows_the_schedule_and_repeats_the_last_step() {
        let policy = RetryPolicy::from_settings(&PipelineSettings::default());
        assert_eq!(policy.max_attempts(), 4);
        assert_eq!(policy.delay_after(1), Duration::from_secs(1));
        assert_eq!(policy.delay_after(2), Duration::from_secs(2));
        assert_eq!(policy.delay_after(3), Duration::from_secs(4));
        assert_eq!(policy.delay_after(9), Duration::from_secs(4));
    }

    #[test]
    fn concurrent_requests_for_one_column_run_a_single_generation() {
        let source = Arc::new(FlatSource::new(2));
        let mut pipeline = pipeline_with(settings(), source.clone());
        let mut world = World::from_settings(pipeline.settings());
        let mut gpu = HeadlessBackend::new();
        let pos = ColumnPos::new(5, -2);

        let accepted = AtomicUsize::new(0);
        let requests = pipeline.requests();
        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    if requests.request(pos) {
                        accepted.fetch_add(1, Ordering::SeqCst);
                    }
                });
            }
        });
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
        assert_eq!(pipeline.pending_requests(), 1);

        run_until(&mut pipeline, &mut world, &mut gpu, |world, _, _| world.contains(pos));
        assert!(!pipeline.is_in_flight(pos));

        // Already loaded: the request is accepted but never started.
        assert!(pipeline.request_generation(pos));
        for _ in 0..5 {
            pipeline.tick(&mut world, &mut gpu);
        }
        assert_eq!(source.generated.load(Ordering::SeqCst), 1);
        assert!(!pipeline.is_in_flight(pos));
    }

    #[test]
    fn exhausted_retries_release_the_column() {
        let source = Arc::new(FlakySource::new(usize::MAX));
        let mut pipeline = pipeline_with(settings(), source.clone());
        let mut world = World::from_settings(pipeline.settings());
        let mut gpu = HeadlessBackend::new();
        let pos = ColumnPos::new(0, 0);

        assert!(pipeline.request_generation(pos));
        let stats = run_until(&mut pipeline, &mut world, &mut gpu, |_, _, stats| {
            stats.generation_failures > 0
        });

        assert_eq!(stats.generation_failures, 1);
        assert_eq!(source.attempts.load(Ordering::SeqCst), 4);
        assert!(!pipeline.is_in_flight(pos));
        assert!(!world.contains(pos));
        assert!(pipeline.request_generation(pos));
    }

    #[test]
    fn transient_failures_and_panics_are_retried_to_success() {
        let source = Arc::new(FlakySource::new(2));
        let mut pipeline = pipeline_with(settings(), source.clone());
        let mut world = World::from_settings(pipeline.settings());
        let mut gpu = HeadlessBackend::new();
        let pos = ColumnPos::new(-4, 9);

        pipeline.request_generation(pos);
        let stats = run_until(&mut pipeline, &mut world, &mut gpu, |world, _, _| world.contains(pos));

        assert_eq!(source.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(stats.generation_failures, 0);
        assert_eq!(stats.generation_completions, 1);
    }

    #[test]
    fn post_processing_waits_for_all_eight_neighbours() {
        let source = Arc::new(FlatSource::new(2));
        let mut pipeline = pipeline_with(settings(), source.clone());
        let mut world = World::from_settings(pipeline.settings());
        let mut gpu = HeadlessBackend::new();
        let center = ColumnPos::new(0, 0);

        pipeline.request_generation(center);
        for neighbor in &center.ring_neighbors()[..7] {
            pipeline.request_generation(*neighbor);
        }
        run_until(&mut pipeline, &mut world, &mut gpu, |world, _, _| world.len() == 8);
        for _ in 0..5 {
            pipeline.tick(&mut world, &mut gpu);
        }
        assert!(!world.chunk(center).expect("center").is_post_processed());
        assert!(source.post_processed.lock().expect("lock").is_empty());
        assert_eq!(pipeline.post_process_backlog(), 8);

        pipeline.request_generation(center.ring_neighbors()[7]);
        run_until(&mut pipeline, &mut world, &mut gpu, |world, _, _| {
            world.chunk(center).is_some_and(|chunk| chunk.is_post_processed())
        });

        assert_eq!(*source.post_processed.lock().expect("lock"), vec![center]);
        for neighbor in center.ring_neighbors() {
            assert!(!world.chunk(neighbor).expect("ring").is_post_processed());
        }
    }

    #[test]
    fn uploaded_chunks_hold_handles_and_empty_meshes_are_never_drawn() {
        let mut pipeline = pipeline_with(settings(), Arc::new(FlatSource::new(0)));
        let mut world = World::from_settings(pipeline.settings());
        let mut gpu = HeadlessBackend::new();
        let center = ColumnPos::new(0, 0);

        request_block(&pipeline, center, 1);
        run_until(&mut pipeline, &mut world, &mut gpu, |world, _, _| {
            world.chunk(center).is_some_and(|chunk| chunk.is_uploaded())
        });

        let chunk = world.chunk(center).expect("center");
        assert!(chunk.gpu_handle().is_some());
        assert_eq!(chunk.vertex_count(), 0);
        world.for_each_loaded_chunk(|chunk| {
            assert!(!chunk.is_uploaded() || chunk.gpu_handle().is_some());
        });

        assert_eq!(world.draw_visible(Vec3::new(4.0, 8.0, 4.0), &mut gpu), 0);
        assert_eq!(gpu.stats().draws, 0);
    }

    #[test]
    fn solid_terrain_is_uploaded_and_drawn() {
        let mut pipeline = pipeline_with(settings(), Arc::new(FlatSource::new(3)));
        let mut world = World::from_settings(pipeline.settings());
        let mut gpu = HeadlessBackend::new();
        let center = ColumnPos::new(2, 2);

        request_block(&pipeline, center, 1);
        run_until(&mut pipeline, &mut world, &mut gpu, |world, _, _| {
            world.chunk(center).is_some_and(|chunk| chunk.is_uploaded())
        });

        let chunk = world.chunk(center).expect("center");
        let handle = chunk.gpu_handle().expect("uploaded chunk has a handle");
        assert!(chunk.vertex_count() > 0);
        assert_eq!(
            gpu.buffer(handle).map(|buffer| buffer.vertex_count),
            Some(chunk.vertex_count())
        );
        assert_eq!(world.draw_visible(Vec3::new(20.0, 8.0, 20.0), &mut gpu), 1);
        assert_eq!(gpu.drawn(), &[handle]);
    }

    #[test]
    fn edits_after_upload_rebuild_the_mesh_in_place() {
        let mut pipeline = pipeline_with(settings(), Arc::new(FlatSource::new(3)));
        let mut world = World::from_settings(pipeline.settings());
        let mut gpu = HeadlessBackend::new();
        let center = ColumnPos::new(0, 0);

        request_block(&pipeline, center, 1);
        run_until(&mut pipeline, &mut world, &mut gpu, |world, _, _| {
            world
                .chunk(center)
                .is_some_and(|chunk| chunk.is_uploaded() && !chunk.is_dirty() && chunk.is_mesh_idle())
        });
        let before = world.chunk(center).expect("center").vertex_count();
        let handle = world.chunk(center).expect("center").gpu_handle();

        world.set_block(IVec3::new(4, 10, 4), BlockId::STONE);
        assert!(world.chunk(center).expect("center").is_dirty());
        run_until(&mut pipeline, &mut world, &mut gpu, |world, _, _| {
            world
                .chunk(center)
                .is_some_and(|chunk| !chunk.is_dirty() && chunk.is_mesh_idle() && chunk.vertex_count() != before)
        });

        let chunk = world.chunk(center).expect("center");
        assert_eq!(chunk.gpu_handle(), handle);
        assert_eq!(chunk.vertex_count(), before + 24);
        assert!(gpu.stats().updates >= 1);
    }

    #[test]
    fn panicking_mesh_jobs_are_rebuilt() {
        let builds = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&builds);
        let mut pipeline = pipeline_with(settings(), Arc::new(FlatSource::new(3))).with_mesh_builder(
            Arc::new(move |request: &MeshRequest| {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("mesher failed for {:?}", request.chunk_pos);
                }
                request.build()
            }),
        );
        let mut world = World::from_settings(pipeline.settings());
        let mut gpu = HeadlessBackend::new();
        let center = ColumnPos::new(0, 0);

        request_block(&pipeline, center, 1);
        let stats = run_until(&mut pipeline, &mut world, &mut gpu, |world, _, _| {
            world.chunk(center).is_some_and(|chunk| chunk.is_uploaded())
        });

        assert_eq!(stats.mesh_failures, 1);
        assert_eq!(builds.load(Ordering::SeqCst), 2);
        let chunk = world.chunk(center).expect("center");
        assert!(chunk.vertex_count() > 0);
        assert!(chunk.is_mesh_idle());
    }

    #[test]
    fn edits_while_a_mesh_is_in_flight_cause_exactly_one_rebuild() {
        let released = Arc::new(AtomicBool::new(false));
        let versions = Arc::new(Mutex::new(Vec::new()));
        let gate = Arc::clone(&released);
        let log = Arc::clone(&versions);
        let mut pipeline = pipeline_with(settings(), Arc::new(FlatSource::new(3))).with_mesh_builder(
            Arc::new(move |request: &MeshRequest| {
                let first = {
                    let mut log = log.lock().expect("lock");
                    log.push(request.version);
                    log.len() == 1
                };
                while first && !gate.load(Ordering::SeqCst) {
                    std::thread::sleep(Duration::from_millis(1));
                }
                request.build()
            }),
        );
        let mut world = World::from_settings(pipeline.settings());
        let mut gpu = HeadlessBackend::new();
        let center = ColumnPos::new(0, 0);

        request_block(&pipeline, center, 1);
        run_until(&mut pipeline, &mut world, &mut gpu, |world, _, _| {
            world.chunk(center).is_some_and(|chunk| chunk.is_mesh_in_flight())
        });

        world.set_block(IVec3::new(4, 10, 4), BlockId::STONE);
        let chunk = world.chunk(center).expect("center");
        assert!(chunk.is_dirty() && chunk.is_mesh_in_flight());

        for _ in 0..10 {
            pipeline.tick(&mut world, &mut gpu);
        }
        assert_eq!(versions.lock().expect("lock").len(), 1);

        released.store(true, Ordering::SeqCst);
        run_until(&mut pipeline, &mut world, &mut gpu, |world, _, _| {
            world
                .chunk(center)
                .is_some_and(|chunk| chunk.is_uploaded() && !chunk.is_dirty() && chunk.is_mesh_idle())
        });
        for _ in 0..10 {
            pipeline.tick(&mut world, &mut gpu);
        }

        let versions = versions.lock().expect("lock").clone();
        assert_eq!(versions.len(), 2);
        assert!(versions[1] > versions[0]);
        let chunk = world.chunk(center).expect("center");
        assert_eq!(chunk.mesh_version(), versions[1]);
        assert_eq!(gpu.stats().creates, 1);
        assert_eq!(gpu.stats().updates, 1);
    }

    #[test]
    fn failed_uploads_are_retried_on_a_later_tick() {
        let mut pipeline = pipeline_with(settings(), Arc::new(FlatSource::new(3)));
        let mut world = World::from_settings(pipeline.settings());
        let mut gpu = HeadlessBackend::new();
        let center = ColumnPos::new(0, 0);

        gpu.fail_next(1);
        request_block(&pipeline, center, 1);
        run_until(&mut pipeline, &mut world, &mut gpu, |world, _, _| {
            world.chunk(center).is_some_and(|chunk| chunk.is_uploaded())
        });

        assert!(world.chunk(center).expect("center").gpu_handle().is_some());
        assert_eq!(gpu.live_buffers(), 1);
    }

    #[test]
    fn colliding_handles_are_regenerated() {
        let mut world = World::new(ColumnShape::new(8, 16), StreamingConfig::default());
        let a = ColumnPos::new(0, 0);
        let b = ColumnPos::new(1, 0);
        world.insert_generated(a, ChunkData::new_empty(ColumnShape::new(8, 16)));
        world.insert_generated(b, ChunkData::new_empty(ColumnShape::new(8, 16)));

        let mut gpu = HeadlessBackend::new();
        let mesh = ChunkMesh::default();
        let first = create_unique_buffer(&mut world, &mut gpu, a, &mesh).expect("first");
        world.chunk_mut(a).expect("a").mark_uploaded(first, 0);

        gpu.reset_handle_counter();
        let second = create_unique_buffer(&mut world, &mut gpu, b, &mesh).expect("second");
        assert_ne!(first, second);
        assert_eq!(gpu.stats().creates, 3);
    }

    #[test]
    fn late_results_for_unwanted_columns_are_discarded() {
        struct SlowSource;

        impl ChunkSource for SlowSource {
            fn generate(&self, _pos: ColumnPos, shape: ColumnShape) -> Result<ChunkData, GenerationError> {
                std::thread::sleep(Duration::from_millis(50));
                Ok(ChunkData::new_empty(shape))
            }

            fn post_process(&self, _world: &mut dyn VoxelAccess, _pos: ColumnPos) -> bool {
                true
            }
        }

        let settings = PipelineSettings {
            load_radius: 1,
            forward_bonus: 0,
            backward_penalty: 0,
            ..settings()
        };
        let mut pipeline = pipeline_with(settings, Arc::new(SlowSource));
        let mut world = World::from_settings(pipeline.settings());
        let mut gpu = HeadlessBackend::new();
        let pos = ColumnPos::new(0, 0);

        pipeline.request_generation(pos);
        let started = pipeline.tick(&mut world, &mut gpu);
        assert_eq!(started.generation_starts, 1);

        world.update_streaming(Vec3::new(8_000.0, 10.0, 8_000.0), Vec3::X, &pipeline, &mut gpu);
        let stats = run_until(&mut pipeline, &mut world, &mut gpu, |_, pipeline, _| {
            !pipeline.is_in_flight(pos)
        });

        assert!(!world.contains(pos));
        assert!(stats.discarded_results >= 1);
    }

    #[test]
    fn stationary_observer_converges_to_the_desired_set() {
        let settings = PipelineSettings {
            load_radius: 2,
            forward_bonus: 1,
            backward_penalty: 1,
            unload_margin: 1,
            unload_grace_ms: 0,
            ..settings()
        };
        let mut pipeline = pipeline_with(settings, Arc::new(FlatSource::new(1)));
        let mut world = World::from_settings(pipeline.settings());
        let mut gpu = HeadlessBackend::new();
        let observer = Vec3::new(4.0, 10.0, 4.0);
        let forward = Vec3::new(1.0, 0.0, 0.0);

        let desired: BTreeSet<(i32, i32)> = world
            .streaming()
            .desired_columns(ColumnPos::new(0, 0), glam::Vec2::new(1.0, 0.0))
            .into_iter()
            .map(|pos| (pos.x, pos.z))
            .collect();

        let deadline = Instant::now() + Duration::from_secs(20);
        loop {
            world.update_streaming(observer, forward, &pipeline, &mut gpu);
            pipeline.tick(&mut world, &mut gpu);
            if world.len() == desired.len() && pipeline.requests().in_flight() == 0 {
                break;
            }
            assert!(Instant::now() < deadline, "streaming did not converge");
            std::thread::sleep(Duration::from_millis(1));
        }

        for _ in 0..10 {
            world.update_streaming(observer, forward, &pipeline, &mut gpu);
            pipeline.tick(&mut world, &mut gpu);
        }
        let loaded: BTreeSet<(i32, i32)> = world
            .loaded_positions()
            .into_iter()
            .map(|pos| (pos.x, pos.z))
            .collect();
        assert_eq!(loaded, desired);
        assert!(desired.contains(&(3, 0)));
        assert!(!desired.contains(&(-2, 0)));
    }

    #[test]
    fn grace_period_keeps_fresh_chunks_loaded() {
        let protected = PipelineSettings {
            load_radius: 1,
            unload_grace_ms: 600_000,
            ..settings()
        };
        let pipeline = pipeline_with(protected.clone(), Arc::new(FlatSource::new(1)));
        let mut gpu = HeadlessBackend::new();
        let far = Vec3::new(4_000.0, 10.0, 0.0);

        let mut world = World::from_settings(pipeline.settings());
        for pos in [ColumnPos::new(0, 0), ColumnPos::new(1, 0), ColumnPos::new(0, 1)] {
            world.insert_generated(pos, ChunkData::new_empty(protected.column_shape()));
        }
        let update = world.update_streaming(far, Vec3::X, &pipeline, &mut gpu);
        assert_eq!(update.unloaded, 0);
        assert_eq!(world.len(), 3);

        let expired = PipelineSettings {
            unload_grace_ms: 0,
            ..protected
        };
        let mut world = World::from_settings(&expired);
        for pos in [ColumnPos::new(0, 0), ColumnPos::new(1, 0), ColumnPos::new(0, 1)] {
            world.insert_generated(pos, ChunkData::new_empty(expired.column_shape()));
        }
        let update = world.update_streaming(far, Vec3::X, &pipeline, &mut gpu);
        assert_eq!(update.unloaded, 3);
        assert!(world.is_empty());
    }

    #[test]
    fn queued_writes_land_after_terrain_fill() {
        let mut pipeline = pipeline_with(settings(), Arc::new(FlatSource::new(4)));
        let mut world = World::from_settings(pipeline.settings());
        let mut gpu = HeadlessBackend::new();
        let pos = ColumnPos::new(0, 0);

        world.set_block(IVec3::new(1, 2, 1), BlockId::GLASS);
        world.set_block(IVec3::new(1, 2, 1), BlockId::SAND);
        world.set_block(IVec3::new(2, 9, 2), BlockId::DIRT);
        pipeline.request_generation(pos);
        run_until(&mut pipeline, &mut world, &mut gpu, |world, _, _| world.contains(pos));

        assert_eq!(world.get_block(IVec3::new(1, 2, 1)), BlockId::SAND);
        assert_eq!(world.get_block(IVec3::new(2, 9, 2)), BlockId::DIRT);
        assert_eq!(world.get_block(IVec3::new(3, 2, 3)), BlockId::STONE);
        assert_eq!(world.queued_write_count(pos), 0);
    }

    #[test]
    fn generated_terrain_reaches_the_gpu() {
        let settings = PipelineSettings {
            world_height: 128,
            seed: 2024,
            ..settings()
        };
        let mut pipeline = PipelineManager::with_world_generator(settings).expect("pipeline");
        let mut world = World::from_settings(pipeline.settings());
        let mut gpu = HeadlessBackend::new();
        let center = ColumnPos::new(0, 0);

        request_block(&pipeline, center, 1);
        run_until(&mut pipeline, &mut world, &mut gpu, |world, _, _| {
            world.chunk(center).is_some_and(|chunk| chunk.is_uploaded())
        });

        let chunk = world.chunk(center).expect("center");
        assert!(chunk.is_post_processed());
        assert!(chunk.vertex_count() > 0);
        assert!(world.surface_height(3, 3).is_some());
        assert_eq!(world.get_block(IVec3::new(3, 0, 3)), BlockId::BEDROCK);
    }
}
