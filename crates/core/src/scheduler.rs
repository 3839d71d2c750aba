use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch, Semaphore};

use crate::codec;
use crate::engine::{EngineLauncher, InterpolationEngine, KillSwitch};
use crate::error::PipelineError;
use crate::sink::FrameSink;
use crate::types::{Frame, InterpolationResult, InterpolationTask, PlaneGeometry, PlaneSet};

pub const DEFAULT_BUFFER_SIZE: usize = 4;

/// Sequence id of the first task: the 1-based index of its right frame.
pub const FIRST_TASK_ID: u64 = 2;

/// Called after every frame the sink accepts with `(written, total)`.
pub type ProgressCallback = Box<dyn Fn(u64, u64) + Send>;

/// Split `pairs` across `workers` channels. Every channel gets
/// `pairs / workers`; channel 0 also takes the remainder.
pub fn plan_batches(pairs: u64, workers: usize) -> Result<Vec<u64>> {
    if workers == 0 {
        return Err(PipelineError::Configuration("at least one worker is required".into()).into());
    }
    if workers as u64 > pairs {
        return Err(PipelineError::Configuration(format!(
            "{workers} workers requested but only {pairs} frame pairs to interpolate"
        ))
        .into());
    }
    let k = workers as u64;
    let mut batches = vec![pairs / k; workers];
    batches[0] += pairs % k;
    Ok(batches)
}

/// Holds out-of-order results until their sequence id comes up.
#[derive(Debug)]
pub struct ReorderBuffer {
    next_id: u64,
    end_id: u64,
    pending: BTreeMap<u64, InterpolationResult>,
}

impl ReorderBuffer {
    /// Accepts ids in `first_id..first_id + count`.
    pub fn new(first_id: u64, count: u64) -> Self {
        Self {
            next_id: first_id,
            end_id: first_id + count,
            pending: BTreeMap::new(),
        }
    }

    pub fn next_id(&self) -> u64 {
        self.next_id
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn insert(&mut self, result: InterpolationResult) -> Result<()> {
        let id = result.id;
        if id < self.next_id || id >= self.end_id || self.pending.contains_key(&id) {
            return Err(PipelineError::Consistency(format!(
                "unexpected result id {id} (next {}, end {})",
                self.next_id, self.end_id
            ))
            .into());
        }
        self.pending.insert(id, result);
        Ok(())
    }

    /// Pop the result for `next_id` if it has arrived.
    pub fn pop_ready(&mut self) -> Option<InterpolationResult> {
        let entry = self.pending.first_entry()?;
        if *entry.key() != self.next_id {
            return None;
        }
        self.next_id += 1;
        Some(entry.remove())
    }

    pub fn finish(self) -> Result<()> {
        if !self.pending.is_empty() {
            let ids: Vec<u64> = self.pending.keys().copied().collect();
            return Err(PipelineError::Consistency(format!(
                "results {ids:?} still pending at end of stream (next id {})",
                self.next_id
            ))
            .into());
        }
        Ok(())
    }
}

/// Caps how many tasks may be dispatched ahead of the collector's next
/// emitted result, which bounds the reorder buffer when one result lags.
#[derive(Clone)]
struct DispatchWindow {
    permits: Arc<Semaphore>,
    runtime: Handle,
}

impl DispatchWindow {
    /// Must be called from inside the runtime.
    fn new(size: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(size)),
            runtime: Handle::current(),
        }
    }

    /// Blocks the calling thread until a slot is free. Returns `false` once
    /// the window is closed. Never call from an async context.
    fn acquire_blocking(&self) -> bool {
        match self.runtime.block_on(self.permits.acquire()) {
            Ok(permit) => {
                permit.forget();
                true
            }
            Err(_) => false,
        }
    }

    fn release(&self) {
        self.permits.add_permits(1);
    }

    fn close(&self) {
        self.permits.close();
    }
}

/// Runs `K` engine channels over the adjacent frame pairs of one source and
/// writes `frame 1, mid(1,2), frame 2, ..., frame N` to a sink.
pub struct InterpolationScheduler {
    launcher: Arc<dyn EngineLauncher>,
    geometry: PlaneGeometry,
    total_frames: u64,
    batches: Vec<u64>,
    buffer_size: usize,
    progress: Option<ProgressCallback>,
}

impl InterpolationScheduler {
    /// Validates the worker count against the pair count. Nothing is
    /// launched until [`run`](Self::run).
    pub fn new(
        launcher: Arc<dyn EngineLauncher>,
        geometry: PlaneGeometry,
        total_frames: u64,
        workers: usize,
    ) -> Result<Self> {
        if total_frames < 2 {
            return Err(PipelineError::Configuration(format!(
                "need at least 2 frames to interpolate, source has {total_frames}"
            ))
            .into());
        }
        if geometry.width == 0 || geometry.height == 0 {
            return Err(PipelineError::Configuration(format!(
                "invalid frame geometry {}x{}",
                geometry.width, geometry.height
            ))
            .into());
        }
        let batches = plan_batches(total_frames - 1, workers)?;
        Ok(Self {
            launcher,
            geometry,
            total_frames,
            batches,
            buffer_size: DEFAULT_BUFFER_SIZE,
            progress: None,
        })
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size.max(1);
        self
    }

    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    pub fn batches(&self) -> &[u64] {
        &self.batches
    }

    pub fn total_pairs(&self) -> u64 {
        self.total_frames - 1
    }

    pub fn output_frames(&self) -> u64 {
        2 * self.total_frames - 1
    }

    /// Tasks that may be in flight or parked in the reorder buffer at once.
    pub fn dispatch_window(&self) -> usize {
        self.buffer_size * self.batches.len()
    }

    /// Drive the whole run. Returns the number of frames written.
    ///
    /// The first error from any stage cancels the others and is returned;
    /// an external cancel returns [`PipelineError::Cancelled`].
    pub async fn run<S, K>(mut self, source: S, sink: K, cancel: watch::Receiver<bool>) -> Result<u64>
    where
        S: Iterator<Item = Result<Frame>> + Send + 'static,
        K: FrameSink,
    {
        if *cancel.borrow() {
            return Err(PipelineError::Cancelled.into());
        }

        tracing::info!(
            frames = self.total_frames,
            pairs = self.total_pairs(),
            workers = self.batches.len(),
            batches = ?self.batches,
            dispatch_window = self.dispatch_window(),
            width = self.geometry.width,
            height = self.geometry.height,
            "Starting interpolation scheduler"
        );

        let (error_tx, mut error_rx) = mpsc::unbounded_channel::<anyhow::Error>();
        let (cancel_tx, _) = watch::channel(false);
        let cancel_state = Arc::new(AtomicBool::new(false));
        let external_cancel = Arc::new(AtomicBool::new(false));
        let kill_switches: Arc<Mutex<Vec<KillSwitch>>> = Arc::new(Mutex::new(Vec::new()));

        let window = DispatchWindow::new(self.dispatch_window());

        let reaper_handle = spawn_engine_reaper(
            cancel_tx.subscribe(),
            kill_switches.clone(),
            window.clone(),
        );
        let external_cancel_handle = spawn_external_cancel_watcher(
            cancel,
            cancel_state.clone(),
            external_cancel.clone(),
            cancel_tx.clone(),
        );

        let mut handles = Vec::new();

        let (first_tx, first_rx) = mpsc::channel::<Frame>(1);
        let (task_tx, task_rx) = mpsc::channel::<InterpolationTask>(self.buffer_size);
        let (result_tx, result_rx) = mpsc::channel::<InterpolationResult>(self.buffer_size);
        let (frame_tx, frame_rx) = mpsc::channel::<Frame>(self.buffer_size);

        handles.push(spawn_producer_stage(
            source,
            self.geometry,
            self.total_frames,
            first_tx,
            task_tx,
            window.clone(),
            cancel_state.clone(),
            cancel_tx.clone(),
            error_tx.clone(),
        ));

        let task_pool = Arc::new(Mutex::new(task_rx));
        for (slot, &batch) in self.batches.iter().enumerate() {
            handles.push(spawn_worker_stage(
                slot,
                batch,
                self.geometry,
                self.launcher.clone(),
                task_pool.clone(),
                result_tx.clone(),
                kill_switches.clone(),
                cancel_state.clone(),
                cancel_tx.clone(),
                error_tx.clone(),
            ));
        }
        // Workers own the only handles now; the producer unblocks once they exit.
        drop(task_pool);
        drop(result_tx);

        handles.push(spawn_collector_stage(
            first_rx,
            result_rx,
            frame_tx,
            self.total_pairs(),
            window,
            cancel_state.clone(),
            cancel_tx.clone(),
            error_tx.clone(),
        ));

        handles.push(spawn_sink_stage(
            sink,
            frame_rx,
            self.output_frames(),
            self.progress.take(),
            cancel_state.clone(),
            cancel_tx.clone(),
            error_tx.clone(),
        ));

        drop(error_tx);

        let mut first_error: Option<anyhow::Error> = None;

        for handle in handles {
            if let Err(join_error) = handle.await {
                signal_cancel(&cancel_state, &cancel_tx);
                if first_error.is_none() {
                    first_error = Some(anyhow!("scheduler task panicked: {join_error}"));
                }
            }
        }

        while let Some(error) = error_rx.recv().await {
            if first_error.is_none() {
                first_error = Some(error);
            }
        }

        signal_cancel(&cancel_state, &cancel_tx);
        external_cancel_handle.abort();
        reaper_handle.abort();
        for handle in [external_cancel_handle, reaper_handle] {
            if let Err(join_error) = handle.await {
                if !join_error.is_cancelled() && first_error.is_none() {
                    first_error = Some(anyhow!("scheduler watcher failed: {join_error}"));
                }
            }
        }

        if let Some(error) = first_error {
            return Err(error);
        }
        if external_cancel.load(Ordering::SeqCst) {
            return Err(PipelineError::Cancelled.into());
        }

        Ok(self.output_frames())
    }
}

fn spawn_external_cancel_watcher(
    mut cancel: watch::Receiver<bool>,
    cancel_state: Arc<AtomicBool>,
    external_cancel: Arc<AtomicBool>,
    cancel_tx: watch::Sender<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if *cancel.borrow_and_update() {
                // Only counts as a user cancel if no stage failed first.
                if !cancel_state.swap(true, Ordering::SeqCst) {
                    external_cancel.store(true, Ordering::SeqCst);
                    tracing::info!("Cancellation requested, stopping scheduler");
                }
                let _ = cancel_tx.send(true);
                return;
            }
            if cancel.changed().await.is_err() {
                return;
            }
        }
    })
}

/// Kills every registered engine once the run is cancelled or fails, and
/// closes the dispatch window so a waiting producer stops.
fn spawn_engine_reaper(
    mut cancel_rx: watch::Receiver<bool>,
    kill_switches: Arc<Mutex<Vec<KillSwitch>>>,
    window: DispatchWindow,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if *cancel_rx.borrow_and_update() {
                window.close();
                let switches = kill_switches
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .clone();
                if !switches.is_empty() {
                    tracing::debug!(engines = switches.len(), "Killing interpolation engines");
                }
                for switch in switches {
                    switch.kill();
                }
                return;
            }
            if cancel_rx.changed().await.is_err() {
                return;
            }
        }
    })
}

#[allow(clippy::too_many_arguments)]
fn spawn_producer_stage<S>(
    mut source: S,
    geometry: PlaneGeometry,
    total_frames: u64,
    first_tx: mpsc::Sender<Frame>,
    task_tx: mpsc::Sender<InterpolationTask>,
    window: DispatchWindow,
    cancel_state: Arc<AtomicBool>,
    cancel_tx: watch::Sender<bool>,
    error_tx: mpsc::UnboundedSender<anyhow::Error>,
) -> tokio::task::JoinHandle<()>
where
    S: Iterator<Item = Result<Frame>> + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let result = run_producer_loop(
            &mut source,
            geometry,
            total_frames,
            &first_tx,
            &task_tx,
            &window,
            &cancel_state,
        );
        if let Err(error) = result {
            report_task_error(
                &error_tx,
                &cancel_state,
                &cancel_tx,
                error.context("producer stage failed"),
            );
        }
    })
}

#[allow(clippy::too_many_arguments)]
fn spawn_worker_stage(
    slot: usize,
    batch: u64,
    geometry: PlaneGeometry,
    launcher: Arc<dyn EngineLauncher>,
    task_pool: Arc<Mutex<mpsc::Receiver<InterpolationTask>>>,
    result_tx: mpsc::Sender<InterpolationResult>,
    kill_switches: Arc<Mutex<Vec<KillSwitch>>>,
    cancel_state: Arc<AtomicBool>,
    cancel_tx: watch::Sender<bool>,
    error_tx: mpsc::UnboundedSender<anyhow::Error>,
) -> tokio::task::JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        let result = run_worker(
            slot,
            batch,
            geometry,
            launcher.as_ref(),
            &task_pool,
            &result_tx,
            &kill_switches,
            &cancel_state,
        );
        if let Err(error) = result {
            report_task_error(
                &error_tx,
                &cancel_state,
                &cancel_tx,
                error.context(format!("worker {slot} failed")),
            );
        }
    })
}

#[allow(clippy::too_many_arguments)]
fn spawn_collector_stage(
    first_rx: mpsc::Receiver<Frame>,
    result_rx: mpsc::Receiver<InterpolationResult>,
    frame_tx: mpsc::Sender<Frame>,
    total_pairs: u64,
    window: DispatchWindow,
    cancel_state: Arc<AtomicBool>,
    cancel_tx: watch::Sender<bool>,
    error_tx: mpsc::UnboundedSender<anyhow::Error>,
) -> tokio::task::JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        let result = run_collector_loop(
            first_rx,
            result_rx,
            &frame_tx,
            total_pairs,
            &window,
            &cancel_state,
        );
        // Nothing releases slots past this point.
        window.close();
        if let Err(error) = result {
            report_task_error(
                &error_tx,
                &cancel_state,
                &cancel_tx,
                error.context("collector stage failed"),
            );
        }
    })
}

fn spawn_sink_stage<K>(
    mut sink: K,
    input: mpsc::Receiver<Frame>,
    expected_frames: u64,
    progress: Option<ProgressCallback>,
    cancel_state: Arc<AtomicBool>,
    cancel_tx: watch::Sender<bool>,
    error_tx: mpsc::UnboundedSender<anyhow::Error>,
) -> tokio::task::JoinHandle<()>
where
    K: FrameSink,
{
    tokio::task::spawn_blocking(move || {
        let result = run_sink_loop(
            &mut sink,
            input,
            expected_frames,
            progress.as_ref(),
            &cancel_state,
        )
        .and_then(|written| {
            if cancel_state.load(Ordering::SeqCst) {
                return Ok(());
            }
            if written != expected_frames {
                return Err(PipelineError::Consistency(format!(
                    "sink received {written} frames, expected {expected_frames}"
                ))
                .into());
            }
            sink.finish().context("sink finish failed")
        });

        if let Err(error) = result {
            report_task_error(
                &error_tx,
                &cancel_state,
                &cancel_tx,
                error.context("sink stage failed"),
            );
        }
    })
}

fn run_producer_loop<S>(
    source: &mut S,
    geometry: PlaneGeometry,
    total_frames: u64,
    first_tx: &mpsc::Sender<Frame>,
    task_tx: &mpsc::Sender<InterpolationTask>,
    window: &DispatchWindow,
    cancel_state: &AtomicBool,
) -> Result<()>
where
    S: Iterator<Item = Result<Frame>>,
{
    let mut previous: Option<Arc<PlaneSet>> = None;
    let mut count = 0_u64;
    let mut total_read_ms = 0.0_f64;
    let mut total_encode_ms = 0.0_f64;
    let mut total_send_ms = 0.0_f64;

    loop {
        if cancel_state.load(Ordering::SeqCst) {
            return Ok(());
        }

        let t_read = Instant::now();
        let Some(frame_result) = source.next() else {
            break;
        };
        let index = count + 1;
        let frame = frame_result.with_context(|| format!("failed to read source frame {index}"))?;
        total_read_ms += t_read.elapsed().as_secs_f64() * 1000.0;

        if index > total_frames {
            return Err(PipelineError::Consistency(format!(
                "source produced more than the expected {total_frames} frames"
            ))
            .into());
        }
        if frame.width() != geometry.width || frame.height() != geometry.height {
            return Err(PipelineError::Consistency(format!(
                "source frame {index} is {}x{}, expected {}x{}",
                frame.width(),
                frame.height(),
                geometry.width,
                geometry.height
            ))
            .into());
        }

        let t_encode = Instant::now();
        let set = Arc::new(codec::encode(&frame));
        total_encode_ms += t_encode.elapsed().as_secs_f64() * 1000.0;

        let t_send = Instant::now();
        match previous.take() {
            None => {
                if first_tx.blocking_send(frame).is_err() {
                    return Ok(());
                }
            }
            Some(left) => {
                if !window.acquire_blocking() {
                    return Ok(());
                }
                let task = InterpolationTask {
                    id: index,
                    left,
                    right: set.clone(),
                };
                if task_tx.blocking_send(task).is_err() {
                    return Ok(());
                }
            }
        }
        total_send_ms += t_send.elapsed().as_secs_f64() * 1000.0;

        previous = Some(set);
        count = index;
    }

    if count != total_frames && !cancel_state.load(Ordering::SeqCst) {
        return Err(PipelineError::Consistency(format!(
            "source ended after {count} of {total_frames} frames"
        ))
        .into());
    }

    if count > 0 {
        tracing::info!(
            frames = count,
            avg_read_ms = format!("{:.1}", total_read_ms / count as f64),
            avg_encode_ms = format!("{:.1}", total_encode_ms / count as f64),
            avg_send_wait_ms = format!("{:.1}", total_send_ms / count as f64),
            total_encode_ms = format!("{:.0}", total_encode_ms),
            "Producer stage summary"
        );
    }

    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn run_worker(
    slot: usize,
    batch: u64,
    geometry: PlaneGeometry,
    launcher: &dyn EngineLauncher,
    task_pool: &Mutex<mpsc::Receiver<InterpolationTask>>,
    result_tx: &mpsc::Sender<InterpolationResult>,
    kill_switches: &Mutex<Vec<KillSwitch>>,
    cancel_state: &AtomicBool,
) -> Result<()> {
    if cancel_state.load(Ordering::SeqCst) {
        return Ok(());
    }

    let mut engine = launcher
        .launch(slot, batch, geometry)
        .with_context(|| format!("failed to launch engine for slot {slot}"))?;

    if let Some(switch) = engine.kill_switch() {
        kill_switches
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(switch);
    }
    // Registered before this check, so the reaper cannot miss this engine.
    if cancel_state.load(Ordering::SeqCst) {
        if let Some(switch) = engine.kill_switch() {
            switch.kill();
        }
        return Ok(());
    }

    let served = run_worker_loop(slot, batch, &mut engine, task_pool, result_tx, cancel_state)?;
    if served < batch {
        // Stopped by cancellation; dropping the engine tears it down.
        return Ok(());
    }

    engine
        .finish()
        .with_context(|| format!("engine slot {slot} did not shut down cleanly"))
}

fn run_worker_loop(
    slot: usize,
    batch: u64,
    engine: &mut Box<dyn InterpolationEngine>,
    task_pool: &Mutex<mpsc::Receiver<InterpolationTask>>,
    result_tx: &mpsc::Sender<InterpolationResult>,
    cancel_state: &AtomicBool,
) -> Result<u64> {
    let mut served = 0_u64;
    let mut total_recv_ms = 0.0_f64;
    let mut total_interpolate_ms = 0.0_f64;
    let mut total_send_ms = 0.0_f64;

    while served < batch {
        if cancel_state.load(Ordering::SeqCst) {
            break;
        }

        let t_recv = Instant::now();
        let task = task_pool
            .lock()
            .map_err(|_| anyhow!("task pool lock poisoned"))?
            .blocking_recv();
        let Some(task) = task else {
            if cancel_state.load(Ordering::SeqCst) {
                break;
            }
            return Err(PipelineError::Consistency(format!(
                "task pool drained after {served} of {batch} tasks"
            ))
            .into());
        };
        total_recv_ms += t_recv.elapsed().as_secs_f64() * 1000.0;

        let t_interp = Instant::now();
        let mid = engine
            .interpolate(&task.left, &task.right)
            .with_context(|| format!("interpolation failed on task {}", task.id))?;
        total_interpolate_ms += t_interp.elapsed().as_secs_f64() * 1000.0;
        served += 1;

        let result = InterpolationResult {
            id: task.id,
            mid,
            right: task.right,
        };
        let t_send = Instant::now();
        if result_tx.blocking_send(result).is_err() {
            break;
        }
        total_send_ms += t_send.elapsed().as_secs_f64() * 1000.0;
    }

    if served > 0 {
        tracing::info!(
            slot,
            batch,
            served,
            avg_recv_wait_ms = format!("{:.1}", total_recv_ms / served as f64),
            avg_interpolate_ms = format!("{:.1}", total_interpolate_ms / served as f64),
            avg_send_wait_ms = format!("{:.1}", total_send_ms / served as f64),
            total_interpolate_ms = format!("{:.0}", total_interpolate_ms),
            "Worker stage summary"
        );
    }

    Ok(served)
}

fn run_collector_loop(
    mut first_rx: mpsc::Receiver<Frame>,
    mut result_rx: mpsc::Receiver<InterpolationResult>,
    output: &mpsc::Sender<Frame>,
    total_pairs: u64,
    window: &DispatchWindow,
    cancel_state: &AtomicBool,
) -> Result<()> {
    let Some(first) = first_rx.blocking_recv() else {
        return stream_closed(cancel_state, "first frame never arrived");
    };
    if output.blocking_send(first).is_err() {
        return Ok(());
    }

    let mut reorder = ReorderBuffer::new(FIRST_TASK_ID, total_pairs);
    let mut emitted = 0_u64;
    let mut max_pending = 0_usize;
    let mut total_recv_ms = 0.0_f64;
    let mut total_decode_ms = 0.0_f64;

    while emitted < total_pairs {
        if cancel_state.load(Ordering::SeqCst) {
            return Ok(());
        }

        let t_recv = Instant::now();
        let Some(result) = result_rx.blocking_recv() else {
            return stream_closed(
                cancel_state,
                &format!("result stream closed after {emitted} of {total_pairs} results"),
            );
        };
        total_recv_ms += t_recv.elapsed().as_secs_f64() * 1000.0;

        reorder.insert(result)?;
        max_pending = max_pending.max(reorder.pending_len());

        while let Some(ready) = reorder.pop_ready() {
            let t_decode = Instant::now();
            let mid = codec::decode(&ready.mid)
                .with_context(|| format!("failed to decode mid frame {}", ready.id))?;
            let right = codec::decode(&ready.right)
                .with_context(|| format!("failed to decode frame {}", ready.id))?;
            total_decode_ms += t_decode.elapsed().as_secs_f64() * 1000.0;

            if output.blocking_send(mid).is_err() || output.blocking_send(right).is_err() {
                return Ok(());
            }
            emitted += 1;
            window.release();
        }
    }

    reorder.finish()?;

    if emitted > 0 {
        tracing::info!(
            results = emitted,
            max_pending,
            avg_recv_wait_ms = format!("{:.1}", total_recv_ms / emitted as f64),
            avg_decode_ms = format!("{:.1}", total_decode_ms / emitted as f64),
            "Collector stage summary"
        );
    }

    Ok(())
}

fn stream_closed(cancel_state: &AtomicBool, message: &str) -> Result<()> {
    if cancel_state.load(Ordering::SeqCst) {
        return Ok(());
    }
    Err(PipelineError::Consistency(message.to_string()).into())
}

fn run_sink_loop<K>(
    sink: &mut K,
    mut input: mpsc::Receiver<Frame>,
    expected_frames: u64,
    progress: Option<&ProgressCallback>,
    cancel_state: &AtomicBool,
) -> Result<u64>
where
    K: FrameSink,
{
    let mut written = 0_u64;
    let mut total_recv_ms = 0.0_f64;
    let mut total_write_ms = 0.0_f64;

    loop {
        if cancel_state.load(Ordering::SeqCst) {
            break;
        }

        let t_recv = Instant::now();
        let Some(frame) = input.blocking_recv() else {
            break;
        };
        total_recv_ms += t_recv.elapsed().as_secs_f64() * 1000.0;

        let t_write = Instant::now();
        sink.write_frame(&frame)
            .with_context(|| format!("failed to write output frame {}", written + 1))?;
        total_write_ms += t_write.elapsed().as_secs_f64() * 1000.0;

        written += 1;

        if let Some(callback) = progress {
            callback(written, expected_frames);
        }
    }

    if written > 0 {
        tracing::info!(
            frames = written,
            avg_recv_wait_ms = format!("{:.1}", total_recv_ms / written as f64),
            avg_write_ms = format!("{:.1}", total_write_ms / written as f64),
            total_write_ms = format!("{:.0}", total_write_ms),
            "Sink stage summary"
        );
    }

    Ok(written)
}

fn signal_cancel(cancel_state: &AtomicBool, cancel_tx: &watch::Sender<bool>) {
    cancel_state.store(true, Ordering::SeqCst);
    let _ = cancel_tx.send(true);
}

/// First error wins: anything raised after the run is already stopping is
/// a consequence of the stop and is only logged.
fn report_task_error(
    error_tx: &mpsc::UnboundedSender<anyhow::Error>,
    cancel_state: &AtomicBool,
    cancel_tx: &watch::Sender<bool>,
    error: anyhow::Error,
) {
    if cancel_state.swap(true, Ordering::SeqCst) {
        tracing::debug!("suppressed error after cancellation: {error:#}");
        let _ = cancel_tx.send(true);
        return;
    }
    let _ = cancel_tx.send(true);
    let _ = error_tx.send(error);
}
