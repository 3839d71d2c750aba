//! Engine channel: binds one external interpolation-engine process and
//! speaks its framed request/response protocol over stdin/stdout.
//!
//! Wire format, all integers big-endian:
//! - handshake, once: `u64 requests`, `u64 encoded_width`, `u64 height`;
//! - per request: left plane set, right plane set, each
//!   `encoded_width * height * 3` bytes in BGR order, row-major;
//! - per response: one plane set of the same size and layout.
//!
//! After `requests` round trips the engine must exit with status 0.

use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use tracing::{debug, info, warn};

use crate::error::PipelineError;
use crate::types::{PlaneGeometry, PlaneSet, CHANNELS, PLANE_COUNT};

pub const HANDSHAKE_BYTES: usize = 24;

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// The three integers an engine receives before its first request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    /// Requests the engine will serve before exiting.
    pub requests: u64,
    /// Width of the wide plane-set image (`source width * PLANE_COUNT`).
    pub encoded_width: u64,
    pub height: u64,
}

impl Handshake {
    pub fn for_batch(requests: u64, geometry: PlaneGeometry) -> Self {
        Self {
            requests,
            encoded_width: geometry.encoded_width() as u64,
            height: geometry.height as u64,
        }
    }

    pub fn encode(&self) -> [u8; HANDSHAKE_BYTES] {
        let mut bytes = [0u8; HANDSHAKE_BYTES];
        bytes[0..8].copy_from_slice(&self.requests.to_be_bytes());
        bytes[8..16].copy_from_slice(&self.encoded_width.to_be_bytes());
        bytes[16..24].copy_from_slice(&self.height.to_be_bytes());
        bytes
    }

    pub fn decode(bytes: &[u8; HANDSHAKE_BYTES]) -> Self {
        let word = |i: usize| {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&bytes[i * 8..(i + 1) * 8]);
            u64::from_be_bytes(buf)
        };
        Self {
            requests: word(0),
            encoded_width: word(1),
            height: word(2),
        }
    }

    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut bytes = [0u8; HANDSHAKE_BYTES];
        let read = read_full(reader, &mut bytes).context("failed to read engine handshake")?;
        if read != HANDSHAKE_BYTES {
            return Err(protocol(format!(
                "handshake truncated after {read} of {HANDSHAKE_BYTES} bytes"
            )));
        }
        Ok(Self::decode(&bytes))
    }

    /// Source geometry implied by the handshake.
    pub fn geometry(&self) -> Result<PlaneGeometry> {
        let planes = PLANE_COUNT as u64;
        if self.encoded_width == 0 || self.encoded_width % planes != 0 || self.height == 0 {
            return Err(protocol(format!(
                "handshake geometry {}x{} is not a {planes}-plane layout",
                self.encoded_width, self.height
            )));
        }
        let width = u32::try_from(self.encoded_width / planes)
            .map_err(|_| protocol(format!("handshake width {} overflows", self.encoded_width)))?;
        let height = u32::try_from(self.height)
            .map_err(|_| protocol(format!("handshake height {} overflows", self.height)))?;
        Ok(PlaneGeometry::new(width, height))
    }
}

/// Serialize a plane set in the engine's BGR byte order.
pub fn write_bgr24(set: &PlaneSet, out: &mut Vec<u8>) {
    out.clear();
    out.reserve(set.as_bytes().len());
    for px in set.as_bytes().chunks_exact(CHANNELS) {
        out.extend_from_slice(&[px[2], px[1], px[0]]);
    }
}

/// Parse an engine BGR buffer back into an RGB plane set.
pub fn read_bgr24(geometry: PlaneGeometry, bytes: &[u8]) -> Result<PlaneSet> {
    if bytes.len() != geometry.plane_set_bytes() {
        return Err(protocol(format!(
            "plane set payload is {} bytes, expected {}",
            bytes.len(),
            geometry.plane_set_bytes()
        )));
    }
    let mut data = Vec::with_capacity(bytes.len());
    for px in bytes.chunks_exact(CHANNELS) {
        data.extend_from_slice(&[px[2], px[1], px[0]]);
    }
    Ok(PlaneSet::from_parts(geometry, data))
}

/// Strict request/response channel contracted for exactly `batch` requests.
pub struct EngineChannel<W: Write, R: Read> {
    writer: W,
    reader: R,
    geometry: PlaneGeometry,
    batch: u64,
    served: u64,
    wire_buf: Vec<u8>,
}

impl<W: Write, R: Read> EngineChannel<W, R> {
    /// Write the handshake and return a channel ready for requests.
    pub fn open(mut writer: W, reader: R, geometry: PlaneGeometry, batch: u64) -> Result<Self> {
        let handshake = Handshake::for_batch(batch, geometry);
        writer
            .write_all(&handshake.encode())
            .and_then(|()| writer.flush())
            .map_err(|e| protocol(format!("failed to write handshake: {e}")))?;

        Ok(Self {
            writer,
            reader,
            geometry,
            batch,
            served: 0,
            wire_buf: Vec::with_capacity(geometry.plane_set_bytes()),
        })
    }

    pub fn geometry(&self) -> PlaneGeometry {
        self.geometry
    }

    pub fn batch(&self) -> u64 {
        self.batch
    }

    pub fn served(&self) -> u64 {
        self.served
    }

    pub fn is_complete(&self) -> bool {
        self.served == self.batch
    }

    /// Send one frame pair and block until the synthesized mid frame arrives.
    pub fn request(&mut self, left: &PlaneSet, right: &PlaneSet) -> Result<PlaneSet> {
        let number = self.served + 1;
        if self.served >= self.batch {
            return Err(protocol(format!(
                "engine contracted for {} requests, refusing request {number}",
                self.batch
            )));
        }
        for (side, set) in [("left", left), ("right", right)] {
            if set.geometry() != self.geometry {
                return Err(anyhow!(
                    "{side} plane set is {:?}, channel expects {:?}",
                    set.geometry(),
                    self.geometry
                ));
            }
        }

        for (side, set) in [("left", left), ("right", right)] {
            write_bgr24(set, &mut self.wire_buf);
            self.writer.write_all(&self.wire_buf).map_err(|e| {
                protocol(format!("failed to write {side} frame of request {number}: {e}"))
            })?;
        }
        self.writer
            .flush()
            .map_err(|e| protocol(format!("failed to flush request {number}: {e}")))?;

        let expected = self.geometry.plane_set_bytes();
        self.wire_buf.resize(expected, 0);
        let read = read_full(&mut self.reader, &mut self.wire_buf)
            .map_err(|e| protocol(format!("failed to read response {number}: {e}")))?;
        if read != expected {
            return Err(protocol(format!(
                "engine closed its output after {read} of {expected} bytes of response {number}"
            )));
        }

        let mid = read_bgr24(self.geometry, &self.wire_buf)?;
        self.served = number;
        Ok(mid)
    }

    pub fn into_parts(self) -> (W, R) {
        (self.writer, self.reader)
    }
}

/// Engine-side half of the protocol: read the handshake, answer every
/// request with `interpolate(left, right)`, return the request count.
pub fn serve_engine<R, W, F>(mut input: R, mut output: W, mut interpolate: F) -> Result<u64>
where
    R: Read,
    W: Write,
    F: FnMut(&PlaneSet, &PlaneSet) -> Result<PlaneSet>,
{
    let handshake = Handshake::read_from(&mut input)?;
    let geometry = handshake.geometry()?;
    let size = geometry.plane_set_bytes();
    let mut left_buf = vec![0u8; size];
    let mut right_buf = vec![0u8; size];
    let mut wire_buf = Vec::with_capacity(size);

    for number in 1..=handshake.requests {
        for (side, buf) in [("left", &mut left_buf), ("right", &mut right_buf)] {
            let read = read_full(&mut input, buf)
                .with_context(|| format!("failed to read {side} frame of request {number}"))?;
            if read != size {
                return Err(protocol(format!(
                    "input closed after {read} of {size} bytes of {side} frame, request {number}"
                )));
            }
        }
        let left = read_bgr24(geometry, &left_buf)?;
        let right = read_bgr24(geometry, &right_buf)?;
        let mid = interpolate(&left, &right)
            .with_context(|| format!("interpolation failed on request {number}"))?;

        write_bgr24(&mid, &mut wire_buf);
        output
            .write_all(&wire_buf)
            .and_then(|()| output.flush())
            .with_context(|| format!("failed to write response {number}"))?;
    }

    Ok(handshake.requests)
}

/// Read until `buf` is full or EOF; returns bytes read.
fn read_full<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        match reader.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(total)
}

fn protocol(message: String) -> anyhow::Error {
    PipelineError::Protocol(message).into()
}

/// One engine instance as seen by a scheduler worker.
pub trait InterpolationEngine: Send {
    fn interpolate(&mut self, left: &PlaneSet, right: &PlaneSet) -> Result<PlaneSet>;

    /// Confirm the contracted batch was served and the engine shut down cleanly.
    fn finish(self: Box<Self>) -> Result<()>;

    /// Handle that can tear the engine down from another thread.
    fn kill_switch(&self) -> Option<KillSwitch> {
        None
    }
}

/// Creates one engine per scheduler slot.
pub trait EngineLauncher: Send + Sync {
    fn launch(
        &self,
        slot: usize,
        batch: u64,
        geometry: PlaneGeometry,
    ) -> Result<Box<dyn InterpolationEngine>>;
}

/// How to start the external engine binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Per-request deadline; `None` waits forever.
    pub request_timeout: Option<Duration>,
}

type SharedChild = Arc<Mutex<Option<Child>>>;

/// Kills an engine process from any thread, including while `finish` waits
/// for it to exit. A no-op once the exit status has been collected.
#[derive(Clone)]
pub struct KillSwitch {
    slot: usize,
    child: SharedChild,
}

impl KillSwitch {
    pub fn kill(&self) {
        let mut guard = self.child.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(child) = guard.as_mut() {
            if let Err(e) = child.kill() {
                debug!(slot = self.slot, error = %e, "engine kill failed (already exited?)");
            } else {
                debug!(slot = self.slot, "engine process killed");
            }
        }
    }
}

enum WatchdogCommand {
    Arm(Instant),
    Disarm,
}

/// Kills the engine when an armed deadline passes.
struct Watchdog {
    tx: Option<mpsc::Sender<WatchdogCommand>>,
    fired: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    timeout: Duration,
}

impl Watchdog {
    fn spawn(timeout: Duration, kill_switch: KillSwitch) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<WatchdogCommand>();
        let fired = Arc::new(AtomicBool::new(false));
        let fired_flag = fired.clone();
        let handle = thread::Builder::new()
            .name(format!("engine-watchdog-{}", kill_switch.slot))
            .spawn(move || {
                let mut deadline: Option<Instant> = None;
                loop {
                    let command = match deadline {
                        None => match rx.recv() {
                            Ok(command) => command,
                            Err(_) => return,
                        },
                        Some(at) => {
                            match rx.recv_timeout(at.saturating_duration_since(Instant::now())) {
                                Ok(command) => command,
                                Err(mpsc::RecvTimeoutError::Timeout) => {
                                    fired_flag.store(true, Ordering::SeqCst);
                                    warn!(slot = kill_switch.slot, "engine request deadline passed, killing engine");
                                    kill_switch.kill();
                                    deadline = None;
                                    continue;
                                }
                                Err(mpsc::RecvTimeoutError::Disconnected) => return,
                            }
                        }
                    };
                    deadline = match command {
                        WatchdogCommand::Arm(at) => Some(at),
                        WatchdogCommand::Disarm => None,
                    };
                }
            })
            .context("failed to spawn engine watchdog thread")?;

        Ok(Self {
            tx: Some(tx),
            fired,
            handle: Some(handle),
            timeout,
        })
    }

    fn arm(&self) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(WatchdogCommand::Arm(Instant::now() + self.timeout));
        }
    }

    fn disarm(&self) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(WatchdogCommand::Disarm);
        }
    }

    fn has_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        drop(self.tx.take());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// External engine process driven through an [`EngineChannel`].
/// Drains stderr in a background thread, kills the engine on [`Drop`].
pub struct EngineProcess {
    slot: usize,
    channel: Mutex<Option<EngineChannel<ChildStdin, ChildStdout>>>,
    child: SharedChild,
    watchdog: Option<Watchdog>,
    stderr_thread: Option<JoinHandle<()>>,
}

impl EngineProcess {
    pub fn spawn(
        command: &EngineCommand,
        slot: usize,
        batch: u64,
        geometry: PlaneGeometry,
    ) -> Result<Self> {
        debug!(
            slot,
            batch,
            program = %command.program.display(),
            args = ?command.args,
            "launching interpolation engine"
        );

        let mut child = crate::runtime::command_for(&command.program.to_string_lossy())
            .args(&command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| {
                format!(
                    "failed to launch interpolation engine '{}'",
                    command.program.display()
                )
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("failed to open engine stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("failed to open engine stdout"))?;
        let stderr = child.stderr.take();

        let stderr_thread = stderr.map(|stderr| {
            thread::spawn(move || {
                let reader = BufReader::new(stderr);
                for line in reader.lines() {
                    match line {
                        Ok(line) if !line.is_empty() => {
                            debug!(target: "engine_stderr", slot, "{}", line);
                        }
                        Err(e) => {
                            debug!(target: "engine_stderr", slot, "read error: {}", e);
                            break;
                        }
                        _ => {}
                    }
                }
            })
        });

        let child: SharedChild = Arc::new(Mutex::new(Some(child)));
        let mut process = Self {
            slot,
            channel: Mutex::new(None),
            child,
            watchdog: None,
            stderr_thread,
        };

        if let Some(timeout) = command.request_timeout {
            process.watchdog = Some(Watchdog::spawn(timeout, process.kill_switch())?);
        }

        let channel = EngineChannel::open(stdin, stdout, geometry, batch)
            .with_context(|| format!("engine slot {slot} rejected its handshake"))?;
        *process.channel.lock().unwrap_or_else(|p| p.into_inner()) = Some(channel);

        info!(
            slot,
            batch,
            width = geometry.encoded_width(),
            height = geometry.height,
            "interpolation engine started"
        );
        Ok(process)
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn kill_switch(&self) -> KillSwitch {
        KillSwitch {
            slot: self.slot,
            child: self.child.clone(),
        }
    }

    /// Serialized round trip; concurrent callers queue on the channel lock.
    pub fn interpolate(&self, left: &PlaneSet, right: &PlaneSet) -> Result<PlaneSet> {
        let mut guard = self
            .channel
            .lock()
            .map_err(|_| anyhow!("engine slot {} channel lock poisoned", self.slot))?;
        let channel = guard
            .as_mut()
            .ok_or_else(|| anyhow!("engine slot {} is already finished", self.slot))?;
        let number = channel.served() + 1;

        if let Some(watchdog) = &self.watchdog {
            watchdog.arm();
        }
        let result = channel.request(left, right);
        if let Some(watchdog) = &self.watchdog {
            watchdog.disarm();
            if watchdog.has_fired() {
                return Err(PipelineError::Timeout(format!(
                    "engine slot {} exceeded {:?} on request {number}",
                    self.slot, watchdog.timeout
                ))
                .into());
            }
        }

        result.with_context(|| format!("engine slot {} failed on request {number}", self.slot))
    }

    /// Close stdin and wait for a clean exit. Fails if the batch was not
    /// fully served or the engine exits non-zero.
    pub fn finish(mut self) -> Result<()> {
        let channel = self
            .channel
            .get_mut()
            .map_err(|_| anyhow!("engine slot {} channel lock poisoned", self.slot))?
            .take()
            .ok_or_else(|| anyhow!("engine slot {} is already finished", self.slot))?;

        if !channel.is_complete() {
            return Err(protocol(format!(
                "engine slot {} torn down after {} of {} requests",
                self.slot,
                channel.served(),
                channel.batch()
            )));
        }
        let served = channel.served();
        drop(channel.into_parts());

        if let Some(watchdog) = &self.watchdog {
            watchdog.arm();
        }
        let waited = self.wait_for_exit();
        if let Some(watchdog) = &self.watchdog {
            watchdog.disarm();
            if watchdog.has_fired() {
                return Err(PipelineError::Timeout(format!(
                    "engine slot {} did not exit within {:?} after its last request",
                    self.slot, watchdog.timeout
                ))
                .into());
            }
        }
        let status = waited?;

        if let Some(handle) = self.stderr_thread.take() {
            let _ = handle.join();
        }

        if !status.success() {
            return Err(protocol(format!(
                "engine slot {} exited with {status} after serving {served} requests",
                self.slot
            )));
        }

        info!(slot = self.slot, served, "interpolation engine exited cleanly");
        Ok(())
    }

    /// Poll for exit while the child stays in the shared slot, so the kill
    /// switch and the watchdog can still reach it.
    fn wait_for_exit(&self) -> Result<ExitStatus> {
        loop {
            {
                let mut guard = self.child.lock().unwrap_or_else(|p| p.into_inner());
                let child = guard
                    .as_mut()
                    .ok_or_else(|| anyhow!("engine slot {} process already reaped", self.slot))?;
                let exited = child
                    .try_wait()
                    .with_context(|| format!("failed to wait for engine slot {}", self.slot))?;
                if let Some(status) = exited {
                    guard.take();
                    return Ok(status);
                }
            }
            thread::sleep(EXIT_POLL_INTERVAL);
        }
    }
}

impl Drop for EngineProcess {
    fn drop(&mut self) {
        if let Ok(channel) = self.channel.get_mut() {
            drop(channel.take());
        }
        let child = self
            .child
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(mut child) = child {
            let _ = child.kill();
            let _ = child.wait();
        }
        drop(self.watchdog.take());
        if let Some(handle) = self.stderr_thread.take() {
            let _ = handle.join();
        }
    }
}

impl InterpolationEngine for EngineProcess {
    fn interpolate(&mut self, left: &PlaneSet, right: &PlaneSet) -> Result<PlaneSet> {
        EngineProcess::interpolate(self, left, right)
    }

    fn finish(self: Box<Self>) -> Result<()> {
        EngineProcess::finish(*self)
    }

    fn kill_switch(&self) -> Option<KillSwitch> {
        Some(EngineProcess::kill_switch(self))
    }
}

/// Launches [`EngineProcess`]es from one [`EngineCommand`].
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    command: EngineCommand,
}

impl ProcessLauncher {
    pub fn new(command: EngineCommand) -> Self {
        Self { command }
    }
}

impl EngineLauncher for ProcessLauncher {
    fn launch(
        &self,
        slot: usize,
        batch: u64,
        geometry: PlaneGeometry,
    ) -> Result<Box<dyn InterpolationEngine>> {
        let process = EngineProcess::spawn(&self.command, slot, batch, geometry)?;
        Ok(Box::new(process))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::classify;
    use std::io::Cursor;

    fn solid_set(geometry: PlaneGeometry, rgb: [u8; 3]) -> PlaneSet {
        let pixels = geometry.encoded_width() as usize * geometry.height as usize;
        PlaneSet::new(geometry, rgb.repeat(pixels)).unwrap()
    }

    fn bgr_bytes(set: &PlaneSet) -> Vec<u8> {
        let mut out = Vec::new();
        write_bgr24(set, &mut out);
        out
    }

    #[test]
    fn test_handshake_is_three_big_endian_words() {
        let handshake = Handshake::for_batch(3, PlaneGeometry::new(4, 2));
        let bytes = handshake.encode();
        assert_eq!(&bytes[0..8], &[0, 0, 0, 0, 0, 0, 0, 3]);
        assert_eq!(&bytes[8..16], &[0, 0, 0, 0, 0, 0, 0, 20]);
        assert_eq!(&bytes[16..24], &[0, 0, 0, 0, 0, 0, 0, 2]);
        assert_eq!(Handshake::decode(&bytes), handshake);
        assert_eq!(handshake.geometry().unwrap(), PlaneGeometry::new(4, 2));
    }

    #[test]
    fn test_handshake_rejects_non_plane_width() {
        let handshake = Handshake {
            requests: 1,
            encoded_width: 7,
            height: 2,
        };
        let err = handshake.geometry().unwrap_err();
        assert!(matches!(classify(&err), Some(PipelineError::Protocol(_))));
    }

    #[test]
    fn test_bgr_wire_order_swaps_red_and_blue() {
        let geometry = PlaneGeometry::new(1, 1);
        let set = solid_set(geometry, [10, 20, 30]);
        let wire = bgr_bytes(&set);
        assert_eq!(&wire[0..3], &[30, 20, 10]);
        assert_eq!(read_bgr24(geometry, &wire).unwrap(), set);
    }

    #[test]
    fn test_channel_serves_exactly_its_batch() {
        let geometry = PlaneGeometry::new(2, 2);
        let left = solid_set(geometry, [1, 2, 3]);
        let right = solid_set(geometry, [4, 5, 6]);
        let mids: Vec<PlaneSet> = (0..3u8)
            .map(|n| solid_set(geometry, [n, n + 10, n + 20]))
            .collect();
        let responses: Vec<u8> = mids.iter().flat_map(bgr_bytes).collect();

        let mut channel =
            EngineChannel::open(Vec::new(), Cursor::new(responses), geometry, 3).unwrap();
        for expected in &mids {
            assert_eq!(&channel.request(&left, &right).unwrap(), expected);
        }
        assert!(channel.is_complete());

        let err = channel.request(&left, &right).unwrap_err();
        assert!(matches!(classify(&err), Some(PipelineError::Protocol(_))));
        assert!(err.to_string().contains("refusing request 4"), "{err}");

        let (written, _) = channel.into_parts();
        let mut cursor = Cursor::new(written);
        let handshake = Handshake::read_from(&mut cursor).unwrap();
        assert_eq!(handshake.requests, 3);
        assert_eq!(handshake.encoded_width, 10);
        assert_eq!(handshake.height, 2);

        let mut rest = Vec::new();
        cursor.read_to_end(&mut rest).unwrap();
        let pair: Vec<u8> = [bgr_bytes(&left), bgr_bytes(&right)].concat();
        assert_eq!(rest, pair.repeat(3), "rejected request must not reach the wire");
    }

    #[test]
    fn test_channel_reports_short_response() {
        let geometry = PlaneGeometry::new(2, 1);
        let set = solid_set(geometry, [9, 9, 9]);
        let truncated = vec![0u8; geometry.plane_set_bytes() - 1];

        let mut channel =
            EngineChannel::open(Vec::new(), Cursor::new(truncated), geometry, 1).unwrap();
        let err = channel.request(&set, &set).unwrap_err();
        assert!(matches!(classify(&err), Some(PipelineError::Protocol(_))));
        assert!(err.to_string().contains("29 of 30 bytes"), "{err}");
        assert_eq!(channel.served(), 0);
    }

    #[test]
    fn test_channel_rejects_mismatched_geometry() {
        let geometry = PlaneGeometry::new(2, 1);
        let other = solid_set(PlaneGeometry::new(1, 1), [0, 0, 0]);
        let mut channel =
            EngineChannel::open(Vec::new(), Cursor::new(Vec::new()), geometry, 1).unwrap();
        assert!(channel.request(&other, &other).is_err());
    }

    #[test]
    fn test_serve_engine_answers_every_request() {
        let geometry = PlaneGeometry::new(1, 2);
        let frames: Vec<PlaneSet> = (0..3u8)
            .map(|n| solid_set(geometry, [n, 2 * n, 3 * n]))
            .collect();

        let mut input = Handshake::for_batch(2, geometry).encode().to_vec();
        for pair in frames.windows(2) {
            input.extend(bgr_bytes(&pair[0]));
            input.extend(bgr_bytes(&pair[1]));
        }

        let mut output = Vec::new();
        let served = serve_engine(Cursor::new(input), &mut output, |left, _right| {
            Ok(left.clone())
        })
        .unwrap();

        assert_eq!(served, 2);
        let expected: Vec<u8> = frames[..2].iter().flat_map(bgr_bytes).collect();
        assert_eq!(output, expected);
    }

    #[test]
    fn test_serve_engine_fails_on_truncated_input() {
        let geometry = PlaneGeometry::new(1, 1);
        let mut input = Handshake::for_batch(1, geometry).encode().to_vec();
        input.extend(vec![0u8; geometry.plane_set_bytes() + 4]);

        let err = serve_engine(Cursor::new(input), Vec::new(), |left, _| Ok(left.clone()))
            .unwrap_err();
        assert!(matches!(classify(&err), Some(PipelineError::Protocol(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_engine_process_request_deadline_kills_engine() {
        let command = EngineCommand {
            program: PathBuf::from("sleep"),
            args: vec!["30".to_string()],
            request_timeout: Some(Duration::from_millis(200)),
        };
        let geometry = PlaneGeometry::new(1, 1);
        let set = solid_set(geometry, [1, 1, 1]);

        let started = Instant::now();
        let engine = EngineProcess::spawn(&command, 0, 1, geometry).unwrap();
        let err = engine.interpolate(&set, &set).unwrap_err();

        assert!(matches!(classify(&err), Some(PipelineError::Timeout(_))), "{err:#}");
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[test]
    fn test_engine_process_exiting_early_is_protocol_violation() {
        let command = EngineCommand {
            program: PathBuf::from("true"),
            args: Vec::new(),
            request_timeout: Some(Duration::from_secs(10)),
        };
        let geometry = PlaneGeometry::new(1, 1);
        let set = solid_set(geometry, [1, 1, 1]);

        let result = EngineProcess::spawn(&command, 0, 1, geometry)
            .and_then(|engine| engine.interpolate(&set, &set));
        let err = result.unwrap_err();
        assert!(matches!(classify(&err), Some(PipelineError::Protocol(_))), "{err:#}");
    }

    #[cfg(unix)]
    #[test]
    fn test_unfinished_batch_is_rejected_on_finish() {
        let command = EngineCommand {
            program: PathBuf::from("sleep"),
            args: vec!["30".to_string()],
            request_timeout: None,
        };
        let engine = EngineProcess::spawn(&command, 2, 4, PlaneGeometry::new(1, 1)).unwrap();
        let err = engine.finish().unwrap_err();
        assert!(matches!(classify(&err), Some(PipelineError::Protocol(_))));
        assert!(err.to_string().contains("after 0 of 4 requests"), "{err}");
    }

    /// Serves one 1×1 request, then keeps running with stdin closed.
    #[cfg(unix)]
    fn lingering_engine(request_timeout: Option<Duration>) -> EngineCommand {
        EngineCommand {
            program: PathBuf::from("sh"),
            args: vec![
                "-c".to_string(),
                "head -c 54 >/dev/null; head -c 15 /dev/zero; exec sleep 30".to_string(),
            ],
            request_timeout,
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_engine_lingering_after_batch_hits_deadline_on_finish() {
        let geometry = PlaneGeometry::new(1, 1);
        let set = solid_set(geometry, [1, 1, 1]);
        let engine = EngineProcess::spawn(
            &lingering_engine(Some(Duration::from_millis(300))),
            0,
            1,
            geometry,
        )
        .unwrap();
        engine.interpolate(&set, &set).unwrap();

        let started = Instant::now();
        let err = engine.finish().unwrap_err();
        assert!(matches!(classify(&err), Some(PipelineError::Timeout(_))), "{err:#}");
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[cfg(unix)]
    #[test]
    fn test_kill_switch_reaches_engine_during_finish() {
        let geometry = PlaneGeometry::new(1, 1);
        let set = solid_set(geometry, [1, 1, 1]);
        let engine = EngineProcess::spawn(&lingering_engine(None), 0, 1, geometry).unwrap();
        engine.interpolate(&set, &set).unwrap();

        let kill_switch = engine.kill_switch();
        let killer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            kill_switch.kill();
        });

        let started = Instant::now();
        let err = engine.finish().unwrap_err();
        killer.join().unwrap();
        assert!(matches!(classify(&err), Some(PipelineError::Protocol(_))), "{err:#}");
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
