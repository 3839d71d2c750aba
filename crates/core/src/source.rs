//! Frame source: raw `rgb48be` frames decoded by an FFmpeg subprocess.
//!
//! The decoder's stdout arrives in arbitrary chunk sizes; [`FrameAccumulator`]
//! buffers partial reads until a whole frame (`width * height * 6` bytes) is
//! available and keeps the remainder for the next one.

use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::process::{Child, ChildStdout, Stdio};
use std::thread::{self, JoinHandle};

use anyhow::{anyhow, bail, Context, Result};
use tracing::debug;

use crate::error::PipelineError;
use crate::types::{Frame, PlaneGeometry};

const READ_CHUNK_BYTES: usize = 1 << 16;

/// Re-chunks an arbitrary byte stream into whole frames.
#[derive(Debug)]
pub struct FrameAccumulator {
    geometry: PlaneGeometry,
    frame_bytes: usize,
    buffer: Vec<u8>,
}

impl FrameAccumulator {
    pub fn new(geometry: PlaneGeometry) -> Result<Self> {
        let frame_bytes = geometry.rgb48_frame_bytes();
        if frame_bytes == 0 {
            bail!(
                "cannot decode frames of size {}x{}",
                geometry.width,
                geometry.height
            );
        }
        Ok(Self {
            geometry,
            frame_bytes,
            buffer: Vec::with_capacity(frame_bytes),
        })
    }

    pub fn frame_bytes(&self) -> usize {
        self.frame_bytes
    }

    /// Bytes held back waiting for the rest of a frame.
    pub fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }

    /// Append `chunk` and move every completed frame into `out`.
    pub fn push(&mut self, chunk: &[u8], out: &mut VecDeque<Frame>) -> Result<()> {
        self.buffer.extend_from_slice(chunk);
        if self.buffer.len() < self.frame_bytes {
            return Ok(());
        }

        let whole = self.buffer.len() / self.frame_bytes * self.frame_bytes;
        for bytes in self.buffer[..whole].chunks_exact(self.frame_bytes) {
            out.push_back(Frame::from_rgb48be(
                self.geometry.width,
                self.geometry.height,
                bytes,
            )?);
        }
        self.buffer.drain(..whole);
        Ok(())
    }

    /// Fails if the stream stopped in the middle of a frame.
    pub fn finish(&self) -> Result<()> {
        if !self.buffer.is_empty() {
            return Err(PipelineError::Protocol(format!(
                "decoder output ended mid-frame ({} of {} bytes)",
                self.pending_bytes(),
                self.frame_bytes
            ))
            .into());
        }
        Ok(())
    }
}

/// Lazy, ordered frame iterator over any byte reader.
pub struct FrameReader<R: Read> {
    reader: R,
    accumulator: FrameAccumulator,
    ready: VecDeque<Frame>,
    chunk: Vec<u8>,
    done: bool,
}

impl<R: Read> FrameReader<R> {
    pub fn new(reader: R, geometry: PlaneGeometry) -> Result<Self> {
        Ok(Self {
            reader,
            accumulator: FrameAccumulator::new(geometry)?,
            ready: VecDeque::new(),
            chunk: vec![0u8; READ_CHUNK_BYTES],
            done: false,
        })
    }

    /// Read until at least one frame is ready. `Ok(false)` means clean EOF.
    fn fill(&mut self) -> Result<bool> {
        while self.ready.is_empty() {
            let n = match self.reader.read(&mut self.chunk) {
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e).context("failed to read decoder output"),
            };
            if n == 0 {
                self.accumulator.finish()?;
                return Ok(false);
            }
            self.accumulator.push(&self.chunk[..n], &mut self.ready)?;
        }
        Ok(true)
    }
}

impl<R: Read> Iterator for FrameReader<R> {
    type Item = Result<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(frame) = self.ready.pop_front() {
            return Some(Ok(frame));
        }
        if self.done {
            return None;
        }
        match self.fill() {
            Ok(true) => self.ready.pop_front().map(Ok),
            Ok(false) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

pub fn build_decoder_args(path: &Path) -> Vec<String> {
    vec![
        "-nostdin".to_string(),
        "-v".to_string(),
        "error".to_string(),
        "-i".to_string(),
        path.to_string_lossy().into_owned(),
        "-map".to_string(),
        "0:v:0".to_string(),
        "-f".to_string(),
        "rawvideo".to_string(),
        "-pix_fmt".to_string(),
        "rgb48be".to_string(),
        "pipe:1".to_string(),
    ]
}

/// Decodes video to 16-bit RGB frames via FFmpeg, one frame at a time.
/// Drains stderr in a background thread, kills FFmpeg on [`Drop`].
pub struct VideoDecoder {
    child: Child,
    frames: FrameReader<ChildStdout>,
    stderr_thread: Option<JoinHandle<()>>,
    decoded: u64,
    done: bool,
}

impl VideoDecoder {
    pub fn new(path: &Path, geometry: PlaneGeometry) -> Result<Self> {
        let args = build_decoder_args(path);
        debug!(
            cmd = %format!("ffmpeg {}", args.join(" ")),
            "launching FFmpeg decoder"
        );

        let mut child = crate::runtime::command_for("ffmpeg")
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("failed to launch ffmpeg, is it installed?")?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("failed to open ffmpeg stdout"))?;
        let stderr_thread = child.stderr.take().map(|stderr| {
            thread::spawn(move || {
                let reader = BufReader::new(stderr);
                for line in reader.lines() {
                    match line {
                        Ok(line) if !line.is_empty() => {
                            debug!(target: "ffmpeg_stderr", "{}", line);
                        }
                        Err(e) => {
                            debug!(target: "ffmpeg_stderr", "read error: {}", e);
                            break;
                        }
                        _ => {}
                    }
                }
            })
        });

        Ok(Self {
            child,
            frames: FrameReader::new(stdout, geometry)?,
            stderr_thread,
            decoded: 0,
            done: false,
        })
    }

    fn wait_for_exit(&mut self) -> Result<()> {
        let status = self.child.wait().context("failed to wait for ffmpeg")?;
        if let Some(handle) = self.stderr_thread.take() {
            let _ = handle.join();
        }
        if !status.success() {
            bail!("ffmpeg decoder exited with status {}", status);
        }
        debug!(frames = self.decoded, "FFmpeg decoder finished");
        Ok(())
    }
}

impl Iterator for VideoDecoder {
    type Item = Result<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.frames.next() {
            Some(Ok(frame)) => {
                self.decoded += 1;
                Some(Ok(frame))
            }
            Some(Err(e)) => {
                self.done = true;
                Some(Err(e))
            }
            None => {
                self.done = true;
                self.wait_for_exit().err().map(Err)
            }
        }
    }
}

impl Drop for VideoDecoder {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
        if let Some(handle) = self.stderr_thread.take() {
            let _ = handle.join();
        }
    }
}
