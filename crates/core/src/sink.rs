//! Frame sink: FFmpeg encode subprocess that receives `rgb48be` frames on
//! stdin and muxes them with the source file's first audio stream and
//! metadata.

use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Stdio};
use std::thread::{self, JoinHandle};

use anyhow::{anyhow, bail, Context, Result};
use tracing::debug;

use crate::config::EncoderSettings;
use crate::probe::FrameRate;
use crate::types::{Frame, PlaneGeometry};

/// Receives output frames in order, one call per frame.
pub trait FrameSink: Send + 'static {
    fn write_frame(&mut self, frame: &Frame) -> Result<()>;
    fn finish(&mut self) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct EncoderConfig {
    /// Original file; audio and metadata are copied from it.
    pub source_path: PathBuf,
    pub output_path: PathBuf,
    pub geometry: PlaneGeometry,
    /// Output frame rate (already doubled).
    pub frame_rate: FrameRate,
    pub codec: String,
    pub crf: u32,
    pub pixel_format: String,
    pub color_primaries: String,
    pub color_trc: String,
    pub colorspace: String,
    pub copy_audio: bool,
}

impl EncoderConfig {
    pub fn new(
        source_path: PathBuf,
        output_path: PathBuf,
        geometry: PlaneGeometry,
        frame_rate: FrameRate,
        settings: &EncoderSettings,
    ) -> Self {
        Self {
            source_path,
            output_path,
            geometry,
            frame_rate,
            codec: settings.codec.clone(),
            crf: settings.crf,
            pixel_format: settings.pixel_format.clone(),
            color_primaries: settings.color_primaries.clone(),
            color_trc: settings.color_trc.clone(),
            colorspace: settings.colorspace.clone(),
            copy_audio: settings.copy_audio,
        }
    }

    pub fn build_ffmpeg_args(&self) -> Vec<String> {
        let size = format!("{}x{}", self.geometry.width, self.geometry.height);

        let mut args: Vec<String> = vec![
            "-nostdin".into(),
            "-y".into(),
            "-i".into(),
            self.source_path.to_string_lossy().into_owned(),
            "-f".into(),
            "rawvideo".into(),
            "-pix_fmt".into(),
            "rgb48be".into(),
            "-video_size".into(),
            size,
            "-framerate".into(),
            self.frame_rate.to_string(),
            "-color_primaries".into(),
            self.color_primaries.clone(),
            "-color_trc".into(),
            self.color_trc.clone(),
            "-i".into(),
            "pipe:0".into(),
        ];

        if self.copy_audio {
            // Trailing '?' keeps silent sources encodable.
            args.extend(["-map".into(), "0:a:0?".into()]);
        }
        args.extend([
            "-map".into(),
            "1:v:0".into(),
            "-map_metadata".into(),
            "0".into(),
            "-movflags".into(),
            "use_metadata_tags".into(),
        ]);
        if self.copy_audio {
            args.extend([
                "-map_metadata:s:a".into(),
                "0:s:a".into(),
                "-c:a".into(),
                "copy".into(),
            ]);
        } else {
            args.push("-an".into());
        }

        args.extend([
            "-map_metadata:s:v".into(),
            "0:s:v".into(),
            "-c:v".into(),
            self.codec.clone(),
            "-crf".into(),
            self.crf.to_string(),
            "-pix_fmt".into(),
            self.pixel_format.clone(),
            "-colorspace".into(),
            self.colorspace.clone(),
            self.output_path.to_string_lossy().into_owned(),
        ]);

        args
    }

    pub fn frame_size(&self) -> usize {
        self.geometry.rgb48_frame_bytes()
    }
}

/// FFmpeg encode subprocess. Drains stderr in a background thread, kills
/// FFmpeg on [`Drop`] so an aborted run never finalizes its output.
pub struct VideoEncoder {
    child: Child,
    stdin: Option<ChildStdin>,
    stderr_thread: Option<JoinHandle<()>>,
    frame_size: usize,
    output_path: PathBuf,
}

impl VideoEncoder {
    pub fn new(config: &EncoderConfig) -> Result<Self> {
        let args = config.build_ffmpeg_args();

        debug!(
            cmd = %format!("ffmpeg {}", args.join(" ")),
            "launching FFmpeg encoder"
        );

        let mut child = crate::runtime::command_for("ffmpeg")
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .context("failed to launch ffmpeg, is it installed?")?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("failed to open ffmpeg stdin"))?;

        let stderr_thread = child.stderr.take().map(|stderr| {
            thread::spawn(move || {
                let reader = BufReader::new(stderr);
                for line in reader.lines() {
                    match line {
                        Ok(line) if !line.is_empty() => {
                            debug!(target: "ffmpeg_encode_stderr", "{}", line);
                        }
                        Err(e) => {
                            debug!(target: "ffmpeg_encode_stderr", "read error: {}", e);
                            break;
                        }
                        _ => {}
                    }
                }
            })
        });

        debug!(
            width = config.geometry.width,
            height = config.geometry.height,
            fps = %config.frame_rate,
            codec = %config.codec,
            crf = config.crf,
            pix_fmt = %config.pixel_format,
            "FFmpeg encoder started"
        );

        Ok(Self {
            child,
            stdin: Some(stdin),
            stderr_thread,
            frame_size: config.frame_size(),
            output_path: config.output_path.clone(),
        })
    }

    /// Raw `rgb48be` bytes, exactly `width * height * 6` of them.
    pub fn write_bytes(&mut self, data: &[u8]) -> Result<()> {
        if data.len() != self.frame_size {
            bail!(
                "frame size mismatch: expected {} bytes, got {}",
                self.frame_size,
                data.len()
            );
        }

        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| anyhow!("encoder stdin already closed"))?;

        stdin
            .write_all(data)
            .context("failed to write frame to ffmpeg stdin")?;

        Ok(())
    }

    pub fn finish(&mut self) -> Result<()> {
        drop(self.stdin.take());

        let status = self.child.wait().context("failed to wait for ffmpeg")?;

        if let Some(handle) = self.stderr_thread.take() {
            let _ = handle.join();
        }

        if !status.success() {
            bail!("ffmpeg encoder exited with status {}", status);
        }

        debug!(output = %self.output_path.display(), "FFmpeg encoder finished successfully");
        Ok(())
    }
}

impl Drop for VideoEncoder {
    fn drop(&mut self) {
        drop(self.stdin.take());
        let _ = self.child.kill();
        let _ = self.child.wait();
        if let Some(handle) = self.stderr_thread.take() {
            let _ = handle.join();
        }
    }
}

impl FrameSink for VideoEncoder {
    fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        self.write_bytes(&frame.to_rgb48be())
    }

    fn finish(&mut self) -> Result<()> {
        VideoEncoder::finish(self)
    }
}
