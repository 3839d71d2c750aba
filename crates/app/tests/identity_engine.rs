//! End-to-end runs against real engine processes: the `identity-engine`
//! subcommand of this binary, launched once per worker.

use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;

use framedouble_core::engine::{EngineCommand, ProcessLauncher};
use framedouble_core::scheduler::InterpolationScheduler;
use framedouble_core::sink::FrameSink;
use framedouble_core::types::{Frame, PlaneGeometry};

const WIDTH: u32 = 4;
const HEIGHT: u32 = 4;

fn identity_engine() -> EngineCommand {
    EngineCommand {
        program: PathBuf::from(env!("CARGO_BIN_EXE_framedouble")),
        args: vec!["identity-engine".to_string()],
        request_timeout: Some(Duration::from_secs(30)),
    }
}

/// Every sample differs and uses the full 16-bit range, so a lossy plane
/// round trip would show up.
fn frame(seed: u32) -> Frame {
    let samples = (0..WIDTH * HEIGHT * 3)
        .map(|i| ((i * 4099 + seed * 7919) % 65536) as u16)
        .collect();
    Frame::new(WIDTH, HEIGHT, samples).unwrap()
}

#[derive(Clone, Default)]
struct CollectingSink {
    frames: Arc<Mutex<Vec<Frame>>>,
    finished: Arc<Mutex<bool>>,
}

impl FrameSink for CollectingSink {
    fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        self.frames.lock().unwrap().push(frame.clone());
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        *self.finished.lock().unwrap() = true;
        Ok(())
    }
}

async fn run_frames(count: u32, workers: usize) -> (Vec<Frame>, Vec<Frame>, bool) {
    let inputs: Vec<Frame> = (1..=count).map(frame).collect();
    let launcher = Arc::new(ProcessLauncher::new(identity_engine()));
    let scheduler = InterpolationScheduler::new(
        launcher,
        PlaneGeometry::new(WIDTH, HEIGHT),
        u64::from(count),
        workers,
    )
    .unwrap();

    let sink = CollectingSink::default();
    let (_cancel_tx, cancel_rx) = watch::channel(false);
    let written = scheduler
        .run(inputs.clone().into_iter().map(Ok), sink.clone(), cancel_rx)
        .await
        .expect("identity run should succeed");
    assert_eq!(written, u64::from(2 * count - 1));

    let outputs = sink.frames.lock().unwrap().clone();
    let finished = *sink.finished.lock().unwrap();
    (inputs, outputs, finished)
}

#[tokio::test]
async fn three_frames_through_one_engine_give_five_outputs() {
    let (inputs, outputs, finished) = run_frames(3, 1).await;

    assert!(finished);
    assert_eq!(
        outputs,
        vec![
            inputs[0].clone(),
            inputs[0].clone(),
            inputs[1].clone(),
            inputs[1].clone(),
            inputs[2].clone(),
        ]
    );
}

#[tokio::test]
async fn several_engine_processes_keep_output_order() {
    let (inputs, outputs, finished) = run_frames(9, 3).await;

    assert!(finished);
    assert_eq!(outputs.len(), 17);
    for (index, input) in inputs.iter().enumerate() {
        assert_eq!(&outputs[2 * index], input, "source frame {}", index + 1);
        if index + 1 < inputs.len() {
            assert_eq!(&outputs[2 * index + 1], input, "mid frame after {}", index + 1);
        }
    }
}

#[test]
fn probe_of_missing_file_exits_with_failure() {
    let data_dir = tempfile::tempdir().unwrap();
    let status = Command::new(env!("CARGO_BIN_EXE_framedouble"))
        .arg("--data-dir")
        .arg(data_dir.path())
        .args(["probe", "/definitely/not/here.mp4"])
        .status()
        .unwrap();

    assert_eq!(status.code(), Some(1));
}

#[test]
fn output_flag_with_two_inputs_is_rejected() {
    let data_dir = tempfile::tempdir().unwrap();
    let output = Command::new(env!("CARGO_BIN_EXE_framedouble"))
        .arg("--data-dir")
        .arg(data_dir.path())
        .args(["run", "a.mp4", "b.mp4", "-o", "out.mp4"])
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("single file"));
}

#[test]
fn identity_engine_subcommand_serves_without_logging_setup() {
    let data_dir = tempfile::tempdir().unwrap();
    let mut child = Command::new(env!("CARGO_BIN_EXE_framedouble"))
        .arg("--data-dir")
        .arg(data_dir.path())
        .arg("identity-engine")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();

    // Zero requests over a 1×1 plane set.
    let mut handshake = Vec::new();
    for word in [0_u64, 5, 1] {
        handshake.extend_from_slice(&word.to_be_bytes());
    }
    child.stdin.take().unwrap().write_all(&handshake).unwrap();
    let output = child.wait_with_output().unwrap();

    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    assert!(output.stdout.is_empty());
    assert!(!data_dir.path().join("logs").exists());
}
