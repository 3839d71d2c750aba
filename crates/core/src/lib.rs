//! Frame-rate doubling core: bit-plane codec, engine protocol, scheduler
//! and the ffmpeg source/sink around them.

pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod probe;
pub mod runtime;
pub mod scheduler;
pub mod sink;
pub mod source;
pub mod types;
