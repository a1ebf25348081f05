//! `gopro-gps` batch-extracts GPS telemetry from GoPro MP4 files into JSON next to each video.
//!
//! For every file the pipeline prefers a memory-safe path:
//! - Probe the container with `ffprobe` for the GPMF (`gpmd`) stream.
//! - Remux just that stream with `ffmpeg` into a temporary MP4 and decode it.
//! - Otherwise load the whole file, unless it is over the configured size threshold.
//!
//! Decoding is two-phase: list the stream keys, then decode only the GPS ones.
//!
//! ## Quick start
//! - Use [`discover_sources`] to find inputs and [`Pipeline::new`] + [`Pipeline::run`] to
//!   process them, or [`run_dir`] for both.
//! - Swap collaborators with [`Pipeline::with_parts`] (any [`CommandRunner`],
//!   [`PayloadLoader`], [`TelemetryDecoder`]).
//!
//! ## Features
//! - `async` (default): [`stream_batch`] yields per-file reports as a Tokio stream.

pub mod error;

pub mod config;
pub mod runner;

pub mod probe;
pub mod isolate;
pub mod payload;

mod gpmf;
mod mp4;
pub mod decoder;
pub mod select;

pub mod batch;

#[cfg(feature = "async")]
pub mod async_batch;

use std::path::Path;

pub use batch::{BatchSummary, FileOutcome, FileReport, Pipeline, discover_sources};
pub use config::{Config, NoGpsPolicy};
pub use decoder::{GpmfDecoder, StreamCatalog, TelemetryDecoder, TelemetryResult};
pub use error::Error;
pub use payload::{ExtractedPayload, FsLoader, PayloadLoader, PayloadSource, SizeGuard, SourceFile};
pub use runner::{CommandOutput, CommandRunner, SystemRunner};
pub use select::gps_stream_keys;

#[cfg(feature = "async")]
pub use async_batch::stream_batch;

/// Discover and process every MP4 in `dir` with the default collaborators.
pub fn run_dir(dir: &Path, config: Config) -> Result<BatchSummary, Error> {
    let sources = discover_sources(dir)?;
    Ok(Pipeline::new(config).run(&sources))
}
