use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Passthrough for IO errors (open/read/seek/write).
    #[error(transparent)]
    Io(#[from] io::Error),

    /// Passthrough for JSON serialization errors when writing artifacts.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// The input directory contained no `.mp4` files.
    #[error("no MP4 files found in {}", dir.display())]
    NoSourceFiles { dir: PathBuf },

    /// An external tool could not be run or exited unsuccessfully.
    #[error("{program} failed ({status}): {stderr}")]
    CommandFailed {
        program: String,
        status: String,
        stderr: String,
    },

    /// Probe output was not the JSON shape we asked for.
    #[error("unparsable probe output: {0}")]
    ProbeOutput(String),

    /// Loading a payload into memory failed because memory ran out.
    #[error("out of memory loading {} ({size} bytes): {message}", path.display())]
    OutOfMemory {
        path: PathBuf,
        size: u64,
        message: String,
    },

    /// No `gpmd` metadata track was found in the payload.
    #[error("no GPMF telemetry track found")]
    NoTelemetryTrack,

    /// MP4 structure is malformed or violates expected ISO-BMFF invariants.
    #[error("mp4 parse error in {context}: box {box_type} at offset {offset}: {message}")]
    Mp4InvalidBox {
        context: String,
        box_type: String,
        offset: u64,
        message: String,
    },

    /// Required tables/structures for extraction are missing.
    #[error("mp4 missing required sample tables: {missing}")]
    Mp4MissingSampleTables { missing: String },

    /// MP4 sample tables are internally inconsistent.
    #[error(
        "mp4 inconsistent sample tables: sample_sizes={sample_sizes} derived_offsets={sample_offsets} chunk_offsets={chunk_offsets}"
    )]
    Mp4InconsistentSampleTables {
        sample_sizes: usize,
        sample_offsets: usize,
        chunk_offsets: usize,
    },

    /// A sample points outside the payload bytes.
    #[error("sample {sample_index} at offset {offset} (+{size}) exceeds payload length {len}")]
    SampleOutOfBounds {
        sample_index: usize,
        offset: u64,
        size: u32,
        len: usize,
    },

    /// GPMF KLV structure is malformed.
    #[error("gpmf parse error at offset {offset}: key {key}: {message}")]
    GpmfInvalid {
        offset: usize,
        key: String,
        message: String,
    },
}

impl Error {
    /// True for the out-of-memory classification used by the batch skip path.
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, Error::OutOfMemory { .. })
    }
}
