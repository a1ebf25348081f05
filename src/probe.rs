//! Stream location via `ffprobe`.

use std::ffi::OsString;
use std::path::Path;

use log::{debug, warn};
use serde::Deserialize;

use crate::Error;
use crate::config::Config;
use crate::runner::CommandRunner;

/// Codec name / tag GoPro uses for the GPMF metadata track.
pub const TELEMETRY_CODEC: &str = "gpmd";

/// Substring of the metadata track's handler name.
pub const TELEMETRY_HANDLER: &str = "gopro met";

/// One stream as reported by the probe.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProbedStream {
    pub index: u32,
    #[serde(default)]
    pub codec_name: Option<String>,
    #[serde(default)]
    pub codec_tag_string: Option<String>,
    /// Raw tag, e.g. `0x646d7067`.
    #[serde(default)]
    pub codec_tag: Option<String>,
    #[serde(default)]
    pub tags: ProbedTags,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ProbedTags {
    #[serde(default)]
    pub handler_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ProbeResult {
    #[serde(default)]
    pub streams: Vec<ProbedStream>,
}

impl ProbeResult {
    pub fn from_json(bytes: &[u8]) -> Result<ProbeResult, Error> {
        serde_json::from_slice(bytes).map_err(|e| Error::ProbeOutput(e.to_string()))
    }

    /// Index of the first stream that looks like GPMF telemetry.
    pub fn telemetry_stream(&self) -> Option<u32> {
        self.streams
            .iter()
            .find(|s| s.is_telemetry())
            .map(|s| s.index)
    }
}

impl ProbedStream {
    pub fn is_telemetry(&self) -> bool {
        let eq = |v: &Option<String>| {
            v.as_deref()
                .is_some_and(|s| s.trim().eq_ignore_ascii_case(TELEMETRY_CODEC))
        };
        if eq(&self.codec_name) || eq(&self.codec_tag_string) {
            return true;
        }
        if self
            .codec_tag
            .as_deref()
            .and_then(raw_tag_fourcc)
            .is_some_and(|t| t.eq_ignore_ascii_case(TELEMETRY_CODEC))
        {
            return true;
        }
        self.tags
            .handler_name
            .as_deref()
            .is_some_and(|h| h.to_lowercase().contains(TELEMETRY_HANDLER))
    }
}

/// ffprobe prints the raw tag as a little-endian hex u32 (`0x646d7067` is `gpmd`).
fn raw_tag_fourcc(raw: &str) -> Option<String> {
    let hex = raw.trim().strip_prefix("0x").or_else(|| raw.trim().strip_prefix("0X"))?;
    let v = u32::from_str_radix(hex, 16).ok()?;
    let bytes = v.to_le_bytes();
    if bytes.iter().all(|b| b.is_ascii_graphic() || *b == b' ') {
        Some(bytes.iter().map(|&b| b as char).collect())
    } else {
        None
    }
}

pub fn probe_args(path: &Path) -> Vec<OsString> {
    let mut args: Vec<OsString> = [
        "-v",
        "error",
        "-show_entries",
        "stream=index,codec_name,codec_tag_string,codec_tag:stream_tags=handler_name",
        "-of",
        "json",
    ]
    .iter()
    .map(OsString::from)
    .collect();
    args.push(path.as_os_str().to_owned());
    args
}

/// Run the probe and parse its stream list.
pub fn probe_streams(
    runner: &dyn CommandRunner,
    config: &Config,
    path: &Path,
) -> Result<ProbeResult, Error> {
    let out = runner.run(&config.ffprobe, &probe_args(path))?;
    if !out.success() {
        return Err(Error::CommandFailed {
            program: config.ffprobe.display().to_string(),
            status: out.status_string(),
            stderr: out.stderr_lossy(),
        });
    }
    ProbeResult::from_json(&out.stdout)
}

/// Index of the telemetry stream in `path`, or `None` if it can't be found for any reason.
pub fn locate_telemetry_stream(
    runner: &dyn CommandRunner,
    config: &Config,
    path: &Path,
) -> Option<u32> {
    match probe_streams(runner, config, path) {
        Ok(result) => {
            let found = result.telemetry_stream();
            debug!(
                "probe of {} saw {} streams, telemetry={:?}",
                path.display(),
                result.streams.len(),
                found
            );
            found
        }
        Err(e) => {
            warn!("  probe failed for {}: {e}", path.display());
            None
        }
    }
}
