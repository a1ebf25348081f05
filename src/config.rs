use std::path::PathBuf;
use std::time::Duration;

/// Files at or above this many bytes are never loaded whole.
pub const DEFAULT_OVERSIZED_THRESHOLD: u64 = 4_000_000_000;

/// Substrings (matched case-insensitively) that mark an I/O error message as an
/// out-of-memory condition. Allocation refusals are always classified as OOM.
pub const DEFAULT_OOM_MARKERS: &[&str] = &[
    "out of memory",
    "cannot allocate memory",
    "memory allocation failed",
    "enomem",
];

/// What to do when a file decodes but exposes no GPS stream keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NoGpsPolicy {
    /// Warn and write nothing.
    #[default]
    Skip,
    /// Warn and write the stream catalog in place of the telemetry result.
    WriteCatalog,
}

/// Knobs for one batch run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Size at which the full-file fallback is refused.
    pub oversized_threshold: u64,
    /// Lowercase substrings that classify a load error as out-of-memory.
    pub oom_markers: Vec<String>,
    /// Probe executable.
    pub ffprobe: PathBuf,
    /// Remux executable.
    pub ffmpeg: PathBuf,
    /// Where isolated tracks are written. `None` means the platform temp dir.
    pub temp_dir: Option<PathBuf>,
    /// Kill probe/remux invocations that run longer than this.
    pub command_timeout: Option<Duration>,
    /// Skip probing/remuxing and always take the (guarded) full-file path.
    pub isolate: bool,
    pub no_gps: NoGpsPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            oversized_threshold: DEFAULT_OVERSIZED_THRESHOLD,
            oom_markers: DEFAULT_OOM_MARKERS.iter().map(|m| m.to_string()).collect(),
            ffprobe: PathBuf::from("ffprobe"),
            ffmpeg: PathBuf::from("ffmpeg"),
            temp_dir: None,
            command_timeout: None,
            isolate: true,
            no_gps: NoGpsPolicy::Skip,
        }
    }
}

impl Config {
    pub fn temp_dir(&self) -> PathBuf {
        self.temp_dir.clone().unwrap_or_else(std::env::temp_dir)
    }

    /// Heuristic OOM check against the configured markers.
    pub fn looks_like_oom(&self, message: &str) -> bool {
        let lower = message.to_lowercase();
        self.oom_markers
            .iter()
            .any(|m| !m.is_empty() && lower.contains(&m.to_lowercase()))
    }
}
