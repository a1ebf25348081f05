//! Per-file pipeline and the sequential batch driver.

use std::any::Any;
use std::fs;
use std::io::{BufWriter, Write};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use serde::Serialize;

use crate::Error;
use crate::config::{Config, NoGpsPolicy};
use crate::decoder::{GpmfDecoder, TelemetryDecoder};
use crate::isolate::try_isolate;
use crate::payload::{
    ExtractedPayload, FsLoader, PayloadLoader, PayloadSource, SizeGuard, SourceFile,
    load_full_file, load_isolated,
};
use crate::probe::locate_telemetry_stream;
use crate::runner::{CommandRunner, SystemRunner};
use crate::select::gps_stream_keys;

/// How processing of one file ended.
#[derive(Debug, Clone, PartialEq)]
pub enum FileOutcome {
    /// GPS telemetry written to `artifact`.
    Written {
        artifact: PathBuf,
        via: PayloadSource,
        samples: usize,
    },
    /// No GPS keys; the stream catalog was written instead.
    CatalogWritten { artifact: PathBuf },
    /// No GPS keys; nothing written.
    NoGps,
    /// Isolation unavailable and the file is too big to load whole.
    OversizedSkip { size: u64 },
    /// Loading the whole file ran out of memory.
    OutOfMemorySkip { message: String },
    Failed { message: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct FileReport {
    pub source: PathBuf,
    pub outcome: FileOutcome,
}

/// Aggregate of one batch run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchSummary {
    /// Every file the batch was given, whatever happened to it.
    pub files: usize,
    pub written: usize,
    pub catalogs: usize,
    pub no_gps: usize,
    pub oversized: usize,
    pub out_of_memory: usize,
    pub failed: usize,
    pub elapsed: Duration,
}

impl BatchSummary {
    pub fn record(&mut self, outcome: &FileOutcome) {
        self.files += 1;
        match outcome {
            FileOutcome::Written { .. } => self.written += 1,
            FileOutcome::CatalogWritten { .. } => self.catalogs += 1,
            FileOutcome::NoGps => self.no_gps += 1,
            FileOutcome::OversizedSkip { .. } => self.oversized += 1,
            FileOutcome::OutOfMemorySkip { .. } => self.out_of_memory += 1,
            FileOutcome::Failed { .. } => self.failed += 1,
        }
    }

    /// Elapsed seconds rounded to two places.
    pub fn elapsed_secs_rounded(&self) -> f64 {
        (self.elapsed.as_secs_f64() * 100.0).round() / 100.0
    }

    pub fn summary_line(&self) -> String {
        format!(
            "Processed {} files in {}s",
            self.files,
            self.elapsed_secs_rounded()
        )
    }
}

/// Every `*.mp4` (any case) directly inside `dir`, sorted by path.
///
/// Hidden entries are skipped, including the AppleDouble `._*.MP4` files macOS leaves on
/// camera cards.
pub fn discover_sources(dir: &Path) -> Result<Vec<SourceFile>, Error> {
    let mut paths = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }
        let path = entry.path();
        let is_mp4 = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("mp4"));
        if is_mp4 && path.is_file() {
            paths.push(path);
        }
    }

    if paths.is_empty() {
        return Err(Error::NoSourceFiles {
            dir: dir.to_path_buf(),
        });
    }

    paths.sort();
    paths.into_iter().map(SourceFile::from_path).collect()
}

/// Write `value` as pretty JSON next to `path` and rename it into place, so a failed write
/// never leaves a truncated artifact behind.
fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), Error> {
    let json = serde_json::to_string_pretty(value)?;
    let dir = match path.parent() {
        Some(d) if !d.as_os_str().is_empty() => d,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::Builder::new()
        .prefix(".gopro-gps-")
        .suffix(".json.tmp")
        .tempfile_in(dir)?;

    let mut out = BufWriter::new(tmp.as_file_mut());
    writeln!(out, "{json}")?;
    out.flush()?;
    drop(out);

    // Temp files are created 0600.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tmp.as_file().set_permissions(fs::Permissions::from_mode(0o644))?;
    }

    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panic: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panic: {s}")
    } else {
        "panic".to_string()
    }
}

/// The extraction pipeline and its collaborators.
#[derive(Debug, Clone)]
pub struct Pipeline<R = SystemRunner, L = FsLoader, D = GpmfDecoder> {
    pub config: Config,
    runner: R,
    loader: L,
    decoder: D,
}

impl Pipeline {
    /// Real subprocesses, real filesystem, GPMF decoding.
    pub fn new(config: Config) -> Self {
        let runner = SystemRunner::with_timeout(config.command_timeout);
        Pipeline {
            config,
            runner,
            loader: FsLoader,
            decoder: GpmfDecoder,
        }
    }
}

impl<R, L, D> Pipeline<R, L, D>
where
    R: CommandRunner,
    L: PayloadLoader,
    D: TelemetryDecoder,
{
    pub fn with_parts(config: Config, runner: R, loader: L, decoder: D) -> Self {
        Pipeline {
            config,
            runner,
            loader,
            decoder,
        }
    }

    pub fn run(&self, sources: &[SourceFile]) -> BatchSummary {
        self.run_with(sources, |_| {})
    }

    /// Process `sources` one after another, handing each report to `on_report`.
    pub fn run_with(&self, sources: &[SourceFile], mut on_report: impl FnMut(&FileReport)) -> BatchSummary {
        let started = Instant::now();
        let mut summary = BatchSummary::default();

        for source in sources {
            let report = self.report_file(source);
            summary.record(&report.outcome);
            on_report(&report);
        }

        summary.elapsed = started.elapsed();
        summary
    }

    pub fn report_file(&self, source: &SourceFile) -> FileReport {
        FileReport {
            source: source.path.clone(),
            outcome: self.process_file(source),
        }
    }

    /// Run one file through the pipeline. Never fails: every error becomes an outcome.
    pub fn process_file(&self, source: &SourceFile) -> FileOutcome {
        let path = source.path.display();
        info!("Processing {path}");

        let outcome = match panic::catch_unwind(AssertUnwindSafe(|| self.extract_file(source))) {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(Error::OutOfMemory { message, .. })) => FileOutcome::OutOfMemorySkip { message },
            Ok(Err(e)) => FileOutcome::Failed {
                message: e.to_string(),
            },
            Err(payload) => FileOutcome::Failed {
                message: panic_message(payload.as_ref()),
            },
        };

        match &outcome {
            FileOutcome::Written { artifact, via, samples } => {
                info!("  Wrote {} ({samples} samples via {via:?})", artifact.display())
            }
            FileOutcome::CatalogWritten { artifact } => warn!(
                "  No GPS streams found for {path}; wrote stream catalog to {}",
                artifact.display()
            ),
            FileOutcome::NoGps => warn!("  No GPS streams found for {path}"),
            FileOutcome::OversizedSkip { size } => warn!(
                "  Skipping {path}: {size} bytes is at or over the {} byte in-memory limit and the telemetry track could not be isolated",
                self.config.oversized_threshold
            ),
            FileOutcome::OutOfMemorySkip { message } => warn!(
                "  Out of memory loading {path} ({message}); make ffprobe/ffmpeg available so the telemetry track can be isolated, or lower the size threshold"
            ),
            FileOutcome::Failed { message } => error!("  Error processing {path}: {message}"),
        }

        outcome
    }

    fn load_payload(&self, source: &SourceFile) -> Result<Option<ExtractedPayload>, Error> {
        let isolated = if self.config.isolate {
            let index = locate_telemetry_stream(&self.runner, &self.config, &source.path);
            try_isolate(&self.runner, &self.config, &source.path, index)
        } else {
            None
        };

        if let Some(track) = isolated {
            debug!("  using isolated track {}", track.path().display());
            let payload = load_isolated(track.path());
            if let Err(e) = track.remove() {
                debug!("  could not remove isolated track: {e}");
            }
            return payload.map(Some);
        }

        if SizeGuard::new(self.config.oversized_threshold).is_oversized(source.size) {
            return Ok(None);
        }

        debug!("  loading whole file ({} bytes)", source.size);
        load_full_file(&self.loader, source, &self.config).map(Some)
    }

    fn extract_file(&self, source: &SourceFile) -> Result<FileOutcome, Error> {
        let Some(payload) = self.load_payload(source)? else {
            return Ok(FileOutcome::OversizedSkip { size: source.size });
        };

        let catalog = self.decoder.list_streams(&payload)?;
        let keys = gps_stream_keys(&catalog);
        let artifact = source.artifact_path();

        if keys.is_empty() {
            return match self.config.no_gps {
                NoGpsPolicy::Skip => Ok(FileOutcome::NoGps),
                NoGpsPolicy::WriteCatalog => {
                    write_json(&artifact, &catalog)?;
                    Ok(FileOutcome::CatalogWritten { artifact })
                }
            };
        }

        debug!("  GPS streams: {keys:?}");
        let telemetry = self.decoder.extract(&payload, &keys)?;
        write_json(&artifact, &telemetry)?;

        Ok(FileOutcome::Written {
            artifact,
            via: payload.source,
            samples: telemetry.sample_count(),
        })
    }
}
