//! Stream isolation via `ffmpeg` stream copy.

use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::Error;
use crate::config::Config;
use crate::runner::CommandRunner;

/// A temporary MP4 holding only the telemetry stream of one source file.
///
/// The file is removed when this value is dropped, so every exit path of a file's processing
/// cleans it up.
#[derive(Debug)]
pub struct IsolatedTrack {
    path: PathBuf,
    removed: bool,
}

impl IsolatedTrack {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Delete the temp file now, reporting the result.
    pub fn remove(mut self) -> io::Result<()> {
        self.removed = true;
        remove_if_present(&self.path)
    }
}

impl Drop for IsolatedTrack {
    fn drop(&mut self) {
        if self.removed {
            return;
        }
        if let Err(e) = remove_if_present(&self.path) {
            debug!("could not remove {}: {e}", self.path.display());
        }
    }
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Deterministic temp path for a source: `<temp>/<stem>.gpmd.mp4`.
pub fn isolated_track_path(temp_dir: &Path, source: &Path) -> PathBuf {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "telemetry".to_string());
    temp_dir.join(format!("{stem}.gpmd.mp4"))
}

pub fn remux_args(source: &Path, stream_index: u32, output: &Path) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec!["-y".into(), "-v".into(), "error".into(), "-i".into()];
    args.push(source.as_os_str().to_owned());
    args.push("-map".into());
    args.push(format!("0:{stream_index}").into());
    args.push("-c".into());
    args.push("copy".into());
    args.push("-f".into());
    args.push("mp4".into());
    args.push(output.as_os_str().to_owned());
    args
}

/// Copy stream `stream_index` of `source` into its own container.
pub fn isolate_stream(
    runner: &dyn CommandRunner,
    config: &Config,
    source: &Path,
    stream_index: u32,
) -> Result<IsolatedTrack, Error> {
    let output = isolated_track_path(&config.temp_dir(), source);
    // Owning the path before the remux runs means a half-written file is cleaned up too.
    let track = IsolatedTrack {
        path: output,
        removed: false,
    };

    let out = runner.run(&config.ffmpeg, &remux_args(source, stream_index, track.path()))?;
    if !out.success() {
        return Err(Error::CommandFailed {
            program: config.ffmpeg.display().to_string(),
            status: out.status_string(),
            stderr: out.stderr_lossy(),
        });
    }
    if !track.path().is_file() {
        return Err(Error::CommandFailed {
            program: config.ffmpeg.display().to_string(),
            status: out.status_string(),
            stderr: format!("no output written to {}", track.path().display()),
        });
    }

    Ok(track)
}

/// Isolate the telemetry stream if one was located; `None` means fall back.
pub fn try_isolate(
    runner: &dyn CommandRunner,
    config: &Config,
    source: &Path,
    stream_index: Option<u32>,
) -> Option<IsolatedTrack> {
    let index = stream_index?;
    match isolate_stream(runner, config, source, index) {
        Ok(track) => Some(track),
        Err(e) => {
            warn!("  isolation failed for {}: {e}", source.display());
            None
        }
    }
}
