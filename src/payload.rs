use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use crate::Error;
use crate::config::Config;

/// An input video on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub path: PathBuf,
    pub size: u64,
}

impl SourceFile {
    pub fn from_path(path: impl Into<PathBuf>) -> Result<SourceFile, Error> {
        let path = path.into();
        let size = fs::metadata(&path)?.len();
        Ok(SourceFile { path, size })
    }

    /// `name.mp4` -> `name.json`, next to the source.
    pub fn artifact_path(&self) -> PathBuf {
        self.path.with_extension("json")
    }
}

/// Refuses whole-file loads at or above `threshold` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeGuard {
    pub threshold: u64,
}

impl SizeGuard {
    pub fn new(threshold: u64) -> Self {
        SizeGuard { threshold }
    }

    pub fn is_oversized(&self, size: u64) -> bool {
        size >= self.threshold
    }
}

/// Where the payload bytes came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadSource {
    Isolated,
    FullFile,
}

/// Raw container bytes handed to the decoder.
#[derive(Debug, Clone)]
pub struct ExtractedPayload {
    pub bytes: Vec<u8>,
    pub source: PayloadSource,
}

/// Reads files into memory. A trait so the batch can be tested with simulated failures.
pub trait PayloadLoader {
    /// Load `path` (of `size` bytes) whole. Out-of-memory must surface as
    /// [`Error::OutOfMemory`].
    fn load(&self, path: &Path, size: u64, config: &Config) -> Result<Vec<u8>, Error>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FsLoader;

impl PayloadLoader for FsLoader {
    fn load(&self, path: &Path, size: u64, config: &Config) -> Result<Vec<u8>, Error> {
        let oom = |message: String| Error::OutOfMemory {
            path: path.to_path_buf(),
            size,
            message,
        };

        let want = usize::try_from(size).map_err(|_| oom("size exceeds address space".to_string()))?;
        let mut buf = Vec::new();
        buf.try_reserve_exact(want).map_err(|e| oom(e.to_string()))?;

        let mut f = File::open(path)?;
        match f.read_to_end(&mut buf) {
            Ok(_) => Ok(buf),
            Err(e) if is_oom_io(&e, config) => Err(oom(e.to_string())),
            Err(e) => Err(e.into()),
        }
    }
}

fn is_oom_io(e: &io::Error, config: &Config) -> bool {
    e.kind() == io::ErrorKind::OutOfMemory || config.looks_like_oom(&e.to_string())
}

/// Load with OOM classification applied to whatever error the loader returned.
pub fn load_full_file(
    loader: &dyn PayloadLoader,
    source: &SourceFile,
    config: &Config,
) -> Result<ExtractedPayload, Error> {
    let bytes = match loader.load(&source.path, source.size, config) {
        Ok(b) => b,
        Err(Error::Io(e)) if is_oom_io(&e, config) => {
            return Err(Error::OutOfMemory {
                path: source.path.clone(),
                size: source.size,
                message: e.to_string(),
            });
        }
        Err(e) => return Err(e),
    };
    Ok(ExtractedPayload {
        bytes,
        source: PayloadSource::FullFile,
    })
}

pub fn load_isolated(path: &Path) -> Result<ExtractedPayload, Error> {
    Ok(ExtractedPayload {
        bytes: fs::read(path)?,
        source: PayloadSource::Isolated,
    })
}
