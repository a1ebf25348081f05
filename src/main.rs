use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use log::{LevelFilter, error};

use gopro_gps::{Config, Error, NoGpsPolicy, Pipeline, discover_sources};

#[derive(Parser, Debug)]
#[command(name = "gopro-gps")]
#[command(about = "Extract GPS telemetry from GoPro MP4 files into sibling JSON files", long_about = None)]
struct Cli {
    /// Directory to scan for .mp4 files (defaults to the current directory)
    #[arg(value_name = "DIR")]
    dir: Option<PathBuf>,

    /// Never load files of this many bytes or more into memory whole
    #[arg(long = "threshold", value_name = "BYTES", default_value_t = gopro_gps::config::DEFAULT_OVERSIZED_THRESHOLD)]
    threshold: u64,

    /// Probe executable
    #[arg(long, value_name = "PATH", default_value = "ffprobe")]
    ffprobe: PathBuf,

    /// Remux executable
    #[arg(long, value_name = "PATH", default_value = "ffmpeg")]
    ffmpeg: PathBuf,

    /// Directory for isolated telemetry tracks (defaults to the system temp dir)
    #[arg(long = "temp-dir", value_name = "DIR")]
    temp_dir: Option<PathBuf>,

    /// Kill ffprobe/ffmpeg after this many seconds
    #[arg(long = "timeout-secs", value_name = "SECS")]
    timeout_secs: Option<u64>,

    /// Write the stream catalog when a file has no GPS streams
    #[arg(long = "write-catalog", action = clap::ArgAction::SetTrue)]
    write_catalog: bool,

    /// Error text that marks a load failure as out-of-memory (repeatable; replaces the defaults)
    #[arg(long = "oom-marker", value_name = "TEXT")]
    oom_markers: Vec<String>,

    /// Skip ffprobe/ffmpeg and always load files whole (still size-guarded)
    #[arg(long = "no-isolate", action = clap::ArgAction::SetTrue)]
    no_isolate: bool,

    /// Debug logging
    #[arg(short, long, action = clap::ArgAction::SetTrue)]
    verbose: bool,
}

impl Cli {
    fn config(&self) -> Config {
        let mut config = Config {
            oversized_threshold: self.threshold,
            ffprobe: self.ffprobe.clone(),
            ffmpeg: self.ffmpeg.clone(),
            temp_dir: self.temp_dir.clone(),
            command_timeout: self.timeout_secs.map(Duration::from_secs),
            isolate: !self.no_isolate,
            no_gps: if self.write_catalog {
                NoGpsPolicy::WriteCatalog
            } else {
                NoGpsPolicy::Skip
            },
            ..Config::default()
        };
        if !self.oom_markers.is_empty() {
            config.oom_markers = self.oom_markers.iter().map(|m| m.to_lowercase()).collect();
        }
        config
    }
}

fn init_logging(verbose: bool) {
    let level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .format_timestamp(None)
        .format_target(false)
        .init();
}

fn run(cli: &Cli) -> Result<(), Error> {
    let dir = match &cli.dir {
        Some(d) => d.clone(),
        None => std::env::current_dir()?,
    };

    let sources = discover_sources(&dir)?;
    let summary = Pipeline::new(cli.config()).run(&sources);

    println!("{}", summary.summary_line());
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
