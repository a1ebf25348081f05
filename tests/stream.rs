#![cfg(feature = "async")]

use std::collections::BTreeSet;
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::Path;

use tokio_stream::StreamExt;

use gopro_gps::decoder::{DeviceStreams, DeviceTelemetry, StreamTelemetry};
use gopro_gps::{
    CommandOutput, CommandRunner, Config, Error, ExtractedPayload, FileOutcome, FsLoader,
    Pipeline, SourceFile, StreamCatalog, TelemetryDecoder, TelemetryResult, stream_batch,
};

/// Neither tool is installed.
struct NoTools;

impl CommandRunner for NoTools {
    fn run(&self, program: &Path, _args: &[OsString]) -> io::Result<CommandOutput> {
        Err(io::Error::new(io::ErrorKind::NotFound, program.display().to_string()))
    }
}

/// Treats the payload text as a comma-separated list of stream keys.
struct KeyListDecoder;

impl TelemetryDecoder for KeyListDecoder {
    fn list_streams(&self, payload: &ExtractedPayload) -> Result<StreamCatalog, Error> {
        let text = String::from_utf8_lossy(&payload.bytes);
        let streams = text.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect();
        let mut catalog = StreamCatalog::default();
        catalog.devices.insert("1".into(), DeviceStreams { name: None, streams });
        Ok(catalog)
    }

    fn extract(&self, _payload: &ExtractedPayload, keys: &BTreeSet<String>) -> Result<TelemetryResult, Error> {
        let mut device = DeviceTelemetry::default();
        for k in keys {
            device.streams.insert(k.clone(), StreamTelemetry::default());
        }
        let mut result = TelemetryResult::default();
        result.devices.insert("1".into(), device);
        Ok(result)
    }
}

#[tokio::test]
async fn stream_yields_reports_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let mut sources = Vec::new();
    for (name, body) in [("a.mp4", "ACCL,GPS5"), ("b.mp4", "ACCL,GYRO"), ("c.mp4", "GPS9")] {
        let p = dir.path().join(name);
        fs::write(&p, body).unwrap();
        sources.push(SourceFile::from_path(p).unwrap());
    }

    let pipeline = Pipeline::with_parts(Config::default(), NoTools, FsLoader, KeyListDecoder);
    let reports: Vec<_> = stream_batch(pipeline, sources, 1).collect().await;

    assert_eq!(reports.len(), 3);
    assert!(matches!(reports[0].outcome, FileOutcome::Written { .. }));
    assert_eq!(reports[1].outcome, FileOutcome::NoGps);
    assert!(matches!(reports[2].outcome, FileOutcome::Written { .. }));
    assert!(reports[0].source.ends_with("a.mp4"));

    let written: TelemetryResult =
        serde_json::from_slice(&fs::read(dir.path().join("a.json")).unwrap()).unwrap();
    assert_eq!(written.devices["1"].streams.keys().collect::<Vec<_>>(), vec!["GPS5"]);
    assert!(!dir.path().join("b.json").exists());
}
