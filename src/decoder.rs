//! Typed telemetry model and the decoder seam.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::Error;
use crate::gpmf;
use crate::mp4::read_telemetry_samples;
use crate::payload::ExtractedPayload;

/// Device id -> the stream keys it exposes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamCatalog {
    pub devices: BTreeMap<String, DeviceStreams>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStreams {
    #[serde(rename = "device name", default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub streams: BTreeSet<String>,
}

impl StreamCatalog {
    /// Every stream key across all devices.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.devices
            .values()
            .flat_map(|d| d.streams.iter().map(String::as_str))
    }

    pub fn is_empty(&self) -> bool {
        self.devices.values().all(|d| d.streams.is_empty())
    }
}

/// Decoded telemetry for the requested streams of one file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TelemetryResult {
    pub devices: BTreeMap<String, DeviceTelemetry>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceTelemetry {
    #[serde(rename = "device name", default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub streams: BTreeMap<String, StreamTelemetry>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamTelemetry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub units: Vec<String>,
    pub samples: Vec<Sample>,
}

/// One scaled reading.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Seconds from the start of the track.
    pub cts: f64,
    pub value: Vec<f64>,
    /// UTC time reported by the receiver for the first reading of a payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fix: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub precision: Option<f64>,
}

impl TelemetryResult {
    pub fn sample_count(&self) -> usize {
        self.devices
            .values()
            .flat_map(|d| d.streams.values())
            .map(|s| s.samples.len())
            .sum()
    }
}

/// Turns payload bytes into telemetry, in two phases.
pub trait TelemetryDecoder {
    /// Enumerate device -> stream keys without decoding sample values.
    fn list_streams(&self, payload: &ExtractedPayload) -> Result<StreamCatalog, Error>;

    /// Decode only `keys`.
    fn extract(
        &self,
        payload: &ExtractedPayload,
        keys: &BTreeSet<String>,
    ) -> Result<TelemetryResult, Error>;
}

/// GoPro GPMF inside an MP4 (either the original file or an isolated track).
#[derive(Debug, Clone, Copy, Default)]
pub struct GpmfDecoder;

impl TelemetryDecoder for GpmfDecoder {
    fn list_streams(&self, payload: &ExtractedPayload) -> Result<StreamCatalog, Error> {
        let samples = read_telemetry_samples(&payload.bytes)?;
        gpmf::catalog(&samples)
    }

    fn extract(
        &self,
        payload: &ExtractedPayload,
        keys: &BTreeSet<String>,
    ) -> Result<TelemetryResult, Error> {
        let samples = read_telemetry_samples(&payload.bytes)?;
        gpmf::extract(&samples, keys)
    }
}
