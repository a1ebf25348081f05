use std::collections::BTreeSet;

use log::debug;

use crate::Error;
use crate::decoder::{DeviceTelemetry, Sample, StreamCatalog, TelemetryResult};
use crate::mp4::{TelemetrySample, fourcc_to_string};

// -----------------------------
// GPMF KLV parsing
// -----------------------------
const DEVC: [u8; 4] = *b"DEVC";
const DVID: [u8; 4] = *b"DVID";
const DVNM: [u8; 4] = *b"DVNM";
const STRM: [u8; 4] = *b"STRM";
const STNM: [u8; 4] = *b"STNM";
const SIUN: [u8; 4] = *b"SIUN";
const UNIT: [u8; 4] = *b"UNIT";
const SCAL: [u8; 4] = *b"SCAL";
const TYPE: [u8; 4] = *b"TYPE";
const GPSF: [u8; 4] = *b"GPSF";
const GPSU: [u8; 4] = *b"GPSU";
const GPSP: [u8; 4] = *b"GPSP";

const HEADER_LEN: usize = 8;

/// One key-length-value entry.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Klv<'a> {
    pub(crate) key: [u8; 4],
    pub(crate) type_char: u8,
    pub(crate) struct_size: u8,
    pub(crate) repeat: u16,
    pub(crate) data: &'a [u8],
    /// Offset of the header within the payload, for error messages.
    pub(crate) offset: usize,
}

pub(crate) struct KlvIter<'a> {
    buf: &'a [u8],
    pos: usize,
    base: usize,
    done: bool,
}

impl<'a> KlvIter<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        KlvIter {
            buf,
            pos: 0,
            base: 0,
            done: false,
        }
    }
}

impl<'a> Iterator for KlvIter<'a> {
    type Item = Result<Klv<'a>, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.pos + HEADER_LEN > self.buf.len() {
            return None;
        }
        let h = &self.buf[self.pos..self.pos + HEADER_LEN];
        let key = [h[0], h[1], h[2], h[3]];
        // Zero padding after the last entry.
        if key == [0; 4] {
            self.done = true;
            return None;
        }
        let type_char = h[4];
        let struct_size = h[5];
        let repeat = u16::from_be_bytes([h[6], h[7]]);

        let len = struct_size as usize * repeat as usize;
        let start = self.pos + HEADER_LEN;
        let offset = self.base + self.pos;
        if start + len > self.buf.len() {
            self.done = true;
            return Some(Err(Error::GpmfInvalid {
                offset,
                key: fourcc_to_string(key),
                message: format!("length {len} overruns buffer of {}", self.buf.len() - start),
            }));
        }

        // Entries are 32-bit aligned.
        self.pos = start + ((len + 3) & !3);

        Some(Ok(Klv {
            key,
            type_char,
            struct_size,
            repeat,
            data: &self.buf[start..start + len],
            offset,
        }))
    }
}

impl<'a> Klv<'a> {
    pub(crate) fn is_nested(&self) -> bool {
        self.type_char == 0
    }

    pub(crate) fn children(&self) -> KlvIter<'a> {
        KlvIter {
            buf: self.data,
            pos: 0,
            base: self.offset + HEADER_LEN,
            done: false,
        }
    }

    pub(crate) fn key_string(&self) -> String {
        fourcc_to_string(self.key)
    }

    fn invalid(&self, message: impl Into<String>) -> Error {
        Error::GpmfInvalid {
            offset: self.offset,
            key: self.key_string(),
            message: message.into(),
        }
    }

    /// Whole value as text (`c` entries, trailing NULs dropped).
    pub(crate) fn text(&self) -> String {
        trim_text(self.data)
    }

    /// One string per repeat, e.g. `SIUN` with one unit per axis.
    pub(crate) fn texts(&self) -> Vec<String> {
        if self.struct_size == 0 {
            return Vec::new();
        }
        self.data
            .chunks(self.struct_size as usize)
            .map(trim_text)
            .collect()
    }

    /// Decode numeric rows, one per repeat. `complex` is the active `TYPE` for `?` entries.
    pub(crate) fn rows(&self, complex: Option<&[u8]>) -> Result<Vec<Vec<f64>>, Error> {
        let layout: Vec<u8> = if self.type_char == b'?' {
            let def = complex.ok_or_else(|| self.invalid("complex value without TYPE"))?;
            expand_type(def).ok_or_else(|| self.invalid("unreadable TYPE"))?
        } else {
            let size = elem_size(self.type_char)
                .ok_or_else(|| self.invalid(format!("unsupported type {:?}", self.type_char as char)))?;
            if self.struct_size as usize % size != 0 {
                return Err(self.invalid(format!(
                    "struct size {} not a multiple of {size}",
                    self.struct_size
                )));
            }
            vec![self.type_char; self.struct_size as usize / size]
        };

        let mut sizes = Vec::with_capacity(layout.len());
        for &t in &layout {
            sizes.push(elem_size(t).ok_or_else(|| self.invalid(format!("unsupported type {:?}", t as char)))?);
        }
        if sizes.iter().sum::<usize>() != self.struct_size as usize {
            return Err(self.invalid("TYPE does not match struct size"));
        }

        let rows = self
            .data
            .chunks_exact(self.struct_size.max(1) as usize)
            .take(self.repeat as usize)
            .map(|row| {
                let mut out = Vec::with_capacity(layout.len());
                let mut at = 0;
                for (&t, &size) in layout.iter().zip(&sizes) {
                    if let Some(v) = read_number(t, &row[at..at + size]) {
                        out.push(v);
                    }
                    at += size;
                }
                out
            })
            .collect();
        Ok(rows)
    }

    /// All numbers in the entry, flattened.
    pub(crate) fn numbers(&self) -> Result<Vec<f64>, Error> {
        Ok(self.rows(None)?.into_iter().flatten().collect())
    }
}

fn trim_text(b: &[u8]) -> String {
    let end = b.iter().rposition(|&c| c != 0).map_or(0, |p| p + 1);
    String::from_utf8_lossy(&b[..end]).trim().to_string()
}

fn elem_size(t: u8) -> Option<usize> {
    Some(match t {
        b'b' | b'B' | b'c' => 1,
        b's' | b'S' => 2,
        b'l' | b'L' | b'f' | b'F' | b'q' => 4,
        b'd' | b'j' | b'J' | b'Q' => 8,
        b'U' | b'G' => 16,
        _ => return None,
    })
}

/// Numeric value of one element; `None` for text/date/fourcc/uuid elements.
fn read_number(t: u8, b: &[u8]) -> Option<f64> {
    Some(match t {
        b'b' => b[0] as i8 as f64,
        b'B' => b[0] as f64,
        b's' => i16::from_be_bytes([b[0], b[1]]) as f64,
        b'S' => u16::from_be_bytes([b[0], b[1]]) as f64,
        b'l' => i32::from_be_bytes(b.try_into().ok()?) as f64,
        b'L' => u32::from_be_bytes(b.try_into().ok()?) as f64,
        b'f' => f32::from_be_bytes(b.try_into().ok()?) as f64,
        b'd' => f64::from_be_bytes(b.try_into().ok()?),
        b'j' => i64::from_be_bytes(b.try_into().ok()?) as f64,
        b'J' => u64::from_be_bytes(b.try_into().ok()?) as f64,
        // Q15.16 / Q31.32 fixed point
        b'q' => i32::from_be_bytes(b.try_into().ok()?) as f64 / 65_536.0,
        b'Q' => i64::from_be_bytes(b.try_into().ok()?) as f64 / 4_294_967_296.0,
        _ => return None,
    })
}

/// `lllf[3]S` -> `lllfffS`.
fn expand_type(def: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < def.len() {
        let t = def[i];
        if t == 0 {
            break;
        }
        i += 1;
        let mut count = 1usize;
        if def.get(i) == Some(&b'[') {
            let close = def[i..].iter().position(|&c| c == b']')? + i;
            count = std::str::from_utf8(&def[i + 1..close]).ok()?.parse().ok()?;
            i = close + 1;
        }
        out.extend(std::iter::repeat_n(t, count));
    }
    Some(out)
}

/// `yymmddhhmmss.sss` -> RFC 3339.
fn format_gps_date(raw: &str) -> String {
    let b = raw.as_bytes();
    if b.len() >= 16 && b[..16].is_ascii() && b[..12].iter().all(u8::is_ascii_digit) {
        format!(
            "20{}-{}-{}T{}:{}:{}Z",
            &raw[0..2],
            &raw[2..4],
            &raw[4..6],
            &raw[6..8],
            &raw[8..10],
            &raw[10..16]
        )
    } else {
        raw.to_string()
    }
}

fn device_id(klv: &Klv<'_>) -> String {
    match klv.type_char {
        b'F' | b'c' => klv.text(),
        _ => match klv.numbers() {
            Ok(n) if !n.is_empty() => format!("{}", n[0]),
            _ => klv.text(),
        },
    }
}

struct Device<'a> {
    id: String,
    name: Option<String>,
    streams: Vec<Klv<'a>>,
}

fn devices<'a>(payload: &'a [u8]) -> Result<Vec<Device<'a>>, Error> {
    let mut out = Vec::new();
    for devc in KlvIter::new(payload) {
        let devc = devc?;
        if devc.key != DEVC || !devc.is_nested() {
            continue;
        }
        let mut dev = Device {
            id: "unknown".to_string(),
            name: None,
            streams: Vec::new(),
        };
        for child in devc.children() {
            let child = child?;
            match child.key {
                DVID => dev.id = device_id(&child),
                DVNM => dev.name = Some(child.text()),
                STRM if child.is_nested() => dev.streams.push(child),
                _ => {}
            }
        }
        out.push(dev);
    }
    Ok(out)
}

/// Sticky metadata precedes the sensor data; the data is the last plain entry in a STRM.
fn stream_entries<'a>(strm: &Klv<'a>) -> Result<(Vec<Klv<'a>>, Option<Klv<'a>>), Error> {
    let entries: Vec<Klv<'a>> = strm.children().collect::<Result<_, _>>()?;
    let data = entries.iter().rev().find(|k| !k.is_nested()).copied();
    Ok((entries, data))
}

/// List-mode walk: collects keys only.
pub(crate) fn catalog(samples: &[TelemetrySample<'_>]) -> Result<StreamCatalog, Error> {
    let mut catalog = StreamCatalog::default();
    for sample in samples {
        for dev in devices(sample.data)? {
            let entry = catalog.devices.entry(dev.id).or_default();
            if entry.name.is_none() {
                entry.name = dev.name;
            }
            for strm in &dev.streams {
                if let (_, Some(data)) = stream_entries(strm)? {
                    entry.streams.insert(data.key_string());
                }
            }
        }
    }
    debug!("gpmf catalog over {} payloads: {:?}", samples.len(), catalog);
    Ok(catalog)
}

/// Extract-mode walk: decodes only streams whose key is in `keys`.
pub(crate) fn extract(samples: &[TelemetrySample<'_>], keys: &BTreeSet<String>) -> Result<TelemetryResult, Error> {
    let mut result = TelemetryResult::default();

    for sample in samples {
        for dev in devices(sample.data)? {
            for strm in &dev.streams {
                let (entries, Some(data)) = stream_entries(strm)? else {
                    continue;
                };
                let key = data.key_string();
                if !keys.contains(&key) {
                    continue;
                }

                let mut name = None;
                let mut units = Vec::new();
                let mut scale = Vec::new();
                let mut complex: Option<&[u8]> = None;
                let mut fix = None;
                let mut precision = None;
                let mut date = None;
                for e in entries.iter().filter(|e| e.offset != data.offset) {
                    match e.key {
                        STNM => name = Some(e.text()),
                        SIUN | UNIT => units = e.texts(),
                        SCAL => scale = e.numbers()?,
                        TYPE => complex = Some(e.data),
                        GPSF => fix = e.numbers()?.first().map(|&v| v as u32),
                        GPSP => precision = e.numbers()?.first().map(|&v| v / 100.0),
                        GPSU => date = Some(format_gps_date(&e.text())),
                        _ => {}
                    }
                }

                let rows = data.rows(complex)?;
                let device: &mut DeviceTelemetry = result.devices.entry(dev.id.clone()).or_default();
                if device.name.is_none() {
                    device.name = dev.name.clone();
                }
                let stream = device.streams.entry(key).or_default();
                if stream.name.is_none() {
                    stream.name = name;
                }
                if stream.units.is_empty() {
                    stream.units = units;
                }

                let n = rows.len().max(1) as f64;
                for (i, row) in rows.into_iter().enumerate() {
                    stream.samples.push(Sample {
                        cts: sample.cts + sample.duration * i as f64 / n,
                        value: apply_scale(row, &scale),
                        date: if i == 0 { date.clone() } else { None },
                        fix,
                        precision,
                    });
                }
            }
        }
    }

    Ok(result)
}

fn apply_scale(mut row: Vec<f64>, scale: &[f64]) -> Vec<f64> {
    for (i, v) in row.iter_mut().enumerate() {
        let s = match scale {
            [] => 1.0,
            [one] => *one,
            many => many.get(i).copied().unwrap_or(1.0),
        };
        if s != 0.0 {
            *v /= s;
        }
    }
    row
}

#[cfg(test)]
pub(crate) mod testutil {
    //! GPMF writers for fixtures.

    pub(crate) fn klv(key: &[u8; 4], type_char: u8, struct_size: u8, repeat: u16, data: &[u8]) -> Vec<u8> {
        let mut out = key.to_vec();
        out.push(type_char);
        out.push(struct_size);
        out.extend_from_slice(&repeat.to_be_bytes());
        out.extend_from_slice(data);
        while out.len() % 4 != 0 {
            out.push(0);
        }
        out
    }

    pub(crate) fn nest(key: &[u8; 4], children: &[Vec<u8>]) -> Vec<u8> {
        let body = children.concat();
        // Nested entries use struct size 1 and repeat = byte length.
        klv(key, 0, 1, body.len() as u16, &body)
    }

    pub(crate) fn text(key: &[u8; 4], s: &str) -> Vec<u8> {
        klv(key, b'c', s.len() as u8, 1, s.as_bytes())
    }

    pub(crate) fn i32s(key: &[u8; 4], per_row: u8, vals: &[i32]) -> Vec<u8> {
        let data: Vec<u8> = vals.iter().flat_map(|v| v.to_be_bytes()).collect();
        klv(key, b'l', 4 * per_row, (vals.len() / per_row as usize) as u16, &data)
    }

    pub(crate) fn i16s(key: &[u8; 4], per_row: u8, vals: &[i16]) -> Vec<u8> {
        let data: Vec<u8> = vals.iter().flat_map(|v| v.to_be_bytes()).collect();
        klv(key, b's', 2 * per_row, (vals.len() / per_row as usize) as u16, &data)
    }

    pub(crate) fn u32_one(key: &[u8; 4], v: u32) -> Vec<u8> {
        klv(key, b'L', 4, 1, &v.to_be_bytes())
    }

    pub(crate) fn u16_one(key: &[u8; 4], v: u16) -> Vec<u8> {
        klv(key, b'S', 2, 1, &v.to_be_bytes())
    }

    /// A HERO-style payload: device 1 with a GPS5 stream (two fixes) and an ACCL stream.
    pub(crate) fn hero_payload(lat_e7: i32) -> Vec<u8> {
        let gps = nest(
            b"STRM",
            &[
                text(b"STNM", "GPS (Lat., Long., Alt., 2D speed, 3D speed)"),
                u32_one(b"GPSF", 3),
                klv(b"GPSU", b'U', 16, 1, b"200315123456.789"),
                u16_one(b"GPSP", 152),
                klv(b"UNIT", b'c', 3, 5, b"degdegm\0\0m/sm/s"),
                i32s(b"SCAL", 1, &[10_000_000, 10_000_000, 1000, 1000, 100]),
                i32s(
                    b"GPS5",
                    5,
                    &[lat_e7, -1_223_000_000, 12_500, 1_000, 150, lat_e7 + 10, -1_223_000_010, 12_600, 1_100, 160],
                ),
            ],
        );
        let accl = nest(
            b"STRM",
            &[
                text(b"STNM", "Accelerometer"),
                klv(b"SIUN", b'c', 4, 1, b"m/s2"),
                i16s(b"SCAL", 1, &[418]),
                i16s(b"ACCL", 3, &[418, 0, -418]),
            ],
        );
        nest(
            b"DEVC",
            &[u32_one(b"DVID", 1), text(b"DVNM", "HERO8 Black"), gps, accl],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;

    fn sample(data: &[u8], cts: f64) -> TelemetrySample<'_> {
        TelemetrySample {
            index: 0,
            cts,
            duration: 1.0,
            data,
        }
    }

    fn keys(k: &[&str]) -> BTreeSet<String> {
        k.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn klv_iter_respects_alignment_and_padding() {
        let mut buf = text(b"STNM", "abcde"); // 5 bytes -> padded to 8
        buf.extend(u32_one(b"GPSF", 2));
        buf.extend([0u8; 8]);
        let items: Vec<_> = KlvIter::new(&buf).collect::<Result<_, _>>().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].text(), "abcde");
        assert_eq!(items[1].offset, 16);
        assert_eq!(items[1].numbers().unwrap(), vec![2.0]);
    }

    #[test]
    fn overrun_is_reported() {
        let mut buf = klv(b"ACCL", b's', 6, 10, &[0; 8]);
        buf.truncate(16);
        let err = KlvIter::new(&buf).next().unwrap().unwrap_err();
        assert!(matches!(err, Error::GpmfInvalid { .. }));
    }

    #[test]
    fn complex_types_follow_type_definition() {
        let mut row = Vec::new();
        row.extend(5i32.to_be_bytes());
        row.extend(7u16.to_be_bytes());
        row.extend(b"ab");
        let k = klv(b"GPS9", b'?', 8, 1, &row);
        let parsed = KlvIter::new(&k).next().unwrap().unwrap();
        assert_eq!(parsed.rows(Some(&b"lSc[2]"[..])).unwrap(), vec![vec![5.0, 7.0]]);
        assert!(parsed.rows(None).is_err());
        assert!(parsed.rows(Some(&b"l"[..])).is_err());
    }

    #[test]
    fn expand_type_handles_counts() {
        assert_eq!(expand_type(b"lf[3]S").unwrap(), b"lfffS".to_vec());
        assert_eq!(expand_type(b"f[x]"), None);
    }

    #[test]
    fn fixed_point_and_float_decode() {
        assert_eq!(read_number(b'q', &65_536i32.to_be_bytes()), Some(1.0));
        assert_eq!(read_number(b'f', &1.5f32.to_be_bytes()), Some(1.5));
        assert_eq!(read_number(b'b', &[0xff]), Some(-1.0));
        assert_eq!(read_number(b'c', b"a"), None);
    }

    #[test]
    fn gps_date_is_reformatted() {
        assert_eq!(format_gps_date("200315123456.789"), "2020-03-15T12:34:56.789Z");
        assert_eq!(format_gps_date("garbage"), "garbage");
    }

    #[test]
    fn gps_date_with_replacement_char_is_left_alone() {
        // Byte 16 falls inside the U+FFFD that lossy decoding leaves for a bad byte.
        let raw = "200315123456.7\u{FFFD}";
        assert_eq!(format_gps_date(raw), raw);
    }

    #[test]
    fn corrupt_gpsu_decodes_without_panicking() {
        let mut date = b"200315123456.7".to_vec();
        date.extend_from_slice(&[0xff, 0xfe]);
        let payload = nest(
            b"DEVC",
            &[
                u32_one(b"DVID", 1),
                nest(b"STRM", &[klv(b"GPSU", b'U', 16, 1, &date), klv(b"GPS5", b'l', 4, 1, &7i32.to_be_bytes())]),
            ],
        );
        let result = extract(&[sample(&payload, 0.0)], &keys(&["GPS5"])).unwrap();
        let got = &result.devices["1"].streams["GPS5"].samples[0];
        assert_eq!(got.value, vec![7.0]);
        assert!(got.date.as_deref().is_some_and(|d| d.starts_with("200315123456.7")));
    }

    #[test]
    fn catalog_lists_every_stream_key() {
        let p = hero_payload(377_000_000);
        let c = catalog(&[sample(&p, 0.0)]).unwrap();
        let dev = &c.devices["1"];
        assert_eq!(dev.name.as_deref(), Some("HERO8 Black"));
        assert_eq!(dev.streams, keys(&["ACCL", "GPS5"]));
    }

    #[test]
    fn extract_decodes_only_requested_keys() {
        let a = hero_payload(377_000_000);
        let b = hero_payload(377_000_100);
        let r = extract(&[sample(&a, 0.0), sample(&b, 1.0)], &keys(&["GPS5"])).unwrap();
        let dev = &r.devices["1"];
        assert_eq!(dev.streams.len(), 1);
        let gps = &dev.streams["GPS5"];
        assert_eq!(gps.units, vec!["deg", "deg", "m", "m/s", "m/s"]);
        assert_eq!(gps.samples.len(), 4);

        let first = &gps.samples[0];
        assert_eq!(first.value, vec![37.7, -122.3, 12.5, 1.0, 1.5]);
        assert_eq!(first.fix, Some(3));
        assert_eq!(first.precision, Some(1.52));
        assert_eq!(first.date.as_deref(), Some("2020-03-15T12:34:56.789Z"));
        assert_eq!(first.cts, 0.0);

        assert_eq!(gps.samples[1].cts, 0.5);
        assert_eq!(gps.samples[1].date, None);
        assert_eq!(gps.samples[2].cts, 1.0);
        assert_eq!(r.sample_count(), 4);
    }

    #[test]
    fn single_scale_applies_to_all_axes() {
        let p = hero_payload(0);
        let r = extract(&[sample(&p, 0.0)], &keys(&["ACCL"])).unwrap();
        let accl = &r.devices["1"].streams["ACCL"];
        assert_eq!(accl.units, vec!["m/s2"]);
        assert_eq!(accl.samples[0].value, vec![1.0, 0.0, -1.0]);
        assert_eq!(accl.samples[0].fix, None);
    }

    #[test]
    fn no_matching_keys_yields_empty_result() {
        let p = hero_payload(0);
        let r = extract(&[sample(&p, 0.0)], &keys(&["GPS9"])).unwrap();
        assert!(r.devices.is_empty());
    }
}
