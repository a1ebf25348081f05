use std::env;
use std::io::{self, Cursor, Read, Seek, SeekFrom};

use log::trace;

use crate::Error;

// Minimal ISO-BMFF reader: just enough of moov to find a metadata track and its samples.

#[derive(Debug, Clone)]
pub(crate) struct TrackSampleTables {
    // stsz
    pub(crate) sample_sizes: Vec<u32>,
    // stco/co64
    pub(crate) chunk_offsets: Vec<u64>,
    pub(crate) stsc: Vec<StscEntry>,
    pub(crate) stts: Vec<SttsEntry>,
    // first stsd entry type (e.g. gpmd)
    pub(crate) sample_entry: Option<[u8; 4]>,
}

#[derive(Debug, Clone)]
pub(crate) struct StscEntry {
    pub(crate) first_chunk: u32,
    pub(crate) samples_per_chunk: u32,
}

#[derive(Debug, Clone)]
pub(crate) struct SttsEntry {
    pub(crate) sample_count: u32,
    pub(crate) sample_delta: u32,
}

#[derive(Debug, Clone)]
pub(crate) struct Track {
    pub(crate) handler_type: Option<[u8; 4]>,
    pub(crate) handler_name: String,
    pub(crate) timescale: u32,
    pub(crate) tables: TrackSampleTables,
}

/// One GPMF payload (one MP4 sample of the metadata track).
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct TelemetrySample<'a> {
    pub(crate) index: usize,
    /// Presentation start in seconds.
    pub(crate) cts: f64,
    pub(crate) duration: f64,
    pub(crate) data: &'a [u8],
}

fn read_u8<R: Read>(r: &mut R) -> io::Result<u8> {
    let mut b = [0u8; 1];
    r.read_exact(&mut b)?;
    Ok(b[0])
}

fn read_be_u32<R: Read>(r: &mut R) -> io::Result<u32> {
    let mut b = [0u8; 4];
    r.read_exact(&mut b)?;
    Ok(u32::from_be_bytes(b))
}

fn read_be_u64<R: Read>(r: &mut R) -> io::Result<u64> {
    let mut b = [0u8; 8];
    r.read_exact(&mut b)?;
    Ok(u64::from_be_bytes(b))
}

fn read_fourcc<R: Read>(r: &mut R) -> io::Result<[u8; 4]> {
    let mut b = [0u8; 4];
    r.read_exact(&mut b)?;
    Ok(b)
}

/// A child box located inside `[start, end)` of its parent.
#[derive(Debug, Clone, Copy)]
struct Child {
    typ: [u8; 4],
    /// First byte after the header.
    body: u64,
    end: u64,
}

pub(crate) fn fourcc_to_string(t: [u8; 4]) -> String {
    t.iter()
        .map(|&c| if c.is_ascii_graphic() { c as char } else { '.' })
        .collect()
}

fn trace_enabled() -> bool {
    matches!(
        env::var("GOPRO_GPS_TRACE_MP4").as_deref(),
        Ok("1" | "true" | "TRUE" | "yes" | "YES")
    )
}

/// Read the headers of every box in `[pos, limit)`.
///
/// A zero size runs to `limit`; sizes past `limit` are clamped to it.
fn children<R: Read + Seek>(f: &mut R, ctx: &str, mut pos: u64, limit: u64) -> Result<Vec<Child>, Error> {
    let mut out = Vec::new();
    while pos + 8 <= limit {
        f.seek(SeekFrom::Start(pos))?;
        let declared = read_be_u32(f)? as u64;
        let typ = read_fourcc(f)?;
        let (size, header_len) = match declared {
            1 => (read_be_u64(f)?, 16),
            0 => (limit - pos, 8),
            n => (n, 8),
        };

        if trace_enabled() {
            trace!(
                "[mp4] {ctx}: pos={pos} typ={} size={size} header={header_len} limit={limit}",
                fourcc_to_string(typ)
            );
        }

        let invalid = |message: String| Error::Mp4InvalidBox {
            context: ctx.to_string(),
            box_type: fourcc_to_string(typ),
            offset: pos,
            message,
        };
        if size < header_len {
            return Err(invalid(format!("size {size} < header_len {header_len}")));
        }
        let end = pos.saturating_add(size).min(limit);
        if end <= pos {
            return Err(invalid(format!("non-advancing end {end}")));
        }

        out.push(Child {
            typ,
            body: pos + header_len,
            end,
        });
        pos = end;
    }
    Ok(out)
}

fn parse_mp4<R: Read + Seek>(f: &mut R) -> Result<Vec<Track>, Error> {
    let file_len = f.seek(SeekFrom::End(0))?;
    let mut tracks = Vec::new();

    for moov in children(f, "top", 0, file_len)?.into_iter().filter(|c| &c.typ == b"moov") {
        for trak in children(f, "moov", moov.body, moov.end)? {
            if &trak.typ != b"trak" {
                continue;
            }
            let mdia = children(f, "trak", trak.body, trak.end)?
                .into_iter()
                .find(|c| &c.typ == b"mdia");
            if let Some(mdia) = mdia {
                tracks.extend(parse_mdia(f, mdia)?);
            }
        }
    }

    Ok(tracks)
}

fn parse_mdia<R: Read + Seek>(f: &mut R, mdia: Child) -> Result<Option<Track>, Error> {
    let mut handler_type = None;
    let mut handler_name = String::new();
    let mut timescale = 0u32;
    let mut tables = None;

    for child in children(f, "mdia", mdia.body, mdia.end)? {
        match &child.typ {
            b"hdlr" => {
                // version/flags (4) + pre_defined (4) + handler_type (4) + reserved (12) + name
                f.seek(SeekFrom::Start(child.body + 8))?;
                handler_type = Some(read_fourcc(f)?);
                handler_name = read_handler_name(f, child.body + 24, child.end)?;
            }
            b"mdhd" => timescale = parse_mdhd_timescale(f, child.body)?,
            b"minf" => {
                let stbl = children(f, "minf", child.body, child.end)?
                    .into_iter()
                    .find(|c| &c.typ == b"stbl");
                tables = stbl.map(|stbl| parse_stbl(f, stbl));
            }
            _ => {}
        }
    }

    let tables = match tables {
        Some(Ok(t)) => t,
        // Broken tables only matter for the track we would read samples from.
        Some(Err(e)) if handler_type == Some(*b"meta") => return Err(e),
        _ => return Ok(None),
    };

    Ok(Some(Track {
        handler_type,
        handler_name,
        timescale,
        tables,
    }))
}

fn read_handler_name<R: Read + Seek>(f: &mut R, name_start: u64, end: u64) -> io::Result<String> {
    if name_start >= end {
        return Ok(String::new());
    }
    f.seek(SeekFrom::Start(name_start))?;
    let mut raw = vec![0u8; (end - name_start) as usize];
    f.read_exact(&mut raw)?;
    // QuickTime writes a length-prefixed (Pascal) string, ISO a C string.
    if let Some(&len) = raw.first() {
        if len as usize == raw.len() - 1 && len > 0 {
            raw.remove(0);
        }
    }
    let name: Vec<u8> = raw.into_iter().take_while(|&b| b != 0).collect();
    Ok(String::from_utf8_lossy(&name).trim().to_string())
}

fn parse_mdhd_timescale<R: Read + Seek>(f: &mut R, body: u64) -> io::Result<u32> {
    f.seek(SeekFrom::Start(body))?;
    let version = read_u8(f)?;
    // flags (3) + creation/modification times (4+4 for v0, 8+8 for v1)
    let skip = if version == 1 { 3 + 16 } else { 3 + 8 };
    f.seek(SeekFrom::Current(skip))?;
    read_be_u32(f)
}

fn parse_stbl<R: Read + Seek>(f: &mut R, stbl: Child) -> Result<TrackSampleTables, Error> {
    let mut sample_sizes = None;
    let mut chunk_offsets = None;
    let mut stsc = None;
    let mut stts = Vec::new();
    let mut sample_entry = None;

    for child in children(f, "stbl", stbl.body, stbl.end)? {
        match &child.typ {
            b"stsd" => sample_entry = parse_stsd_entry_type(f, child)?,
            b"stsz" => sample_sizes = Some(parse_stsz(f, child)?),
            b"stco" => chunk_offsets = Some(full_box_entries(f, child.body, |f| Ok(read_be_u32(f)? as u64))?),
            b"co64" => chunk_offsets = Some(full_box_entries(f, child.body, read_be_u64)?),
            b"stsc" => {
                stsc = Some(full_box_entries(f, child.body, |f| {
                    let entry = StscEntry {
                        first_chunk: read_be_u32(f)?,
                        samples_per_chunk: read_be_u32(f)?,
                    };
                    // sample_description_index
                    read_be_u32(f)?;
                    Ok(entry)
                })?)
            }
            b"stts" => {
                stts = full_box_entries(f, child.body, |f| {
                    Ok(SttsEntry {
                        sample_count: read_be_u32(f)?,
                        sample_delta: read_be_u32(f)?,
                    })
                })?
            }
            _ => {}
        }
    }

    match (sample_sizes, chunk_offsets, stsc) {
        (Some(sample_sizes), Some(chunk_offsets), Some(stsc)) => Ok(TrackSampleTables {
            sample_sizes,
            chunk_offsets,
            stsc,
            stts,
            sample_entry,
        }),
        (sizes, offsets, stsc) => {
            let missing: Vec<&str> = [
                (sizes.is_none(), "stsz"),
                (offsets.is_none(), "stco/co64"),
                (stsc.is_none(), "stsc"),
            ]
            .into_iter()
            .filter_map(|(absent, name)| absent.then_some(name))
            .collect();
            Err(Error::Mp4MissingSampleTables {
                missing: missing.join(", "),
            })
        }
    }
}

// Table counts come from the file; cap preallocation so a corrupt count can't balloon memory.
fn capped(count: u32) -> usize {
    (count as usize).min(1 << 16)
}

/// Read a full box laid out as version/flags, entry count, then `count` fixed-size entries.
fn full_box_entries<R, T, F>(f: &mut R, body: u64, mut entry: F) -> io::Result<Vec<T>>
where
    R: Read + Seek,
    F: FnMut(&mut R) -> io::Result<T>,
{
    f.seek(SeekFrom::Start(body + 4))?;
    let count = read_be_u32(f)?;
    let mut v = Vec::with_capacity(capped(count));
    for _ in 0..count {
        v.push(entry(f)?);
    }
    Ok(v)
}

fn parse_stsz<R: Read + Seek>(f: &mut R, stsz: Child) -> Result<Vec<u32>, Error> {
    f.seek(SeekFrom::Start(stsz.body + 4))?;
    let uniform = read_be_u32(f)?;
    if uniform == 0 {
        // With no uniform size, the layout after the zero matches a plain entry table.
        return Ok(full_box_entries(f, stsz.body + 4, read_be_u32)?);
    }

    // Uniform samples have no per-entry table, so the count is only bounded by the file
    // that has to hold them.
    let count = read_be_u32(f)?;
    let file_len = f.seek(SeekFrom::End(0))?;
    if count as u64 * uniform as u64 > file_len {
        return Err(Error::Mp4InvalidBox {
            context: "stbl".to_string(),
            box_type: "stsz".to_string(),
            offset: stsz.body - 8,
            message: format!("{count} samples of {uniform} bytes exceed file length {file_len}"),
        });
    }
    Ok(vec![uniform; count as usize])
}

fn parse_stsd_entry_type<R: Read + Seek>(f: &mut R, stsd: Child) -> io::Result<Option<[u8; 4]>> {
    // version/flags (4) + entry_count (4) + first entry (size (4) + type (4) + ...)
    if stsd.body + 16 > stsd.end {
        return Ok(None);
    }
    f.seek(SeekFrom::Start(stsd.body + 4))?;
    if read_be_u32(f)? == 0 {
        return Ok(None);
    }
    f.seek(SeekFrom::Current(4))?;
    Ok(Some(read_fourcc(f)?))
}

/// Per-sample absolute offsets from stsc + stco + stsz.
///
/// stsc chunk numbers are 1-based; a chunk takes the samples-per-chunk of the last run
/// starting at or before it (chunks ahead of the first run reuse the first run).
pub(crate) fn build_sample_offsets(t: &TrackSampleTables) -> Result<Vec<u64>, Error> {
    let per_chunk = |chunk: u32| -> usize {
        let run = t.stsc.partition_point(|e| e.first_chunk <= chunk);
        t.stsc
            .get(run.saturating_sub(1))
            .map_or(0, |e| e.samples_per_chunk as usize)
    };

    let mut sizes = t.sample_sizes.iter();
    let mut sample_offsets = Vec::with_capacity(t.sample_sizes.len());
    for (chunk, &chunk_off) in (1u32..).zip(&t.chunk_offsets) {
        let mut off = chunk_off;
        for &size in sizes.by_ref().take(per_chunk(chunk)) {
            sample_offsets.push(off);
            off += size as u64;
        }
    }

    if sample_offsets.len() != t.sample_sizes.len() {
        return Err(Error::Mp4InconsistentSampleTables {
            sample_sizes: t.sample_sizes.len(),
            sample_offsets: sample_offsets.len(),
            chunk_offsets: t.chunk_offsets.len(),
        });
    }

    Ok(sample_offsets)
}

/// Sample boundaries in seconds from stts: `count + 1` entries, so sample `i` spans
/// `times[i]..times[i + 1]`. Missing entries repeat the last delta.
pub(crate) fn build_sample_times(t: &TrackSampleTables, timescale: u32, count: usize) -> Vec<f64> {
    let scale = if timescale == 0 { 1.0 } else { timescale as f64 };
    let count = count + 1;
    let mut times = Vec::with_capacity(count);
    let mut ticks = 0u64;
    let mut delta = 0u32;

    let mut runs = t.stts.iter();
    let mut remaining = 0u32;
    while times.len() < count {
        if remaining == 0 {
            if let Some(run) = runs.next() {
                remaining = run.sample_count;
                delta = run.sample_delta;
                continue;
            }
            remaining = u32::MAX;
        }
        times.push(ticks as f64 / scale);
        ticks += delta as u64;
        remaining -= 1;
    }
    times
}

impl Track {
    pub(crate) fn is_telemetry(&self) -> bool {
        self.tables.sample_entry == Some(*b"gpmd")
            || (self.handler_type == Some(*b"meta")
                && self.handler_name.to_lowercase().contains("gopro met"))
    }
}

/// Locate the GPMF track in an in-memory MP4 and slice out its samples.
pub(crate) fn read_telemetry_samples(bytes: &[u8]) -> Result<Vec<TelemetrySample<'_>>, Error> {
    let tracks = parse_mp4(&mut Cursor::new(bytes))?;

    let track = tracks
        .iter()
        .find(|t| t.is_telemetry())
        .ok_or(Error::NoTelemetryTrack)?;

    let offsets = build_sample_offsets(&track.tables)?;
    let times = build_sample_times(&track.tables, track.timescale, offsets.len());

    offsets
        .iter()
        .zip(&track.tables.sample_sizes)
        .zip(times.windows(2))
        .enumerate()
        .map(|(index, ((&offset, &size), span))| {
            let start = usize::try_from(offset).ok();
            let end = start.and_then(|s| s.checked_add(size as usize));
            match (start, end) {
                (Some(s), Some(e)) if e <= bytes.len() => Ok(TelemetrySample {
                    index,
                    cts: span[0],
                    duration: span[1] - span[0],
                    data: &bytes[s..e],
                }),
                _ => Err(Error::SampleOutOfBounds {
                    sample_index: index,
                    offset,
                    size,
                    len: bytes.len(),
                }),
            }
        })
        .collect()
}

#[cfg(test)]
pub(crate) mod testutil {
    //! Builders for tiny MP4 files with a single GPMF track.

    pub(crate) fn mp4_box(typ: &[u8; 4], payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(payload.len() + 8);
        out.extend_from_slice(&((payload.len() + 8) as u32).to_be_bytes());
        out.extend_from_slice(typ);
        out.extend_from_slice(payload);
        out
    }

    fn full_box(typ: &[u8; 4], body: &[u8]) -> Vec<u8> {
        let mut p = vec![0, 0, 0, 0];
        p.extend_from_slice(body);
        mp4_box(typ, &p)
    }

    fn u32s(vals: &[u32]) -> Vec<u8> {
        vals.iter().flat_map(|v| v.to_be_bytes()).collect()
    }

    /// ftyp + mdat(samples) + moov with one track of `handler`/`entry`, one sample per chunk,
    /// 1000 ticks per sample at timescale 1000.
    pub(crate) fn build_mp4(samples: &[Vec<u8>], handler: &[u8; 4], name: &str, entry: &[u8; 4]) -> Vec<u8> {
        let ftyp = mp4_box(b"ftyp", b"mp41\0\0\0\0mp41");
        let mdat_payload: Vec<u8> = samples.concat();
        let mdat = mp4_box(b"mdat", &mdat_payload);

        let mut offsets = Vec::new();
        let mut off = (ftyp.len() + 8) as u32;
        for s in samples {
            offsets.push(off);
            off += s.len() as u32;
        }
        let n = samples.len() as u32;

        let mut stsd_entry = vec![0u8; 8]; // reserved (6) + data_reference_index (2)
        stsd_entry[7] = 1;
        let mut stsd_body = u32s(&[1]);
        stsd_body.extend(mp4_box(entry, &stsd_entry));
        let stsd = full_box(b"stsd", &stsd_body);

        let mut stsz_body = u32s(&[0, n]);
        stsz_body.extend(u32s(&samples.iter().map(|s| s.len() as u32).collect::<Vec<_>>()));
        let stsz = full_box(b"stsz", &stsz_body);

        let mut stco_body = u32s(&[n]);
        stco_body.extend(u32s(&offsets));
        let stco = full_box(b"stco", &stco_body);

        let stsc = full_box(b"stsc", &u32s(&[1, 1, 1, 1]));
        let stts = full_box(b"stts", &u32s(&[1, n, 1000]));

        let stbl = mp4_box(b"stbl", &[stsd, stts, stsc, stsz, stco].concat());
        let minf = mp4_box(b"minf", &stbl);

        let mut hdlr_body = u32s(&[0]);
        hdlr_body.extend_from_slice(handler);
        hdlr_body.extend(u32s(&[0, 0, 0]));
        hdlr_body.extend_from_slice(name.as_bytes());
        hdlr_body.push(0);
        let hdlr = full_box(b"hdlr", &hdlr_body);

        let mdhd = full_box(b"mdhd", &u32s(&[0, 0, 1000, n * 1000, 0]));

        let mdia = mp4_box(b"mdia", &[mdhd, hdlr, minf].concat());
        let trak = mp4_box(b"trak", &mdia);
        let moov = mp4_box(b"moov", &trak);

        [ftyp, mdat, moov].concat()
    }

    pub(crate) fn gpmf_mp4(samples: &[Vec<u8>]) -> Vec<u8> {
        build_mp4(samples, b"meta", "GoPro MET", b"gpmd")
    }

    /// Rewrite the stsz box to claim `count` samples of `uniform` bytes each.
    pub(crate) fn with_uniform_stsz(mut mp4: Vec<u8>, uniform: u32, count: u32) -> Vec<u8> {
        let at = mp4.windows(4).position(|w| w == b"stsz").expect("stsz box");
        // type (4) + version/flags (4), then sample_size and sample_count
        mp4[at + 8..at + 12].copy_from_slice(&uniform.to_be_bytes());
        mp4[at + 12..at + 16].copy_from_slice(&count.to_be_bytes());
        mp4
    }
}
