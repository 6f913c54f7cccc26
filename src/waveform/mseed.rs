//! Mini-SEED encode/decode for the on-disk waveform cache.
//!
//! One record per file: 48-byte fixed header, blockette 1000, IEEE
//! big-endian doubles, zero padding up to the record length. The record
//! length is the next power of two holding payload plus header, clamped to
//! [128, 1 048 576] bytes. Anything the reader does not recognize is a
//! parse error; the cache falls back to the record stream in that case.

use std::fs;
use std::io::Cursor;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use camino::Utf8Path;
use hifitime::Duration;

use crate::rtdd_errors::RtddError;
use crate::utctime;
use crate::waveform::Trace;

const FIXED_HEADER_LEN: usize = 48;
const BLOCKETTE_1000_LEN: usize = 8;
const DATA_OFFSET: usize = 64;
const ENCODING_IEEE_DOUBLE: u8 = 5;
const WORD_ORDER_BIG_ENDIAN: u8 = 1;
pub const MIN_RECLEN: usize = 128;
pub const MAX_RECLEN: usize = 1 << 20;

/// Smallest power of two >= `value` within [min, max]; None when even `max`
/// is too small.
pub fn next_power_of_two(value: usize, min: usize, max: usize) -> Option<usize> {
    let mut b = min;
    while b < value {
        b <<= 1;
        if b > max {
            return None;
        }
    }
    Some(b)
}

fn pad(code: &str, width: usize) -> Result<Vec<u8>, RtddError> {
    if code.len() > width {
        return Err(RtddError::Parse(format!(
            "stream code '{code}' exceeds {width} characters"
        )));
    }
    let mut out = code.as_bytes().to_vec();
    out.resize(width, b' ');
    Ok(out)
}

/// Serialize a trace as a single mini-SEED record.
pub fn write_trace(trace: &Trace, path: &Utf8Path) -> Result<(), RtddError> {
    let nsamples = trace.sample_count();
    if nsamples > u16::MAX as usize {
        return Err(RtddError::Parse(format!(
            "trace of {nsamples} samples does not fit a single record"
        )));
    }
    let freq = trace.sampling_frequency();
    if freq < 1.0 || freq.fract() != 0.0 || freq > i16::MAX as f64 {
        return Err(RtddError::Parse(format!(
            "sampling frequency {freq} Hz is not cacheable"
        )));
    }

    let payload = nsamples * 8 + DATA_OFFSET;
    let reclen = next_power_of_two(payload, MIN_RECLEN, MAX_RECLEN).ok_or_else(|| {
        RtddError::Parse(format!("record of {payload} bytes exceeds the maximum length"))
    })?;

    let mut buf = Vec::with_capacity(reclen);
    buf.extend_from_slice(b"000001D ");
    buf.extend_from_slice(&pad(&trace.station_code, 5)?);
    buf.extend_from_slice(&pad(&trace.location_code, 2)?);
    buf.extend_from_slice(&pad(&trace.channel_code, 3)?);
    buf.extend_from_slice(&pad(&trace.network_code, 2)?);

    let parts = utctime::to_parts(trace.start_time());
    buf.write_u16::<BigEndian>(parts.year as u16).unwrap();
    buf.write_u16::<BigEndian>(utctime::day_of_year(trace.start_time())).unwrap();
    buf.push(parts.hour);
    buf.push(parts.minute);
    buf.push(parts.second);
    buf.push(0);
    buf.write_u16::<BigEndian>((parts.microsecond / 100) as u16).unwrap();

    buf.write_u16::<BigEndian>(nsamples as u16).unwrap();
    buf.write_i16::<BigEndian>(freq as i16).unwrap();
    buf.write_i16::<BigEndian>(1).unwrap();
    buf.push(0); // activity flags
    buf.push(0); // io flags
    buf.push(0); // data quality flags
    buf.push(1); // one blockette follows
    buf.write_i32::<BigEndian>(0).unwrap(); // time correction
    buf.write_u16::<BigEndian>(DATA_OFFSET as u16).unwrap();
    buf.write_u16::<BigEndian>(FIXED_HEADER_LEN as u16).unwrap();
    debug_assert_eq!(buf.len(), FIXED_HEADER_LEN);

    // blockette 1000
    buf.write_u16::<BigEndian>(1000).unwrap();
    buf.write_u16::<BigEndian>(0).unwrap();
    buf.push(ENCODING_IEEE_DOUBLE);
    buf.push(WORD_ORDER_BIG_ENDIAN);
    buf.push(reclen.trailing_zeros() as u8);
    buf.push(0);
    debug_assert_eq!(buf.len(), FIXED_HEADER_LEN + BLOCKETTE_1000_LEN);

    buf.resize(DATA_OFFSET, 0);
    for v in trace.data() {
        buf.write_f64::<BigEndian>(*v).unwrap();
    }
    buf.resize(reclen, 0);

    fs::write(path, buf)?;
    Ok(())
}

fn read_code(cur: &mut Cursor<&[u8]>, width: usize) -> Result<String, RtddError> {
    let mut raw = vec![0u8; width];
    std::io::Read::read_exact(cur, &mut raw)?;
    Ok(String::from_utf8_lossy(&raw).trim_end().to_string())
}

/// Deserialize a single-record mini-SEED file.
pub fn read_trace(path: &Utf8Path) -> Result<Trace, RtddError> {
    let buf = fs::read(path)?;
    if buf.len() < DATA_OFFSET {
        return Err(RtddError::Parse(format!("{path}: truncated record")));
    }
    let mut cur = Cursor::new(buf.as_slice());

    let mut head = [0u8; 8];
    std::io::Read::read_exact(&mut cur, &mut head)?;
    if !head[0..6].iter().all(|b| b.is_ascii_digit()) {
        return Err(RtddError::Parse(format!("{path}: bad sequence number")));
    }

    let station = read_code(&mut cur, 5)?;
    let location = read_code(&mut cur, 2)?;
    let channel = read_code(&mut cur, 3)?;
    let network = read_code(&mut cur, 2)?;

    let year = cur.read_u16::<BigEndian>()?;
    let doy = cur.read_u16::<BigEndian>()?;
    let hour = cur.read_u8()?;
    let minute = cur.read_u8()?;
    let second = cur.read_u8()?;
    let _unused = cur.read_u8()?;
    let fract = cur.read_u16::<BigEndian>()?;

    let nsamples = cur.read_u16::<BigEndian>()? as usize;
    let rate_factor = cur.read_i16::<BigEndian>()?;
    let rate_multiplier = cur.read_i16::<BigEndian>()?;
    let _flags = (cur.read_u8()?, cur.read_u8()?, cur.read_u8()?);
    let num_blockettes = cur.read_u8()?;
    let _time_correction = cur.read_i32::<BigEndian>()?;
    let data_offset = cur.read_u16::<BigEndian>()? as usize;
    let blockette_offset = cur.read_u16::<BigEndian>()? as usize;

    if num_blockettes < 1 || blockette_offset != FIXED_HEADER_LEN {
        return Err(RtddError::Parse(format!("{path}: missing blockette 1000")));
    }
    let blk_type = cur.read_u16::<BigEndian>()?;
    let _next = cur.read_u16::<BigEndian>()?;
    let encoding = cur.read_u8()?;
    let word_order = cur.read_u8()?;
    let _reclen_exp = cur.read_u8()?;
    if blk_type != 1000 || encoding != ENCODING_IEEE_DOUBLE || word_order != WORD_ORDER_BIG_ENDIAN {
        return Err(RtddError::Parse(format!(
            "{path}: unsupported encoding (blockette {blk_type}, encoding {encoding})"
        )));
    }

    let sampling_frequency = match (rate_factor, rate_multiplier) {
        (f, m) if f > 0 && m > 0 => f as f64 * m as f64,
        (f, m) if f > 0 && m < 0 => -(f as f64) / m as f64,
        (f, m) if f < 0 && m > 0 => -(m as f64) / f as f64,
        (f, m) if f < 0 && m < 0 => 1.0 / (f as f64 * m as f64),
        _ => return Err(RtddError::Parse(format!("{path}: invalid sampling rate"))),
    };

    if !(1..=366).contains(&doy) || !(1900..=2500).contains(&year) || hour > 23 {
        return Err(RtddError::Parse(format!("{path}: invalid record start time")));
    }
    if buf.len() < data_offset + nsamples * 8 {
        return Err(RtddError::Parse(format!("{path}: truncated data section")));
    }
    let mut cur = Cursor::new(&buf[data_offset..]);
    let mut data = Vec::with_capacity(nsamples);
    for _ in 0..nsamples {
        data.push(cur.read_f64::<BigEndian>()?);
    }

    let start = hifitime::Epoch::from_gregorian_utc(year as i32, 1, 1, hour, minute, second, 0)
        + Duration::from_days((doy - 1) as f64)
        + Duration::from_microseconds(fract as f64 * 100.0);

    Ok(Trace::new(
        &network,
        &station,
        &location,
        &channel,
        start,
        sampling_frequency,
        data,
    ))
}
