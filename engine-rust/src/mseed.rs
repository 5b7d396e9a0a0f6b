//! Minimal MiniSEED 2.4 writer for the record dump debug surface.
//!
//! Emits 4096-byte records: fixed section of the data header, one blockette
//! 1000 (IEEE float32, big endian) and the sample payload. This is enough
//! for standard SEED tooling to read dumped intermediate streams; it is not
//! a general-purpose encoder.

use std::io::{self, Write};

use chrono::{Datelike, Timelike};
use seismic_types::Record;

const RECORD_LEN: usize = 4096;
const DATA_OFFSET: usize = 64;
const MAX_SAMPLES: usize = (RECORD_LEN - DATA_OFFSET) / 4;

fn pad_ascii(out: &mut [u8], s: &str) {
    let bytes = s.as_bytes();
    for (i, slot) in out.iter_mut().enumerate() {
        *slot = if i < bytes.len() { bytes[i] } else { b' ' };
    }
}

fn sample_rate_fields(fsamp: f64) -> (i16, i16) {
    if fsamp >= 1.0 {
        (fsamp.round() as i16, 1)
    } else if fsamp > 0.0 {
        // Negative factor encodes the sample period in seconds
        (-(1.0 / fsamp).round() as i16, 1)
    } else {
        (0, 0)
    }
}

/// Write one record as a sequence of MiniSEED records.
pub fn write_record(rec: &Record, w: &mut impl Write) -> io::Result<()> {
    let mut seq = 1usize;
    for (chunk_index, chunk) in rec.samples.chunks(MAX_SAMPLES).enumerate() {
        let start = rec.start
            + seismic_types::secs((chunk_index * MAX_SAMPLES) as f64 / rec.fsamp);

        let mut buf = [0u8; RECORD_LEN];

        // Fixed section of the data header
        pad_ascii(&mut buf[0..6], &format!("{seq:06}"));
        buf[6] = b'D';
        buf[7] = b' ';
        pad_ascii(&mut buf[8..13], &rec.id.sta);
        pad_ascii(&mut buf[13..15], &rec.id.loc);
        pad_ascii(&mut buf[15..18], &rec.id.cha);
        pad_ascii(&mut buf[18..20], &rec.id.net);

        // BTIME
        buf[20..22].copy_from_slice(&(start.year() as u16).to_be_bytes());
        buf[22..24].copy_from_slice(&(start.ordinal() as u16).to_be_bytes());
        buf[24] = start.hour() as u8;
        buf[25] = start.minute() as u8;
        buf[26] = start.second() as u8;
        buf[27] = 0;
        let fract = (start.nanosecond() / 100_000) as u16;
        buf[28..30].copy_from_slice(&fract.to_be_bytes());

        buf[30..32].copy_from_slice(&(chunk.len() as u16).to_be_bytes());
        let (factor, multiplier) = sample_rate_fields(rec.fsamp);
        buf[32..34].copy_from_slice(&factor.to_be_bytes());
        buf[34..36].copy_from_slice(&multiplier.to_be_bytes());

        buf[39] = 1; // one blockette follows
        buf[44..46].copy_from_slice(&(DATA_OFFSET as u16).to_be_bytes());
        buf[46..48].copy_from_slice(&48u16.to_be_bytes());

        // Blockette 1000
        buf[48..50].copy_from_slice(&1000u16.to_be_bytes());
        buf[50..52].copy_from_slice(&0u16.to_be_bytes());
        buf[52] = 4; // IEEE float32
        buf[53] = 1; // big endian
        buf[54] = 12; // 2^12 = 4096
        buf[55] = 0;

        for (i, v) in chunk.iter().enumerate() {
            let ofs = DATA_OFFSET + i * 4;
            buf[ofs..ofs + 4].copy_from_slice(&(*v as f32).to_be_bytes());
        }

        w.write_all(&buf)?;
        seq += 1;
    }
    Ok(())
}

// ── Tests ────────────────────────────────────────────────────────────────────
