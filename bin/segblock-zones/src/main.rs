#![deny(unsafe_code)]

//! `segblock-zones`: reads DDZONE's per-buffer stdout records (`offset
//! \t bytes \t seconds`) and renders contiguous runs of buffers whose
//! measured throughput falls in the same decile bucket as a table of
//! throughput "zones".

use std::io::Read;
use std::process::ExitCode;

use clap::Parser;

/// Summarizes DDZONE records piped in on stdin into throughput zones.
#[derive(Parser, Debug)]
#[command(name = "segblock-zones", version, about)]
struct Args;

struct Record {
    offset: u64,
    bytes: u64,
    seconds: f64,
}

struct Zone {
    start_offset: u64,
    end_offset: u64,
    buffer_count: u64,
    decile: u8,
}

fn main() -> ExitCode {
    let _args = Args::parse();
    let mut input = String::new();
    if std::io::stdin().lock().read_to_string(&mut input).is_err() {
        println!("segblock-zones: failed to read stdin");
        return ExitCode::FAILURE;
    }

    let records = parse_records(&input);
    if records.is_empty() {
        println!("no DDZONE records on stdin");
        return ExitCode::SUCCESS;
    }

    for zone in build_zones(&records) {
        println!(
            "zone [{}, {}) buffers={} decile={}",
            zone.start_offset, zone.end_offset, zone.buffer_count, zone.decile
        );
    }
    ExitCode::SUCCESS
}

fn parse_records(input: &str) -> Vec<Record> {
    input
        .lines()
        .filter_map(|line| {
            let mut fields = line.split('\t');
            let offset = fields.next()?.parse().ok()?;
            let bytes = fields.next()?.parse().ok()?;
            let seconds = fields.next()?.parse().ok()?;
            Some(Record { offset, bytes, seconds })
        })
        .collect()
}

/// Bucket a record's throughput into a decile (0-9) of the run's peak
/// observed MB/s, then coalesce adjacent same-decile records into zones.
fn build_zones(records: &[Record]) -> Vec<Zone> {
    let peak = records
        .iter()
        .map(throughput_mb_s)
        .fold(0.0_f64, f64::max)
        .max(f64::MIN_POSITIVE);

    let deciles: Vec<u8> = records
        .iter()
        .map(|r| {
            let ratio = (throughput_mb_s(r) / peak).clamp(0.0, 1.0);
            ((ratio * 10.0) as u8).min(9)
        })
        .collect();

    let mut zones = Vec::new();
    let mut iter = records.iter().zip(deciles.iter()).peekable();

    while let Some((record, &decile)) = iter.next() {
        let mut end_offset = record.offset + record.bytes;
        let mut buffer_count = 1;
        while let Some((next, next_decile)) = iter.peek() {
            if **next_decile != decile {
                break;
            }
            end_offset = next.offset + next.bytes;
            buffer_count += 1;
            iter.next();
        }
        zones.push(Zone {
            start_offset: record.offset,
            end_offset,
            buffer_count,
            decile,
        });
    }
    zones
}

fn throughput_mb_s(record: &Record) -> f64 {
    if record.seconds <= 0.0 {
        0.0
    } else {
        (record.bytes as f64 / 1_000_000.0) / record.seconds
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tab_separated_records() {
        let records = parse_records("0\t8388608\t0.010000\n8388608\t8388608\t0.020000\n");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].offset, 0);
        assert_eq!(records[1].bytes, 8388608);
    }

    #[test]
    fn coalesces_same_decile_records_into_one_zone() {
        let records = parse_records("0\t1000000\t1.0\n1000000\t1000000\t1.0\n2000000\t1000\t1.0\n");
        let zones = build_zones(&records);
        assert_eq!(zones.len(), 2);
        assert_eq!(zones[0].buffer_count, 2);
        assert_eq!(zones[1].buffer_count, 1);
    }

    #[test]
    fn ignores_malformed_lines() {
        let records = parse_records("not a record\n0\t100\t1.0\n");
        assert_eq!(records.len(), 1);
    }
}
