#![deny(unsafe_code)]

//! `ddzero`: walks a source in segment-size steps without a checksum
//! store and reports what fraction of segments are entirely zero-filled,
//! using the same blank-segment fingerprint heuristic the checksum store
//! relies on. Grounded on the original `ddprofile` density dump, but
//! scans the source directly rather than an existing checksum file.

use std::io::Read;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use device_io::CacheMode;

/// Reports the fraction of a source's segments that are blank (all
/// zero).
#[derive(Parser, Debug)]
#[command(name = "segblock-ddzero", version, about)]
struct Args {
    /// Source device or file.
    #[arg(short = 'c', long = "source")]
    source: PathBuf,

    /// Increase log verbosity; repeatable (-v, -vv).
    #[arg(short = 'v', action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> ExitCode {
    let args = Args::parse();
    logging::init(logging::Verbosity::from_count(args.verbose));

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            println!("segblock-ddzero: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> std::io::Result<()> {
    let mut source = device_io::open_read_only(&args.source, CacheMode::Buffered)
        .map_err(std::io::Error::other)?;
    let source_len = device_io::size_in_bytes(&mut source).map_err(std::io::Error::other)?;
    let segment_count = layout::segment_count(source_len);

    let mut buffer = vec![0u8; layout::SEGMENT_SIZE as usize];
    let mut blank_count = 0u64;

    for index in 0..segment_count {
        let remaining = source_len - index * layout::SEGMENT_SIZE;
        let seg_len = layout::SEGMENT_SIZE.min(remaining) as usize;
        source.read_exact(&mut buffer[..seg_len])?;

        let fp = hashing::fingerprint(&buffer[..seg_len]);
        let blank = hashing::is_blank(fp);
        if blank {
            blank_count += 1;
        }
        println!(
            "block {}/{} {:08x} {:08x}",
            index + 1,
            segment_count,
            fp.0,
            fp.1
        );
    }

    let pct = if segment_count == 0 {
        0.0
    } else {
        100.0 * blank_count as f64 / segment_count as f64
    };
    println!("blank {blank_count}/{segment_count} {pct:.2}%");
    Ok(())
}
