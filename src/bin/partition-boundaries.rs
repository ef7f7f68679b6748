//! Reads an `fdisk -l` report on stdin and prints the sector boundaries
//! of the root and data partitions:
//!
//! ```text
//! fdisk -l box.img | partition-boundaries 1.5 8
//! 8192 2929792 2929920 15624999
//! ```
//!
//! Sizes are in GB (10^9 bytes). Pass `-` as the disk size to skip the
//! consistency check against the report.

use std::io::Read;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use appliance_builder::config::ONE_GB;
use appliance_builder::geometry::parse_boundaries;

fn usage() -> &'static str {
    "Usage: partition-boundaries <root_size_gb> <disk_size_gb|->  < fdisk-report"
}

fn gigabytes(raw: &str, what: &str) -> Result<u64> {
    let value: f64 = raw
        .parse()
        .with_context(|| format!("invalid {what} '{raw}'"))?;
    if !value.is_finite() || value < 0.0 {
        bail!("invalid {what} '{raw}'");
    }
    Ok((value * ONE_GB as f64) as u64)
}

fn run(args: &[String]) -> Result<String> {
    let [root, disk] = args else {
        bail!(usage());
    };
    let root_size = gigabytes(root, "root size")?;
    let disk_size = match disk.as_str() {
        "-" => None,
        raw => Some(gigabytes(raw, "disk size")?),
    };

    let mut report = String::new();
    std::io::stdin()
        .read_to_string(&mut report)
        .context("reading disk report from stdin")?;

    let layout = parse_boundaries(&report, root_size, disk_size)?;
    Ok(format!(
        "{} {} {} {}",
        layout.root_start, layout.root_end, layout.data_start, layout.data_end
    ))
}

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();
    match run(&args) {
        Ok(line) => {
            println!("{line}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            println!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
