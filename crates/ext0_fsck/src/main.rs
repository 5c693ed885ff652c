use anyhow::Context;
use clap::Parser;
use colored::*;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use ext0_lib::Volume;
use ext0_lib::check::{self, Report, Severity};
use ext0_lib::device::{BlockDevice, FileDevice};
use ext0_lib::superblock::SuperBlock;
use ext0_lib::types::{EXT0_MAGIC, STATE_MOUNTED};

/// Check an unmounted ext0 filesystem for inconsistencies
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Image file or block device
    #[arg(value_name = "DEVICE")]
    path: PathBuf,

    /// Block size the image was formatted with
    #[arg(short, long, default_value_t = 1024)]
    block_size: usize,

    /// Print warnings as well as errors
    #[arg(short, long)]
    verbose: bool,
}

fn format_time(secs: u32) -> String {
    chrono::DateTime::from_timestamp(i64::from(secs), 0)
        .map(|at| at.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| secs.to_string())
}

fn print_report(report: &Report, verbose: bool) {
    for finding in &report.findings {
        match finding.severity {
            Severity::Error => println!("    {} {}", "[ERROR]".red(), finding.message),
            Severity::Warning if verbose => {
                println!("    {} {}", "[WARN]".yellow(), finding.message)
            }
            Severity::Warning => {}
        }
    }
}

fn main() -> anyhow::Result<ExitCode> {
    env_logger::init();
    let args = Args::parse();
    println!("{}", "=== ext0 File System Check (fsck) ===".bold().blue());

    // 1. Device
    if !args.path.exists() {
        anyhow::bail!("{:?} does not exist", args.path);
    }
    let device = FileDevice::open(&args.path, args.block_size)
        .with_context(|| format!("opening {:?}", args.path))?;
    println!("[*] Device found at {:?}", args.path);

    // 2. Primary superblock, read before mounting changes its state
    println!("[*] Reading superblock...");
    let (sb, _) = match SuperBlock::decode(&device.read_block_vec(1)?) {
        Ok(parsed) => parsed,
        Err(err) => {
            println!("{} {err}", "[FAIL] Superblock is unreadable:".red());
            return Ok(ExitCode::FAILURE);
        }
    };
    if sb.magic != EXT0_MAGIC {
        println!("{}", "[FAIL] Bad magic number, not an ext0 volume".red());
        return Ok(ExitCode::FAILURE);
    }
    println!("{}", "[OK] ext0 signature found".green());
    println!("    > Volume: {}", sb.volume_name());
    println!("    > Groups: {}", sb.groups_count);
    println!("    > Last written: {}", format_time(sb.wtime));
    if sb.state == STATE_MOUNTED {
        println!(
            "{}",
            "[WARN] Volume was not cleanly unmounted".yellow()
        );
    }

    // 3. Full check
    let volume = match Volume::open(Arc::new(device)) {
        Ok(volume) => volume,
        Err(err) => {
            println!("{} {err}", "[FAIL] Volume cannot be opened:".red());
            return Ok(ExitCode::FAILURE);
        }
    };
    println!("[*] Checking groups, inodes and directories...");
    let report = check::check(&volume)?;
    println!("    > Groups checked: {}", report.groups_checked);
    println!("    > Live inodes: {}", report.live_entities);
    println!("    > Directories: {}", report.directories);
    println!("    > Directory entries: {}", report.entries);
    print_report(&report, args.verbose);

    let errors = report.errors().count();
    let warnings = report.warnings().count();
    if errors == 0 {
        // a clean volume is marked clean again, a broken one stays marked mounted
        volume.close()?;
        println!("\n{}", ">> FILESYSTEM IS CLEAN".bold().green());
        if warnings > 0 {
            println!("   {warnings} warnings (counters and replicas are refreshed on the next sync)");
        }
        Ok(ExitCode::SUCCESS)
    } else {
        println!("\n{} {errors} errors found.", ">> WARNING:".bold().red());
        Ok(ExitCode::FAILURE)
    }
}
