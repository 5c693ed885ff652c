use anyhow::Context;
use clap::Parser;
use log::info;
use std::path::PathBuf;
use uuid::Uuid;

use ext0_lib::device::{BlockDevice, FileDevice};
use ext0_lib::layout::Geometry;
use ext0_lib::mkfs::{self, DEFAULT_VOLUME_NAME, MkfsOptions};

/// Format a file or block device as an ext0 filesystem
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Image file or block device to format. Its current size decides the number of groups.
    #[arg(value_name = "DEVICE")]
    path: PathBuf,

    /// Block size in bytes: 1024, 2048, 4096 or 8192
    #[arg(short, long, default_value_t = 1024)]
    block_size: usize,

    /// Volume label, at most 16 bytes
    #[arg(short = 'L', long, default_value = DEFAULT_VOLUME_NAME)]
    volume_name: String,

    /// Only print the layout, write nothing
    #[arg(short = 'n', long)]
    dry_run: bool,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();
    println!("=== ext0 mkfs ===");
    println!("Target: {:?}", args.path);

    // 1. Geometry and device
    let geometry = Geometry::with_block_size(args.block_size)?;
    let device = FileDevice::open(&args.path, geometry.block_size)
        .with_context(|| format!("opening {:?}", args.path))?;

    // 2. Layout, before anything is written
    let layout = mkfs::plan(&geometry, device.size_bytes())?;
    println!("fs_size          = {}", layout.fs_size);
    println!("groups_count     = {}", layout.groups_count);
    println!("blocks_per_group = {}", layout.blocks_per_group);
    println!("block_size       = {}", layout.block_size);
    if args.dry_run {
        println!("Dry run, nothing written.");
        return Ok(());
    }

    // 3. Write the image
    let options = MkfsOptions {
        geometry,
        volume_name: args.volume_name,
        ..MkfsOptions::default()
    };
    let written = mkfs::build_image(&device, &options)?;
    info!("uuid {}", Uuid::from_bytes(options.uuid));
    println!(
        "[x] {} groups written, last block {}",
        written.groups_count, written.last_block
    );
    println!("Format complete.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_defaults() {
        let args = Args::try_parse_from(["ext0_mkfs", "disk.img"]).unwrap();
        assert_eq!(args.path, PathBuf::from("disk.img"));
        assert_eq!(args.block_size, 1024);
        assert_eq!(args.volume_name, DEFAULT_VOLUME_NAME);
        assert!(!args.dry_run);
    }

    #[test]
    fn test_args_overrides() {
        let args =
            Args::try_parse_from(["ext0_mkfs", "-b", "4096", "-L", "data", "-n", "/dev/loop0"])
                .unwrap();
        assert_eq!(args.block_size, 4096);
        assert_eq!(args.volume_name, "data");
        assert!(args.dry_run);
        assert!(Args::try_parse_from(["ext0_mkfs"]).is_err());
    }

    #[test]
    fn test_volume_id_is_printed_hyphenated() {
        let mut bytes = [0u8; 16];
        bytes[0] = 0xab;
        bytes[15] = 0x01;
        assert_eq!(
            Uuid::from_bytes(bytes).to_string(),
            "ab000000-0000-0000-0000-000000000001"
        );
        let options = MkfsOptions::default();
        assert_eq!(Uuid::from_bytes(options.uuid).get_version_num(), 4);
    }
}
