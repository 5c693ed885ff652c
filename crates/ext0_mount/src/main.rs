use anyhow::Context;
use clap::Parser;
use fuser::MountOption;
use log::{info, warn};
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;
use std::sync::Arc;

use ext0_lib::Volume;
use ext0_lib::device::FileDevice;

mod fs;

/// Mount an ext0 image through FUSE
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Image file or block device holding the filesystem
    #[arg(value_name = "DEVICE")]
    device: PathBuf,

    /// Directory to mount on (created if missing)
    #[arg(value_name = "MOUNT_POINT")]
    mountpoint: PathBuf,

    /// Block size the image was formatted with
    #[arg(short, long, default_value_t = 1024)]
    block_size: usize,

    /// Mount read-only
    #[arg(long)]
    read_only: bool,
}

fn main() -> anyhow::Result<()> {
    env_logger::init(); // RUST_LOG=debug for per-request logs
    let args = Args::parse();

    if !args.device.exists() {
        anyhow::bail!("device {:?} does not exist", args.device);
    }
    if !args.mountpoint.exists() {
        std::fs::create_dir_all(&args.mountpoint)?;
    }

    let device = FileDevice::open(&args.device, args.block_size)
        .with_context(|| format!("opening {:?}", args.device))?;
    let volume = Volume::open(Arc::new(device))
        .with_context(|| format!("{:?} is not a mountable ext0 volume", args.device))?;
    let name = volume.volume_name();
    let stat = volume.statfs();
    info!(
        "volume '{name}': {} groups, {} free data blocks",
        stat.files, stat.free_blocks
    );

    // inodes carry no owner, everything shows up as owned by the mount point's owner
    let owner = std::fs::metadata(&args.mountpoint)?;
    let filesystem = fs::Ext0Fs::new(volume, owner.uid(), owner.gid());

    let mut options = vec![
        MountOption::FSName(name),
        MountOption::Subtype("ext0".to_string()),
        MountOption::DefaultPermissions,
    ];
    if args.read_only {
        options.push(MountOption::RO);
    } else {
        options.push(MountOption::RW);
    }

    println!("Mounting {:?} on {:?} (unmount to exit)", args.device, args.mountpoint);
    // blocks until the filesystem is unmounted; destroy() writes the final sync
    if let Err(err) = fuser::mount2(filesystem, &args.mountpoint, &options) {
        warn!("mount ended with an error: {err}");
        return Err(err.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_defaults() {
        let args = Args::try_parse_from(["ext0_mount", "disk.img", "/mnt/x"]).unwrap();
        assert_eq!(args.device, PathBuf::from("disk.img"));
        assert_eq!(args.mountpoint, PathBuf::from("/mnt/x"));
        assert_eq!(args.block_size, 1024);
        assert!(!args.read_only);
    }

    #[test]
    fn test_args_require_mount_point() {
        assert!(Args::try_parse_from(["ext0_mount", "disk.img"]).is_err());
        let args =
            Args::try_parse_from(["ext0_mount", "-b", "4096", "--read-only", "d", "m"]).unwrap();
        assert_eq!(args.block_size, 4096);
        assert!(args.read_only);
    }
}
