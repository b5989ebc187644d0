use std::ffi::OsStr;
use std::fs::File;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use log::{error, info, LevelFilter};
use memmap2::MmapOptions;
use rustix::fs::Mode;
use rustix::process::{geteuid, umask};

use pefsck::device::Device;
use pefsck::erofs::Erofs;
use pefsck::extract::ExtractOptions;
use pefsck::fsck::{Fsck, FsckConfig};
use pefsck::Error;

#[derive(Parser, Debug)]
#[command(version, about = "Check and optionally extract an EROFS image", long_about = None)]
struct Args {
    /// Print debug messages, 0 (errors only) to 9 (everything)
    #[arg(short = 'd', value_parser = clap::value_parser!(u8).range(0..=9))]
    debug: Option<u8>,

    /// Print the filesystem compression ratio
    #[arg(short = 'p')]
    print_comp_ratio: bool,

    /// Decode all compressed data; with a path, also write the tree out there
    #[arg(long, num_args = 0..=1, require_equals = true, value_name = "X")]
    extract: Option<Option<PathBuf>>,

    /// Extra blob device, in device table order
    #[arg(long = "device", value_name = "PATH")]
    devices: Vec<PathBuf>,

    /// Allow extracting to the root directory
    #[arg(long)]
    force: bool,

    /// Replace entries that already exist in the extract directory
    #[arg(long)]
    overwrite: bool,

    /// Restore owners and permissions (default for the superuser)
    #[arg(long)]
    preserve: bool,

    #[arg(long)]
    preserve_owner: bool,

    #[arg(long)]
    preserve_perms: bool,

    /// Apply the current umask and do not change owners (default for regular users)
    #[arg(long)]
    no_preserve: bool,

    #[arg(long)]
    no_preserve_owner: bool,

    #[arg(long)]
    no_preserve_perms: bool,

    /// Stop right away when the superblock checksum does not match
    #[arg(long)]
    strict_checksum: bool,

    /// Worker threads; 0 checks everything on the main thread
    #[arg(long)]
    threads: Option<usize>,

    image: PathBuf,
}

impl Args {
    fn explicit_preserve(&self) -> bool {
        self.preserve
            || self.preserve_owner
            || self.preserve_perms
            || self.no_preserve
            || self.no_preserve_owner
            || self.no_preserve_perms
    }

    fn config(&self) -> FsckConfig {
        let superuser = geteuid().is_root();
        let mut extract = ExtractOptions {
            overwrite: self.overwrite,
            preserve_owner: superuser,
            preserve_perms: superuser,
            umask: 0,
            superuser,
        };
        if self.preserve {
            extract.preserve_owner = true;
            extract.preserve_perms = true;
        }
        if self.no_preserve {
            extract.preserve_owner = false;
            extract.preserve_perms = false;
        }
        if self.preserve_owner {
            extract.preserve_owner = true;
        }
        if self.no_preserve_owner {
            extract.preserve_owner = false;
        }
        if self.preserve_perms {
            extract.preserve_perms = true;
        }
        if self.no_preserve_perms {
            extract.preserve_perms = false;
        }

        let extract_path = match &self.extract {
            Some(Some(path)) => Some(strip_trailing_slashes(path)),
            _ => None,
        };
        FsckConfig {
            extract_path,
            check_decomp: self.extract.is_some(),
            print_comp_ratio: self.print_comp_ratio,
            force: self.force,
            explicit_preserve: self.explicit_preserve(),
            extract,
            strict_checksum: self.strict_checksum,
            workers: self.threads.unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(|x| x.get())
                    .unwrap_or(1)
            }),
        }
    }
}

// "/" stays as it is
fn strip_trailing_slashes(path: &Path) -> PathBuf {
    let s = path.as_os_str().as_bytes();
    let end = s.iter().rposition(|x| *x != b'/').map_or(1.min(s.len()), |i| i + 1);
    PathBuf::from(OsStr::from_bytes(&s[..end]))
}

fn level(debug: u8) -> LevelFilter {
    match debug {
        0..=1 => LevelFilter::Error,
        2 => LevelFilter::Warn,
        3..=6 => LevelFilter::Info,
        7 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

fn map_device(path: &Path) -> Result<Box<dyn Device>, Error> {
    let file = File::open(path)?;
    let mmap = unsafe { MmapOptions::new().map(&file)? };
    Ok(Box::new(mmap))
}

fn open(args: &Args) -> Result<Erofs, Error> {
    let devices = args
        .devices
        .iter()
        .map(|x| map_device(x))
        .collect::<Result<Vec<_>, _>>()?;
    Erofs::open(map_device(&args.image)?)?.with_devices(devices)
}

fn main() -> ExitCode {
    let args = Args::parse();

    let mut logger =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"));
    if let Some(debug) = args.debug {
        logger.filter_level(level(debug));
    }
    logger.init();

    let mut cfg = args.config();
    if let Err(e) = cfg.validate() {
        error!("{}", e);
        return ExitCode::FAILURE;
    }
    if cfg.extract_path.is_some() {
        // created entries get exactly the modes asked for
        cfg.extract.umask = umask(Mode::empty()).bits();
    }

    let fs = match open(&args) {
        Ok(fs) => fs,
        Err(e) => {
            error!("failed to open image {}: {}", args.image.display(), e);
            return ExitCode::FAILURE;
        }
    };
    info!(
        "checking {} with {} workers",
        args.image.display(),
        cfg.workers
    );

    let extracting = cfg.extract_path.is_some();
    let report = Fsck::new(Arc::new(fs), cfg).run();

    if !report.is_clean() {
        if extracting {
            println!("Failed to extract filesystem");
        } else if report.corrupted {
            println!("Found some filesystem corruption");
        } else {
            println!("Failed to read filesystem");
        }
        return ExitCode::FAILURE;
    }
    if extracting {
        println!("Extracted filesystem successfully");
    } else {
        println!("No errors found");
    }
    if let Some(ratio) = report.compression_ratio {
        println!("Compression ratio: {:.2}(%)", ratio);
    }
    ExitCode::SUCCESS
}
