//! Slicesync CLI - delta downloads and fingerprint maintenance.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use slicesync::{
    hash_info, DiffMode, FingerprintStore, LocalRangeReader, SliceSync, SyncBuilder, AUTOSIZE,
    DEFAULT_SLICE,
};

/// Slicesync - sync remote files by fetching only the differing slices
#[derive(Parser)]
#[command(name = "slicesync")]
#[command(version)]
#[command(about = "Delta file synchronization over HTTP ranges")]
#[command(long_about = None)]
struct Cli {
    /// Show debug output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download a remote file, reusing a local alike
    Sync {
        /// Server base, e.g. host:8000 or http://host:8000/files
        server: String,

        /// Remote file name relative to the server base
        filename: String,

        /// Destination path (default: the remote file's basename)
        #[arg(short, long)]
        dest: Option<PathBuf>,

        /// Local alike file (default: the destination)
        #[arg(short, long)]
        alike: Option<PathBuf>,

        /// Slice size in bytes
        #[arg(short, long, default_value_t = DEFAULT_SLICE)]
        slice: u64,

        /// Match slices at any byte offset instead of aligned only
        #[arg(long)]
        shifted: bool,
    },

    /// Compute the plan between a remote file and a local alike
    Diff {
        /// Server base, e.g. host:8000
        server: String,

        /// Remote file name relative to the server base
        filename: String,

        /// Local alike file
        alike: PathBuf,

        /// Slice size in bytes
        #[arg(short, long, default_value_t = DEFAULT_SLICE)]
        slice: u64,

        /// Match slices at any byte offset instead of aligned only
        #[arg(long)]
        shifted: bool,
    },

    /// Maintain the .slicesync fingerprint tree for a served directory
    Hash {
        /// Directory to fingerprint
        #[arg(short, long, default_value = ".")]
        dir: PathBuf,

        /// Slice size in bytes
        #[arg(short, long, default_value_t = DEFAULT_SLICE)]
        slice: u64,

        /// Recurse into subdirectories
        #[arg(short, long)]
        recursive: bool,
    },

    /// Print the digest of one file or file slice
    Info {
        /// File to hash
        file: PathBuf,

        /// Starting offset
        #[arg(short, long, default_value_t = 0)]
        offset: u64,

        /// Bytes to hash (0 = to end of file)
        #[arg(short, long, default_value_t = AUTOSIZE)]
        slice: u64,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Commands::Sync {
            server,
            filename,
            dest,
            alike,
            slice,
            shifted,
        } => run_sync(&server, &filename, dest, alike, slice, shifted),
        Commands::Diff {
            server,
            filename,
            alike,
            slice,
            shifted,
        } => run_diff(&server, &filename, &alike, slice, shifted),
        Commands::Hash {
            dir,
            slice,
            recursive,
        } => run_hash(&dir, slice, recursive),
        Commands::Info {
            file,
            offset,
            slice,
        } => run_info(&file, offset, slice),
    }
}

fn engine(slice: u64, shifted: bool) -> SliceSync {
    SyncBuilder::new()
        .slice(slice)
        .mode(if shifted {
            DiffMode::Shifted
        } else {
            DiffMode::Aligned
        })
        .build()
}

fn run_sync(
    server: &str,
    filename: &str,
    dest: Option<PathBuf>,
    alike: Option<PathBuf>,
    slice: u64,
    shifted: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let sync = engine(slice, shifted);
    let plan = sync.sync(server, filename, dest.as_deref(), alike.as_deref())?;

    let reused = plan.length - plan.differences;
    println!(
        "Synced {filename} ({} bytes, {} fetched, {reused} reused from {})",
        plan.length,
        plan.differences,
        if plan.alike.is_empty() {
            "nothing"
        } else {
            plan.alike.as_str()
        },
    );
    Ok(())
}

fn run_diff(
    server: &str,
    filename: &str,
    alike: &PathBuf,
    slice: u64,
    shifted: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    use slicesync::{naive_diff, shifted_diff, FingerprintReader, HashSource, LocalHashSource};
    use std::io::BufReader;

    let remote = slicesync::RemoteHashSource::new(server)?;
    let alike_dir = alike.parent().filter(|p| !p.as_os_str().is_empty());
    let local = LocalHashSource::new(alike_dir.unwrap_or_else(|| std::path::Path::new(".")));
    let alike_name = alike
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let remote_fp = FingerprintReader::new(BufReader::new(remote.fingerprint(filename, slice)?));
    let mut plan = if shifted {
        let alike_bytes = std::fs::read(alike)?;
        shifted_diff(
            &alike_bytes,
            remote_fp,
            &alike_name,
            filename,
            slice,
            &slicesync::CancelToken::new(),
        )?
    } else {
        let local_fp = FingerprintReader::new(BufReader::new(local.fingerprint(&alike_name, slice)?));
        naive_diff(
            local_fp,
            remote_fp,
            &alike_name,
            filename,
            slice,
            &slicesync::CancelToken::new(),
        )?
    };
    plan.remote = server.to_string();

    println!("{}", plan.to_json_pretty());
    Ok(())
}

fn run_hash(dir: &PathBuf, slice: u64, recursive: bool) -> Result<(), Box<dyn std::error::Error>> {
    let store = FingerprintStore::new(dir);
    store.hash_dir(slice, recursive)?;
    println!(
        "Fingerprinted {}{} (slice {slice})",
        dir.display(),
        if recursive { " recursively" } else { "" },
    );
    Ok(())
}

fn run_info(file: &PathBuf, offset: u64, slice: u64) -> Result<(), Box<dyn std::error::Error>> {
    let dir = file.parent().filter(|p| !p.as_os_str().is_empty());
    let reader = LocalRangeReader::new(dir.unwrap_or_else(|| std::path::Path::new(".")));
    let name = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let info = hash_info(&reader, &name, offset, slice)?;
    println!(
        "{} bytes {}-{}: {}",
        info.size,
        info.offset,
        info.offset + info.slice,
        if info.hash.is_empty() {
            "(empty)"
        } else {
            info.hash.as_str()
        },
    );
    Ok(())
}
