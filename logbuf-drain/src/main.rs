use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use logbuf::{
    oversize_path, Context, LogBuffer, LogBufferConfig, LogEntry, MemoryPolicy, OpenError,
    Preamble, ReadOrder, ReliabilityLevel, StringEncoding,
};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let DrainCommand { action } = DrainCommand::parse();

    let result = match action {
        Action::Inspect { file } => inspect(&file),
        Action::Drain {
            file,
            name,
            categories,
            keep,
            order,
        } => drain(&file, name, categories, keep, order.into()),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "logbuf-drain failed");
            eprintln!("logbuf-drain: {err}");
            ExitCode::FAILURE
        }
    }
}

#[derive(Parser)]
#[command(version, about)]
struct DrainCommand {
    #[command(subcommand)]
    action: Action,
}

#[derive(Subcommand)]
enum Action {
    /// Print the geometry recorded in the preamble of an arena file.
    Inspect {
        #[arg(help = "The arena file")]
        file: PathBuf,
    },
    /// Recover an arena file and print its entries, one per line.
    ///
    /// Lines are tab separated: timestamp, level, category and payload. The name and the
    /// categories must be the ones the log was written with, an arena of any other log is
    /// refused without being touched.
    Drain {
        #[arg(help = "The arena file")]
        file: PathBuf,

        /// Name of the log that wrote the arena.
        #[arg(long)]
        name: String,

        /// Category names of the log, in order.
        #[arg(long = "category")]
        categories: Vec<String>,

        /// Drain a copy of the arena, leaving the file itself untouched.
        ///
        /// The copy is taken without the lock, so this also works on the file of a running log.
        #[arg(long)]
        keep: bool,

        #[arg(value_enum, long, default_value_t = Order::Timestamp)]
        order: Order,
    },
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum Order {
    /// Oldest timestamp first, across all blocks.
    Timestamp,
    /// Block after block.
    PerBlock,
}

impl From<Order> for ReadOrder {
    fn from(order: Order) -> Self {
        match order {
            Order::Timestamp => ReadOrder::Timestamp,
            Order::PerBlock => ReadOrder::PerBlock,
        }
    }
}

#[derive(Debug)]
enum DrainError {
    Io(io::Error),
    Open(OpenError),
    Invalid(String),
}

impl core::fmt::Display for DrainError {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self {
            DrainError::Io(err) => write!(f, "{err}"),
            DrainError::Open(err) => write!(f, "{err}"),
            DrainError::Invalid(msg) => f.write_str(msg),
        }
    }
}

impl From<io::Error> for DrainError {
    fn from(err: io::Error) -> Self {
        DrainError::Io(err)
    }
}

impl From<OpenError> for DrainError {
    fn from(err: OpenError) -> Self {
        DrainError::Open(err)
    }
}

fn read_preamble(file: &Path) -> Result<Preamble, DrainError> {
    let preamble = Preamble::read_from(file)?;
    preamble
        .validate()
        .map_err(|reason| DrainError::Invalid(format!("{}: {reason}", file.display())))?;
    Ok(preamble)
}

fn inspect(file: &Path) -> Result<(), DrainError> {
    let preamble = read_preamble(file)?;
    let mut out = io::stdout().lock();

    writeln!(out, "version: {}", preamble.version())?;
    writeln!(out, "fingerprint: {:#018x}", preamble.fingerprint())?;
    writeln!(out, "categories: {}", preamble.fingerprint() >> 32)?;
    writeln!(out, "total_size: {}", preamble.total_size())?;
    writeln!(out, "per_block_size: {}", preamble.per_block_size())?;
    writeln!(out, "max_blocks_count: {}", preamble.max_blocks_count())?;
    Ok(())
}

fn drain(
    file: &Path,
    name: String,
    categories: Vec<String>,
    keep: bool,
    order: ReadOrder,
) -> Result<(), DrainError> {
    let preamble = read_preamble(file)?;
    debug!(file = %file.display(), ?preamble, "found arena");
    let oversize_size = oversize_size(file);

    // Opening writes: recovery and the reader persist their cursors.
    let snapshot = if keep {
        let dir = tempfile::tempdir()?;
        let copy = dir.path().join("arena.mmap");
        std::fs::copy(file, &copy)?;
        if oversize_size != 0 {
            std::fs::copy(oversize_path(file), oversize_path(&copy))?;
        }

        debug!(copy = %copy.display(), "draining a copy");
        Some((dir, copy))
    } else {
        None
    };

    let source = snapshot.as_ref().map_or(file, |(_, copy)| copy.as_path());

    // Auto expansion links no further block into a recovered chain.
    let config = LogBufferConfig {
        name,
        categories,
        max_blocks_count: preamble.max_blocks_count(),
        total_size: preamble.total_size(),
        initial_blocks: 0,
        policy: MemoryPolicy::AutoExpandWhenFull,
        reliability: ReliabilityLevel::High,
        backing_path: Some(source.to_owned()),
        reject_mismatch: true,
        oversize_size,
        ..LogBufferConfig::default()
    };

    let buffer = LogBuffer::open(&Context::default(), config)?;
    info!(recovery = ?buffer.recovery(), "arena open");

    let Some(reader) = buffer.reader() else {
        return Err(DrainError::Invalid("the reader is already taken".into()));
    };

    let mut reader = reader.with_order(order);
    let categories = &buffer.config().categories;
    let mut out = io::stdout().lock();
    let mut failed = None;

    let print = |_: u16, data: &[u8]| {
        if failed.is_none() {
            if let Err(err) = print_entry(&mut out, categories, data) {
                failed = Some(err);
            }
        }
    };

    let count = reader.drain(print);

    if let Some(err) = failed {
        return Err(err.into());
    }

    info!(count, keep, "entries written");
    Ok(())
}

/// Size of the oversize arena next to `file`, zero if there is none to read.
fn oversize_size(file: &Path) -> u64 {
    let path = oversize_path(file);
    let Ok(preamble) = Preamble::read_from(&path) else {
        return 0;
    };

    match preamble.validate() {
        Ok(()) => preamble.total_size(),
        Err(reason) => {
            warn!(file = %path.display(), %reason, "ignoring the oversize arena");
            0
        }
    }
}

fn print_entry(out: &mut impl Write, categories: &[String], data: &[u8]) -> io::Result<()> {
    let Some(entry) = LogEntry::parse(data) else {
        return writeln!(out, "-\t-\t-\t{}", hex(data));
    };

    let header = entry.header;
    let category = categories
        .get(header.category_idx as usize)
        .cloned()
        .unwrap_or_else(|| header.category_idx.to_string());

    let payload = match header.encoding() {
        Some(StringEncoding::Utf8) => String::from_utf8_lossy(entry.args)
            .trim_end_matches('\0')
            .to_owned(),
        Some(StringEncoding::Utf16) => {
            let units: Vec<u16> = entry
                .args
                .chunks_exact(2)
                .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                .collect();
            String::from_utf16_lossy(&units)
                .trim_end_matches('\0')
                .to_owned()
        }
        None => hex(entry.args),
    };

    writeln!(
        out,
        "{}\t{}\t{}\t{}",
        header.timestamp_epoch, header.level, category, payload
    )
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
