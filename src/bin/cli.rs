//! blobstore CLI
//!
//! Command-line interface for inspecting and editing a blob storage file.

use std::process;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{fmt, EnvFilter};

use blobstore::pages::{MmapPagedFile, PageStorage, PagedFile};
use blobstore::{BlobStorage, Config, RecordId};

/// blobstore CLI
#[derive(Parser, Debug)]
#[command(name = "blobstore-cli")]
#[command(about = "Inspect and edit blobstore files")]
#[command(version)]
struct Args {
    /// Storage file
    #[arg(short, long, default_value = "./blobstore.data")]
    file: String,

    /// Page size in KiB
    #[arg(short, long, default_value = "1024")]
    page_kb: usize,

    /// Page storage backend
    #[arg(short, long, value_enum, default_value_t = Backend::Paged)]
    backend: Backend,

    #[command(subcommand)]
    command: Commands,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Backend {
    /// Page cache over a plain file
    Paged,
    /// Memory-mapped file
    Mmap,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print header and statistics
    Stat,

    /// Store a new record, print its id
    Put {
        /// Record content
        value: String,
    },

    /// Replace the content of a record, print the id it lives under now
    Update {
        /// Record id
        id: RecordId,

        /// New record content
        value: String,
    },

    /// Print a record
    Get {
        /// Record id
        id: RecordId,
    },

    /// Delete a record
    Delete {
        /// Record id
        id: RecordId,
    },

    /// List all record slots
    Dump,

    /// Set the data format version stored in the header
    SetVersion {
        /// New version
        version: u32,
    },
}

fn main() {
    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,blobstore=info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let config = Config::builder()
        .path(&args.file)
        .page_size(args.page_kb * 1024)
        .build();

    let result = match args.backend {
        Backend::Paged => run::<PagedFile>(&config, args.command),
        Backend::Mmap => run::<MmapPagedFile>(&config, args.command),
    };

    if let Err(e) = result {
        tracing::error!("{}", e);
        process::exit(1);
    }
}

fn run<S: PageStorage>(config: &Config, command: Commands) -> blobstore::Result<()> {
    let storage = BlobStorage::<S>::open(config)?;

    match command {
        Commands::Stat => {
            println!("{}", storage);
            println!("storage version:     {}", storage.storage_version()?);
            println!("data format version: {}", storage.data_format_version()?);
            println!("closed properly:     {}", storage.was_closed_properly()?);
            println!("max payload:         {} bytes", storage.max_payload_supported());
            println!("{}", storage.stats()?);
        }
        Commands::Put { value } => {
            let id = storage.write(blobstore::NULL_ID, value.as_bytes())?;
            println!("{}", id);
        }
        Commands::Update { id, value } => {
            let id = storage.write(id, value.as_bytes())?;
            println!("{}", id);
        }
        Commands::Get { id } => {
            let (payload, actual_id) = storage.read_record_redirected(id, |payload| payload.to_vec())?;
            if actual_id != id {
                eprintln!("(record {} moved to {})", id, actual_id);
            }
            println!("{}", String::from_utf8_lossy(&payload));
        }
        Commands::Delete { id } => {
            storage.delete_record(id)?;
            println!("deleted {}", id);
        }
        Commands::Dump => {
            let visited = storage.for_each(|id, capacity, length, payload| {
                if BlobStorage::<S>::is_record_actual(length) {
                    println!(
                        "{:>10}  actual  capacity={:<8} length={:<8} crc32={:08x}",
                        id,
                        capacity,
                        length,
                        crc32fast::hash(payload)
                    );
                } else {
                    println!("{:>10}  other   capacity={:<8}", id, capacity);
                }
                true
            })?;
            println!("{} slots", visited);
        }
        Commands::SetVersion { version } => {
            storage.set_data_format_version(version)?;
            println!("data format version: {}", version);
        }
    }

    storage.close()
}
