//! arcsync: content-addressed archiving and synchronization
//!
//! Encodes a filesystem tree into a linear archive while splitting it into
//! content-defined chunks stored under their SHA-256 ids, and decodes the
//! tree back from an archive or from an index plus chunk stores.

mod config;

use std::path::PathBuf;

use clap::builder::styling::{AnsiColor, Effects};
use clap::{ArgGroup, Parser, Subcommand, ValueEnum, builder::Styles};
use color_eyre::Result;
use color_eyre::eyre::eyre;
use tracing::{debug, info};

use arcsync_core::{BaseKind, ChunkConfig, ObjectId, SyncStep, Synchronizer};

use config::ArcsyncConfig;

const STYLES: Styles = Styles::styled()
    .header(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .usage(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .literal(AnsiColor::Cyan.on_default().effects(Effects::BOLD))
    .placeholder(AnsiColor::Cyan.on_default())
    .valid(AnsiColor::Green.on_default())
    .invalid(AnsiColor::Red.on_default());

#[derive(Parser)]
#[command(name = "arcsync")]
#[command(version)]
#[command(styles = STYLES)]
#[command(about = "Content-addressed archiving with chunk deduplication")]
#[command(long_about = r#"
arcsync turns filesystem trees into linear archives, deduplicated chunk
stores, and indexes, and reassembles them again.

Examples:
  arcsync make tree.arc ./project                      Archive only
  arcsync make tree.arc ./project --store ./chunks \
      --index tree.arcsidx                             Archive + chunks + index
  arcsync extract ./restored --index tree.arcsidx \
      --store ./chunks                                 Rebuild from chunks
  arcsync extract ./restored --archive tree.arc        Rebuild from the archive
  arcsync digest ./project                             Print the tree digest
"#)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Encode a tree into an archive, chunk store, and index
    Make {
        /// Archive file to create
        archive: PathBuf,

        /// Directory or file to encode
        base: PathBuf,

        /// Chunk store directory to fill
        #[arg(short, long)]
        store: Option<PathBuf>,

        /// Index file to write (requires --store)
        #[arg(short, long)]
        index: Option<PathBuf>,

        #[command(flatten)]
        chunk: ChunkArgs,
    },

    /// Decode a tree from an archive or from an index plus stores
    #[command(group(ArgGroup::new("source").required(true).args(["archive", "index"])))]
    Extract {
        /// Path to materialize the tree at
        base: PathBuf,

        /// Read the serialized archive directly
        #[arg(short, long)]
        archive: Option<PathBuf>,

        /// Resolve chunks through an index file
        #[arg(short, long)]
        index: Option<PathBuf>,

        /// Writable chunk store consulted first
        #[arg(short, long)]
        store: Option<PathBuf>,

        /// Read-only seed store, consulted in order; may repeat
        #[arg(long)]
        seed: Vec<PathBuf>,

        /// Shape of the target to create
        #[arg(short, long, value_enum, default_value_t = TargetKind::Dir)]
        kind: TargetKind,
    },

    /// Compute the archive digest of a tree without writing anything
    Digest {
        /// Directory or file to digest
        base: PathBuf,
    },
}

/// Chunk size bounds; flags win over .arcsync.toml.
#[derive(Debug, clap::Args)]
struct ChunkArgs {
    /// Minimum chunk size in bytes
    #[arg(long)]
    chunk_min: Option<u32>,

    /// Average chunk size in bytes
    #[arg(long)]
    chunk_avg: Option<u32>,

    /// Maximum chunk size in bytes
    #[arg(long)]
    chunk_max: Option<u32>,
}

impl ChunkArgs {
    /// Merge flags over the config file default.
    fn resolve(&self, config: &ArcsyncConfig) -> Option<ChunkConfig> {
        let base = config.chunk.unwrap_or_default();
        if self.chunk_min.is_none()
            && self.chunk_avg.is_none()
            && self.chunk_max.is_none()
            && config.chunk.is_none()
        {
            return None;
        }
        Some(ChunkConfig {
            min_size: self.chunk_min.unwrap_or(base.min_size),
            avg_size: self.chunk_avg.unwrap_or(base.avg_size),
            max_size: self.chunk_max.unwrap_or(base.max_size),
        })
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TargetKind {
    /// Directory tree
    Dir,
    /// Single regular file
    Reg,
    /// Block device, written in place
    Blk,
}

impl From<TargetKind> for BaseKind {
    fn from(kind: TargetKind) -> Self {
        match kind {
            TargetKind::Dir => BaseKind::Directory,
            TargetKind::Reg => BaseKind::Regular,
            TargetKind::Blk => BaseKind::BlockDevice,
        }
    }
}

fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();

    // Setup logging
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let config = ArcsyncConfig::load(std::path::Path::new("."))?;

    match cli.command {
        Commands::Make {
            archive,
            base,
            store,
            index,
            chunk,
        } => make_command(&config, archive, base, store, index, &chunk),
        Commands::Extract {
            base,
            archive,
            index,
            store,
            seed,
            kind,
        } => extract_command(base, archive, index, store, seed, kind),
        Commands::Digest { base } => digest_command(base),
    }
}

fn make_command(
    config: &ArcsyncConfig,
    archive: PathBuf,
    base: PathBuf,
    store: Option<PathBuf>,
    index: Option<PathBuf>,
    chunk: &ChunkArgs,
) -> Result<()> {
    if index.is_some() && store.is_none() && config.store.is_none() {
        return Err(eyre!("--index requires a chunk store (--store or config)"));
    }

    let mut sync = Synchronizer::new_encode();
    sync.set_base_path(&base)?;
    sync.set_archive_path(&archive)?;
    if let Some(store) = store.or_else(|| config.store.clone()) {
        sync.set_store_local(store)?;
    }
    if let Some(index) = index {
        sync.set_index_path(index)?;
    }
    if let Some(chunk) = chunk.resolve(config) {
        sync.set_chunk_config(chunk)?;
    }

    info!("Archiving {}...", base.display());
    let digest = drive(&mut sync)?;
    info!("Wrote {}", archive.display());
    println!("{digest}");
    Ok(())
}

fn extract_command(
    base: PathBuf,
    archive: Option<PathBuf>,
    index: Option<PathBuf>,
    store: Option<PathBuf>,
    seeds: Vec<PathBuf>,
    kind: TargetKind,
) -> Result<()> {
    if index.is_some() && store.is_none() && seeds.is_empty() {
        return Err(eyre!("--index needs at least one store to resolve chunks"));
    }

    let mut sync = Synchronizer::new_decode();
    if let Some(archive) = &archive {
        sync.set_archive_path(archive)?;
    }
    if let Some(index) = index {
        sync.set_index_path(index)?;
    }
    if let Some(store) = store {
        sync.set_store_local(store)?;
    }
    for seed in seeds {
        sync.add_seed_store_local(seed)?;
    }
    sync.set_base_path(&base)?;
    sync.set_base_mode(kind.into())?;

    info!("Extracting to {}...", base.display());
    drive(&mut sync)?;
    info!("Done");
    Ok(())
}

fn digest_command(base: PathBuf) -> Result<()> {
    let mut sync = Synchronizer::new_encode();
    sync.set_base_path(&base)?;

    let digest = drive(&mut sync)?;
    println!("{digest}");
    Ok(())
}

/// Step the pipeline to completion and return the archive digest.
fn drive(sync: &mut Synchronizer) -> Result<ObjectId> {
    loop {
        match sync.step()? {
            SyncStep::Finished => break,
            SyncStep::NextFile => {
                if let Ok(Some(path)) = sync.current_path() {
                    debug!("processing {}", path.display());
                }
            }
            SyncStep::Step => {}
        }
    }
    Ok(sync.get_digest()?)
}
