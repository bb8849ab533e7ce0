use clap::{Parser, Subcommand};
use secram::block::{Block, ContentType};
use secram::codec::CompressionMethod;
use secram::container::{Container, SENSITIVE_BLOCK_CONTENT_ID};
use secram::crypto::{random_salt, FilterConfig, KeyedFilter, SecurityFilter};
use secram::iterator::ContainerIterator;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

/// File salt used when `--salt` is not given.
const DEFAULT_FILE_SALT: u64 = 0x5345_4352_414d_0001;

#[derive(Parser)]
#[command(name = "secram", about = "Encrypted CRAM-style container streams")]
struct Cli {
    /// Log at debug level (RUST_LOG still takes precedence per target)
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Pack files into a container stream, one container per file
    Pack {
        #[arg(short, long)]
        output: PathBuf,
        #[arg(long)]
        password: String,
        /// File salt for the master key
        #[arg(long, default_value_t = DEFAULT_FILE_SALT)]
        salt: u64,
        /// Start position of the first container
        #[arg(long, default_value = "0")]
        start_pos: u64,
        /// Positions covered by each container
        #[arg(long, default_value = "1000")]
        span: u64,
        /// Core block method: raw, gzip (default), lzma, rans
        #[arg(short, long, default_value = "gzip")]
        method: String,
        /// JSON filter config; only its `kdf` section is used when packing
        #[arg(long)]
        filter: Option<PathBuf>,
        #[arg(short, long, required = true, num_args = 1..)]
        input: Vec<PathBuf>,
    },
    /// Decrypt and list the permitted containers of a stream
    List {
        input: PathBuf,
        #[arg(long)]
        password: String,
        #[arg(long, default_value_t = DEFAULT_FILE_SALT)]
        salt: u64,
        /// JSON filter config with permitted position ranges
        #[arg(long)]
        filter: Option<PathBuf>,
    },
    /// Decode one serialized block and describe it
    Block {
        input: PathBuf,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let level = if cli.verbose { tracing::Level::DEBUG } else { tracing::Level::WARN };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .with_writer(std::io::stderr)
        .init();

    match cli.command {

        // ── Pack ─────────────────────────────────────────────────────────────
        Commands::Pack { output, password, salt, start_pos, span, method, filter, input } => {
            let method = parse_method(&method)?;
            let mut keys = KeyedFilter::from_password(&password, salt, load_config(filter.as_deref())?)?;
            let mut out = BufWriter::new(File::create(&output)?);

            let mut pos = start_pos;
            for (i, path) in input.iter().enumerate() {
                let data = std::fs::read(path)?;
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| path.display().to_string());

                let container_id = u32::try_from(i)?;
                let container_salt = random_salt();
                let end = pos.saturating_add(span.saturating_sub(1));
                let mut container = Container::new(container_id, pos, end, container_salt);

                keys.init_container_encryption(container_salt, container_id)?;
                let sealed = keys.encrypt_block(&data, container_id)?;

                container.add_block(Block::container_header(name.as_bytes().to_vec()))?;
                container.add_block(Block::new(method, ContentType::Core, 0, name.into_bytes()))?;
                container.add_block(Block::external(CompressionMethod::Raw, SENSITIVE_BLOCK_CONTENT_ID, sealed))?;
                container.write(&mut out)?;

                println!("  packed  {:<40} id={:<4} pos={}..={}", path.display(), container_id, pos, end);
                pos = pos.saturating_add(span);
            }
            out.flush()?;
            println!("Created: {}", output.display());
        }

        // ── List ─────────────────────────────────────────────────────────────
        Commands::List { input, password, salt, filter } => {
            let keys = KeyedFilter::from_password(&password, salt, load_config(filter.as_deref())?)?;
            let mut iter = ContainerIterator::new(BufReader::new(File::open(&input)?), keys);

            println!("Stream: {}", input.display());
            println!("{:>6} {:>14} {:>14} {:>7} {:>12}  Plaintext hash",
                     "Id", "Start", "End", "Blocks", "Sensitive");
            while let Some(mut container) = iter.next_container()? {
                let blocks = container.block_count();
                let (size, hash) = match container.sensitive_block_mut() {
                    Some(block) => {
                        let plain = block.raw_content()?;
                        (plain.len(), hex::encode(&blake3::hash(plain).as_bytes()[..6]))
                    }
                    None => (0, "-".into()),
                };
                println!("{:>6} {:>14} {:>14} {:>7} {:>12}  {}",
                    container.container_id, container.absolute_pos_start,
                    container.absolute_pos_end, blocks, size, hash);
            }

            let t = iter.timings();
            println!("{} container(s), io {:.1?}, decryption {:.1?}", t.containers, t.io, t.decryption);
            iter.close();
        }

        // ── Block ────────────────────────────────────────────────────────────
        Commands::Block { input } => {
            let bytes = std::fs::read(&input)?;
            let block = Block::read(bytes.as_slice())?;
            println!("{}", block);
        }
    }

    Ok(())
}

// ── helpers ──────────────────────────────────────────────────────────────────

fn load_config(path: Option<&Path>) -> Result<FilterConfig, Box<dyn std::error::Error>> {
    Ok(match path {
        Some(p) => FilterConfig::load(p)?,
        None    => FilterConfig::default(),
    })
}

fn parse_method(s: &str) -> Result<CompressionMethod, String> {
    CompressionMethod::from_name(s).ok_or_else(|| format!("Unknown compression method '{}'", s))
}
