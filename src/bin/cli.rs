//! AtlasLog CLI
//!
//! Offline inspection of log files and archive directories.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use atlaslog::archive::{list_archive_files, list_group_dirs, ArchiveMeta};
use atlaslog::crypto::{CryptoCodec, LocalKeyManagement};
use atlaslog::log::{IoMode, LogFile, LogReader, LogRecovery, LOG_FILE_NAME};
use atlaslog::{AtlasError, Lsn, Result, LOG_BLOCK_HDR_SIZE, LOG_BLOCK_TRL_SIZE};
use clap::{Parser, Subcommand};

/// AtlasLog CLI
#[derive(Parser, Debug)]
#[command(name = "atlaslog-cli")]
#[command(about = "Inspect AtlasLog redo log files and archives")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the file header, both checkpoint slots and the end of the log
    Inspect {
        /// Log directory holding ib_logfile0
        dir: PathBuf,

        /// Passphrase of an encrypted log
        #[arg(short, long)]
        passphrase: Option<String>,
    },

    /// Hex dump of the payload bytes in [from, to)
    Dump {
        /// Log directory holding ib_logfile0
        dir: PathBuf,

        /// First LSN (default: the latest checkpoint)
        #[arg(long)]
        from: Option<Lsn>,

        /// End LSN, exclusive (default: the recovered end of the log)
        #[arg(long)]
        to: Option<Lsn>,

        /// Passphrase of an encrypted log
        #[arg(short, long)]
        passphrase: Option<String>,
    },

    /// List archive groups and their files
    Archives {
        /// Archive directory
        dir: PathBuf,
    },
}

fn main() {
    let args = Args::parse();

    let outcome = match args.command {
        Commands::Inspect { dir, passphrase } => inspect(&dir, passphrase.as_deref()),
        Commands::Dump {
            dir,
            from,
            to,
            passphrase,
        } => dump(&dir, from, to, passphrase.as_deref()),
        Commands::Archives { dir } => archives(&dir),
    };

    if let Err(e) = outcome {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

fn open_log(dir: &Path, passphrase: Option<&str>) -> Result<(LogFile, Option<CryptoCodec>)> {
    let file = LogFile::open(&dir.join(LOG_FILE_NAME), IoMode::Normal)?;
    let crypto = passphrase.map(|p| CryptoCodec::new(Arc::new(LocalKeyManagement::from_passphrase(p))));
    if file.header().encrypted && crypto.is_none() {
        return Err(AtlasError::Config("log is encrypted, pass --passphrase".to_string()));
    }
    Ok((file, crypto))
}

fn inspect(dir: &Path, passphrase: Option<&str>) -> Result<()> {
    let (file, crypto) = open_log(dir, passphrase)?;
    let header = file.header();
    println!("file:        {}", file.path().display());
    println!("creator:     {}", header.creator);
    println!("block size:  {}", header.block_size);
    println!("first lsn:   {}", header.first_lsn);
    println!("file size:   {}", file.file_size());
    println!("capacity:    {}", file.capacity());
    println!("encrypted:   {}", header.encrypted);

    let (latest, previous) = LogRecovery::read_checkpoints(&file)?;
    for (label, record) in [("latest", Some(latest)), ("previous", previous)] {
        match record {
            Some(r) => println!(
                "{:<9}    no={} checkpoint_lsn={} end_lsn={} key_epoch={}",
                label,
                r.checkpoint_no,
                r.checkpoint_lsn,
                r.end_lsn,
                r.crypto.map_or("-".to_string(), |c| format!("v{}", c.key_version)),
            ),
            None => println!("{:<9}    (invalid or empty)", label),
        }
    }

    let recovered = LogRecovery::recover(&file, crypto.as_ref())?;
    println!(
        "end of log:  {} ({} blocks scanned)",
        recovered.end_lsn, recovered.blocks_scanned
    );
    Ok(())
}

fn dump(dir: &Path, from: Option<Lsn>, to: Option<Lsn>, passphrase: Option<&str>) -> Result<()> {
    let (file, crypto) = open_log(dir, passphrase)?;
    let recovered = LogRecovery::recover(&file, crypto.as_ref())?;
    let from = from.unwrap_or(recovered.checkpoint.checkpoint_lsn);
    let to = to.unwrap_or(recovered.end_lsn).min(recovered.end_lsn);
    if from > to {
        return Err(AtlasError::InvalidArgument(format!(
            "empty range {}..{}, log ends at {}",
            from, to, recovered.end_lsn
        )));
    }

    let reader = LogReader::new(&file, crypto.as_ref())?;
    let geometry = *reader.geometry();
    let b = geometry.block_size() as u64;

    // One line per 16 payload bytes, labelled with the LSN of the first
    let mut block_lsn = geometry.align_down(from);
    while block_lsn < to {
        let lo = from.max(block_lsn + LOG_BLOCK_HDR_SIZE as u64);
        let hi = to.min(block_lsn + b - LOG_BLOCK_TRL_SIZE as u64);
        if lo < hi {
            let image = reader.read_block(block_lsn)?.map_err(|defect| {
                AtlasError::Corruption(format!("block at lsn {}: {:?}", block_lsn, defect))
            })?;
            let payload = &image[(lo - block_lsn) as usize..(hi - block_lsn) as usize];
            for (i, line) in payload.chunks(16).enumerate() {
                println!("{:>12}  {}", lo + (i * 16) as u64, hex_line(line));
            }
        }
        block_lsn += b;
    }
    Ok(())
}

fn hex_line(bytes: &[u8]) -> String {
    let hex: Vec<String> = bytes.iter().map(|b| format!("{:02x}", b)).collect();
    let text: String = bytes
        .iter()
        .map(|b| if b.is_ascii_graphic() || *b == b' ' { *b as char } else { '.' })
        .collect();
    format!("{:<47}  |{}|", hex.join(" "), text)
}

fn archives(dir: &Path) -> Result<()> {
    for group_dir in list_group_dirs(dir)? {
        match ArchiveMeta::load(&group_dir) {
            Ok(meta) => println!(
                "{}  begin={} end={} durable={} file_size={}",
                group_dir.display(),
                meta.begin_lsn,
                meta.end_lsn.map_or("open".to_string(), |l| l.to_string()),
                meta.durable,
                meta.file_size,
            ),
            Err(e) => println!("{}  unreadable metadata: {}", group_dir.display(), e),
        }
        for file in list_archive_files(&group_dir)? {
            println!("    {}", file.display());
        }
    }
    Ok(())
}
