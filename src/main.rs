//! mapjournal - create and inspect journal files through the mapping cache

use anyhow::{bail, Context, Result};
use clap::{Parser as ClapParser, Subcommand};
use log::info;
use mapjournal::cache::{Access, MappingManager};
use mapjournal::config::CacheConfig;
use mapjournal::journal::header::unix_now;
use mapjournal::journal::layout::{decode_envelope, ENVELOPE_SIZE};
use mapjournal::journal::{JournalHeader, JournalParameters, ListDescriptor, INVALID_HANDLE};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Create and inspect memory-mapped journal files
#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Mapping budget of the cache in megabytes
    #[arg(long, default_value = "100", global = true)]
    mapping_limit_mb: usize,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write a fresh journal header and size the file for its pages
    Create {
        path: PathBuf,

        /// Number of pages to reserve
        #[arg(short, long, default_value = "0")]
        pages: u32,

        /// Bytes of per-page metadata
        #[arg(long, default_value = "32")]
        page_header_size: u32,

        /// Bytes of record data per page (defaults to blocks * block size)
        #[arg(long)]
        page_data_size: Option<u32>,

        /// Bytes reserved for caller data after the header states
        #[arg(long, default_value = "0")]
        user_data_size: u32,

        /// Alignment of the header size
        #[arg(long, default_value = "4096")]
        alignment: u32,
    },
    /// Recover a journal header and print its committed state
    Inspect { path: PathBuf },
}

fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    let cache = MappingManager::from_config(
        &CacheConfig::default().with_limit_mb(args.mapping_limit_mb),
    );

    match args.command {
        Command::Create {
            path,
            pages,
            page_header_size,
            page_data_size,
            user_data_size,
            alignment,
        } => create(
            &cache,
            &path,
            pages,
            page_header_size,
            page_data_size,
            user_data_size,
            alignment,
        ),
        Command::Inspect { path } => inspect(&cache, &path),
    }
}

fn create(
    cache: &MappingManager,
    path: &Path,
    pages: u32,
    page_header_size: u32,
    page_data_size: Option<u32>,
    user_data_size: u32,
    alignment: u32,
) -> Result<()> {
    let params = JournalParameters::default();
    let page_data_size = page_data_size.unwrap_or_else(|| params.page_data_size());
    let header_size = u32::try_from(JournalHeader::required_header_size(user_data_size, alignment))
        .context("Header size does not fit in 32 bits")?;

    let mut header = JournalHeader::init(
        header_size,
        page_header_size,
        page_data_size,
        alignment,
        user_data_size,
        &params,
    )
    .context("Failed to lay out journal header")?;
    header.set_num_pages(pages);
    header.set_modification_time(unix_now());
    header.commit_active_state();

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    let file_size = header.calculate_file_size(pages);
    file.set_len(file_size)
        .context("Failed to size journal file")?;
    let file = Arc::new(file);

    let dirty = cache.create_dirty_list();
    let page = cache.add_page(
        &file,
        0,
        header_size as usize,
        Access::ReadWrite,
        cache.num_priorities() - 1,
        Some(dirty),
    );
    {
        let mut guard = cache.write_page(&page).context("Failed to map header")?;
        header
            .write_to(&mut guard)
            .context("Failed to write journal header")?;
    }
    let flushed = cache
        .flush_dirty_list(dirty, true)
        .context("Failed to flush journal header")?;
    cache.remove_page(page);
    cache.delete_dirty_list(dirty);

    info!(
        "created {} ({} bytes, {} pages, {} header page flushed)",
        path.display(),
        file_size,
        pages,
        flushed
    );
    Ok(())
}

fn inspect(cache: &MappingManager, path: &Path) -> Result<()> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let file_len = file.metadata()?.len();
    if file_len < ENVELOPE_SIZE as u64 {
        bail!("{} is too short to hold a journal header", path.display());
    }
    let file = Arc::new(file);

    let probe = cache.add_page(&file, 0, ENVELOPE_SIZE, Access::ReadOnly, 0, None);
    let envelope = {
        let guard = cache.read_page(&probe).context("Failed to map header")?;
        decode_envelope(&guard)
    };
    cache.remove_page(probe);
    let envelope = envelope.context("Not a journal file")?;

    if file_len < envelope.header_size as u64 {
        bail!(
            "{} is truncated: header needs {} bytes",
            path.display(),
            envelope.header_size
        );
    }

    let page = cache.add_page(
        &file,
        0,
        envelope.header_size as usize,
        Access::ReadOnly,
        0,
        None,
    );
    let header = {
        let guard = cache.read_page(&page).context("Failed to map header")?;
        JournalHeader::open(&guard)
    };
    cache.remove_page(page);
    let header = header.context("Failed to recover journal header")?;

    let envelope = header.envelope();
    let state = header.committed_state();
    println!("file:                  {}", path.display());
    println!("format version:        {}", envelope.version);
    println!("header size:           {}", envelope.header_size);
    println!("pages per set:         {}", envelope.pages_per_set);
    println!(
        "blocks per page:       {} x {} bytes (threshold {})",
        envelope.blocks_per_page, envelope.block_size, envelope.free_block_threshold
    );
    println!("page header size:      {}", envelope.page_header_size);
    println!("page data size:        {}", envelope.page_data_size);
    println!("alignment:             {}", envelope.alignment);
    println!("created:               {}", envelope.creation_time);
    println!("user data size:        {}", envelope.user_data_size);
    println!("committed transaction: {}", state.committed_transaction_id);
    println!("active slot:           {}", header.active_index());
    println!("pages:                 {}", state.num_pages);
    println!("modified:              {}", state.modification_time);
    println!("confirmed records:     {}", describe(&state.confirmed_records));
    println!("unconfirmed records:   {}", describe(&state.unconfirmed_records));
    println!("fill pages:            {}", describe(&state.fill_pages));
    println!("pre-fill pages:        {}", describe(&state.pre_fill_pages));
    println!(
        "expected file size:    {} (actual {})",
        header.calculate_file_size(state.num_pages),
        file_len
    );
    Ok(())
}

fn describe(list: &ListDescriptor) -> String {
    let handle = |value: u32| {
        if value == INVALID_HANDLE {
            "-".to_string()
        } else {
            value.to_string()
        }
    };
    format!(
        "{} (first {}, last {})",
        list.count,
        handle(list.first),
        handle(list.last)
    )
}
