// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fmt,
    fs::File,
    io::{BufReader, Read, Seek, Write},
    path::{Path, PathBuf},
    sync::atomic::AtomicBool,
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use crate::{
    cli::{self, CompactView, status, warning},
    format::{
        compression::{CompressedFormat, CompressedReader},
        detect::{self, FileKind},
        transfer::TransferList,
    },
    stream::{FromReader, SetLen},
};

struct Metadata<'a>(&'a TransferList);

impl fmt::Debug for Metadata<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let commands = self
            .0
            .commands
            .iter()
            .map(|c| c.to_string())
            .collect::<Vec<_>>();

        f.debug_struct("TransferList")
            .field("version", &self.0.version)
            .field("total_blocks", &self.0.total_blocks)
            .field("stash_entries", &self.0.stash_entries)
            .field("stash_max_blocks", &self.0.stash_max_blocks)
            .field("image_blocks", &self.0.image_blocks())
            .field("commands", &CompactView(&commands))
            .finish()
    }
}

pub(crate) fn load_transfer_list(path: &Path) -> Result<TransferList> {
    let reader = cli::open_reader(path)?;

    TransferList::from_reader(reader)
        .with_context(|| format!("Failed to parse transfer list: {path:?}"))
}

/// Open a new data stream, transparently decompressing brotli and LZ4 frame
/// inputs.
pub(crate) fn open_transfer_data(path: &Path) -> Result<CompressedReader<BufReader<File>>> {
    let mut reader = cli::open_reader(path)?;

    let kind = detect::detect(&mut reader, Some(path))
        .with_context(|| format!("Failed to detect file type: {path:?}"))?;
    let format = match kind {
        FileKind::Brotli => CompressedFormat::Brotli,
        FileKind::Lz4 => CompressedFormat::Lz4,
        _ => CompressedFormat::None,
    };

    if format != CompressedFormat::None {
        info!("Decompressing {format:?} transfer data: {path:?}");
    }

    Ok(CompressedReader::with_format(BufReader::new(reader), format))
}

/// Replay `list` into `writer`, warning if the number of blocks written does
/// not match what the list header claims.
pub(crate) fn replay(
    list: &TransferList,
    input: impl Read,
    writer: impl Write + Seek + SetLen,
    cancel_signal: &AtomicBool,
) -> Result<()> {
    let written = list
        .replay(input, writer, cli::progress_logger("Replaying"), cancel_signal)
        .context("Failed to replay transfer list")?;

    if written != list.total_blocks {
        warning!(
            "Transfer list header claims {} blocks, but {written} were written",
            list.total_blocks,
        );
    }

    Ok(())
}

fn replay_subcommand(cli: &ReplayCli, cancel_signal: &AtomicBool) -> Result<()> {
    let list = load_transfer_list(&cli.transfer_list)?;
    let input = open_transfer_data(&cli.input)?;

    status!(
        "Replaying {} commands into {} blocks",
        list.commands.len(),
        list.image_blocks(),
    );

    let mut temp_writer = cli::create_temp_output(&cli.output)?;

    replay(&list, input, temp_writer.as_file_mut(), cancel_signal)
        .with_context(|| format!("Failed to replay: {:?} -> {:?}", cli.input, cli.output))?;

    cli::persist_output(temp_writer, &cli.output)
}

fn info_subcommand(transfer_cli: &TransferCli, cli: &InfoCli) -> Result<()> {
    let list = load_transfer_list(&cli.transfer_list)?;

    if !transfer_cli.quiet {
        println!("{:#?}", Metadata(&list));
    }

    Ok(())
}

pub fn transfer_main(cli: &TransferCli, cancel_signal: &AtomicBool) -> Result<()> {
    match &cli.command {
        TransferCommand::Replay(c) => replay_subcommand(c, cancel_signal),
        TransferCommand::Info(c) => info_subcommand(cli, c),
    }
}

/// Rebuild a raw image from a transfer list and its new data stream.
///
/// The output image is sized to hold the highest block referenced by the
/// transfer list. Blocks not written by any command are zero.
#[derive(Debug, Parser)]
struct ReplayCli {
    /// Path to transfer list.
    #[arg(short, long, value_name = "FILE", value_parser)]
    transfer_list: PathBuf,

    /// Path to new data stream.
    ///
    /// Files ending in `.br` are decompressed with brotli. LZ4 frames are
    /// detected automatically.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,

    /// Path to output raw image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    output: PathBuf,
}

/// Display transfer list commands.
#[derive(Debug, Parser)]
struct InfoCli {
    /// Path to transfer list.
    #[arg(short, long, value_name = "FILE", value_parser)]
    transfer_list: PathBuf,
}

#[derive(Debug, Subcommand)]
enum TransferCommand {
    Replay(ReplayCli),
    Info(InfoCli),
}

/// Replay and inspect OTA block transfer lists.
#[derive(Debug, Parser)]
pub struct TransferCli {
    #[command(subcommand)]
    command: TransferCommand,

    /// Don't print transfer list metadata.
    #[arg(short, long, global = true)]
    quiet: bool,
}
