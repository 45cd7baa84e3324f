// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fmt,
    io::{BufReader, Seek, SeekFrom},
    path::PathBuf,
    sync::atomic::AtomicBool,
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::{
    cli::{self, CompactView},
    format::sparse::{self, Chunk, Header, SparseReader},
    stream,
};

#[derive(Clone)]
struct Metadata {
    header: Header,
    chunks: Vec<Chunk>,
}

impl fmt::Debug for Metadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Metadata")
            .field("header", &self.header)
            .field("chunks", &CompactView(&self.chunks))
            .finish()
    }
}

fn unpack_subcommand(
    sparse_cli: &SparseCli,
    cli: &UnpackCli,
    cancel_signal: &AtomicBool,
) -> Result<()> {
    let reader = cli::open_reader(&cli.input)?;
    let mut temp_writer = cli::create_temp_output(&cli.output)?;

    if cli.preserve && cli.output.exists() {
        let existing = cli::open_reader(&cli.output)?;

        stream::copy(BufReader::new(existing), temp_writer.as_file_mut(), cancel_signal)
            .with_context(|| format!("Failed to copy existing data: {:?}", cli.output))?;
        temp_writer
            .as_file_mut()
            .seek(SeekFrom::Start(0))
            .with_context(|| format!("Failed to seek file: {:?}", temp_writer.path()))?;
    }

    // The output is grown to the full image size, but never truncated.
    let header = sparse::unsparse(
        BufReader::new(reader),
        temp_writer.as_file_mut(),
        cli::progress_logger("Unsparsing"),
        cancel_signal,
    )
    .with_context(|| format!("Failed to unsparse: {:?} -> {:?}", cli.input, cli.output))?;

    cli::persist_output(temp_writer, &cli.output)?;

    if !sparse_cli.quiet {
        println!("{header:#?}");
    }

    Ok(())
}

fn info_subcommand(sparse_cli: &SparseCli, cli: &InfoCli) -> Result<()> {
    let reader = cli::open_reader(&cli.input)?;
    let mut sparse_reader = SparseReader::new_seekable(reader)
        .with_context(|| format!("Failed to read sparse file: {:?}", cli.input))?;

    let mut metadata = Metadata {
        header: sparse_reader.header(),
        chunks: vec![],
    };

    while let Some(chunk) = sparse_reader
        .next_chunk()
        .with_context(|| format!("Failed to read chunk: {:?}", cli.input))?
    {
        metadata.chunks.push(chunk);
    }

    if !sparse_cli.quiet {
        println!("{metadata:#?}");
    }

    Ok(())
}

pub fn sparse_main(cli: &SparseCli, cancel_signal: &AtomicBool) -> Result<()> {
    match &cli.command {
        SparseCommand::Unpack(c) => unpack_subcommand(cli, c, cancel_signal),
        SparseCommand::Info(c) => info_subcommand(cli, c),
    }
}

/// Unpack a sparse image.
#[derive(Debug, Parser)]
struct UnpackCli {
    /// Path to input sparse image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,

    /// Path to output raw image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    output: PathBuf,

    /// Preserve existing data in the output file.
    ///
    /// Hole chunks leave the existing output data untouched. This is useful
    /// for unpacking several sparse images with disjoint blocks into a single
    /// output file.
    #[arg(long)]
    preserve: bool,
}

/// Display sparse image metadata.
#[derive(Debug, Parser)]
struct InfoCli {
    /// Path to input sparse image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,
}

#[derive(Debug, Subcommand)]
enum SparseCommand {
    Unpack(UnpackCli),
    Info(InfoCli),
}

/// Unpack and inspect Android sparse images.
#[derive(Debug, Parser)]
pub struct SparseCli {
    #[command(subcommand)]
    command: SparseCommand,

    /// Don't print sparse image metadata.
    #[arg(short, long, global = true)]
    quiet: bool,
}
