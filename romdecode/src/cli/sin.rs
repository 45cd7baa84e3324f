// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{fmt, io::BufReader, path::PathBuf, sync::atomic::AtomicBool};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::{
    cli::{self, CompactView, status},
    format::sin::{self, Info},
};

struct Metadata(Info);

impl fmt::Debug for Metadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Info::V3 {
                header,
                directory,
                payload_size,
            } => f
                .debug_struct("V3")
                .field("header", header)
                .field("gptp_uid", &hex::encode(&directory.gptp_uid))
                .field("blocks", &CompactView(&directory.blocks))
                .field("payload_size", payload_size)
                .finish(),
            Info::Tar(entries) => f
                .debug_struct("Tar")
                .field("entries", &CompactView(entries))
                .finish(),
        }
    }
}

fn unpack_subcommand(cli: &UnpackCli, cancel_signal: &AtomicBool) -> Result<()> {
    let reader = cli::open_reader(&cli.input)?;
    let input_size = cli::file_size(&reader, &cli.input)?;

    let mut temp_writer = cli::create_temp_output(&cli.output)?;

    let format = sin::decode(
        BufReader::new(reader),
        temp_writer.as_file_mut(),
        input_size,
        cli::progress_logger("Decoding"),
        cancel_signal,
    )
    .with_context(|| format!("Failed to decode SIN: {:?} -> {:?}", cli.input, cli.output))?;

    status!("Decoded {format:?} container: {:?}", cli.input);

    cli::persist_output(temp_writer, &cli.output)
}

fn info_subcommand(sin_cli: &SinCli, cli: &InfoCli) -> Result<()> {
    let reader = cli::open_reader(&cli.input)?;
    let info = sin::inspect(BufReader::new(reader))
        .with_context(|| format!("Failed to read SIN metadata: {:?}", cli.input))?;

    if !sin_cli.quiet {
        println!("{:#?}", Metadata(info));
    }

    Ok(())
}

pub fn sin_main(cli: &SinCli, cancel_signal: &AtomicBool) -> Result<()> {
    match &cli.command {
        SinCommand::Unpack(c) => unpack_subcommand(c, cancel_signal),
        SinCommand::Info(c) => info_subcommand(cli, c),
    }
}

/// Unpack a SIN container into a raw image.
///
/// Version 3 containers are decoded directly. Older containers that are tar
/// archives of sparse images have each sparse image written into the same
/// output file.
#[derive(Debug, Parser)]
struct UnpackCli {
    /// Path to input SIN file.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,

    /// Path to output raw image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    output: PathBuf,
}

/// Display SIN container metadata.
#[derive(Debug, Parser)]
struct InfoCli {
    /// Path to input SIN file.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,
}

#[derive(Debug, Subcommand)]
enum SinCommand {
    Unpack(UnpackCli),
    Info(InfoCli),
}

/// Unpack and inspect Sony SIN firmware containers.
#[derive(Debug, Parser)]
pub struct SinCli {
    #[command(subcommand)]
    command: SinCommand,

    /// Don't print SIN metadata.
    #[arg(short, long, global = true)]
    quiet: bool,
}
