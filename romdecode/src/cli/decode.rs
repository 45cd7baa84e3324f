// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
    sync::atomic::AtomicBool,
};

use anyhow::{Context, Result, bail};
use clap::Parser;
use tempfile::NamedTempFile;
use tracing::info;

use crate::{
    cli::{self, status, transfer},
    format::{
        compression::{CompressedFormat, CompressedReader},
        detect::{self, FileKind},
        sin, sparse,
    },
    stream,
};

/// Compressed sparse images inside SIN containers need three stages. Anything
/// much deeper than that is a loop.
const MAX_STAGES: usize = 8;

/// Strip the last extension so that `system.new.dat.br` is detected as
/// transfer data once decompressed.
fn strip_extension(name: Option<PathBuf>) -> Option<PathBuf> {
    let name = name?;
    let stem = name.file_stem()?;

    Some(name.with_file_name(stem))
}

fn decompress(
    reader: File,
    format: CompressedFormat,
    writer: &mut File,
    cancel_signal: &AtomicBool,
) -> Result<()> {
    let reader = CompressedReader::with_format(BufReader::new(reader), format);

    let size = stream::copy(reader, writer, cancel_signal)
        .with_context(|| format!("Failed to decompress {format:?} data"))?;
    info!("Decompressed {size} bytes of {format:?} data");

    Ok(())
}

/// Run a single decoding stage, writing the result to `writer`. Returns the
/// name to use for detecting the next stage's input.
fn run_stage(
    cli: &DecodeCli,
    kind: FileKind,
    reader: File,
    name: Option<PathBuf>,
    writer: &mut File,
    cancel_signal: &AtomicBool,
) -> Result<Option<PathBuf>> {
    match kind {
        FileKind::Sparse => {
            sparse::unsparse(
                BufReader::new(reader),
                writer,
                cli::progress_logger("Unsparsing"),
                cancel_signal,
            )?;

            Ok(None)
        }
        FileKind::Sin => {
            let input_size = cli::file_size(&reader, &cli.input)?;

            sin::decode(
                BufReader::new(reader),
                writer,
                input_size,
                cli::progress_logger("Decoding"),
                cancel_signal,
            )?;

            Ok(None)
        }
        FileKind::Lz4 => {
            decompress(reader, CompressedFormat::Lz4, writer, cancel_signal)?;

            Ok(strip_extension(name))
        }
        FileKind::Brotli => {
            decompress(reader, CompressedFormat::Brotli, writer, cancel_signal)?;

            Ok(strip_extension(name))
        }
        FileKind::TransferData => {
            let Some(path) = &cli.transfer_list else {
                bail!("Transfer data requires a transfer list (--transfer-list)");
            };
            let list = transfer::load_transfer_list(path)?;

            transfer::replay(&list, BufReader::new(reader), writer, cancel_signal)?;

            Ok(None)
        }
        FileKind::TransferList => {
            bail!("Transfer lists must be passed via --transfer-list");
        }
        FileKind::Unknown => bail!("No decoder for unrecognized data"),
    }
}

fn open_stage_input(input: &Path, temp: Option<&NamedTempFile>) -> Result<File> {
    match temp {
        Some(t) => t
            .reopen()
            .with_context(|| format!("Failed to reopen temporary file: {:?}", t.path())),
        None => cli::open_reader(input),
    }
}

pub fn decode_main(cli: &DecodeCli, cancel_signal: &AtomicBool) -> Result<()> {
    let mut current: Option<NamedTempFile> = None;
    let mut name = Some(cli.input.clone());
    let mut replayed = false;
    let mut finished = false;

    for stage in 0..MAX_STAGES {
        let mut reader = open_stage_input(&cli.input, current.as_ref())?;

        let mut kind = detect::detect(&mut reader, name.as_deref())
            .with_context(|| format!("Failed to detect file type: {:?}", cli.input))?;

        // Unrecognizable data alongside a transfer list is the new data.
        if kind == FileKind::Unknown && cli.transfer_list.is_some() && !replayed {
            kind = FileKind::TransferData;
        }
        if kind == FileKind::TransferData {
            replayed = true;
        }

        if kind == FileKind::Unknown {
            finished = true;
            break;
        }

        status!("Stage {}: {kind:?}", stage + 1);

        let mut temp_writer = cli::create_temp_output(&cli.output)?;

        name = run_stage(
            cli,
            kind,
            reader,
            name.take(),
            temp_writer.as_file_mut(),
            cancel_signal,
        )
        .with_context(|| format!("Failed to decode {kind:?} stage: {:?}", cli.input))?;
        current = Some(temp_writer);
    }

    if !finished {
        bail!("Input is nested more than {MAX_STAGES} levels deep: {:?}", cli.input);
    }

    let Some(temp_writer) = current else {
        bail!("Unrecognized input format: {:?}", cli.input);
    };

    if cli.transfer_list.is_some() && !replayed {
        bail!("Transfer list was given, but no transfer data was found: {:?}", cli.input);
    }

    cli::persist_output(temp_writer, &cli.output)
}

/// Decode an image by detecting its format and chaining decoders.
///
/// SIN containers, sparse images, LZ4 frames and brotli streams are unwrapped
/// until a raw image remains. Transfer data is replayed with the transfer list
/// given by `--transfer-list`.
#[derive(Debug, Parser)]
pub struct DecodeCli {
    /// Path to input file.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,

    /// Path to output raw image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    output: PathBuf,

    /// Path to transfer list for `*.new.dat` inputs.
    #[arg(short, long, value_name = "FILE", value_parser)]
    transfer_list: Option<PathBuf>,
}
