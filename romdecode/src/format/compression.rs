// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::io::{self, Read, Seek};

use brotli::Decompressor;
use lz4_flex::{block::DecompressError, frame::FrameDecoder};
use thiserror::Error;

use crate::stream::ReadFixedSizeExt;

static LZ4_FRAME_MAGIC: &[u8; 4] = b"\x04\x22\x4d\x18";

/// Upper bound for a single in-memory LZ4 block. Both sparse LZ4 chunks and
/// SIN LZ4A blocks are far smaller than this in practice.
pub const MAX_LZ4_BLOCK_SIZE: u64 = 1024 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unknown compression format")]
    UnknownFormat,
    #[error("I/O error when autodetecting compression format")]
    AutoDetect(#[source] io::Error),
    #[error("LZ4 block size too large: {0}")]
    Lz4BlockTooLarge(u64),
    #[error("Failed to decompress LZ4 block")]
    Lz4Block(#[source] DecompressError),
    #[error("LZ4 block decompressed to {actual} bytes, but expected {expected}")]
    Lz4BlockSizeMismatch { expected: usize, actual: usize },
}

type Result<T> = std::result::Result<T, Error>;

/// Decompress a raw LZ4 block (no frame header) that must expand to exactly
/// `size` bytes.
pub fn decompress_lz4_block(data: &[u8], size: u64) -> Result<Vec<u8>> {
    if size > MAX_LZ4_BLOCK_SIZE {
        return Err(Error::Lz4BlockTooLarge(size));
    }

    let mut buf = vec![0u8; size as usize];
    let n = lz4_flex::block::decompress_into(data, &mut buf).map_err(Error::Lz4Block)?;

    if n != buf.len() {
        return Err(Error::Lz4BlockSizeMismatch {
            expected: buf.len(),
            actual: n,
        });
    }

    Ok(buf)
}

/// Check if the stream starts with an LZ4 frame header. This consumes the
/// data, so the caller is responsible for resetting the stream position.
pub fn is_lz4_frame(mut reader: impl Read) -> io::Result<bool> {
    match reader.read_array_exact::<4>() {
        Ok(magic) => Ok(&magic == LZ4_FRAME_MAGIC),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressedFormat {
    None,
    Lz4,
    /// Not autodetected.
    Brotli,
}

pub enum CompressedReader<R: Read> {
    None(R),
    Lz4(FrameDecoder<R>),
    /// Boxed because the decoder state is several KiB.
    Brotli(Box<Decompressor<R>>),
}

impl<R: Read> CompressedReader<R> {
    pub fn with_format(reader: R, format: CompressedFormat) -> Self {
        match format {
            CompressedFormat::None => Self::None(reader),
            CompressedFormat::Lz4 => Self::Lz4(FrameDecoder::new(reader)),
            CompressedFormat::Brotli => Self::Brotli(Box::new(Decompressor::new(reader, 4096))),
        }
    }

    pub fn format(&self) -> CompressedFormat {
        match self {
            Self::None(_) => CompressedFormat::None,
            Self::Lz4(_) => CompressedFormat::Lz4,
            Self::Brotli(_) => CompressedFormat::Brotli,
        }
    }
}

impl<R: Read + Seek> CompressedReader<R> {
    pub fn new(mut reader: R, raw_if_unknown: bool) -> Result<Self> {
        let magic = reader.read_array_exact::<4>().map_err(Error::AutoDetect)?;

        reader.rewind().map_err(Error::AutoDetect)?;

        if &magic == LZ4_FRAME_MAGIC {
            Ok(Self::Lz4(FrameDecoder::new(reader)))
        } else if raw_if_unknown {
            Ok(Self::None(reader))
        } else {
            Err(Error::UnknownFormat)
        }
    }
}

impl<R: Read> Read for CompressedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::None(r) => r.read(buf),
            Self::Lz4(r) => r.read(buf),
            Self::Brotli(r) => r.read(buf),
        }
    }
}
