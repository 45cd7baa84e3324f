// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Android sparse images, including the Sony variant with LZ4 chunks.
//!
//! [`SparseReader`] walks the chunks of a sparse image in a single forward
//! pass. [`SparseImage`] builds an index of all chunks from a seekable source
//! and exposes the unsparsed image through [`Read`] and [`Seek`] without
//! materializing it. [`unsparse`] writes the unsparsed image to an output file
//! in one forward pass, which is needed when the source is not seekable.

use std::{
    fmt,
    io::{self, Read, Seek, SeekFrom, Write},
    mem,
    ops::Range,
    sync::atomic::AtomicBool,
};

use num_traits::ToPrimitive;
use thiserror::Error;
use tracing::{debug, warn};
use zerocopy::{FromBytes, byteorder::little_endian};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::{
    format::compression,
    stream::{self, ReadDiscardExt, ReadFixedSizeExt, SetLen},
};

/// Magic value for [`RawHeader::magic`].
const HEADER_MAGIC: u32 = 0xed26ff3a;

/// Raw chunk type for [`RawChunk::chunk_type`].
const CHUNK_TYPE_RAW: u16 = 0xcac1;
/// Fill chunk type for [`RawChunk::chunk_type`].
const CHUNK_TYPE_FILL: u16 = 0xcac2;
/// Hole chunk type for [`RawChunk::chunk_type`].
const CHUNK_TYPE_DONT_CARE: u16 = 0xcac3;
/// CRC32 chunk type for [`RawChunk::chunk_type`].
const CHUNK_TYPE_CRC32: u16 = 0xcac4;
/// LZ4 chunk type for [`RawChunk::chunk_type`]. This is a Sony extension.
const CHUNK_TYPE_LZ4: u16 = 0xcac5;

/// Supported major version.
pub const MAJOR_VERSION: u16 = 1;

#[derive(Debug, Error)]
pub enum Error {
    // Header errors.
    #[error("Invalid magic: {0:#010x}")]
    InvalidMagic(u32),
    #[error("Unsupported major version: {0}")]
    UnsupportedMajorVersion(u16),
    #[error("Invalid file header size: {0} < {size}", size = mem::size_of::<RawHeader>())]
    InvalidFileHeaderSize(u16),
    #[error("Invalid chunk header size: {0} < {size}", size = mem::size_of::<RawChunk>())]
    InvalidChunkHeaderSize(u16),
    #[error("Invalid block size (must be a non-zero multiple of 4): {0}")]
    InvalidBlockSize(u32),
    // Chunk errors.
    #[error("Chunk #{index}: Size overflow: {chunk_size} * {block_size}")]
    ChunkSizeOverflow {
        index: u32,
        chunk_size: u32,
        block_size: u32,
    },
    #[error("Chunk #{index}: Data size too large: {data_size}")]
    DataSizeTooLarge { index: u32, data_size: u32 },
    #[error("Chunk #{index}: Block count overflow: {start_block} + {chunk_size}")]
    BlockCountOverflow {
        index: u32,
        start_block: u32,
        chunk_size: u32,
    },
    #[error("Chunk #{index}: End block {end_block} exceeds total blocks {total_blocks}")]
    EndBlockExceedsTotal {
        index: u32,
        end_block: u32,
        total_blocks: u32,
    },
    #[error("Chunk #{index}: CRC32 chunk is not empty")]
    Crc32ChunkNotEmpty { index: u32, chunk_size: u32 },
    #[error("Chunk #{index}: Expected total size {expected_size}, but have {total_size}")]
    InvalidChunkSize {
        index: u32,
        expected_size: u32,
        total_size: u32,
    },
    #[error("Chunk #{index}: Total size {total_size} outside of range {valid:?}")]
    ChunkSizeOutOfRange {
        index: u32,
        total_size: u32,
        valid: Range<u32>,
    },
    #[error("Chunks cover {blocks} blocks, but image has {total_blocks} blocks")]
    IncompleteImage { blocks: u32, total_blocks: u32 },
    #[error("Chunk data ends at offset {expected_size}, but file is {file_size} bytes")]
    TruncatedData { expected_size: u64, file_size: u64 },
    #[error("Chunk #{index}: Failed to decompress LZ4 data")]
    Lz4Chunk {
        index: u32,
        #[source]
        source: compression::Error,
    },
    // Reader errors.
    #[error("Previous chunk still has {0} unread bytes")]
    UnreadChunkData(u32),
    #[error("Operation was cancelled")]
    Cancelled,
    // Wrapped errors.
    #[error("Failed to copy chunk data")]
    DataCopy(#[source] io::Error),
    #[error("Failed to read sparse data: {0}")]
    DataRead(&'static str, #[source] io::Error),
    #[error("Failed to write unsparsed data: {0}")]
    DataWrite(&'static str, #[source] io::Error),
}

impl Error {
    /// Map errors from [`stream::copy_n`], which may come from either side of
    /// the copy or from the cancel signal.
    fn copy(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::Interrupted {
            Self::Cancelled
        } else {
            Self::DataCopy(e)
        }
    }
}

type Result<T> = std::result::Result<T, Error>;

/// Raw on-disk layout for the header.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawHeader {
    /// Magic value. This should be equal to [`HEADER_MAGIC`].
    magic: little_endian::U32,
    /// Major version. [`MAJOR_VERSION`] is the only version supported. All
    /// other versions cannot be parsed.
    major_version: little_endian::U16,
    /// Minor version. Newer minor versions are backwards compatible.
    minor_version: little_endian::U16,
    /// Size of this [`RawHeader`], plus any excess bytes to skip.
    file_hdr_sz: little_endian::U16,
    /// Size of a [`RawChunk`], plus any excess bytes to skip.
    chunk_hdr_sz: little_endian::U16,
    /// Block size in bytes. Must be a multiple of 4.
    blk_sz: little_endian::U32,
    /// Number of blocks when unsparsed.
    total_blks: little_endian::U32,
    /// Number of chunks.
    total_chunks: little_endian::U32,
    /// CRC32 checksum of the original data. This is not validated.
    image_checksum: little_endian::U32,
}

impl fmt::Debug for RawHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawHeader")
            .field("magic", &format_args!("{:#010x}", self.magic))
            .field("major_version", &self.major_version.get())
            .field("minor_version", &self.minor_version.get())
            .field("file_hdr_sz", &self.file_hdr_sz.get())
            .field("chunk_hdr_sz", &self.chunk_hdr_sz.get())
            .field("blk_sz", &self.blk_sz.get())
            .field("total_blks", &self.total_blks.get())
            .field("total_chunks", &self.total_chunks.get())
            .field(
                "image_checksum",
                &format_args!("{:#010x}", self.image_checksum.get()),
            )
            .finish()
    }
}

impl RawHeader {
    fn validate(&self) -> Result<()> {
        if self.magic.get() != HEADER_MAGIC {
            return Err(Error::InvalidMagic(self.magic.get()));
        }

        if self.major_version.get() != MAJOR_VERSION {
            return Err(Error::UnsupportedMajorVersion(self.major_version.get()));
        }

        if self.file_hdr_sz.get() < mem::size_of::<Self>() as u16 {
            return Err(Error::InvalidFileHeaderSize(self.file_hdr_sz.get()));
        } else if self.chunk_hdr_sz.get() < mem::size_of::<RawChunk>() as u16 {
            return Err(Error::InvalidChunkHeaderSize(self.chunk_hdr_sz.get()));
        }

        if self.blk_sz.get() == 0 || self.blk_sz.get() % 4 != 0 {
            return Err(Error::InvalidBlockSize(self.blk_sz.get()));
        }

        Ok(())
    }

    fn excess_raw_header_bytes(&self) -> u16 {
        self.file_hdr_sz.get() - mem::size_of::<Self>() as u16
    }

    fn excess_raw_chunk_bytes(&self) -> u16 {
        self.chunk_hdr_sz.get() - mem::size_of::<RawChunk>() as u16
    }
}

/// Raw on-disk layout for the chunk header.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawChunk {
    /// Chunk type. Types other than the `CHUNK_TYPE_*` constants are skipped.
    chunk_type: little_endian::U16,
    /// Unused.
    reserved1: little_endian::U16,
    /// Number of unsparsed blocks this chunk represents.
    chunk_sz: little_endian::U32,
    /// The size in bytes of this chunk, including this [`RawChunk`].
    total_sz: little_endian::U32,
}

impl fmt::Debug for RawChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawChunk")
            .field("chunk_type", &format_args!("{:#06x}", self.chunk_type.get()))
            .field("reserved1", &format_args!("{:#06x}", self.reserved1.get()))
            .field("chunk_sz", &self.chunk_sz.get())
            .field("total_sz", &self.total_sz.get())
            .finish()
    }
}

impl RawChunk {
    /// Size of the unsparsed data in bytes.
    fn unsparsed_size(&self, index: u32, header: &RawHeader) -> Result<u32> {
        self.chunk_sz
            .get()
            .checked_mul(header.blk_sz.get())
            .ok_or_else(|| Error::ChunkSizeOverflow {
                index,
                chunk_size: self.chunk_sz.get(),
                block_size: header.blk_sz.get(),
            })
    }

    fn with_header_size(index: u32, header: &RawHeader, data_size: u32) -> Result<u32> {
        data_size
            .checked_add(header.chunk_hdr_sz.into())
            .ok_or(Error::DataSizeTooLarge { index, data_size })
    }

    fn validate(&self, index: u32, header: &RawHeader, start_block: u32) -> Result<()> {
        let end_block = start_block
            .checked_add(self.chunk_sz.get())
            .ok_or_else(|| Error::BlockCountOverflow {
                index,
                start_block,
                chunk_size: self.chunk_sz.get(),
            })?;

        if end_block > header.total_blks.get() {
            return Err(Error::EndBlockExceedsTotal {
                index,
                end_block,
                total_blocks: header.total_blks.get(),
            });
        }

        let total_size = self.total_sz.get();
        let hdr_size = u32::from(header.chunk_hdr_sz.get());

        let expected_size = match self.chunk_type.get() {
            CHUNK_TYPE_RAW => {
                let data_size = self.unsparsed_size(index, header)?;
                Self::with_header_size(index, header, data_size)?
            }
            CHUNK_TYPE_FILL => Self::with_header_size(index, header, 4)?,
            CHUNK_TYPE_CRC32 => {
                if self.chunk_sz.get() != 0 {
                    return Err(Error::Crc32ChunkNotEmpty {
                        index,
                        chunk_size: self.chunk_sz.get(),
                    });
                }

                Self::with_header_size(index, header, 4)?
            }
            CHUNK_TYPE_DONT_CARE => hdr_size,
            CHUNK_TYPE_LZ4 => {
                // Compressed data can be any size up to the unsparsed size.
                let data_size = self.unsparsed_size(index, header)?;
                let max_size = Self::with_header_size(index, header, data_size)?;
                let valid = hdr_size + 1..max_size.saturating_add(1);

                if !valid.contains(&total_size) {
                    return Err(Error::ChunkSizeOutOfRange {
                        index,
                        total_size,
                        valid,
                    });
                }

                return Ok(());
            }
            _ => {
                if total_size < hdr_size {
                    return Err(Error::ChunkSizeOutOfRange {
                        index,
                        total_size,
                        valid: hdr_size..u32::MAX,
                    });
                }

                return Ok(());
            }
        };

        if expected_size != total_size {
            return Err(Error::InvalidChunkSize {
                index,
                expected_size,
                total_size,
            });
        }

        Ok(())
    }
}

/// Sparse file header.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Major version. [`MAJOR_VERSION`] is the only version supported.
    pub major_version: u16,
    pub minor_version: u16,
    /// Block size in bytes. Must be a multiple of 4.
    pub block_size: u32,
    /// Number of blocks when unsparsed.
    pub num_blocks: u32,
    /// Number of chunks.
    pub num_chunks: u32,
    /// CRC32 checksum of the original data.
    pub crc32: u32,
}

impl fmt::Debug for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Header")
            .field("major_version", &self.major_version)
            .field("minor_version", &self.minor_version)
            .field("block_size", &self.block_size)
            .field("num_blocks", &self.num_blocks)
            .field("num_chunks", &self.num_chunks)
            .field("crc32", &format_args!("{:#010x}", self.crc32))
            .finish()
    }
}

impl Header {
    /// Size of the unsparsed image in bytes.
    pub fn image_size(&self) -> u64 {
        u64::from(self.num_blocks) * u64::from(self.block_size)
    }
}

/// Half-open range indicating the block range that a chunk covers.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ChunkBounds {
    /// Starting block (inclusive).
    pub start: u32,
    /// Ending block (exclusive).
    pub end: u32,
}

impl fmt::Debug for ChunkBounds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

impl IntoIterator for ChunkBounds {
    type Item = u32;

    type IntoIter = Range<u32>;

    fn into_iter(self) -> Self::IntoIter {
        self.start..self.end
    }
}

impl ChunkBounds {
    /// Length in blocks.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> u32 {
        self.end - self.start
    }
}

/// The type of data contained in a chunk.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum ChunkData {
    /// The chunk is filled with raw data.
    Data,
    /// The chunk is filled with repeating patterns of the specified integer
    /// encoded in little-endian.
    Fill(u32),
    /// The chunk is a hole and does not represent useful or valid data.
    Hole,
    /// The chunk is a CRC32 checksum. The checksum is not validated.
    Crc32(u32),
    /// The chunk contains a raw LZ4 block that decompresses to the full size
    /// of the chunk.
    Lz4 { compressed_size: u32 },
    /// The chunk type is not known. Its payload has already been skipped and
    /// its blocks, if any, are treated as a hole.
    Unknown { chunk_type: u16, data_size: u32 },
}

impl fmt::Debug for ChunkData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Data => write!(f, "Data"),
            Self::Fill(value) => f
                .debug_tuple("Fill")
                .field(&format_args!("{value:#010x}"))
                .finish(),
            Self::Hole => write!(f, "Hole"),
            Self::Crc32(checksum) => f
                .debug_tuple("Crc32")
                .field(&format_args!("{checksum:#010x}"))
                .finish(),
            Self::Lz4 { compressed_size } => f
                .debug_struct("Lz4")
                .field("compressed_size", compressed_size)
                .finish(),
            Self::Unknown {
                chunk_type,
                data_size,
            } => f
                .debug_struct("Unknown")
                .field("chunk_type", &format_args!("{chunk_type:#06x}"))
                .field("data_size", data_size)
                .finish(),
        }
    }
}

/// A type that represents a contiguous list of blocks and the type of data or
/// metadata they contain.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    /// When [`Self::data`] is [`ChunkData::Data`] or [`ChunkData::Lz4`], this
    /// is guaranteed to not exceed the bounds of [`u32`] when multiplied by
    /// [`Header::block_size`].
    pub bounds: ChunkBounds,
    pub data: ChunkData,
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chunk")
            .field("bounds", &self.bounds)
            .field("data", &format_args!("{:?}", self.data))
            .finish()
    }
}

/// Check if the stream starts with a sparse image header. This consumes the
/// header, so the caller is responsible for resetting the stream position.
pub fn detect(mut reader: impl Read) -> io::Result<bool> {
    match RawHeader::read_from_io(&mut reader) {
        Ok(header) => Ok(header.magic.get() == HEADER_MAGIC),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// A type for reading sparse files chunk by chunk.
pub struct SparseReader<R> {
    inner: R,
    seek_relative: Option<fn(&mut R, i64) -> io::Result<()>>,
    header: RawHeader,
    /// Starting block for next chunk.
    block: u32,
    /// Next chunk to read.
    chunk: u32,
    /// Number of bytes left to read for the current chunk if the chunk has
    /// [`ChunkData::Data`] or [`ChunkData::Lz4`].
    data_remain: u32,
}

impl<R: Read + Seek> SparseReader<R> {
    /// Create a new reader from a seekable file. This allows data chunks to be
    /// efficiently skipped without reading them.
    pub fn new_seekable(inner: R) -> Result<Self> {
        let mut result = Self::new(inner)?;
        result.seek_relative = Some(Seek::seek_relative);
        Ok(result)
    }
}

impl<R: Read> SparseReader<R> {
    /// Create a new reader from a stream. This cannot efficiently skip reading
    /// data chunks if they are not needed. If the underlying file is seekable
    /// and skipping chunks is needed, use [`Self::new_seekable`] instead.
    pub fn new(mut inner: R) -> Result<Self> {
        let header =
            RawHeader::read_from_io(&mut inner).map_err(|e| Error::DataRead("header", e))?;

        header.validate()?;

        inner
            .read_discard_exact(header.excess_raw_header_bytes().into())
            .map_err(|e| Error::DataRead("header_excess", e))?;

        debug!("Sparse header: {header:?}");

        Ok(Self {
            inner,
            seek_relative: None,
            header,
            block: 0,
            chunk: 0,
            data_remain: 0,
        })
    }

    /// Get the sparse file header.
    pub fn header(&self) -> Header {
        Header {
            major_version: self.header.major_version.get(),
            minor_version: self.header.minor_version.get(),
            block_size: self.header.blk_sz.get(),
            num_blocks: self.header.total_blks.get(),
            num_chunks: self.header.total_chunks.get(),
            crc32: self.header.image_checksum.get(),
        }
    }

    /// Read the header for the next chunk. If the previous chunk had
    /// [`ChunkData::Data`] or [`ChunkData::Lz4`], the data must be fully read
    /// first unless the reader is seekable. If the last chunk has already been
    /// read, then [`None`] is returned. At that point, the chunks are
    /// guaranteed to have covered every block in the image.
    pub fn next_chunk(&mut self) -> Result<Option<Chunk>> {
        if self.data_remain != 0 {
            if let Some(seek_relative) = self.seek_relative {
                seek_relative(&mut self.inner, self.data_remain.into())
                    .map_err(|e| Error::DataRead("data_remain", e))?;
                self.data_remain = 0;
            } else {
                return Err(Error::UnreadChunkData(self.data_remain));
            }
        }

        if self.chunk == self.header.total_chunks.get() {
            if self.block != self.header.total_blks.get() {
                return Err(Error::IncompleteImage {
                    blocks: self.block,
                    total_blocks: self.header.total_blks.get(),
                });
            }

            return Ok(None);
        }

        let raw_chunk =
            RawChunk::read_from_io(&mut self.inner).map_err(|e| Error::DataRead("chunk", e))?;

        raw_chunk.validate(self.chunk, &self.header, self.block)?;

        self.inner
            .read_discard_exact(self.header.excess_raw_chunk_bytes().into())
            .map_err(|e| Error::DataRead("chunk_excess", e))?;

        // Validation guarantees that this cannot underflow.
        let payload_size = raw_chunk.total_sz.get() - u32::from(self.header.chunk_hdr_sz.get());

        let data = match raw_chunk.chunk_type.get() {
            CHUNK_TYPE_RAW => {
                self.data_remain = payload_size;
                ChunkData::Data
            }
            CHUNK_TYPE_LZ4 => {
                self.data_remain = payload_size;
                ChunkData::Lz4 {
                    compressed_size: payload_size,
                }
            }
            CHUNK_TYPE_FILL => {
                let fill_value = little_endian::U32::read_from_io(&mut self.inner)
                    .map_err(|e| Error::DataRead("chunk_fill_value", e))?;

                ChunkData::Fill(fill_value.get())
            }
            CHUNK_TYPE_DONT_CARE => ChunkData::Hole,
            CHUNK_TYPE_CRC32 => {
                let checksum = little_endian::U32::read_from_io(&mut self.inner)
                    .map_err(|e| Error::DataRead("chunk_crc32", e))?;

                debug!(
                    "Chunk #{}: Ignoring CRC32 checkpoint: {:#010x}",
                    self.chunk,
                    checksum.get(),
                );

                ChunkData::Crc32(checksum.get())
            }
            chunk_type => {
                warn!(
                    "Chunk #{}: Skipping unknown chunk type {chunk_type:#06x} ({payload_size} bytes)",
                    self.chunk,
                );

                self.inner
                    .read_discard_exact(payload_size.into())
                    .map_err(|e| Error::DataRead("chunk_unknown", e))?;

                ChunkData::Unknown {
                    chunk_type,
                    data_size: payload_size,
                }
            }
        };

        let chunk = Chunk {
            bounds: ChunkBounds {
                start: self.block,
                end: self.block + raw_chunk.chunk_sz.get(),
            },
            data,
        };

        self.chunk += 1;
        self.block = chunk.bounds.end;

        Ok(Some(chunk))
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> Read for SparseReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let to_read = buf.len().min(self.data_remain as usize);

        let n = self.inner.read(&mut buf[..to_read])?;

        self.data_remain -= n as u32;

        Ok(n)
    }
}

/// Where the data for a [`LocatedChunk`] comes from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ChunkSource {
    /// Raw data at the specified offset in the sparse file.
    Data { offset: u64 },
    /// LZ4 block at the specified offset in the sparse file.
    Lz4 { offset: u64, compressed_size: u32 },
    Fill(u32),
    Zero,
}

/// A chunk and its byte range in the unsparsed image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct LocatedChunk {
    start: u64,
    end: u64,
    source: ChunkSource,
}

/// A read-only view of the unsparsed image. The chunk list is built once when
/// opening the file and every read is resolved by binary search over it.
#[derive(Debug)]
pub struct SparseImage<R> {
    inner: R,
    header: Header,
    chunks: Vec<LocatedChunk>,
    /// Most recently decompressed LZ4 chunk.
    lz4_cache: Option<(usize, Vec<u8>)>,
    pos: u64,
}

impl<R: Read + Seek> SparseImage<R> {
    /// Parse the sparse header and all chunk headers. Data chunks are skipped
    /// via seeking and not read until needed.
    pub fn open(inner: R) -> Result<Self> {
        let mut reader = SparseReader::new_seekable(inner)?;
        let header = reader.header();
        let block_size = u64::from(header.block_size);
        let mut chunks = Vec::with_capacity(header.num_chunks.min(65536) as usize);

        while let Some(chunk) = reader.next_chunk()? {
            if chunk.bounds.len() == 0 {
                continue;
            }

            let source = match chunk.data {
                ChunkData::Data => ChunkSource::Data {
                    offset: reader
                        .inner
                        .stream_position()
                        .map_err(|e| Error::DataRead("chunk_offset", e))?,
                },
                ChunkData::Lz4 { compressed_size } => ChunkSource::Lz4 {
                    offset: reader
                        .inner
                        .stream_position()
                        .map_err(|e| Error::DataRead("chunk_offset", e))?,
                    compressed_size,
                },
                ChunkData::Fill(value) => ChunkSource::Fill(value),
                ChunkData::Hole | ChunkData::Crc32(_) | ChunkData::Unknown { .. } => {
                    ChunkSource::Zero
                }
            };

            chunks.push(LocatedChunk {
                start: u64::from(chunk.bounds.start) * block_size,
                end: u64::from(chunk.bounds.end) * block_size,
                source,
            });
        }

        // Data chunks were skipped by seeking, which succeeds past the end.
        let expected_size = reader
            .inner
            .stream_position()
            .map_err(|e| Error::DataRead("data_end", e))?;
        let file_size = reader
            .inner
            .seek(SeekFrom::End(0))
            .map_err(|e| Error::DataRead("file_size", e))?;
        if file_size < expected_size {
            return Err(Error::TruncatedData {
                expected_size,
                file_size,
            });
        }

        Ok(Self {
            inner: reader.into_inner(),
            header,
            chunks,
            lz4_cache: None,
            pos: 0,
        })
    }

    fn read_lz4_chunk(
        &mut self,
        index: usize,
        offset: u64,
        compressed_size: u32,
    ) -> io::Result<&[u8]> {
        if !matches!(&self.lz4_cache, Some((i, _)) if *i == index) {
            let chunk = self.chunks[index];

            self.inner.seek(SeekFrom::Start(offset))?;
            let compressed = self.inner.read_vec_exact(compressed_size as usize)?;

            let data = compression::decompress_lz4_block(&compressed, chunk.end - chunk.start)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

            self.lz4_cache = Some((index, data));
        }

        Ok(self
            .lz4_cache
            .as_ref()
            .map(|(_, data)| data.as_slice())
            .unwrap_or_default())
    }
}

impl<R> SparseImage<R> {
    pub fn header(&self) -> Header {
        self.header
    }

    /// Size of the unsparsed image in bytes.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> u64 {
        self.header.image_size()
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read + Seek> Read for SparseImage<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() || self.pos >= self.len() {
            return Ok(0);
        }

        // Chunks are contiguous and cover the entire image.
        let index = self.chunks.partition_point(|c| c.end <= self.pos);
        let chunk = self.chunks[index];
        let rel = self.pos - chunk.start;
        let to_read = (chunk.end - self.pos).min(buf.len() as u64) as usize;
        let buf = &mut buf[..to_read];

        let n = match chunk.source {
            ChunkSource::Data { offset } => {
                self.inner.seek(SeekFrom::Start(offset + rel))?;
                let n = self.inner.read(buf)?;
                if n == 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "Sparse file ends inside data chunk",
                    ));
                }
                n
            }
            ChunkSource::Lz4 {
                offset,
                compressed_size,
            } => {
                let data = self.read_lz4_chunk(index, offset, compressed_size)?;
                buf.copy_from_slice(&data[rel as usize..][..to_read]);
                to_read
            }
            ChunkSource::Fill(value) => {
                // Chunks are block-aligned and block sizes are multiples of 4.
                let pattern = value.to_le_bytes();
                for (i, b) in buf.iter_mut().enumerate() {
                    *b = pattern[(rel as usize + i) % pattern.len()];
                }
                to_read
            }
            ChunkSource::Zero => {
                buf.fill(0);
                to_read
            }
        };

        self.pos += n as u64;

        Ok(n)
    }
}

impl<R: Read + Seek> Seek for SparseImage<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let (base, offset) = match pos {
            SeekFrom::Start(o) => {
                self.pos = o;
                return Ok(o);
            }
            SeekFrom::End(o) => (self.len(), o),
            SeekFrom::Current(o) => (self.pos, o),
        };

        self.pos = base
            .to_i64()
            .and_then(|s| s.checked_add(offset))
            .and_then(|s| s.to_u64())
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "Offset would be before the start of the file",
                )
            })?;

        Ok(self.pos)
    }
}

/// Unsparse an image in a single forward pass. Data chunks are written as-is,
/// LZ4 chunks are decompressed, fill chunks are expanded, and holes are
/// skipped over, leaving whatever the writer already contained. `progress` is
/// called with the number of chunks processed and the total number of chunks
/// after each chunk. The writer is grown to the full image size if needed.
pub fn unsparse(
    reader: impl Read,
    mut writer: impl Write + Seek + SetLen,
    mut progress: impl FnMut(u64, u64),
    cancel_signal: &AtomicBool,
) -> Result<Header> {
    let mut sparse_reader = SparseReader::new(reader)?;
    let header = sparse_reader.header();
    let block_size = u64::from(header.block_size);
    let total_chunks = u64::from(header.num_chunks);
    let mut chunks_done = 0;

    while let Some(chunk) = sparse_reader.next_chunk()? {
        stream::check_cancel(cancel_signal).map_err(|_| Error::Cancelled)?;

        let offset = u64::from(chunk.bounds.start) * block_size;
        let size = u64::from(chunk.bounds.len()) * block_size;

        match chunk.data {
            ChunkData::Data => {
                writer
                    .seek(SeekFrom::Start(offset))
                    .map_err(|e| Error::DataWrite("seek", e))?;

                stream::copy_n(&mut sparse_reader, &mut writer, size, cancel_signal)
                    .map_err(Error::copy)?;
            }
            ChunkData::Lz4 { compressed_size } => {
                let compressed = sparse_reader
                    .read_vec_exact(compressed_size as usize)
                    .map_err(|e| Error::DataRead("chunk_lz4", e))?;

                if size != 0 {
                    let data =
                        compression::decompress_lz4_block(&compressed, size).map_err(|e| {
                            Error::Lz4Chunk {
                                index: chunks_done as u32,
                                source: e,
                            }
                        })?;

                    writer
                        .seek(SeekFrom::Start(offset))
                        .map_err(|e| Error::DataWrite("seek", e))?;
                    writer
                        .write_all(&data)
                        .map_err(|e| Error::DataWrite("chunk_lz4", e))?;
                }
            }
            ChunkData::Fill(value) => {
                let buf = value.to_le_bytes().repeat(header.block_size as usize / 4);

                writer
                    .seek(SeekFrom::Start(offset))
                    .map_err(|e| Error::DataWrite("seek", e))?;

                for _ in chunk.bounds {
                    stream::check_cancel(cancel_signal).map_err(|_| Error::Cancelled)?;

                    writer
                        .write_all(&buf)
                        .map_err(|e| Error::DataWrite("chunk_fill", e))?;
                }
            }
            ChunkData::Hole | ChunkData::Crc32(_) | ChunkData::Unknown { .. } => {}
        }

        chunks_done += 1;
        progress(chunks_done, total_chunks);
    }

    // Trailing holes are not written, so make sure the file is large enough.
    let file_size = writer
        .seek(SeekFrom::End(0))
        .map_err(|e| Error::DataWrite("file_size", e))?;
    if file_size < header.image_size() {
        writer
            .set_len(header.image_size())
            .map_err(|e| Error::DataWrite("set_len", e))?;
    }

    Ok(header)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use assert_matches::assert_matches;
    use zerocopy::IntoBytes;

    use super::*;

    fn header(block_size: u32, num_blocks: u32, num_chunks: u32) -> Vec<u8> {
        RawHeader {
            magic: HEADER_MAGIC.into(),
            major_version: MAJOR_VERSION.into(),
            minor_version: 0.into(),
            file_hdr_sz: (mem::size_of::<RawHeader>() as u16).into(),
            chunk_hdr_sz: (mem::size_of::<RawChunk>() as u16).into(),
            blk_sz: block_size.into(),
            total_blks: num_blocks.into(),
            total_chunks: num_chunks.into(),
            image_checksum: 0.into(),
        }
        .as_bytes()
        .to_vec()
    }

    fn chunk(chunk_type: u16, chunk_sz: u32, payload: &[u8]) -> Vec<u8> {
        let mut data = RawChunk {
            chunk_type: chunk_type.into(),
            reserved1: 0.into(),
            chunk_sz: chunk_sz.into(),
            total_sz: (mem::size_of::<RawChunk>() as u32 + payload.len() as u32).into(),
        }
        .as_bytes()
        .to_vec();
        data.extend_from_slice(payload);
        data
    }

    #[test]
    fn detect_magic() {
        let data = header(8, 0, 0);
        assert!(detect(Cursor::new(&data)).unwrap());

        let mut bad = data.clone();
        bad[0] ^= 0xff;
        assert!(!detect(Cursor::new(&bad)).unwrap());

        // Too short to contain a header.
        assert!(!detect(Cursor::new(&data[..4])).unwrap());
    }

    #[test]
    fn reject_bad_raw_chunk_size() {
        let mut data = header(8, 1, 1);
        // Claims one block of data, but only carries 4 bytes.
        data.extend(chunk(CHUNK_TYPE_RAW, 1, b"abcd"));

        let mut reader = SparseReader::new(Cursor::new(&data)).unwrap();
        assert_matches!(
            reader.next_chunk(),
            Err(Error::InvalidChunkSize {
                index: 0,
                expected_size: 20,
                total_size: 16,
            })
        );
    }

    #[test]
    fn reject_bad_hole_chunk_size() {
        let mut data = header(8, 1, 1);
        data.extend(chunk(CHUNK_TYPE_DONT_CARE, 1, b"abcd"));

        let mut reader = SparseReader::new(Cursor::new(&data)).unwrap();
        assert_matches!(reader.next_chunk(), Err(Error::InvalidChunkSize { .. }));
    }

    #[test]
    fn reject_oversized_lz4_chunk() {
        let mut data = header(8, 1, 1);
        data.extend(chunk(CHUNK_TYPE_LZ4, 1, &[0u8; 9]));

        let mut reader = SparseReader::new(Cursor::new(&data)).unwrap();
        assert_matches!(reader.next_chunk(), Err(Error::ChunkSizeOutOfRange { .. }));
    }

    #[test]
    fn reject_incomplete_image() {
        let mut data = header(8, 2, 1);
        data.extend(chunk(CHUNK_TYPE_DONT_CARE, 1, b""));

        let mut reader = SparseReader::new(Cursor::new(&data)).unwrap();
        reader.next_chunk().unwrap();
        assert_matches!(
            reader.next_chunk(),
            Err(Error::IncompleteImage {
                blocks: 1,
                total_blocks: 2,
            })
        );
    }

    #[test]
    fn skip_unknown_and_crc32_chunks() {
        let mut data = header(4, 2, 4);
        data.extend(chunk(CHUNK_TYPE_RAW, 1, b"abcd"));
        data.extend(chunk(CHUNK_TYPE_CRC32, 0, &0x12345678u32.to_le_bytes()));
        data.extend(chunk(0xcaff, 0, b"junk data"));
        data.extend(chunk(CHUNK_TYPE_RAW, 1, b"efgh"));

        let mut image = SparseImage::open(Cursor::new(&data)).unwrap();
        let mut buf = vec![];
        image.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"abcdefgh");
    }

    #[test]
    fn excess_header_bytes() {
        let mut data = header(4, 1, 1);
        // Grow both header sizes by 4 bytes.
        data[8..10].copy_from_slice(&32u16.to_le_bytes());
        data[10..12].copy_from_slice(&16u16.to_le_bytes());
        data.extend_from_slice(b"XXXX");

        let mut raw_chunk = chunk(CHUNK_TYPE_RAW, 1, b"");
        raw_chunk[8..12].copy_from_slice(&20u32.to_le_bytes());
        raw_chunk.extend_from_slice(b"YYYY");
        raw_chunk.extend_from_slice(b"data");
        data.extend(raw_chunk);

        let mut image = SparseImage::open(Cursor::new(&data)).unwrap();
        let mut buf = vec![];
        image.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"data");
    }

    #[test]
    fn random_access_reads() {
        let lz4_data = b"0123456789abcdef";
        let compressed = lz4_flex::block::compress(lz4_data);

        let mut data = header(8, 7, 4);
        data.extend(chunk(CHUNK_TYPE_RAW, 2, b"AAAAAAAABBBBBBBB"));
        data.extend(chunk(CHUNK_TYPE_DONT_CARE, 2, b""));
        data.extend(chunk(CHUNK_TYPE_FILL, 1, &0x04030201u32.to_le_bytes()));
        data.extend(chunk(CHUNK_TYPE_LZ4, 2, &compressed));

        let mut image = SparseImage::open(Cursor::new(&data)).unwrap();
        assert_eq!(image.len(), 56);

        let mut buf = [0u8; 4];

        image.seek(SeekFrom::Start(6)).unwrap();
        image.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"AABB");

        image.seek(SeekFrom::Start(30)).unwrap();
        image.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [0, 0, 1, 2]);

        image.seek(SeekFrom::End(-4)).unwrap();
        image.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"cdef");

        image.seek(SeekFrom::Current(-10)).unwrap();
        image.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"6789");

        image.seek(SeekFrom::End(0)).unwrap();
        assert_eq!(image.read(&mut buf).unwrap(), 0);

        assert!(image.seek(SeekFrom::Current(-57)).is_err());
    }

    #[test]
    fn unsparse_stream() {
        let lz4_data = [0x11u8; 16];
        let compressed = lz4_flex::block::compress(&lz4_data);

        let mut data = header(8, 6, 4);
        data.extend(chunk(CHUNK_TYPE_RAW, 1, b"rawdata!"));
        data.extend(chunk(CHUNK_TYPE_LZ4, 2, &compressed));
        data.extend(chunk(CHUNK_TYPE_FILL, 1, &0xaabbccddu32.to_le_bytes()));
        data.extend(chunk(CHUNK_TYPE_DONT_CARE, 2, b""));

        let cancel_signal = AtomicBool::new(false);
        let mut writer = Cursor::new(Vec::new());
        let mut reports = vec![];

        let header = unsparse(
            Cursor::new(&data),
            &mut writer,
            |done, total| reports.push((done, total)),
            &cancel_signal,
        )
        .unwrap();
        assert_eq!(header.num_blocks, 6);

        let mut expected = b"rawdata!".to_vec();
        expected.extend_from_slice(&lz4_data);
        expected.extend_from_slice(&[0xdd, 0xcc, 0xbb, 0xaa].repeat(2));
        expected.extend_from_slice(&[0u8; 16]);

        assert_eq!(writer.into_inner(), expected);
        assert_eq!(reports, [(1, 4), (2, 4), (3, 4), (4, 4)]);
    }

    #[test]
    fn unsparse_corrupt_lz4() {
        let mut data = header(8, 2, 1);
        data.extend(chunk(CHUNK_TYPE_LZ4, 2, &[0xf0, 0x00]));

        let cancel_signal = AtomicBool::new(false);
        assert_matches!(
            unsparse(
                Cursor::new(&data),
                Cursor::new(Vec::new()),
                |_, _| {},
                &cancel_signal
            ),
            Err(Error::Lz4Chunk { index: 0, .. })
        );
    }

    #[test]
    fn unsparse_cancelled() {
        let mut data = header(8, 1, 1);
        data.extend(chunk(CHUNK_TYPE_RAW, 1, b"rawdata!"));

        let cancel_signal = AtomicBool::new(true);
        assert_matches!(
            unsparse(
                Cursor::new(&data),
                Cursor::new(Vec::new()),
                |_, _| {},
                &cancel_signal
            ),
            Err(Error::Cancelled)
        );
    }

    #[test]
    fn reject_truncated_data_chunk() {
        let mut data = header(8, 4, 1);
        // Declares four blocks of data, but only one is present.
        data.extend(chunk(CHUNK_TYPE_RAW, 4, b"AAAAAAAA"));
        data[28 + 8..28 + 12].copy_from_slice(&(12u32 + 32).to_le_bytes());

        assert_matches!(
            SparseImage::open(Cursor::new(&data)),
            Err(Error::TruncatedData {
                expected_size: 72,
                file_size: 48,
            })
        );

        let cancel_signal = AtomicBool::new(false);
        assert_matches!(
            unsparse(
                Cursor::new(&data),
                Cursor::new(Vec::new()),
                |_, _| {},
                &cancel_signal
            ),
            Err(Error::DataCopy(e)) if e.kind() == io::ErrorKind::UnexpectedEof
        );
    }

    #[test]
    fn data_chunk_read_past_end_of_source() {
        let mut data = header(8, 2, 1);
        data.extend(chunk(CHUNK_TYPE_RAW, 2, b"AAAAAAAABBBBBBBB"));

        let image = SparseImage::open(Cursor::new(&data)).unwrap();

        // Source shrinks after the chunk table was built.
        let truncated = data[..data.len() - 12].to_vec();
        let mut image = SparseImage {
            inner: Cursor::new(&truncated),
            ..image
        };

        let mut buf = vec![];
        assert_matches!(
            image.read_to_end(&mut buf),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof
        );
        assert_eq!(buf, b"AAAA");
    }
}
