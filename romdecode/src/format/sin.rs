// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Sony SIN firmware containers.
//!
//! Version 3 files consist of a tag-length-value header with hashes and a
//! certificate, followed by an `MMCF` data directory that lists `ADDR`
//! (stored) and `LZ4A` (LZ4 block compressed) payload blocks. Each block names
//! a source offset within the payload and a destination offset within the
//! decoded image. The payload is only ever read forwards, so these files can
//! be decoded straight from an archive entry stream.
//!
//! Some SIN files have no TLV header at all and are instead tar archives
//! containing Sony sparse images.

use std::{
    cell::Cell,
    fmt,
    io::{self, Read, Seek, SeekFrom, Write},
    sync::atomic::AtomicBool,
};

use thiserror::Error;
use tracing::{debug, warn};
use zerocopy::{FromBytes, byteorder::big_endian};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::{
    format::{compression, sparse},
    stream::{self, CountingReader, ReadDiscardExt, ReadFixedSizeExt, RewindableReader, SetLen},
};

/// The only TLV version that is supported.
pub const VERSION: u8 = 3;

/// `\x03SIN`. The first byte doubles as the container version.
const SIN_TAG: u32 = 0x0353494e;
const MMCF_TAG: u32 = 0x4d4d4346;
const GPTP_TAG: u32 = 0x47505450;
const ADDR_TAG: u32 = 0x41444452;
const LZ4A_TAG: u32 = 0x4c5a3441;

/// Upper bound for header and directory blocks, which are read into memory.
const MAX_HEADER_BLOCK_SIZE: u32 = 64 * 1024 * 1024;

/// Digest sizes indexed by hash type.
const DIGEST_SIZES: [usize; 3] = [0, 0, 32];

/// Format a TLV tag as its ASCII name if printable.
fn fourcc(tag: &u32) -> String {
    let bytes = tag.to_be_bytes();

    if bytes.iter().all(|b| b.is_ascii_graphic()) {
        String::from_utf8_lossy(&bytes).into_owned()
    } else {
        format!("{tag:#010x}")
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unsupported SIN version: {0}")]
    UnsupportedVersion(u8),
    #[error("Expected {} block, but found {}", fourcc(.expected), fourcc(.actual))]
    InvalidTag { expected: u32, actual: u32 },
    #[error("Unknown data block: {}", fourcc(.0))]
    UnknownBlockTag(u32),
    #[error("Block {} has invalid length: {length}", fourcc(.tag))]
    InvalidBlockLength { tag: u32, length: u32 },
    #[error("Block {} too large to load into memory: {length}", fourcc(.tag))]
    BlockTooLarge { tag: u32, length: u32 },
    #[error("Block {}: Need {needed} bytes for {field}, but only {remaining} remain", fourcc(.tag))]
    Truncated {
        tag: u32,
        field: &'static str,
        needed: usize,
        remaining: usize,
    },
    #[error("Unsupported hash type: {0}")]
    UnsupportedHashType(u32),
    #[error("Destination range overflows: {offset} + {length}")]
    DestinationOverflow { offset: u64, length: u64 },
    #[error("Expected block at source offset {expected}, but payload is at {actual}")]
    UnexpectedSourceOffset { expected: u64, actual: u64 },
    #[error("Tar archive contains no sparse images")]
    NoSparseImages,
    #[error("Compression error")]
    Compression(#[from] compression::Error),
    #[error("Sparse image error")]
    Sparse(#[from] sparse::Error),
    #[error("Operation was cancelled")]
    Cancelled,
    #[error("Failed to read tar archive")]
    Tar(#[source] io::Error),
    #[error("Failed to read SIN data: {0}")]
    DataRead(&'static str, #[source] io::Error),
    #[error("Failed to copy block data")]
    DataCopy(#[source] io::Error),
    #[error("Failed to write SIN data: {0}")]
    DataWrite(&'static str, #[source] io::Error),
}

impl Error {
    fn copy(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::Interrupted {
            Self::Cancelled
        } else {
            Self::DataCopy(e)
        }
    }
}

type Result<T> = std::result::Result<T, Error>;

/// Raw on-disk layout for the framing of every TLV block.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawBlockHeader {
    tag: big_endian::U32,
    /// Size of the block, including this header.
    length: big_endian::U32,
}

impl RawBlockHeader {
    fn body_len(&self) -> Result<u32> {
        self.length
            .get()
            .checked_sub(8)
            .ok_or_else(|| Error::InvalidBlockLength {
                tag: self.tag.get(),
                length: self.length.get(),
            })
    }
}

/// Raw on-disk layout for the fixed fields of the `\x03SIN` block.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawSinHeader {
    payload_type: big_endian::U32,
    hash_type: big_endian::U32,
    reserved: big_endian::U32,
    /// Size of the hash block list in bytes.
    hash_len: big_endian::U32,
}

/// Raw on-disk layout for the fixed fields of an `ADDR` block.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawAddrBlock {
    source_offset: big_endian::U64,
    length: big_endian::U64,
    dest_offset: big_endian::U64,
    hash_type: big_endian::U32,
}

/// Raw on-disk layout for the fixed fields of an `LZ4A` block.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawLz4aBlock {
    source_offset: big_endian::U64,
    uncompressed_length: big_endian::U64,
    compressed_length: big_endian::U64,
    dest_offset: big_endian::U64,
    reserved: big_endian::U64,
    hash_type: big_endian::U32,
}

/// Cursor over the in-memory body of a single TLV block.
struct BlockReader<'a> {
    tag: u32,
    data: &'a [u8],
}

impl<'a> BlockReader<'a> {
    fn new(tag: u32, data: &'a [u8]) -> Self {
        Self { tag, data }
    }

    fn truncated(&self, field: &'static str, needed: usize) -> Error {
        Error::Truncated {
            tag: self.tag,
            field,
            needed,
            remaining: self.data.len(),
        }
    }

    fn read<T: FromBytes>(&mut self, field: &'static str) -> Result<T> {
        let (value, rest) = T::read_from_prefix(self.data)
            .map_err(|_| self.truncated(field, size_of::<T>()))?;
        self.data = rest;

        Ok(value)
    }

    fn read_bytes(&mut self, field: &'static str, size: usize) -> Result<&'a [u8]> {
        if size > self.data.len() {
            return Err(self.truncated(field, size));
        }

        let (value, rest) = self.data.split_at(size);
        self.data = rest;

        Ok(value)
    }

    /// Read a nested TLV block.
    fn read_block(&mut self) -> Result<BlockReader<'a>> {
        let header = self.read::<RawBlockHeader>("block_header")?;
        let body = self.read_bytes("block_body", header.body_len()? as usize)?;

        Ok(Self::new(header.tag.get(), body))
    }

    fn remaining(&self) -> &'a [u8] {
        self.data
    }

    fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Read a top-level TLV block from the stream and return its body.
fn read_block(mut reader: impl Read, expected_tag: u32) -> Result<Vec<u8>> {
    let header =
        RawBlockHeader::read_from_io(&mut reader).map_err(|e| Error::DataRead("block_header", e))?;

    if header.tag.get() != expected_tag {
        return Err(Error::InvalidTag {
            expected: expected_tag,
            actual: header.tag.get(),
        });
    }

    let body_len = header.body_len()?;
    if body_len > MAX_HEADER_BLOCK_SIZE {
        return Err(Error::BlockTooLarge {
            tag: expected_tag,
            length: header.length.get(),
        });
    }

    reader
        .read_vec_exact(body_len as usize)
        .map_err(|e| Error::DataRead("block_body", e))
}

#[derive(Clone, PartialEq, Eq)]
pub struct HashBlock {
    /// Number of bytes covered by the digest.
    pub length: u32,
    pub digest: Vec<u8>,
}

impl fmt::Debug for HashBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HashBlock")
            .field("length", &self.length)
            .field("digest", &hex::encode(&self.digest))
            .finish()
    }
}

/// The outer `\x03SIN` block. Hashes and the certificate are parsed, but not
/// verified.
#[derive(Clone, PartialEq, Eq)]
pub struct SinHeader {
    pub payload_type: u32,
    pub hash_type: u32,
    pub hash_blocks: Vec<HashBlock>,
    pub certificate: Vec<u8>,
}

impl fmt::Debug for SinHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SinHeader")
            .field("payload_type", &self.payload_type)
            .field("hash_type", &self.hash_type)
            .field("hash_blocks", &self.hash_blocks)
            .field("certificate", &format_args!("<{} bytes>", self.certificate.len()))
            .finish()
    }
}

impl SinHeader {
    fn parse(body: &[u8]) -> Result<Self> {
        let mut reader = BlockReader::new(SIN_TAG, body);
        let raw = reader.read::<RawSinHeader>("header")?;

        if raw.reserved.get() != 0 {
            debug!("Non-zero reserved header field: {:#010x}", raw.reserved.get());
        }

        let hash_type = raw.hash_type.get();
        let digest_size = *DIGEST_SIZES
            .get(hash_type as usize)
            .ok_or(Error::UnsupportedHashType(hash_type))?;

        let hash_list = reader.read_bytes("hash_list", raw.hash_len.get() as usize)?;
        let mut hash_reader = BlockReader::new(SIN_TAG, hash_list);
        let mut hash_blocks = vec![];

        while !hash_reader.is_empty() {
            let length = hash_reader.read::<big_endian::U32>("hash_length")?.get();
            let digest = hash_reader.read_bytes("hash_digest", digest_size)?.to_vec();

            hash_blocks.push(HashBlock { length, digest });
        }

        let cert_len = reader.read::<big_endian::U32>("cert_length")?.get() as usize;
        let certificate = reader.read_bytes("certificate", cert_len)?.to_vec();

        // The certificate is padded to a 4-byte boundary, but the padding may
        // be cut short at the end of the block.
        let padding = (4 - cert_len % 4) % 4;
        reader.read_bytes("cert_padding", padding.min(reader.remaining().len()))?;

        if !reader.is_empty() {
            debug!(
                "Ignoring {} trailing bytes in SIN header",
                reader.remaining().len(),
            );
        }

        Ok(Self {
            payload_type: raw.payload_type.get(),
            hash_type,
            hash_blocks,
            certificate,
        })
    }
}

/// A payload block listed in the data directory.
#[derive(Clone, PartialEq, Eq)]
pub enum CopyBlock {
    /// Data stored as-is.
    Addr {
        source_offset: u64,
        length: u64,
        dest_offset: u64,
        hash_type: u32,
        checksum: Vec<u8>,
    },
    /// Data stored as a raw LZ4 block.
    Lz4 {
        source_offset: u64,
        compressed_length: u64,
        uncompressed_length: u64,
        dest_offset: u64,
        hash_type: u32,
        checksum: Vec<u8>,
    },
}

impl fmt::Debug for CopyBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Addr {
                source_offset,
                length,
                dest_offset,
                hash_type,
                checksum,
            } => f
                .debug_struct("Addr")
                .field("source_offset", source_offset)
                .field("length", length)
                .field("dest_offset", dest_offset)
                .field("hash_type", hash_type)
                .field("checksum", &hex::encode(checksum))
                .finish(),
            Self::Lz4 {
                source_offset,
                compressed_length,
                uncompressed_length,
                dest_offset,
                hash_type,
                checksum,
            } => f
                .debug_struct("Lz4")
                .field("source_offset", source_offset)
                .field("compressed_length", compressed_length)
                .field("uncompressed_length", uncompressed_length)
                .field("dest_offset", dest_offset)
                .field("hash_type", hash_type)
                .field("checksum", &hex::encode(checksum))
                .finish(),
        }
    }
}

impl CopyBlock {
    pub fn source_offset(&self) -> u64 {
        match self {
            Self::Addr { source_offset, .. } | Self::Lz4 { source_offset, .. } => *source_offset,
        }
    }

    /// Number of bytes occupied in the payload.
    pub fn source_len(&self) -> u64 {
        match self {
            Self::Addr { length, .. } => *length,
            Self::Lz4 {
                compressed_length, ..
            } => *compressed_length,
        }
    }

    pub fn dest_offset(&self) -> u64 {
        match self {
            Self::Addr { dest_offset, .. } | Self::Lz4 { dest_offset, .. } => *dest_offset,
        }
    }

    /// Number of bytes occupied in the decoded image.
    pub fn dest_len(&self) -> u64 {
        match self {
            Self::Addr { length, .. } => *length,
            Self::Lz4 {
                uncompressed_length,
                ..
            } => *uncompressed_length,
        }
    }

    fn dest_end(&self) -> Result<u64> {
        self.dest_offset()
            .checked_add(self.dest_len())
            .ok_or_else(|| Error::DestinationOverflow {
                offset: self.dest_offset(),
                length: self.dest_len(),
            })
    }
}

/// The `MMCF` block.
#[derive(Clone, PartialEq, Eq)]
pub struct DataDirectory {
    pub gptp_uid: Vec<u8>,
    /// Blocks in directory order.
    pub blocks: Vec<CopyBlock>,
}

impl fmt::Debug for DataDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataDirectory")
            .field("gptp_uid", &hex::encode(&self.gptp_uid))
            .field("blocks", &self.blocks)
            .finish()
    }
}

impl DataDirectory {
    fn parse(body: &[u8]) -> Result<Self> {
        let mut reader = BlockReader::new(MMCF_TAG, body);

        let gptp = reader.read_block()?;
        if gptp.tag != GPTP_TAG {
            return Err(Error::InvalidTag {
                expected: GPTP_TAG,
                actual: gptp.tag,
            });
        }

        let mut blocks = vec![];

        while !reader.is_empty() {
            let mut block_reader = reader.read_block()?;

            let block = match block_reader.tag {
                ADDR_TAG => {
                    let raw = block_reader.read::<RawAddrBlock>("addr")?;

                    CopyBlock::Addr {
                        source_offset: raw.source_offset.get(),
                        length: raw.length.get(),
                        dest_offset: raw.dest_offset.get(),
                        hash_type: raw.hash_type.get(),
                        checksum: block_reader.remaining().to_vec(),
                    }
                }
                LZ4A_TAG => {
                    let raw = block_reader.read::<RawLz4aBlock>("lz4a")?;
                    if raw.reserved.get() != 0 {
                        debug!("Non-zero reserved LZ4A field: {:#x}", raw.reserved.get());
                    }

                    CopyBlock::Lz4 {
                        source_offset: raw.source_offset.get(),
                        compressed_length: raw.compressed_length.get(),
                        uncompressed_length: raw.uncompressed_length.get(),
                        dest_offset: raw.dest_offset.get(),
                        hash_type: raw.hash_type.get(),
                        checksum: block_reader.remaining().to_vec(),
                    }
                }
                tag => return Err(Error::UnknownBlockTag(tag)),
            };

            blocks.push(block);
        }

        Ok(Self {
            gptp_uid: gptp.remaining().to_vec(),
            blocks,
        })
    }

    /// Size of the decoded image. This is the end of the furthest block.
    pub fn image_size(&self) -> Result<u64> {
        self.blocks
            .iter()
            .map(|b| b.dest_end())
            .try_fold(0, |size, end| end.map(|e| size.max(e)))
    }
}

/// Container variant that was decoded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Format {
    /// TLV container with `ADDR`/`LZ4A` payload blocks.
    V3,
    /// Tar archive of Sony sparse images.
    Tar,
}

/// Metadata for a tar entry in a [`Format::Tar`] container.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TarEntryInfo {
    pub name: String,
    pub size: u64,
    /// [`None`] if the entry is not a sparse image.
    pub sparse_header: Option<sparse::Header>,
}

/// Container metadata without the payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Info {
    V3 {
        header: SinHeader,
        directory: DataDirectory,
        payload_size: u64,
    },
    Tar(Vec<TarEntryInfo>),
}

/// Check if the stream starts with a version 3 SIN header. This consumes the
/// data, so the caller is responsible for resetting the stream position.
pub fn detect(mut reader: impl Read) -> io::Result<bool> {
    match big_endian::U32::read_from_io(&mut reader) {
        Ok(tag) => Ok(tag.get() == SIN_TAG),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Peek at the version byte and leave the reader rewound to the start.
fn probe_format<R: Read>(reader: &mut RewindableReader<R>) -> Result<Format> {
    reader.start_recording();
    let version = reader
        .read_array_exact::<1>()
        .map_err(|e| Error::DataRead("version", e))?[0];
    reader.rewind(true);

    match version {
        VERSION => Ok(Format::V3),
        1 | 2 => Err(Error::UnsupportedVersion(version)),
        _ => {
            debug!("No TLV header (first byte {version:#04x}); trying tar");
            Ok(Format::Tar)
        }
    }
}

/// Read the TLV header and data directory, leaving the reader at the start of
/// the payload.
fn read_v3_metadata(mut reader: impl Read) -> Result<(SinHeader, DataDirectory, u64)> {
    let header = SinHeader::parse(&read_block(&mut reader, SIN_TAG)?)?;
    debug!("SIN header: {header:?}");

    let directory = DataDirectory::parse(&read_block(&mut reader, MMCF_TAG)?)?;
    debug!("Data directory has {} blocks", directory.blocks.len());

    let payload_size = big_endian::U64::read_from_io(&mut reader)
        .map_err(|e| Error::DataRead("payload_size", e))?
        .get();
    debug!("Payload size: {payload_size}");

    Ok((header, directory, payload_size))
}

fn decode_v3(
    reader: impl Read,
    mut writer: impl Write + Seek + SetLen,
    mut progress: impl FnMut(u64, u64),
    cancel_signal: &AtomicBool,
) -> Result<()> {
    let mut reader = CountingReader::new(reader);
    let (_, directory, _) = read_v3_metadata(&mut reader)?;
    let (reader, header_size) = reader.finish();

    let image_size = directory.image_size()?;
    let mut blocks = directory.blocks;
    blocks.sort_by_key(|b| b.source_offset());

    let file_size = writer
        .seek(SeekFrom::End(0))
        .map_err(|e| Error::DataWrite("file_size", e))?;
    if file_size < image_size {
        writer
            .set_len(image_size)
            .map_err(|e| Error::DataWrite("set_len", e))?;
    }

    // Source offsets are relative to the start of the payload.
    let mut reader = CountingReader::new(reader);

    if let Some(first) = blocks.first() {
        reader
            .read_discard_exact(first.source_offset())
            .map_err(|e| Error::DataRead("payload_gap", e))?;
    }

    let mut written = 0;

    for block in &blocks {
        stream::check_cancel(cancel_signal).map_err(|_| Error::Cancelled)?;

        let position = reader
            .stream_position()
            .map_err(|e| Error::DataRead("payload_position", e))?;
        if position != block.source_offset() {
            return Err(Error::UnexpectedSourceOffset {
                expected: block.source_offset(),
                actual: position,
            });
        }

        writer
            .seek(SeekFrom::Start(block.dest_offset()))
            .map_err(|e| Error::DataWrite("seek", e))?;

        match block {
            CopyBlock::Addr { length, .. } => {
                stream::copy_n(&mut reader, &mut writer, *length, cancel_signal)
                    .map_err(Error::copy)?;
            }
            CopyBlock::Lz4 {
                compressed_length,
                uncompressed_length,
                ..
            } => {
                if *compressed_length > compression::MAX_LZ4_BLOCK_SIZE {
                    return Err(compression::Error::Lz4BlockTooLarge(*compressed_length).into());
                }

                let compressed = reader
                    .read_vec_exact(*compressed_length as usize)
                    .map_err(|e| Error::DataRead("lz4a_data", e))?;
                let data = compression::decompress_lz4_block(&compressed, *uncompressed_length)?;

                writer
                    .write_all(&data)
                    .map_err(|e| Error::DataWrite("lz4a_data", e))?;
            }
        }

        written += block.dest_len();
        progress(written, image_size);
    }

    let (_, payload_read) = reader.finish();
    debug!("Read {header_size} header bytes and {payload_read} payload bytes");

    Ok(())
}

/// Reader that publishes the number of bytes read through a shared counter so
/// that progress can be computed while another function owns the reader.
struct SharedCountingReader<'a, R> {
    inner: R,
    count: &'a Cell<u64>,
}

impl<R: Read> Read for SharedCountingReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count.set(self.count.get() + n as u64);
        Ok(n)
    }
}

fn decode_tar(
    reader: impl Read,
    mut writer: impl Write + Seek + SetLen,
    input_size: u64,
    mut progress: impl FnMut(u64, u64),
    cancel_signal: &AtomicBool,
) -> Result<()> {
    let mut archive = tar::Archive::new(reader);
    let mut decoded = 0;

    for entry in archive.entries().map_err(Error::Tar)? {
        stream::check_cancel(cancel_signal).map_err(|_| Error::Cancelled)?;

        let entry = entry.map_err(Error::Tar)?;
        let name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();

        if !entry.header().entry_type().is_file() {
            debug!("Skipping non-file tar entry: {name:?}");
            continue;
        }

        let base = entry.raw_file_position();
        let consumed = Cell::new(0);
        let mut reader = RewindableReader::new(SharedCountingReader {
            inner: entry,
            count: &consumed,
        });

        reader.start_recording();
        let is_sparse = sparse::detect(&mut reader).map_err(Error::Tar)?;
        reader.rewind(true);

        if !is_sparse {
            warn!("Skipping tar entry that is not a sparse image: {name:?}");
            continue;
        }

        debug!("Unsparsing tar entry: {name:?}");

        sparse::unsparse(
            &mut reader,
            &mut writer,
            |_, _| progress(base + consumed.get(), input_size),
            cancel_signal,
        )?;

        decoded += 1;
    }

    if decoded == 0 {
        return Err(Error::NoSparseImages);
    }

    Ok(())
}

/// Decode a SIN container into `writer`. The reader is only ever read forwards.
///
/// For version 3 containers, `progress` receives the number of decoded bytes
/// written and the size of the decoded image. For tar containers, it receives
/// the number of input bytes consumed and `input_size`. Later tar entries are
/// written on top of earlier ones.
pub fn decode(
    reader: impl Read,
    writer: impl Write + Seek + SetLen,
    input_size: u64,
    progress: impl FnMut(u64, u64),
    cancel_signal: &AtomicBool,
) -> Result<Format> {
    let mut reader = RewindableReader::new(reader);
    let format = probe_format(&mut reader)?;

    match format {
        Format::V3 => decode_v3(reader, writer, progress, cancel_signal)?,
        Format::Tar => decode_tar(reader, writer, input_size, progress, cancel_signal)?,
    }

    Ok(format)
}

/// Read the container metadata without decoding the payload.
pub fn inspect(reader: impl Read) -> Result<Info> {
    let mut reader = RewindableReader::new(reader);

    match probe_format(&mut reader)? {
        Format::V3 => {
            let (header, directory, payload_size) = read_v3_metadata(reader)?;

            Ok(Info::V3 {
                header,
                directory,
                payload_size,
            })
        }
        Format::Tar => {
            let mut archive = tar::Archive::new(reader);
            let mut entries = vec![];

            for entry in archive.entries().map_err(Error::Tar)? {
                let entry = entry.map_err(Error::Tar)?;
                if !entry.header().entry_type().is_file() {
                    continue;
                }

                let name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
                let size = entry.size();
                let sparse_header = sparse::SparseReader::new(entry)
                    .ok()
                    .map(|r| r.header());

                entries.push(TarEntryInfo {
                    name,
                    size,
                    sparse_header,
                });
            }

            Ok(Info::Tar(entries))
        }
    }
}
