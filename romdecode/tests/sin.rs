// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{io::Cursor, sync::atomic::AtomicBool};

use assert_matches::assert_matches;
use romdecode::format::{
    sin::{self, CopyBlock, Error, Format, Info},
    sparse,
};

fn tlv(tag: &[u8; 4], body: &[u8]) -> Vec<u8> {
    let mut data = tag.to_vec();
    data.extend((body.len() as u32 + 8).to_be_bytes());
    data.extend(body);
    data
}

fn sin_header() -> Vec<u8> {
    let mut body = vec![];
    // Payload type, hash type, reserved, hash list length.
    body.extend(9u32.to_be_bytes());
    body.extend(0u32.to_be_bytes());
    body.extend(0u32.to_be_bytes());
    body.extend(8u32.to_be_bytes());
    // Two hash blocks with empty digests.
    body.extend(4096u32.to_be_bytes());
    body.extend(512u32.to_be_bytes());
    // Certificate with padding.
    body.extend(6u32.to_be_bytes());
    body.extend(b"cert!!\0\0");

    tlv(b"\x03SIN", &body)
}

fn addr(source_offset: u64, length: u64, dest_offset: u64) -> Vec<u8> {
    let mut body = vec![];
    body.extend(source_offset.to_be_bytes());
    body.extend(length.to_be_bytes());
    body.extend(dest_offset.to_be_bytes());
    body.extend(0u32.to_be_bytes());
    tlv(b"ADDR", &body)
}

fn lz4a(source_offset: u64, compressed: u64, uncompressed: u64, dest_offset: u64) -> Vec<u8> {
    let mut body = vec![];
    body.extend(source_offset.to_be_bytes());
    body.extend(uncompressed.to_be_bytes());
    body.extend(compressed.to_be_bytes());
    body.extend(dest_offset.to_be_bytes());
    body.extend(0u64.to_be_bytes());
    body.extend(0u32.to_be_bytes());
    tlv(b"LZ4A", &body)
}

fn container(blocks: &[Vec<u8>], payload: &[u8]) -> Vec<u8> {
    let mut directory = tlv(b"GPTP", b"\x01\x02\x03\x04");
    for block in blocks {
        directory.extend(block);
    }

    let mut data = sin_header();
    data.extend(tlv(b"MMCF", &directory));
    data.extend((payload.len() as u64).to_be_bytes());
    data.extend(payload);
    data
}

fn sparse_image(block_size: u32, chunks: &[(u16, u32, &[u8])]) -> Vec<u8> {
    let num_blocks: u32 = chunks.iter().map(|(_, blocks, _)| blocks).sum();

    let mut data = vec![];
    data.extend(0xed26ff3au32.to_le_bytes());
    data.extend(1u16.to_le_bytes());
    data.extend(0u16.to_le_bytes());
    data.extend(28u16.to_le_bytes());
    data.extend(12u16.to_le_bytes());
    data.extend(block_size.to_le_bytes());
    data.extend(num_blocks.to_le_bytes());
    data.extend((chunks.len() as u32).to_le_bytes());
    data.extend(0u32.to_le_bytes());

    for (chunk_type, blocks, payload) in chunks {
        data.extend(chunk_type.to_le_bytes());
        data.extend(0u16.to_le_bytes());
        data.extend(blocks.to_le_bytes());
        data.extend((12 + payload.len() as u32).to_le_bytes());
        data.extend(*payload);
    }

    data
}

fn tar_archive(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());

    for (name, data) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        builder.append_data(&mut header, name, *data).unwrap();
    }

    builder.into_inner().unwrap()
}

fn decode(data: &[u8], writer: &mut Cursor<Vec<u8>>) -> Result<(Format, Vec<(u64, u64)>), Error> {
    let cancel_signal = AtomicBool::new(false);
    let mut progress = vec![];

    let format = sin::decode(
        data,
        writer,
        data.len() as u64,
        |done, total| progress.push((done, total)),
        &cancel_signal,
    )?;

    Ok((format, progress))
}

fn decode_cancelled(data: &[u8]) -> Result<Format, Error> {
    let cancel_signal = AtomicBool::new(true);

    sin::decode(
        data,
        Cursor::new(Vec::new()),
        data.len() as u64,
        |_, _| {},
        &cancel_signal,
    )
}

#[test]
fn decode_v3_out_of_order_destinations() {
    let stored = b"0123456789abcdef";
    let expanded = [0x77u8; 64];
    let compressed = lz4_flex::block::compress(&expanded);
    let compressed_len = compressed.len() as u64;

    let mut payload = stored.to_vec();
    payload.extend(&compressed);
    payload.extend(b"tail");

    // The directory is not sorted by source offset and leaves 16 bytes of the
    // destination unwritten.
    let data = container(
        &[
            addr(16 + compressed_len, 4, 0),
            lz4a(16, compressed_len, 64, 36),
            addr(0, 16, 100),
        ],
        &payload,
    );

    let mut writer = Cursor::new(Vec::new());
    let (format, progress) = decode(&data, &mut writer).unwrap();
    let output = writer.into_inner();

    assert_eq!(format, Format::V3);
    assert_eq!(output.len(), 116);
    assert_eq!(&output[..4], b"tail");
    assert!(output[4..36].iter().all(|b| *b == 0));
    assert_eq!(&output[36..100], &expanded[..]);
    assert_eq!(&output[100..], stored);
    assert_eq!(progress, [(16, 116), (80, 116), (84, 116)]);
}

#[test]
fn decode_v3_truncated_payload() {
    let data = container(&[addr(0, 32, 0)], b"short");

    let mut writer = Cursor::new(Vec::new());
    assert_matches!(decode(&data, &mut writer), Err(Error::DataCopy(_)));
}

#[test]
fn decode_v3_wrong_lz4_size() {
    let compressed = lz4_flex::block::compress(&[0x42u8; 32]);
    let data = container(
        &[lz4a(0, compressed.len() as u64, 48, 0)],
        &compressed,
    );

    let mut writer = Cursor::new(Vec::new());
    assert_matches!(decode(&data, &mut writer), Err(Error::Compression(_)));
}

#[test]
fn decode_v3_cancelled() {
    let data = container(&[addr(0, 4, 0), addr(4, 4, 4)], b"datadata");

    assert_matches!(decode_cancelled(&data), Err(Error::Cancelled));
}

#[test]
fn inspect_v3_directory() {
    let data = container(&[addr(0, 4, 8)], b"data");

    let Info::V3 {
        header,
        directory,
        payload_size,
    } = sin::inspect(&data[..]).unwrap()
    else {
        panic!("Expected version 3 container");
    };

    assert_eq!(header.payload_type, 9);
    assert_eq!(header.hash_blocks.len(), 2);
    assert_eq!(header.hash_blocks[1].length, 512);
    assert_eq!(header.certificate, b"cert!!");
    assert_eq!(directory.gptp_uid, [1, 2, 3, 4]);
    assert_eq!(directory.image_size().unwrap(), 12);
    assert_matches!(
        directory.blocks.as_slice(),
        [CopyBlock::Addr {
            source_offset: 0,
            length: 4,
            dest_offset: 8,
            ..
        }]
    );
    assert_eq!(payload_size, 4);
}

#[test]
fn reject_old_versions() {
    let mut data = container(&[], b"");
    data[0] = 2;

    let mut writer = Cursor::new(Vec::new());
    assert_matches!(decode(&data, &mut writer), Err(Error::UnsupportedVersion(2)));
}

#[test]
fn decode_tar_of_sparse_images() {
    let first = sparse_image(
        8,
        &[
            (0xcac1, 1, &b"AAAAAAAA"[..]),
            (0xcac3, 3, &[][..]),
        ],
    );
    let second = sparse_image(
        8,
        &[
            (0xcac3, 2, &[][..]),
            (0xcac2, 1, &0x01020304u32.to_le_bytes()[..]),
            (0xcac3, 1, &[][..]),
        ],
    );
    let archive = tar_archive(&[
        ("system_a.img", &first[..]),
        ("readme.txt", &b"not a sparse image"[..]),
        ("system_b.img", &second[..]),
    ]);

    let mut writer = Cursor::new(Vec::new());
    let (format, progress) = decode(&archive, &mut writer).unwrap();

    let mut expected = b"AAAAAAAA".to_vec();
    expected.extend([0u8; 8]);
    expected.extend([4, 3, 2, 1, 4, 3, 2, 1]);
    expected.extend([0u8; 8]);

    assert_eq!(format, Format::Tar);
    assert_eq!(writer.into_inner(), expected);
    assert!(!progress.is_empty());
    assert!(
        progress
            .iter()
            .all(|(done, total)| *done <= *total && *total == archive.len() as u64)
    );
    assert!(progress.windows(2).all(|w| w[0].0 <= w[1].0));
}

#[test]
fn tar_without_sparse_images() {
    let archive = tar_archive(&[("readme.txt", &b"hello"[..])]);

    let mut writer = Cursor::new(Vec::new());
    assert_matches!(decode(&archive, &mut writer), Err(Error::NoSparseImages));
}

#[test]
fn tar_with_corrupt_sparse_image() {
    let mut image = sparse_image(8, &[(0xcac1, 1, &b"AAAAAAAA"[..])]);
    // Declare two blocks while only providing chunks for one.
    image[16] = 2;
    let archive = tar_archive(&[("system.img", &image[..])]);

    let mut writer = Cursor::new(Vec::new());
    assert_matches!(
        decode(&archive, &mut writer),
        Err(Error::Sparse(sparse::Error::IncompleteImage {
            blocks: 1,
            total_blocks: 2,
        }))
    );
}

#[test]
fn tar_with_truncated_sparse_chunk() {
    let mut image = sparse_image(8, &[(0xcac1, 4, &b"AAAAAAAA"[..])]);
    // Declare four blocks of raw data while only providing one.
    image[28 + 8..28 + 12].copy_from_slice(&44u32.to_le_bytes());
    let archive = tar_archive(&[("system.img", &image[..])]);

    let mut writer = Cursor::new(Vec::new());
    assert_matches!(
        decode(&archive, &mut writer),
        Err(Error::Sparse(sparse::Error::DataCopy(_)))
    );
}

#[test]
fn decode_tar_cancelled() {
    let image = sparse_image(8, &[(0xcac1, 1, &b"AAAAAAAA"[..])]);
    let archive = tar_archive(&[("system.img", &image[..])]);

    assert_matches!(decode_cancelled(&archive), Err(Error::Cancelled));
}

#[test]
fn inspect_tar_entries() {
    let image = sparse_image(8, &[(0xcac3, 5, &[][..])]);
    let archive = tar_archive(&[("notes", &b"text"[..]), ("vendor.img", &image[..])]);

    let Info::Tar(entries) = sin::inspect(&archive[..]).unwrap() else {
        panic!("Expected tar container");
    };

    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].name, "notes");
    assert_eq!(entries[0].size, 4);
    assert_eq!(entries[0].sparse_header, None);
    assert_eq!(entries[1].name, "vendor.img");
    assert_eq!(entries[1].size, image.len() as u64);
    assert_matches!(
        entries[1].sparse_header,
        Some(sparse::Header {
            block_size: 8,
            num_blocks: 5,
            num_chunks: 1,
            ..
        })
    );
}
