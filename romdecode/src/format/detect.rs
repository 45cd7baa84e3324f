// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    io::{self, Read, Seek},
    path::Path,
};

use crate::format::{compression, sin, sparse};

/// The kind of input file, used to pick a decoder.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileKind {
    Sparse,
    /// SIN container. Files named `*.sin` without a TLV header are reported
    /// here too because they may be tar archives of sparse images.
    Sin,
    Lz4,
    Brotli,
    TransferList,
    TransferData,
    Unknown,
}

/// Suffixes for formats that have no magic number.
const SUFFIXES: &[(&str, FileKind)] = &[
    (".transfer.list", FileKind::TransferList),
    (".new.dat", FileKind::TransferData),
    (".br", FileKind::Brotli),
    (".sin", FileKind::Sin),
];

/// Detect the file kind by magic number, falling back to the file name if one
/// is provided. The reader is rewound to the start before returning.
pub fn detect(mut reader: impl Read + Seek, name: Option<&Path>) -> io::Result<FileKind> {
    for kind in [FileKind::Sparse, FileKind::Sin, FileKind::Lz4] {
        let matched = match kind {
            FileKind::Sparse => sparse::detect(&mut reader),
            FileKind::Sin => sin::detect(&mut reader),
            _ => compression::is_lz4_frame(&mut reader),
        }?;
        reader.rewind()?;

        if matched {
            return Ok(kind);
        }
    }

    let Some(file_name) = name.and_then(|n| n.file_name()) else {
        return Ok(FileKind::Unknown);
    };
    let file_name = file_name.to_string_lossy().to_ascii_lowercase();

    Ok(SUFFIXES
        .iter()
        .find(|(suffix, _)| file_name.ends_with(suffix))
        .map_or(FileKind::Unknown, |(_, kind)| *kind))
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn detect_bytes(data: &[u8], name: Option<&str>) -> FileKind {
        let mut reader = Cursor::new(data);
        let kind = detect(&mut reader, name.map(Path::new)).unwrap();
        assert_eq!(reader.position(), 0);
        kind
    }

    #[test]
    fn detect_by_magic() {
        let mut sparse_header = 0xed26ff3au32.to_le_bytes().to_vec();
        sparse_header.resize(28, 0);

        assert_eq!(detect_bytes(&sparse_header, None), FileKind::Sparse);
        assert_eq!(detect_bytes(b"\x03SIN\0\0\0\x08", None), FileKind::Sin);
        assert_eq!(detect_bytes(b"\x04\x22\x4d\x18", None), FileKind::Lz4);
        // Magic wins over the file name.
        assert_eq!(
            detect_bytes(b"\x04\x22\x4d\x18", Some("system.new.dat")),
            FileKind::Lz4,
        );
    }

    #[test]
    fn detect_by_name() {
        assert_eq!(
            detect_bytes(b"4\n", Some("out/system.transfer.list")),
            FileKind::TransferList,
        );
        assert_eq!(
            detect_bytes(b"", Some("system.new.dat")),
            FileKind::TransferData,
        );
        assert_eq!(
            detect_bytes(b"\x1b", Some("SYSTEM.NEW.DAT.BR")),
            FileKind::Brotli,
        );
        assert_eq!(detect_bytes(b"tar data", Some("system.sin")), FileKind::Sin);
        assert_eq!(detect_bytes(b"tar data", Some("system.img")), FileKind::Unknown);
        assert_eq!(detect_bytes(b"tar data", None), FileKind::Unknown);
    }
}
