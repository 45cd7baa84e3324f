// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! OTA block transfer lists (`*.transfer.list`) and their replay against the
//! accompanying `*.new.dat` data stream.

use std::{
    fmt,
    io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write},
    num::ParseIntError,
    ops::Range,
    str::FromStr,
    sync::atomic::AtomicBool,
};

use thiserror::Error;
use tracing::debug;

use crate::stream::{self, FromReader, SetLen, WriteZerosExt};

/// Size of a block in bytes. This is fixed by the format.
pub const BLOCK_SIZE: u64 = 4096;

/// Supported transfer list versions.
pub const VERSIONS: Range<u32> = 1..5;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Missing header line: {0}")]
    MissingHeader(&'static str),
    #[error("Unsupported transfer list version: {0}")]
    UnsupportedVersion(u32),
    #[error("Line {0}")]
    Line(usize, #[source] Box<Error>),
    #[error("Invalid {0}: {1:?}")]
    InvalidNumber(&'static str, String, #[source] ParseIntError),
    #[error("Unknown command: {0:?}")]
    UnknownCommand(String),
    #[error("Command {0:?} has no range set")]
    MissingRangeSet(String),
    #[error("Unexpected data after range set: {0:?}")]
    TrailingData(String),
    #[error("Invalid range set {0:?}: {1}")]
    InvalidRangeSet(String, &'static str),
    #[error("Operation was cancelled")]
    Cancelled,
    #[error("Failed to read transfer list: {0}")]
    DataRead(&'static str, #[source] io::Error),
    #[error("Failed to copy new data")]
    DataCopy(#[source] io::Error),
    #[error("Failed to write output: {0}")]
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

fn parse_number<T: FromStr<Err = ParseIntError>>(field: &'static str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|e| Error::InvalidNumber(field, value.to_owned(), e))
}

/// A list of half-open block ranges. Serialized as `<n>,<a0>,<b0>,...` where
/// `n` is the number of values that follow.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RangeSet(pub Vec<Range<u32>>);

impl RangeSet {
    /// Total number of blocks across all ranges.
    pub fn num_blocks(&self) -> u64 {
        self.0.iter().map(|r| u64::from(r.end - r.start)).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Range<u32>> {
        self.0.iter()
    }
}

impl FromStr for RangeSet {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut pieces = s.split(',');
        // split() always yields at least one item.
        let count: usize = parse_number("range count", pieces.next().unwrap_or_default())?;
        let values = pieces
            .map(|v| parse_number::<u32>("block number", v))
            .collect::<Result<Vec<_>>>()?;

        if count != values.len() {
            return Err(Error::InvalidRangeSet(
                s.to_owned(),
                "count does not match number of values",
            ));
        } else if count % 2 != 0 {
            return Err(Error::InvalidRangeSet(s.to_owned(), "odd number of values"));
        }

        let mut ranges = Vec::with_capacity(count / 2);

        for pair in values.chunks_exact(2) {
            if pair[0] >= pair[1] {
                return Err(Error::InvalidRangeSet(s.to_owned(), "empty or reversed range"));
            }

            ranges.push(pair[0]..pair[1]);
        }

        Ok(Self(ranges))
    }
}

impl fmt::Display for RangeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.len() * 2)?;

        for range in &self.0 {
            write!(f, ",{},{}", range.start, range.end)?;
        }

        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// Discard blocks. The output is zero-initialized, so this is a no-op.
    Erase(RangeSet),
    /// Fill blocks with data read sequentially from the new data stream.
    New(RangeSet),
    /// Fill blocks with zeros without consuming input.
    Zero(RangeSet),
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Erase(_) => "erase",
            Self::New(_) => "new",
            Self::Zero(_) => "zero",
        }
    }

    pub fn ranges(&self) -> &RangeSet {
        match self {
            Self::Erase(r) | Self::New(r) | Self::Zero(r) => r,
        }
    }
}

impl FromStr for Command {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut tokens = s.split_ascii_whitespace();
        let name = tokens.next().unwrap_or_default();

        let constructor = match name {
            "erase" => Self::Erase,
            "new" => Self::New,
            "zero" => Self::Zero,
            _ => return Err(Error::UnknownCommand(name.to_owned())),
        };

        let ranges = tokens
            .next()
            .ok_or_else(|| Error::MissingRangeSet(name.to_owned()))?;

        if let Some(extra) = tokens.next() {
            return Err(Error::TrailingData(extra.to_owned()));
        }

        Ok(constructor(ranges.parse()?))
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.name(), self.ranges())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransferList {
    pub version: u32,
    /// Number of blocks the list claims to write. Only used for progress.
    pub total_blocks: u64,
    pub stash_entries: Option<u32>,
    pub stash_max_blocks: Option<u32>,
    pub commands: Vec<Command>,
}

impl<R: Read> FromReader<R> for TransferList {
    type Error = Error;

    fn from_reader(reader: R) -> Result<Self> {
        let mut lines = BufReader::new(reader)
            .lines()
            .enumerate()
            .map(|(i, line)| {
                line.map(|l| (i + 1, l))
                    .map_err(|e| Error::DataRead("line", e))
            })
            .peekable();

        let mut header_line = |field: &'static str| -> Result<u64> {
            let (n, line) = lines.next().ok_or(Error::MissingHeader(field))??;
            parse_number(field, &line).map_err(|e| Error::Line(n, Box::new(e)))
        };

        let version = header_line("version")?;
        let version = u32::try_from(version)
            .ok()
            .filter(|v| VERSIONS.contains(v))
            .ok_or(Error::UnsupportedVersion(version.min(u32::MAX.into()) as u32))?;
        let total_blocks = header_line("total blocks")?;

        let mut stash_entries = None;
        let mut stash_max_blocks = None;

        if version >= 2 {
            // Some tools omit the stash lines for lists that never stash.
            for field in [&mut stash_entries, &mut stash_max_blocks] {
                if let Some(Ok((_, line))) = lines.peek()
                    && let Ok(value) = line.trim().parse::<u32>()
                {
                    *field = Some(value);
                    lines.next();
                }
            }
        }

        let mut commands = vec![];

        for line in lines {
            let (n, line) = line?;
            if line.trim().is_empty() {
                continue;
            }

            let command: Command = line.parse().map_err(|e| Error::Line(n, Box::new(e)))?;
            commands.push(command);
        }

        debug!(
            "Transfer list version {version} with {} commands for {total_blocks} blocks",
            commands.len(),
        );

        Ok(Self {
            version,
            total_blocks,
            stash_entries,
            stash_max_blocks,
            commands,
        })
    }
}

impl TransferList {
    /// Number of blocks needed to hold every block referenced by any command.
    pub fn image_blocks(&self) -> u64 {
        self.commands
            .iter()
            .flat_map(|c| c.ranges().iter())
            .map(|r| u64::from(r.end))
            .max()
            .unwrap_or(0)
    }

    /// Replay the commands in order. `new` commands consume `input`
    /// sequentially. The output is grown to [`Self::image_blocks`] blocks
    /// before anything is written so untouched blocks read back as zeros.
    /// `progress` is called after each command with the number of blocks
    /// written by `new` and `zero` commands so far and [`Self::total_blocks`].
    /// Returns the number of blocks written.
    pub fn replay(
        &self,
        mut input: impl Read,
        mut output: impl Write + Seek + SetLen,
        mut progress: impl FnMut(u64, u64),
        cancel_signal: &AtomicBool,
    ) -> Result<u64> {
        let image_size = self.image_blocks() * BLOCK_SIZE;
        let file_size = output
            .seek(SeekFrom::End(0))
            .map_err(|e| Error::DataWrite("file_size", e))?;
        if file_size < image_size {
            output
                .set_len(image_size)
                .map_err(|e| Error::DataWrite("set_len", e))?;
        }

        let mut blocks_done = 0;

        for command in &self.commands {
            stream::check_cancel(cancel_signal).map_err(|_| Error::Cancelled)?;

            match command {
                Command::Erase(_) => {}
                Command::New(ranges) => {
                    for range in ranges.iter() {
                        output
                            .seek(SeekFrom::Start(u64::from(range.start) * BLOCK_SIZE))
                            .map_err(|e| Error::DataWrite("seek", e))?;

                        stream::copy_n(
                            &mut input,
                            &mut output,
                            u64::from(range.end - range.start) * BLOCK_SIZE,
                            cancel_signal,
                        )
                        .map_err(Error::copy)?;
                    }

                    blocks_done += ranges.num_blocks();
                }
                Command::Zero(ranges) => {
                    for range in ranges.iter() {
                        output
                            .seek(SeekFrom::Start(u64::from(range.start) * BLOCK_SIZE))
                            .map_err(|e| Error::DataWrite("seek", e))?;
                        output
                            .write_zeros_exact(u64::from(range.end - range.start) * BLOCK_SIZE)
                            .map_err(|e| Error::DataWrite("zero", e))?;
                    }

                    blocks_done += ranges.num_blocks();
                }
            }

            progress(blocks_done, self.total_blocks);
        }

        Ok(blocks_done)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use assert_matches::assert_matches;

    use super::*;

    fn parse(data: &str) -> Result<TransferList> {
        TransferList::from_reader(data.as_bytes())
    }

    #[test]
    fn parse_range_set() {
        assert_eq!(
            "4,0,2,10,11".parse::<RangeSet>().unwrap(),
            RangeSet(vec![0..2, 10..11]),
        );
        assert_eq!("0".parse::<RangeSet>().unwrap(), RangeSet::default());

        assert_matches!(
            "3,0,2".parse::<RangeSet>(),
            Err(Error::InvalidRangeSet(_, _))
        );
        assert_matches!(
            "3,0,2,4".parse::<RangeSet>(),
            Err(Error::InvalidRangeSet(_, "odd number of values"))
        );
        assert_matches!(
            "2,5,5".parse::<RangeSet>(),
            Err(Error::InvalidRangeSet(_, "empty or reversed range"))
        );
        assert_matches!(
            "2,a,5".parse::<RangeSet>(),
            Err(Error::InvalidNumber("block number", _, _))
        );
    }

    #[test]
    fn range_set_display() {
        let ranges = RangeSet(vec![0..2, 10..11]);
        assert_eq!(ranges.to_string(), "4,0,2,10,11");
        assert_eq!(ranges.num_blocks(), 3);
    }

    #[test]
    fn parse_version_1() {
        let list = parse("1\n5\nerase 2,0,5\n\nnew 2,0,3\nzero 2,3,5\n").unwrap();

        assert_eq!(list.version, 1);
        assert_eq!(list.total_blocks, 5);
        assert_eq!(list.stash_entries, None);
        assert_eq!(
            list.commands,
            [
                Command::Erase(RangeSet(vec![0..5])),
                Command::New(RangeSet(vec![0..3])),
                Command::Zero(RangeSet(vec![3..5])),
            ],
        );
        assert_eq!(list.image_blocks(), 5);
    }

    #[test]
    fn parse_version_4_with_stash() {
        let list = parse("4\n10\n1\n8\r\nnew 4,0,2,8,10\r\n").unwrap();

        assert_eq!(list.version, 4);
        assert_eq!(list.stash_entries, Some(1));
        assert_eq!(list.stash_max_blocks, Some(8));
        assert_eq!(list.commands, [Command::New(RangeSet(vec![0..2, 8..10]))]);
        assert_eq!(list.image_blocks(), 10);
    }

    #[test]
    fn parse_errors() {
        assert_matches!(parse(""), Err(Error::MissingHeader("version")));
        assert_matches!(parse("1\n"), Err(Error::MissingHeader("total blocks")));
        assert_matches!(parse("0\n1\n"), Err(Error::UnsupportedVersion(0)));
        assert_matches!(parse("5\n1\n"), Err(Error::UnsupportedVersion(5)));
        assert_matches!(
            parse("x\n1\n"),
            Err(Error::Line(1, e)) if matches!(*e, Error::InvalidNumber("version", _, _))
        );
        assert_matches!(
            parse("1\n1\nmove 2,0,1\n"),
            Err(Error::Line(3, e)) if matches!(*e, Error::UnknownCommand(_))
        );
        assert_matches!(
            parse("1\n1\nnew\n"),
            Err(Error::Line(3, e)) if matches!(*e, Error::MissingRangeSet(_))
        );
        assert_matches!(
            parse("1\n1\nnew 2,0,1 extra\n"),
            Err(Error::Line(3, e)) if matches!(*e, Error::TrailingData(_))
        );
    }

    #[test]
    fn replay_new_and_zero() {
        let list = parse("2\n100\nnew 2,0,2\nzero 2,2,4\n").unwrap();
        let input = vec![0x11u8; 2 * BLOCK_SIZE as usize];
        let mut output = Cursor::new(vec![0xffu8; 4 * BLOCK_SIZE as usize]);
        let cancel_signal = AtomicBool::new(false);
        let mut reports = vec![];

        let written = list
            .replay(
                Cursor::new(&input),
                &mut output,
                |done, total| reports.push((done, total)),
                &cancel_signal,
            )
            .unwrap();

        let output = output.into_inner();
        assert_eq!(written, 4);
        assert_eq!(output.len(), 4 * BLOCK_SIZE as usize);
        assert_eq!(&output[..2 * BLOCK_SIZE as usize], &input[..]);
        assert!(output[2 * BLOCK_SIZE as usize..].iter().all(|b| *b == 0));
        assert_eq!(reports, [(2, 100), (4, 100)]);
    }

    #[test]
    fn replay_short_input() {
        let list = parse("1\n2\nnew 2,0,2\n").unwrap();
        let cancel_signal = AtomicBool::new(false);

        assert_matches!(
            list.replay(
                Cursor::new(vec![0u8; 100]),
                Cursor::new(Vec::new()),
                |_, _| {},
                &cancel_signal,
            ),
            Err(Error::DataCopy(e)) if e.kind() == io::ErrorKind::UnexpectedEof
        );
    }

    #[test]
    fn replay_cancelled() {
        let list = parse("1\n1\nzero 2,0,1\n").unwrap();
        let cancel_signal = AtomicBool::new(true);

        assert_matches!(
            list.replay(io::empty(), Cursor::new(Vec::new()), |_, _| {}, &cancel_signal),
            Err(Error::Cancelled)
        );
    }
}
