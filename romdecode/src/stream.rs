// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs::File,
    io::{self, Cursor, Read, Seek, SeekFrom, Write},
    sync::atomic::{AtomicBool, Ordering},
};

use crate::util;

/// Common function for reading a structure from a reader.
pub trait FromReader<R: Read>: Sized {
    type Error;

    fn from_reader(reader: R) -> Result<Self, Self::Error>;
}

/// Extensions for readers to read and discard data (eg. for padding).
pub trait ReadDiscardExt {
    fn read_discard(&mut self, size: u64) -> io::Result<u64>;

    fn read_discard_exact(&mut self, size: u64) -> io::Result<()> {
        let n = self.read_discard(size)?;
        if n != size {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("Expected to read {size} bytes, but reached EOF after {n} bytes"),
            ));
        }
        Ok(())
    }
}

impl<R: Read> ReadDiscardExt for R {
    fn read_discard(&mut self, size: u64) -> io::Result<u64> {
        io::copy(&mut self.take(size), &mut io::sink())
    }
}

/// Extensions for writers to easily write zeros (eg. for padding).
pub trait WriteZerosExt {
    fn write_zeros(&mut self, size: u64) -> io::Result<u64>;

    fn write_zeros_exact(&mut self, size: u64) -> io::Result<()> {
        let n = self.write_zeros(size)?;
        if n != size {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("Expected to write {size} bytes, but reached EOF after {n} bytes"),
            ));
        }
        Ok(())
    }
}

impl<W: Write> WriteZerosExt for W {
    fn write_zeros(&mut self, size: u64) -> io::Result<u64> {
        // We don't use std::io::copy() on std::io::repeat(0) because it fails
        // if the writer hits EOF before all data is written.
        let mut written = 0;

        while written < size {
            let to_write = (size - written).min(util::ZEROS.len() as u64) as usize;
            let n = self.write(&util::ZEROS[..to_write])?;
            written += n as u64;

            if n < to_write {
                break;
            }
        }

        Ok(written)
    }
}

/// Extensions for readers to read fixed-size buffers.
pub trait ReadFixedSizeExt {
    /// Read fixed-size array.
    fn read_array_exact<const N: usize>(&mut self) -> io::Result<[u8; N]>;

    /// Read fixed-sized [`Vec`].
    fn read_vec_exact(&mut self, size: usize) -> io::Result<Vec<u8>>;
}

impl<R: Read> ReadFixedSizeExt for R {
    fn read_array_exact<const N: usize>(&mut self) -> io::Result<[u8; N]> {
        let mut buf = [0u8; N];
        self.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn read_vec_exact(&mut self, size: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; size];
        self.read_exact(&mut buf)?;
        Ok(buf)
    }
}

/// Extensions for output sinks that can be resized up front. Decoders use
/// this to preallocate the full image so that regions that are never written
/// read back as zeros.
pub trait SetLen {
    fn set_len(&mut self, size: u64) -> io::Result<()>;
}

impl SetLen for File {
    fn set_len(&mut self, size: u64) -> io::Result<()> {
        File::set_len(self, size)
    }
}

impl SetLen for Cursor<Vec<u8>> {
    fn set_len(&mut self, size: u64) -> io::Result<()> {
        let size = usize::try_from(size).map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("Size {size} does not fit in memory"),
            )
        })?;

        self.get_mut().resize(size, 0);

        Ok(())
    }
}

impl<S: ?Sized + SetLen> SetLen for &mut S {
    fn set_len(&mut self, size: u64) -> io::Result<()> {
        (**self).set_len(size)
    }
}

/// A reader wrapper that implements [`Seek`], but only for reporting the
/// current file position.
pub struct CountingReader<R> {
    inner: R,
    offset: u64,
}

impl<R: Read> CountingReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, offset: 0 }
    }

    pub fn finish(self) -> (R, u64) {
        (self.inner, self.offset)
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.offset += n as u64;
        Ok(n)
    }
}

impl<R: Read> Seek for CountingReader<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        if pos == SeekFrom::Current(0) {
            Ok(self.offset)
        } else {
            Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Can only report current offset",
            ))
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RewindState {
    /// Reads go straight to the inner reader and nothing is buffered.
    Live,
    /// Reads go to the inner reader and are appended to the buffer.
    Recording,
    /// Reads are served from the buffer starting at `pos`. Once the buffer is
    /// exhausted, reads fall through to the inner reader and are appended to
    /// the buffer if `recording` is set.
    Replaying { pos: usize, recording: bool },
}

/// A reader wrapper that emulates a bounded amount of backwards seeking on top
/// of a forward-only reader. Data read while recording is kept in memory and
/// can be replayed after calling [`Self::rewind`].
pub struct RewindableReader<R> {
    inner: R,
    buf: Vec<u8>,
    state: RewindState,
    /// Number of bytes read from the inner reader.
    inner_pos: u64,
}

impl<R: Read> RewindableReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::new(),
            state: RewindState::Live,
            inner_pos: 0,
        }
    }

    /// Whether newly read data from the inner reader is being captured.
    pub fn is_recording(&self) -> bool {
        match self.state {
            RewindState::Live => false,
            RewindState::Recording => true,
            RewindState::Replaying { recording, .. } => recording,
        }
    }

    /// The logical read position, accounting for data that has been rewound
    /// but not yet replayed.
    pub fn position(&self) -> u64 {
        match self.state {
            RewindState::Replaying { pos, .. } => self.inner_pos - (self.buf.len() - pos) as u64,
            _ => self.inner_pos,
        }
    }

    /// Start capturing data read from this point onwards. If the reader is in
    /// the middle of replaying, the already replayed data is discarded and the
    /// remaining buffered data becomes the start of the new recording.
    pub fn start_recording(&mut self) {
        match self.state {
            RewindState::Live | RewindState::Recording => {
                self.buf.clear();
                self.state = RewindState::Recording;
            }
            RewindState::Replaying { pos, .. } => {
                self.buf.drain(..pos);
                self.state = RewindState::Replaying {
                    pos: 0,
                    recording: true,
                };
            }
        }
    }

    /// Stop capturing data without rewinding. Any data that has already been
    /// replayed is no longer reachable.
    pub fn stop_recording(&mut self) {
        match self.state {
            RewindState::Live => {}
            RewindState::Recording => {
                self.buf.clear();
                self.state = RewindState::Live;
            }
            RewindState::Replaying { pos, .. } => {
                self.state = RewindState::Replaying {
                    pos,
                    recording: false,
                };
                self.release_if_drained();
            }
        }
    }

    /// Move the read position back to the start of the captured data. If
    /// `stop_recording` is false, data read past the end of the captured data
    /// continues to be appended so that another rewind is possible later.
    pub fn rewind(&mut self, stop_recording: bool) {
        self.state = RewindState::Replaying {
            pos: 0,
            recording: !stop_recording,
        };
        self.release_if_drained();
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    fn release_if_drained(&mut self) {
        if let RewindState::Replaying {
            pos,
            recording: false,
        } = self.state
            && pos == self.buf.len()
        {
            self.buf = Vec::new();
            self.state = RewindState::Live;
        }
    }

    fn read_inner(&mut self, buf: &mut [u8], record: bool) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.inner_pos += n as u64;

        if record {
            self.buf.extend_from_slice(&buf[..n]);
        }

        Ok(n)
    }
}

impl<R: Read> Read for RewindableReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        match self.state {
            RewindState::Live => self.read_inner(buf, false),
            RewindState::Recording => self.read_inner(buf, true),
            RewindState::Replaying { pos, recording } => {
                let n = if pos < self.buf.len() {
                    let n = buf.len().min(self.buf.len() - pos);
                    buf[..n].copy_from_slice(&self.buf[pos..pos + n]);
                    n
                } else {
                    self.read_inner(buf, recording)?
                };

                // Live reads that aren't recorded don't move the replay
                // position because the buffer is already drained.
                let consumed = if pos < self.buf.len() || recording {
                    n
                } else {
                    0
                };

                self.state = RewindState::Replaying {
                    pos: pos + consumed,
                    recording,
                };
                self.release_if_drained();

                Ok(n)
            }
        }
    }
}

/// Returns an I/O error with the [`io::ErrorKind::Interrupted`] type if
/// `cancel_signal` is true. This should be called frequently in I/O loops for
/// cancellation to be responsive.
#[inline]
pub fn check_cancel(cancel_signal: &AtomicBool) -> io::Result<()> {
    if cancel_signal.load(Ordering::SeqCst) {
        return Err(io::Error::new(
            io::ErrorKind::Interrupted,
            "Received cancel signal",
        ));
    }

    Ok(())
}

/// Copy exactly `size` bytes from `reader` to `writer`. If either `reader` or
/// `writer` reaches EOF before `size` bytes are copied, an error is returned.
/// The operation is cancelled on the next loop iteration if `cancel_signal` is
/// set to `true`.
pub fn copy_n(
    mut reader: impl Read,
    mut writer: impl Write,
    mut size: u64,
    cancel_signal: &AtomicBool,
) -> io::Result<()> {
    let mut buf = [0u8; 16384];

    while size > 0 {
        check_cancel(cancel_signal)?;

        let to_read = size.min(buf.len() as u64) as usize;
        reader.read_exact(&mut buf[..to_read])?;
        writer.write_all(&buf[..to_read])?;

        size -= to_read as u64;
    }

    Ok(())
}

/// Copy data from `reader` to `writer` until `reader` reaches EOF. If `writer`
/// reaches EOF before `reader` does, an error is returned. The operation is
/// cancelled on the next loop iteration if `cancel_signal` is set to `true`.
pub fn copy(
    mut reader: impl Read,
    mut writer: impl Write,
    cancel_signal: &AtomicBool,
) -> io::Result<u64> {
    let mut buf = [0u8; 16384];
    let mut copied = 0;

    loop {
        check_cancel(cancel_signal)?;

        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };

        writer.write_all(&buf[..n])?;

        copied += n as u64;
    }

    Ok(copied)
}
