#[cfg(not(windows))]
mod fuzz {
    use std::{
        io::{Cursor, Seek, SeekFrom, Write},
        sync::atomic::AtomicBool,
    };

    use honggfuzz::fuzz;
    use romdecode::{format::sin, stream::SetLen};

    /// Sink that tracks the size without storing anything.
    #[derive(Default)]
    struct NullWriter {
        pos: u64,
        len: u64,
    }

    impl Write for NullWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.pos += buf.len() as u64;
            self.len = self.len.max(self.pos);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl Seek for NullWriter {
        fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
            self.pos = match pos {
                SeekFrom::Start(o) => o,
                SeekFrom::End(o) => self.len.saturating_add_signed(o),
                SeekFrom::Current(o) => self.pos.saturating_add_signed(o),
            };
            Ok(self.pos)
        }
    }

    impl SetLen for NullWriter {
        fn set_len(&mut self, size: u64) -> std::io::Result<()> {
            self.len = size;
            Ok(())
        }
    }

    pub fn main() {
        let cancel_signal = AtomicBool::new(false);

        loop {
            fuzz!(|data: &[u8]| {
                let _ = sin::inspect(Cursor::new(data));
                let _ = sin::decode(
                    Cursor::new(data),
                    NullWriter::default(),
                    data.len() as u64,
                    |_, _| {},
                    &cancel_signal,
                );
            });
        }
    }
}

fn main() {
    #[cfg(not(windows))]
    fuzz::main();
}
