#[cfg(not(windows))]
mod fuzz {
    use std::io::{self, Cursor, Read};

    use honggfuzz::fuzz;
    use romdecode::format::sparse::{ChunkData, SparseImage, SparseReader};

    pub fn main() {
        loop {
            fuzz!(|data: &[u8]| {
                if let Ok(mut sparse_reader) = SparseReader::new(Cursor::new(data)) {
                    while let Ok(Some(chunk)) = sparse_reader.next_chunk() {
                        if matches!(chunk.data, ChunkData::Data | ChunkData::Lz4 { .. }) {
                            let _ = io::copy(&mut sparse_reader, &mut io::sink());
                        }
                    }
                }

                if let Ok(image) = SparseImage::open(Cursor::new(data)) {
                    // Bound the output so huge block counts don't stall.
                    let _ = io::copy(&mut image.take(1024 * 1024), &mut io::sink());
                }
            });
        }
    }
}

fn main() {
    #[cfg(not(windows))]
    fuzz::main();
}
