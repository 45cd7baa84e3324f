#[cfg(not(windows))]
mod fuzz {
    use std::{
        io::{Cursor, Read},
        sync::atomic::AtomicBool,
    };

    use honggfuzz::fuzz;
    use romdecode::{format::transfer::TransferList, stream::FromReader};

    pub fn main() {
        let cancel_signal = AtomicBool::new(false);

        loop {
            fuzz!(|data: &[u8]| {
                let Some(split) = data.iter().position(|b| *b == 0) else {
                    return;
                };
                let (list, new_data) = data.split_at(split);

                if let Ok(list) = TransferList::from_reader(list) {
                    // Avoid allocating giant outputs.
                    if list.image_blocks() <= 256 {
                        let mut output = Cursor::new(Vec::new());
                        let _ = list.replay(
                            new_data.take(1 << 20),
                            &mut output,
                            |_, _| {},
                            &cancel_signal,
                        );
                    }
                }
            });
        }
    }
}

fn main() {
    #[cfg(not(windows))]
    fuzz::main();
}
