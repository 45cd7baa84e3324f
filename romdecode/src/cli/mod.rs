// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

pub mod args;
pub mod completion;
pub mod decode;
pub mod sin;
pub mod sparse;
pub mod transfer;

use std::{
    ffi::OsStr,
    fmt,
    fs::File,
    path::Path,
};

use anyhow::{Context, Result};
use tempfile::NamedTempFile;
use tracing::info;

use crate::util;

macro_rules! status {
    ($($arg:tt)*) => {
        println!("\x1b[1m[*] {}\x1b[0m", format!($($arg)*))
    }
}

macro_rules! warning {
    ($($arg:tt)*) => {
        println!("\x1b[1;31m[WARNING] {}\x1b[0m", format!($($arg)+))
    }
}

pub(crate) use status;
pub(crate) use warning;

/// Debug-formats a list with one line per item, even in alternate mode.
pub(crate) struct CompactView<'a, T>(pub &'a [T]);

impl<T: fmt::Debug> fmt::Debug for CompactView<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_list();

        for item in self.0 {
            // No alternate mode for no inner newlines.
            list.entry(&format_args!("{item:?}"));
        }

        list.finish()
    }
}

pub(crate) fn open_reader(path: &Path) -> Result<File> {
    File::open(path).with_context(|| format!("Failed to open for reading: {path:?}"))
}

pub(crate) fn file_size(file: &File, path: &Path) -> Result<u64> {
    file.metadata()
        .map(|m| m.len())
        .with_context(|| format!("Failed to get file size: {path:?}"))
}

/// Create a temporary file in the same directory as `output` so that it can be
/// atomically moved into place with [`persist_output`] once fully written.
pub(crate) fn create_temp_output(output: &Path) -> Result<NamedTempFile> {
    NamedTempFile::with_prefix_in(
        output
            .file_name()
            .unwrap_or_else(|| OsStr::new("romdecode.tmp")),
        util::parent_path(output),
    )
    .with_context(|| format!("Failed to create temporary file for: {output:?}"))
}

pub(crate) fn persist_output(temp_writer: NamedTempFile, output: &Path) -> Result<()> {
    let temp_path = temp_writer.path().to_owned();

    // NamedTempFile forces 600 permissions on temp files because it's the safe
    // option for a shared /tmp. Since we're writing to the output file's
    // directory, just mimic umask.
    #[cfg(unix)]
    {
        use std::{fs::Permissions, os::unix::prelude::PermissionsExt};

        use rustix::{fs::Mode, process::umask};

        let mask = umask(Mode::empty());
        umask(mask);

        // Mac uses a 16-bit value.
        #[allow(clippy::useless_conversion)]
        let mode = u32::from(0o666 & !mask.bits());

        temp_writer
            .as_file()
            .set_permissions(Permissions::from_mode(mode))
            .with_context(|| format!("Failed to set permissions to {mode:o}: {temp_path:?}"))?;
    }

    temp_writer.persist(output).with_context(|| {
        format!("Failed to move temporary file to output path: {temp_path:?} -> {output:?}")
    })?;

    Ok(())
}

/// Returns a progress callback that logs every 10% step. Totals of zero are
/// ignored.
pub(crate) fn progress_logger(what: &str) -> impl FnMut(u64, u64) + '_ {
    let mut last_step = None;

    move |done, total| {
        if total == 0 {
            return;
        }

        let percent = (u128::from(done) * 100 / u128::from(total)).min(100) as u64;
        let step = percent / 10;

        if last_step != Some(step) {
            last_step = Some(step);
            info!("{what}: {}%", step * 10);
        }
    }
}
