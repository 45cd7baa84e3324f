// SPDX-FileCopyrightText: 2023 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! romdecode is primarily an application. The semver versioning covers the CLI
//! only and the Rust APIs can change at any time.
//!
//! The decoders in [`format`] are generic over their input and output streams
//! so that they can be chained. The CLI source files use concrete types.

pub mod cli;
pub mod format;
pub mod stream;
pub mod util;
