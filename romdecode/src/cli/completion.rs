// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::io;

use anyhow::Result;
use clap::{CommandFactory, Parser};
use clap_complete::Shell;

use crate::cli::args::Cli;

pub fn completion_main(cli: &CompletionCli) -> Result<()> {
    let mut command = Cli::command();
    let name = command.get_name().to_owned();

    clap_complete::generate(cli.shell, &mut command, name, &mut io::stdout());

    Ok(())
}

/// Print a shell completion script to stdout.
#[derive(Debug, Parser)]
pub struct CompletionCli {
    /// Shell to generate completions for.
    #[arg(short, long, value_name = "SHELL", value_parser)]
    pub shell: Shell,
}
