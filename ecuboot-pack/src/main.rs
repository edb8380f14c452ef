// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Packaging tool for ecuboot firmware images.
//!
//! Usage:
//!   ecuboot-pack keygen vendor
//!   ecuboot-pack pack app.bin --key vendor.key --cipher-key <HEX> --version 2 --output app.img
//!   ecuboot-pack inspect app.img --public-key vendor.pub --cipher-key <HEX>
//!   ecuboot-pack simulate app.img --public-key vendor.pub --cipher-key <HEX>

mod cli;
mod commands;
mod transport;

use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    let args = cli::Cli::parse();
    cli::run(args)
}
