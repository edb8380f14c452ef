// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Command-line interface definitions.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::commands;

/// Staging chunk size of the reference bootloader build.
pub const DEFAULT_CHUNK_SIZE: usize = 256;

/// Command-line arguments.
#[derive(Parser)]
#[command(name = "ecuboot-pack")]
#[command(about = "Packaging and transfer simulation tool for the ecuboot bootloader")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Subcommand)]
pub enum Commands {
    /// Generate a P-256 signing key pair (<OUT>.key and <OUT>.pub)
    Keygen {
        #[arg(value_name = "OUT", default_value = "ecuboot")]
        out: PathBuf,

        /// Overwrite existing key files
        #[arg(short, long)]
        force: bool,
    },

    /// Sign and encrypt a firmware binary into a transport image
    Pack {
        /// Firmware binary file
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Private key written by `keygen`
        #[arg(short, long)]
        key: PathBuf,

        /// 128-bit cipher key as 32 hex digits
        #[arg(short, long)]
        cipher_key: String,

        /// Firmware version number
        #[arg(short, long, default_value = "1")]
        version: u32,

        /// Application flags byte
        #[arg(long, default_value = "0")]
        flags: u8,

        /// Free text stored in the header (19 bytes max)
        #[arg(long, default_value = "")]
        info: String,

        /// Cipher chunk size, equal to the bootloader staging buffer
        #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
        chunk_size: usize,

        /// Output image file
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Decode an image header and optionally check it
    Inspect {
        /// Transport image file
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Public key to check the signature with
        #[arg(short, long)]
        public_key: Option<PathBuf>,

        /// Cipher key to check the binary CRC and hash with
        #[arg(short, long)]
        cipher_key: Option<String>,

        #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
        chunk_size: usize,
    },

    /// Transfer an image into a bootloader running on simulated flash
    Simulate {
        /// Transport image file
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Public key the simulated bootloader trusts
        #[arg(short, long)]
        public_key: PathBuf,

        /// Cipher key of the simulated bootloader
        #[arg(short, long)]
        cipher_key: String,

        #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
        chunk_size: usize,

        /// Device id of the simulated bootloader
        #[arg(short, long, default_value = "4")]
        device_id: u8,
    },
}

/// Execute the parsed CLI command.
pub fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Keygen { out, force } => commands::keygen(&out, force),
        Commands::Pack {
            file,
            key,
            cipher_key,
            version,
            flags,
            info,
            chunk_size,
            output,
        } => commands::pack(
            &file,
            &key,
            &cipher_key,
            commands::PackOptions {
                version,
                flags,
                info,
                chunk_size,
            },
            &output,
        ),
        Commands::Inspect {
            file,
            public_key,
            cipher_key,
            chunk_size,
        } => commands::inspect(&file, public_key.as_deref(), cipher_key.as_deref(), chunk_size),
        Commands::Simulate {
            file,
            public_key,
            cipher_key,
            chunk_size,
            device_id,
        } => commands::simulate(&file, &public_key, &cipher_key, chunk_size, device_id),
    }
}
