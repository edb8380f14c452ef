// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Command implementations.

use std::fs;
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use p256::ecdsa::signature::hazmat::PrehashSigner;
use p256::ecdsa::{Signature, SigningKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use zerocopy::IntoBytes;

use ecuboot_common::bootloader::{BootError, Bootloader, BootloaderConfig};
use ecuboot_common::checksum::{BURST_CRC_POLY, FIRMWARE_CRC};
use ecuboot_common::cipher::{decrypt_image, encrypt_image, Xxtea};
use ecuboot_common::flash::{FlashPages, PageLayout};
use ecuboot_common::frame::{CanTransport, FrameQueue};
use ecuboot_common::image::{FirmwareHeader, FirmwareInfo, PublicKey, HEADER_SIZE, INFO_TEXT_LEN, PUBLIC_KEY_LEN};
use ecuboot_common::memory::PagedMemory;
use ecuboot_common::protocol::{TransferStatus, MAX_SEQUENCE};
use ecuboot_common::sender::{Sender, SenderConfig};
use ecuboot_common::verify::{header_digest, verify_header, P256Verifier};

use crate::transport::{self, Link, RamFlash, SimPlatform, BURST_SIZE, FLASH_BASE, PACKET_SIZE, PAGE_SIZE};

/// Upper bound on simulated time for one transfer.
const SIMULATION_LIMIT_MS: u32 = 30 * 60 * 1000;
/// Time given to the bootloader to install the image after the transfer.
const SETTLE_MS: u32 = 1000;

/// Header fields and cipher layout of a packed image.
pub struct PackOptions {
    pub version: u32,
    pub flags: u8,
    pub info: String,
    pub chunk_size: usize,
}

/// Generate a signing key pair.
pub fn keygen(out: &Path, force: bool) -> Result<()> {
    let private_path = out.with_extension("key");
    let public_path = out.with_extension("pub");
    for path in [&private_path, &public_path] {
        if path.exists() && !force {
            bail!("{} already exists (use --force to overwrite)", path.display());
        }
    }

    let key = SigningKey::random(&mut OsRng);
    let public = public_key_of(&key);
    fs::write(&private_path, key.to_bytes().as_slice())
        .with_context(|| format!("Failed to write {}", private_path.display()))?;
    fs::write(&public_path, public).with_context(|| format!("Failed to write {}", public_path.display()))?;

    println!("Private key: {}", private_path.display());
    println!("Public key:  {}", public_path.display());
    println!("  {}", hex::encode(public));
    Ok(())
}

/// Build a transport image from a binary file.
pub fn pack(file: &Path, key: &Path, cipher_key: &str, options: PackOptions, output: &Path) -> Result<()> {
    let binary = fs::read(file).with_context(|| format!("Failed to read {}", file.display()))?;
    let signing_key = read_signing_key(key)?;
    let cipher = parse_cipher_key(cipher_key)?;
    if options.info.len() > INFO_TEXT_LEN {
        println!("Warning: info text truncated to {} bytes", INFO_TEXT_LEN);
    }

    let image = build_image(&binary, &signing_key, &cipher, &options)?;
    fs::write(output, &image).with_context(|| format!("Failed to write {}", output.display()))?;

    println!(
        "Firmware: {} ({} bytes, CRC32: 0x{:08x})",
        file.display(),
        binary.len(),
        FIRMWARE_CRC.checksum(&binary)
    );
    println!("Version:  {}", options.version);
    println!("Image:    {} ({} bytes)", output.display(), image.len());
    Ok(())
}

/// Signed header followed by the binary enciphered per chunk.
pub fn build_image(binary: &[u8], key: &SigningKey, cipher: &Xxtea, options: &PackOptions) -> Result<Vec<u8>> {
    if binary.is_empty() {
        bail!("Firmware binary is empty");
    }
    if options.chunk_size == 0 {
        bail!("Chunk size must not be zero");
    }
    let max = MAX_SEQUENCE as usize + 1 - HEADER_SIZE;
    if binary.len() > max {
        bail!("Binary of {} bytes exceeds the {} bytes one transfer can carry", binary.len(), max);
    }

    let info = FirmwareInfo::new(
        binary.len() as u32,
        FIRMWARE_CRC.checksum(binary),
        options.version,
        options.flags,
        options.info.as_bytes(),
    );
    let mut header = FirmwareHeader::unsigned(Sha256::digest(binary).into(), info);
    let signature: Signature = key
        .sign_prehash(&header_digest(&header))
        .map_err(|e| anyhow!("Failed to sign header: {}", e))?;
    header.signature.copy_from_slice(&signature.to_bytes());

    let mut body = binary.to_vec();
    encrypt_image(cipher, options.chunk_size, &mut body);

    let mut image = Vec::with_capacity(HEADER_SIZE + body.len());
    image.extend_from_slice(header.as_bytes());
    image.extend_from_slice(&body);
    Ok(image)
}

/// Print an image header and check whatever the given keys allow.
pub fn inspect(file: &Path, public_key: Option<&Path>, cipher_key: Option<&str>, chunk_size: usize) -> Result<()> {
    let image = fs::read(file).with_context(|| format!("Failed to read {}", file.display()))?;
    let header = FirmwareHeader::parse(&image)
        .with_context(|| format!("{} is shorter than a {}-byte header", file.display(), HEADER_SIZE))?;
    let info = &header.info;
    let body = &image[HEADER_SIZE..];

    println!("Image: {} ({} bytes)", file.display(), image.len());
    println!("  Size:     {} bytes", info.size());
    println!("  CRC32:    0x{:08x}", info.crc());
    println!("  Version:  {}", info.version());
    println!("  Flags:    0x{:02x}", info.flags);
    println!("  Info:     {}", info_text(&info.info));
    println!("  SHA-256:  {}", hex::encode(header.hash));
    if body.len() != info.size() as usize {
        println!("  Warning: body is {} bytes, header declares {}", body.len(), info.size());
    }

    let mut failures = 0;
    if let Some(path) = public_key {
        let key = read_public_key(path)?;
        match verify_header(&header, &key, &P256Verifier) {
            Ok(()) => println!("Signature: OK"),
            Err(e) => {
                println!("Signature: FAILED ({})", e);
                failures += 1;
            }
        }
    }
    if let Some(cipher_key) = cipher_key {
        if chunk_size == 0 {
            bail!("Chunk size must not be zero");
        }
        let cipher = parse_cipher_key(cipher_key)?;
        let mut binary = body.to_vec();
        decrypt_image(&cipher, chunk_size, &mut binary);
        binary.truncate(info.size() as usize);

        let crc = FIRMWARE_CRC.checksum(&binary);
        if crc == info.crc() {
            println!("CRC32:     OK");
        } else {
            println!("CRC32:     FAILED (computed 0x{:08x})", crc);
            failures += 1;
        }
        let hash: [u8; 32] = Sha256::digest(&binary).into();
        if hash == header.hash {
            println!("SHA-256:   OK");
        } else {
            println!("SHA-256:   FAILED");
            failures += 1;
        }
    }

    if failures > 0 {
        bail!("{} check(s) failed", failures);
    }
    Ok(())
}

/// What a simulated update left behind.
#[derive(Debug)]
pub struct SimReport {
    pub elapsed_ms: u32,
    pub frames: u64,
    pub status: u8,
    pub installed_version: u32,
    pub app_status: u8,
    pub jumped: bool,
}

/// Push `image` into a bootloader running on RAM flash.
pub fn run_simulation(
    image: &[u8],
    public_key: PublicKey,
    cipher: &Xxtea,
    chunk_size: usize,
    device_id: u8,
    progress: Option<&ProgressBar>,
) -> Result<SimReport> {
    let header = FirmwareHeader::parse(image).context("Image is shorter than its header")?;
    let (sections, page_count) = transport::sections_for(header.info.size());
    let verifier = P256Verifier;

    let mut scratch = vec![0u8; PAGE_SIZE as usize];
    let mut chunk = vec![0u8; chunk_size];
    let mut burst = vec![0u8; BURST_SIZE];
    let pages = FlashPages::new(
        RamFlash::new((page_count * PAGE_SIZE) as usize),
        PageLayout::Regular {
            start: 0,
            size: PAGE_SIZE,
            count: page_count,
        },
        &mut scratch,
        FLASH_BASE,
    );
    let mut config = BootloaderConfig::new(public_key, &verifier, cipher);
    config.device_id = device_id;
    let mut boot = Bootloader::new(
        config,
        sections,
        PagedMemory::new(pages),
        CanTransport::new(FrameQueue::new()),
        SimPlatform::default(),
        &mut chunk,
        &mut burst,
    )
    .context("Invalid bootloader configuration")?;
    boot.stay_in_bootloader(true);

    let mut sender = Sender::new(
        SenderConfig::default(),
        device_id,
        BURST_CRC_POLY,
        image,
        BURST_SIZE as u16,
        PACKET_SIZE,
    )
    .context("Cannot send image")?;
    let mut link = Link::new(device_id);
    let mut now = 0u32;
    sender.start(now).context("Cannot start sender")?;

    while sender.is_running() {
        if now >= SIMULATION_LIMIT_MS {
            bail!("Transfer still running after {} simulated ms", now);
        }
        link.step(now, &mut boot, &mut sender);
        if let Some(pb) = progress {
            pb.set_position(sender.progress() as u64);
        }
        now += 1;
    }
    let elapsed_ms = now;
    let status = sender.outcome().unwrap_or(TransferStatus::Unknown.code());

    for _ in 0..SETTLE_MS {
        link.step(now, &mut boot, &mut sender);
        now += 1;
    }

    Ok(SimReport {
        elapsed_ms,
        frames: link.frames(),
        status,
        installed_version: boot.installed_version(),
        app_status: boot.app_status(),
        jumped: boot.platform().jumped,
    })
}

/// Run an image through the transfer protocol into a simulated device.
pub fn simulate(file: &Path, public_key: &Path, cipher_key: &str, chunk_size: usize, device_id: u8) -> Result<()> {
    let image = fs::read(file).with_context(|| format!("Failed to read {}", file.display()))?;
    let key = read_public_key(public_key)?;
    let cipher = parse_cipher_key(cipher_key)?;

    println!("Simulating transfer of {} ({} bytes) to device {}", file.display(), image.len(), device_id);
    let pb = ProgressBar::new(image.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}")?
            .progress_chars("#>-"),
    );

    let report = match run_simulation(&image, key, &cipher, chunk_size, device_id, Some(&pb)) {
        Ok(report) => report,
        Err(e) => {
            pb.abandon();
            return Err(e);
        }
    };
    if report.status != TransferStatus::Ok.code() {
        pb.abandon();
        bail!("Transfer failed: {}", describe_status(report.status));
    }
    pb.finish_with_message("transferred");

    println!();
    println!("Simulated time:    {} ms", report.elapsed_ms);
    println!("Frames exchanged:  {}", report.frames);
    println!("Installed version: {}", report.installed_version);
    println!("Status byte:       0x{:02x}", report.app_status);
    Ok(())
}

/// Name of a finish-report status code.
pub fn describe_status(code: u8) -> String {
    if let Some(status) = TransferStatus::from_code(code) {
        return format!("{:?} (0x{:02x})", status, code);
    }
    let boot = [
        BootError::HeaderVerification,
        BootError::CrcMismatch,
        BootError::Verification,
        BootError::Read,
        BootError::Write,
        BootError::ImageTooLarge,
    ]
    .into_iter()
    .find(|e| e.code() == code);
    match boot {
        Some(e) => format!("{} (0x{:02x})", e, code),
        None => format!("unknown status 0x{:02x}", code),
    }
}

fn public_key_of(key: &SigningKey) -> PublicKey {
    let point = key.verifying_key().to_encoded_point(false);
    let mut public = [0u8; PUBLIC_KEY_LEN];
    // Drop the SEC1 0x04 prefix
    public.copy_from_slice(&point.as_bytes()[1..]);
    public
}

fn read_signing_key(path: &Path) -> Result<SigningKey> {
    let bytes = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    SigningKey::from_slice(&bytes).map_err(|e| anyhow!("Invalid private key in {}: {}", path.display(), e))
}

fn read_public_key(path: &Path) -> Result<PublicKey> {
    let bytes = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    bytes.as_slice().try_into().map_err(|_| {
        anyhow!(
            "{} holds {} bytes, expected a {}-byte public key",
            path.display(),
            bytes.len(),
            PUBLIC_KEY_LEN
        )
    })
}

fn parse_cipher_key(text: &str) -> Result<Xxtea> {
    let bytes = parse_hex(text)?;
    let key: [u8; 16] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| anyhow!("Cipher key must be 16 bytes, got {}", bytes.len()))?;
    Ok(Xxtea::from_bytes(&key))
}

fn parse_hex(text: &str) -> Result<Vec<u8>> {
    let digits = text.trim();
    let digits = digits.strip_prefix("0x").unwrap_or(digits);
    hex::decode(digits).with_context(|| format!("Invalid hex string '{}'", text))
}

fn info_text(text: &[u8]) -> String {
    let end = text.iter().position(|&b| b == 0 || b == 0xFF).unwrap_or(text.len());
    String::from_utf8_lossy(&text[..end]).into_owned()
}
