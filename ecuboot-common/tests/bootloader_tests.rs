// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Bootloader tests: slot handling at boot, full updates over the CAN
//! framing, and the jump to the application.

mod common;

use common::*;
use ecuboot_common::bootloader::{BootError, BootState, Bootloader, ConfigError, Section, Sections};
use ecuboot_common::boot_fsm::SlotStatus;
use ecuboot_common::checksum::FIRMWARE_CRC;
use ecuboot_common::frame::{dispatch, msg_type_for_id, run_mode_frame, CanFrame, CanTransport, FrameQueue, RunMode};
use ecuboot_common::image::{FirmwareHeader, FirmwareInfo, InstalledRecord, HEADER_SIZE};
use ecuboot_common::memory::{Memory, PagedMemory};
use ecuboot_common::protocol::{MsgType, TransferStatus};
use zerocopy::IntoBytes;

fn fresh_memory() -> PagedMemory<'static, RamFlash> {
    PagedMemory::new(make_pages(PAGE_SIZE as usize))
}

/// Write `binary` and its record as if it had been installed earlier.
fn install_slot(memory: &mut PagedMemory<'static, RamFlash>, info: Section, slot: Section, binary: &[u8], version: u32) -> InstalledRecord {
    let header = make_header(binary, version);
    memory.write(slot.address, binary).unwrap();
    let record = InstalledRecord::new(MAGIC, header.info);
    memory.write(info.address, record.as_bytes()).unwrap();
    record
}

/// Bootloader over pre-filled flash, with the driver counters cleared.
fn boot_with(mut memory: PagedMemory<'static, RamFlash>) -> TestBootloader {
    memory.pages_mut().driver_mut().reset_counters();
    make_bootloader_with(memory, boot_config())
}

/// Fresh bootloader that has reached `Idle`.
fn idle_bootloader(now: &mut u32) -> TestBootloader {
    let mut boot = make_bootloader();
    run_for(&mut boot, now, 5);
    assert_eq!(boot.state(), BootState::Idle);
    boot
}

// =============================================================================
// Boot sequence
// =============================================================================

#[test]
fn test_fresh_boot_waits_for_an_image() {
    let mut boot = make_bootloader();
    boot.tick(0);
    assert_eq!(boot.state(), BootState::StartDataComm);
    boot.tick(1);
    assert_eq!(boot.state(), BootState::Idle);
    assert!(boot.receiver().is_running());
    assert!(!boot.is_receiving());
    assert_eq!(boot.slots().app.status, SlotStatus::NotFound);
    assert_eq!(boot.installed_version(), 0);
    assert_eq!(boot.app_status(), 0x04);
}

#[test]
fn test_fresh_boot_never_jumps() {
    let mut now = 0;
    let mut boot = idle_bootloader(&mut now);
    boot.start_application(true);
    run_for(&mut boot, &mut now, 1000);
    assert_eq!(boot.platform().jumps, 0);
    assert_eq!(boot.state(), BootState::Idle);
}

#[test]
fn test_verified_app_starts_after_jump_delay() {
    let s = sections();
    let mut memory = fresh_memory();
    install_slot(&mut memory, s.app_info, s.app, &make_binary(500, 1), 3);
    let mut boot = boot_with(memory);

    let mut now = 0;
    run_for(&mut boot, &mut now, 100);
    assert_eq!(boot.state(), BootState::Idle);
    assert_eq!(boot.slots().app.status, SlotStatus::Verified);
    assert_eq!(boot.installed_version(), 3);
    assert_eq!(boot.platform().jumps, 0);

    run_for(&mut boot, &mut now, 150);
    assert!(boot.platform().jumps > 0);
    assert_eq!(boot.state(), BootState::GoToApp);
}

#[test]
fn test_stay_request_blocks_jump_until_start() {
    let s = sections();
    let mut memory = fresh_memory();
    install_slot(&mut memory, s.app_info, s.app, &make_binary(500, 1), 3);
    let mut boot = boot_with(memory);
    let mut now = 0;

    assert!(dispatch(&mut boot, now, &run_mode_frame(DEVICE_ID, RunMode::StayInBootloader)));
    run_for(&mut boot, &mut now, 1000);
    assert_eq!(boot.platform().jumps, 0);

    assert!(dispatch(&mut boot, now, &run_mode_frame(DEVICE_ID, RunMode::StartApplication)));
    run_for(&mut boot, &mut now, 2);
    assert!(boot.platform().jumps > 0);
}

#[test]
fn test_zero_jump_delay_waits_for_explicit_start() {
    let s = sections();
    let mut memory = fresh_memory();
    install_slot(&mut memory, s.app_info, s.app, &make_binary(200, 1), 1);
    memory.pages_mut().driver_mut().reset_counters();
    let mut config = boot_config();
    config.jump_delay = 0;
    let mut boot = make_bootloader_with(memory, config);

    let mut now = 0;
    run_for(&mut boot, &mut now, 1000);
    assert_eq!(boot.platform().jumps, 0);
    boot.start_application(true);
    run_for(&mut boot, &mut now, 2);
    assert!(boot.platform().jumps > 0);
}

#[test]
fn test_corrupted_app_is_not_started() {
    let s = sections();
    let mut memory = fresh_memory();
    install_slot(&mut memory, s.app_info, s.app, &make_binary(500, 1), 3);
    memory.write(s.app.address + 10, &[0x00]).unwrap();
    let mut boot = boot_with(memory);

    let mut now = 0;
    boot.start_application(true);
    run_for(&mut boot, &mut now, 500);
    assert_eq!(boot.slots().app.status, SlotStatus::Corrupted);
    assert_eq!(boot.platform().jumps, 0);
    assert_eq!(boot.app_status(), 0x04 | (3 << 6));
}

#[test]
fn test_record_larger_than_section_is_corrupted() {
    let s = sections();
    let mut memory = fresh_memory();
    let info = FirmwareInfo::new(s.app.size + 1, 0, 1, 0, b"huge");
    memory
        .write(s.app_info.address, InstalledRecord::new(MAGIC, info).as_bytes())
        .unwrap();
    let mut boot = boot_with(memory);

    let mut now = 0;
    run_for(&mut boot, &mut now, 10);
    assert_eq!(boot.slots().app.status, SlotStatus::Corrupted);
}

#[test]
fn test_record_with_wrong_magic_is_ignored() {
    let s = sections();
    let mut memory = fresh_memory();
    let binary = make_binary(100, 1);
    let info = make_header(&binary, 1).info;
    memory.write(s.app.address, &binary).unwrap();
    memory
        .write(s.app_info.address, InstalledRecord::new(MAGIC ^ 1, info).as_bytes())
        .unwrap();
    let mut boot = boot_with(memory);

    let mut now = 0;
    run_for(&mut boot, &mut now, 10);
    assert_eq!(boot.slots().app.status, SlotStatus::NotFound);
}

// =============================================================================
// Installing the upgrade slot
// =============================================================================

#[test]
fn test_different_upgrade_replaces_app() {
    let s = sections();
    let mut memory = fresh_memory();
    install_slot(&mut memory, s.app_info, s.app, &make_binary(700, 1), 1);
    let upgrade = make_binary(900, 2);
    let record = install_slot(&mut memory, s.upgrade_info, s.upgrade, &upgrade, 2);
    let mut boot = boot_with(memory);
    boot.stay_in_bootloader(true);

    let mut now = 0;
    run_for(&mut boot, &mut now, 50);
    assert_eq!(boot.state(), BootState::Idle);
    assert_eq!(boot.slots().app.record, record);
    assert_eq!(boot.slots().app.status, SlotStatus::Verified);
    assert_eq!(boot.installed_version(), 2);
    assert_eq!(flash_bytes(&boot, s.app.address, upgrade.len()), upgrade);
    assert_eq!(boot.app_status(), 0x04 | (2 << 4) | (2 << 6));
}

#[test]
fn test_identical_upgrade_is_not_copied() {
    let s = sections();
    let binary = make_binary(700, 1);
    let mut memory = fresh_memory();
    install_slot(&mut memory, s.app_info, s.app, &binary, 1);
    install_slot(&mut memory, s.upgrade_info, s.upgrade, &binary, 1);
    let mut boot = boot_with(memory);
    boot.stay_in_bootloader(true);

    let mut now = 0;
    run_for(&mut boot, &mut now, 50);
    assert_eq!(flash(&boot).writes, 0);
    assert_eq!(boot.slots().upgrade.status, SlotStatus::Verified);
}

#[test]
fn test_corrupted_upgrade_is_not_copied() {
    let s = sections();
    let mut memory = fresh_memory();
    let app = install_slot(&mut memory, s.app_info, s.app, &make_binary(700, 1), 1);
    install_slot(&mut memory, s.upgrade_info, s.upgrade, &make_binary(600, 2), 2);
    memory.write(s.upgrade.address, &[0x00]).unwrap();
    let mut boot = boot_with(memory);
    boot.stay_in_bootloader(true);

    let mut now = 0;
    run_for(&mut boot, &mut now, 50);
    assert_eq!(boot.slots().upgrade.status, SlotStatus::Corrupted);
    assert_eq!(boot.slots().app.record, app);
    assert_eq!(flash(&boot).writes, 0);
}

#[test]
fn test_copy_retries_are_bounded() {
    let s = sections();
    let mut memory = fresh_memory();
    install_slot(&mut memory, s.upgrade_info, s.upgrade, &make_binary(600, 2), 2);
    let mut boot = boot_with(memory);
    flash_mut(&mut boot).fail_writes = true;

    let mut now = 0;
    run_for(&mut boot, &mut now, 100);
    assert_eq!(boot.state(), BootState::Idle);
    assert_eq!(boot.slots().upgrade.status, SlotStatus::Corrupted);
    assert_eq!(boot.slots().app.status, SlotStatus::NotFound);
    assert_eq!(boot.app_status(), 0x04 | (3 << 4));
    assert!(boot.receiver().is_running());
}

#[test]
fn test_new_upgrade_gets_fresh_copy_budget() {
    let s = sections();
    let mut memory = fresh_memory();
    install_slot(&mut memory, s.upgrade_info, s.upgrade, &make_binary(600, 2), 2);
    let mut boot = boot_with(memory);
    boot.stay_in_bootloader(true);
    flash_mut(&mut boot).fail_writes = true;

    let mut now = 0;
    run_for(&mut boot, &mut now, 100);
    assert_eq!(boot.slots().upgrade.status, SlotStatus::Corrupted);

    flash_mut(&mut boot).fail_writes = false;
    let binary = make_binary(700, 9);
    assert_eq!(
        transfer(&mut boot, &mut now, &make_image(&binary, 9)),
        Some(TransferStatus::Ok.code())
    );
    run_for(&mut boot, &mut now, 100);

    assert_eq!(boot.state(), BootState::Idle);
    assert_eq!(boot.slots().app.status, SlotStatus::Verified);
    assert_eq!(boot.installed_version(), 9);
    assert_eq!(flash_bytes(&boot, s.app.address, 700), binary);
}

// =============================================================================
// Updates over the bus
// =============================================================================

#[test]
fn test_full_update_installs_image() {
    let mut now = 0;
    let mut boot = idle_bootloader(&mut now);
    boot.stay_in_bootloader(true);
    let binary = make_binary(1000, 0x5A);
    let image = make_image(&binary, 7);

    assert_eq!(transfer(&mut boot, &mut now, &image), Some(TransferStatus::Ok.code()));
    run_for(&mut boot, &mut now, 100);

    let s = sections();
    let slots = boot.slots();
    assert_eq!(boot.state(), BootState::Idle);
    assert_eq!(slots.upgrade.status, SlotStatus::Verified);
    assert_eq!(slots.app.status, SlotStatus::Verified);
    assert_eq!(slots.app.record, slots.upgrade.record);
    assert_eq!(slots.app.record.info.size(), 1000);
    assert_eq!(boot.installed_version(), 7);
    assert_eq!(flash_bytes(&boot, s.upgrade.address, 1000), binary);
    assert_eq!(flash_bytes(&boot, s.app.address, 1000), binary);
    assert_eq!(boot.platform().jumps, 0);
}

#[test]
fn test_image_filling_the_slot_is_accepted() {
    let mut now = 0;
    let mut boot = idle_bootloader(&mut now);
    boot.stay_in_bootloader(true);
    let s = sections();
    let binary = make_binary(s.upgrade.size as usize, 0x21);

    assert_eq!(transfer(&mut boot, &mut now, &make_image(&binary, 9)), Some(0));
    run_for(&mut boot, &mut now, 200);
    assert_eq!(boot.slots().app.status, SlotStatus::Verified);
    assert_eq!(boot.installed_version(), 9);
}

#[test]
fn test_image_larger_than_slot_is_refused() {
    let mut now = 0;
    let mut boot = idle_bootloader(&mut now);
    let s = sections();
    let binary = make_binary(s.upgrade.size as usize + 1, 0x21);

    let outcome = transfer(&mut boot, &mut now, &make_image(&binary, 9));
    assert_eq!(outcome, Some(BootError::ImageTooLarge.code()));
    run_for(&mut boot, &mut now, 100);
    assert_eq!(boot.slots().upgrade.status, SlotStatus::NotFound);
}

#[test]
fn test_bad_signature_restarts_then_fails() {
    let mut now = 0;
    let mut boot = idle_bootloader(&mut now);
    let mut image = make_image(&make_binary(300, 4), 2);
    image[HEADER_SIZE - 1] ^= 0x01;

    let outcome = transfer(&mut boot, &mut now, &image);
    assert_eq!(outcome, Some(TransferStatus::MaxFullRetries.code()));
    run_for(&mut boot, &mut now, 100);
    assert_eq!(boot.slots().upgrade.status, SlotStatus::NotFound);
    assert_eq!(boot.slots().app.status, SlotStatus::NotFound);
}

#[test]
fn test_binary_not_matching_signed_hash_is_not_committed() {
    let mut now = 0;
    let mut boot = idle_bootloader(&mut now);
    let binary = make_binary(300, 4);
    let info = FirmwareInfo::new(300, FIRMWARE_CRC.checksum(&binary), 2, 0, b"wrong hash");
    let mut header = FirmwareHeader::unsigned([0xAB; 32], info);
    sign_header(&mut header);

    let outcome = transfer(&mut boot, &mut now, &image_from_header(&header, &binary));
    assert_eq!(outcome, Some(TransferStatus::MaxFullRetries.code()));
    run_for(&mut boot, &mut now, 100);
    assert_eq!(boot.slots().upgrade.status, SlotStatus::NotFound);
}

#[test]
fn test_image_ending_inside_header_is_aborted() {
    let mut now = 0;
    let mut boot = idle_bootloader(&mut now);
    let image = make_image(&make_binary(300, 4), 2);

    let outcome = transfer(&mut boot, &mut now, &image[..100]);
    assert_eq!(outcome, Some(BootError::HeaderVerification.code()));
}

#[test]
fn test_corrupted_packet_is_retried() {
    let mut now = 0;
    let mut boot = idle_bootloader(&mut now);
    boot.stay_in_bootloader(true);
    let binary = make_binary(400, 0x10);
    let mut corrupted = 0;

    let outcome = transfer_with(&mut boot, &mut now, &make_image(&binary, 5), 60_000, |frame| {
        if msg_type_for_id(frame.id) == Some(MsgType::BurstPacket) && corrupted < 2 {
            corrupted += 1;
            let mut data = frame.data().to_vec();
            data[4] ^= 0xFF;
            return CanFrame::new(frame.id, &data);
        }
        Some(frame)
    });

    assert_eq!(outcome, Some(0));
    run_for(&mut boot, &mut now, 100);
    assert_eq!(flash_bytes(&boot, sections().app.address, 400), binary);
}

#[test]
fn test_lost_packet_is_retried() {
    let mut now = 0;
    let mut boot = idle_bootloader(&mut now);
    boot.stay_in_bootloader(true);
    let binary = make_binary(400, 0x10);
    let mut packets = 0;

    let outcome = transfer_with(&mut boot, &mut now, &make_image(&binary, 5), 60_000, |frame| {
        if msg_type_for_id(frame.id) == Some(MsgType::BurstPacket) {
            packets += 1;
            if packets == 30 {
                return None;
            }
        }
        Some(frame)
    });

    assert_eq!(outcome, Some(0));
    run_for(&mut boot, &mut now, 100);
    assert_eq!(boot.installed_version(), 5);
}

#[test]
fn test_update_while_app_runs_does_not_jump_mid_transfer() {
    let s = sections();
    let mut memory = fresh_memory();
    install_slot(&mut memory, s.app_info, s.app, &make_binary(700, 1), 1);
    let mut boot = boot_with(memory);
    let mut now = 0;
    run_for(&mut boot, &mut now, 3);
    assert_eq!(boot.state(), BootState::Idle);

    let binary = make_binary(1500, 3);
    assert_eq!(transfer(&mut boot, &mut now, &make_image(&binary, 2)), Some(0));
    assert_eq!(boot.platform().jumps, 0);

    run_for(&mut boot, &mut now, 50);
    assert_eq!(boot.installed_version(), 2);
    assert_eq!(flash_bytes(&boot, s.app.address, binary.len()), binary);

    run_for(&mut boot, &mut now, 300);
    assert!(boot.platform().jumps > 0);
}

#[test]
fn test_frames_for_other_devices_are_ignored() {
    let mut now = 0;
    let mut boot = idle_bootloader(&mut now);
    let frame = run_mode_frame(DEVICE_ID + 1, RunMode::StartApplication);
    assert!(!dispatch(&mut boot, now, &frame));
}

// =============================================================================
// Configuration
// =============================================================================

fn config_error(sections: Sections, chunk: usize, burst: usize, alignment: u32) -> Option<ConfigError> {
    let mut config = boot_config();
    config.padding_alignment = alignment;
    Bootloader::new(
        config,
        sections,
        fresh_memory(),
        CanTransport::new(FrameQueue::<32>::new()),
        FakePlatform::default(),
        leak_buffer(chunk),
        leak_buffer(burst),
    )
    .err()
}

#[test]
fn test_config_validation() {
    let good = sections();
    assert_eq!(config_error(good, CHUNK_SIZE, BURST_SIZE, 16), None);
    assert_eq!(Sections::STM32H5.validate(), Ok(()));

    let mut empty = good;
    empty.app.size = 0;
    assert_eq!(config_error(empty, CHUNK_SIZE, BURST_SIZE, 16), Some(ConfigError::EmptySlot));

    let mut larger = good;
    larger.upgrade.size = good.app.size + 0x100;
    assert_eq!(
        config_error(larger, CHUNK_SIZE, BURST_SIZE, 16),
        Some(ConfigError::UpgradeLargerThanApp)
    );

    let mut info = good;
    info.upgrade_info.size = good.app_info.size * 2;
    assert_eq!(
        config_error(info, CHUNK_SIZE, BURST_SIZE, 16),
        Some(ConfigError::UpgradeInfoLargerThanAppInfo)
    );

    let mut tiny = good;
    tiny.upgrade_info.size = 16;
    assert_eq!(
        config_error(tiny, CHUNK_SIZE, BURST_SIZE, 16),
        Some(ConfigError::InfoSectionTooSmall)
    );

    assert_eq!(config_error(good, 0, BURST_SIZE, 0), Some(ConfigError::EmptyBuffer));
    assert_eq!(config_error(good, CHUNK_SIZE, 0, 16), Some(ConfigError::EmptyBuffer));
    assert_eq!(
        config_error(good, CHUNK_SIZE, BURST_SIZE, CHUNK_SIZE as u32 * 2),
        Some(ConfigError::InvalidAlignment)
    );
}

#[test]
fn test_staging_buffer_must_keep_writes_aligned() {
    let good = sections();
    // 100-byte chunks would put every later flush at an unaligned offset
    assert_eq!(config_error(good, 100, BURST_SIZE, 16), Some(ConfigError::InvalidAlignment));
    assert_eq!(config_error(good, 104, BURST_SIZE, 8), None);
    assert_eq!(config_error(good, 96, BURST_SIZE, 16), None);
    // No alignment means no padding at all
    assert_eq!(config_error(good, 100, BURST_SIZE, 0), None);
}

#[test]
fn test_error_codes_are_stable() {
    assert_eq!(BootError::HeaderVerification.code(), 0x81);
    assert_eq!(BootError::ImageTooLarge.code(), 0x86);
    assert_eq!(BootError::Unknown.code(), 0xFF);
    assert_eq!(ConfigError::EmptySlot.code(), 1);
    assert_eq!(ConfigError::InvalidAlignment.code(), 6);
}
