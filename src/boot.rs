//! The boot decider and the image assembler.
//!
//! On every reset the device runs one `attempt`: poll the serial link for a
//! sender, and either pull a whole UF2 image down packet by packet, or fall
//! back to the program already installed. Four transport packets assemble
//! one block; every block is validated against the device geometry and the
//! session before a byte of it is committed.
//!
//! Flash is touched in a fixed order. The arrival of the first valid block
//! erases the image's sector span and the program-info sector; the record
//! is rewritten only after an EOT that closes a complete image. At no point
//! does flash hold a record describing a half-written image.

use log::{debug, info};
use thiserror::Error;

use crate::flash::{FlashIo, Layout, ProgInfo, BOOT2_SIZE, PAGE_SIZE, SECTOR_SIZE};
use crate::io::{BytePort, Indicator};
use crate::uf2::{self, Block};
use crate::xmodem::{self, Receiver, Status};
use crate::Error;

/// Transport packets that make up one block.
const PACKETS_PER_BLOCK: u32 = (uf2::BLOCK_SIZE / xmodem::PAYLOAD_SIZE) as u32;

/// Timeout settings for a boot attempt, in milliseconds.
#[derive(Debug, Copy, Clone)]
pub struct Timeouts {
    /// Wait for the first packet when no program is installed.
    pub initial_packet_ms: u32,
    /// Grace window for a sender to show up before an installed program is
    /// launched.
    pub boot_ms: u32,
    /// Wait for the start of any later packet.
    pub packet_ms: u32,
    /// Wait between bytes inside a packet.
    pub data_ms: u32,
}

impl Default for Timeouts {
    fn default() -> Timeouts {
        Timeouts {
            initial_packet_ms: 60_000,
            boot_ms: 3_000,
            packet_ms: 2_000,
            data_ms: 500,
        }
    }
}

/// Everything configurable about a bootloader instance.
#[derive(Debug, Copy, Clone)]
pub struct BootConfig {
    pub layout: Layout,
    pub timeouts: Timeouts,
    pub xmodem: xmodem::Config,
}

impl Default for BootConfig {
    fn default() -> BootConfig {
        BootConfig {
            layout: crate::flash::RP2040_LAYOUT,
            timeouts: Timeouts::default(),
            xmodem: xmodem::Config::default(),
        }
    }
}

/// Why a received block was refused.
///
/// A reject ends the session with an outbound CAN; it never escapes the
/// boot loop.
#[derive(Error, Debug)]
pub enum Reject {
    #[error("{0}")]
    Malformed(#[from] uf2::BlockError),

    #[error("block is not destined for main flash")]
    NotMainFlash,

    #[error("target address {0:#010x} is not page aligned")]
    MisalignedTarget(u32),

    #[error("target address {0:#010x} is outside the program area")]
    TargetOutOfArea(u32),

    #[error("payload size {0} does not match the flash page size")]
    WrongPayloadSize(u32),

    #[error("image declares zero blocks")]
    EmptyImage,

    #[error("block index {0} is not below the block count {1}")]
    BlockIndexOutOfRange(u32, u32),

    #[error("family id {0:#010x} does not match this device")]
    WrongFamily(u32),

    #[error("first block of the image has index {0}")]
    NotFirstBlock(u32),

    #[error("image of {0} blocks overruns the program area")]
    ImageTooLarge(u32),

    #[error("block count changed from {0} to {1} mid-transfer")]
    BlockCountChanged(u32, u32),

    #[error("expected block {0}, got block {1}")]
    BlockOutOfOrder(u32, u32),

    #[error("expected target address {0:#010x}, got {1:#010x}")]
    TargetNotContiguous(u32, u32),
}

/// Volatile progress of one transfer attempt.
#[derive(Debug, Default)]
struct Session {
    /// Start address declared by the image's first block.
    prog_addr: u32,
    /// Block count declared by the image's first block.
    num_blks: u32,
    /// Blocks already committed to flash.
    num_blks_recv: u32,
    /// Packets collected toward the block in the buffer, 0..=3 between
    /// blocks.
    num_pkts_recv: u32,
    /// Sequence number the next packet must carry.
    next_pkt_num: u8,
}

impl Session {
    fn new() -> Session {
        Session {
            next_pkt_num: 1,
            ..Session::default()
        }
    }
}

/// Handed back when the boot decider wants the stored program to run.
///
/// The jump itself is architecture specific and stays out of the core: the
/// embedding tears down the bootloader context, loads the stack pointer
/// from the first word at `vector_addr` and branches to the second.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Launch {
    /// The installed image's vector table: its start address plus the
    /// second-stage loader page at the front of every image.
    pub vector_addr: u32,
}

/// The bootloader core.
///
/// Owns the transfer session, the block buffer and the session state, and
/// decides on every attempt between receiving a new image and launching
/// the stored one.
pub struct Bootloader<P, F, L> {
    xmodem: Receiver<P>,
    flash: F,
    indicator: L,
    layout: Layout,
    timeouts: Timeouts,
    block_buf: [u8; uf2::BLOCK_SIZE],
    session: Session,
}

impl<P: BytePort, F: FlashIo, L: Indicator> Bootloader<P, F, L> {
    pub fn new(port: P, flash: F, indicator: L, config: BootConfig) -> Bootloader<P, F, L> {
        Bootloader {
            xmodem: Receiver::new(port, config.xmodem),
            flash,
            indicator,
            layout: config.layout,
            timeouts: config.timeouts,
            block_buf: [0; uf2::BLOCK_SIZE],
            session: Session::new(),
        }
    }

    /// The flash behind the bootloader, e.g. for persisting a host-side
    /// image file between attempts.
    pub fn flash(&self) -> &F {
        &self.flash
    }

    /// The outer boot loop: attempts forever until a launch is due.
    pub fn run(&mut self) -> Result<Launch, Error> {
        loop {
            if let Some(launch) = self.attempt()? {
                return Ok(launch);
            }
        }
    }

    /// Runs one iteration of the outer boot loop.
    ///
    /// Returns `Ok(Some(_))` when the stored program should run; the caller
    /// owns the jump. `Ok(None)` means the attempt ended in some terminal
    /// transfer outcome, including a completed update, and the loop should
    /// go around again.
    pub fn attempt(&mut self) -> Result<Option<Launch>, Error> {
        self.session = Session::new();

        let stored = ProgInfo::load(&self.flash, &self.layout);

        self.indicator.set(true);

        // A stored program shortens the initial poll to a grace window; an
        // unprovisioned device keeps waiting.
        let pkt_timeout = if stored.is_some() {
            self.timeouts.boot_ms
        } else {
            self.timeouts.initial_packet_ms
        };

        let mut status = self.xmodem.recv_begin(
            &mut self.block_buf[..xmodem::PAYLOAD_SIZE],
            pkt_timeout,
            self.timeouts.data_ms,
        )?;

        // A silent link and an explicit refusal both hand control to the
        // stored program.
        if matches!(status, Status::InitialTimeout | Status::Cancelled) {
            if let Some(stored) = stored {
                self.indicator.set(false);
                info!("launching program at {:#010x}", stored.prog_addr);

                return Ok(Some(Launch {
                    vector_addr: stored.prog_addr + BOOT2_SIZE,
                }));
            }
        }

        loop {
            match status {
                Status::Packet => {
                    self.session.num_pkts_recv += 1;
                    self.session.next_pkt_num = self.session.next_pkt_num.wrapping_add(1);

                    // Toggle every 2 packets
                    if self.session.next_pkt_num % 2 == 1 {
                        self.indicator.toggle();
                    }

                    // Block incomplete: pull the next packet into the next
                    // buffer slot.
                    if self.session.num_pkts_recv < PACKETS_PER_BLOCK {
                        let offset = xmodem::PAYLOAD_SIZE * self.session.num_pkts_recv as usize;
                        status = self.xmodem.recv_next(
                            &mut self.block_buf[offset..offset + xmodem::PAYLOAD_SIZE],
                            self.session.next_pkt_num,
                            self.timeouts.packet_ms,
                            self.timeouts.data_ms,
                        )?;
                        continue;
                    }

                    if let Err(reject) = self.absorb_block() {
                        debug!(
                            "rejecting block {}: {}",
                            self.session.num_blks_recv, reject
                        );
                        self.xmodem.recv_cancel()?;
                        break;
                    }

                    self.session.num_blks_recv += 1;
                    self.session.num_pkts_recv = 0;
                    status = self.xmodem.recv_next(
                        &mut self.block_buf[..xmodem::PAYLOAD_SIZE],
                        self.session.next_pkt_num,
                        self.timeouts.packet_ms,
                        self.timeouts.data_ms,
                    )?;
                }
                Status::Eot => {
                    self.commit_prog_info();
                    break;
                }
                Status::Cancelled | Status::Aborted | Status::InitialTimeout => break,
            }
        }

        // Whatever ended the transfer, flash is in a proper state now:
        // untouched, or fully updated with the record rewritten, or
        // partially written with the record still erased. Nothing to undo.
        Ok(None)
    }

    /// Validates and commits the completed block sitting in the buffer.
    fn absorb_block(&mut self) -> Result<(), Reject> {
        let block = Block::from_bytes(&self.block_buf)?;

        if self.session.num_blks_recv == 0 {
            self.check_first_block(&block)?;
            self.commit_first_block(&block);
        } else {
            self.check_next_block(&block)?;
            self.flash.program(
                block.target_addr - self.layout.xip_base,
                &block.data[..PAGE_SIZE as usize],
            );
        }

        Ok(())
    }

    /// Checks every block must pass regardless of its position.
    fn check_generic_block(&self, b: &Block) -> Result<(), Reject> {
        if b.flags & uf2::FLAG_NOT_MAIN_FLASH != 0 {
            return Err(Reject::NotMainFlash);
        }
        if b.target_addr % PAGE_SIZE != 0 {
            return Err(Reject::MisalignedTarget(b.target_addr));
        }
        if b.target_addr < self.layout.prog_area_begin()
            || b.target_addr >= self.layout.prog_area_end()
        {
            return Err(Reject::TargetOutOfArea(b.target_addr));
        }
        if b.payload_size != PAGE_SIZE {
            return Err(Reject::WrongPayloadSize(b.payload_size));
        }
        if b.num_blocks == 0 {
            return Err(Reject::EmptyImage);
        }
        if b.block_no >= b.num_blocks {
            return Err(Reject::BlockIndexOutOfRange(b.block_no, b.num_blocks));
        }
        if b.has_family_id() && b.file_size != uf2::RP2040_FAMILY_ID {
            return Err(Reject::WrongFamily(b.file_size));
        }

        Ok(())
    }

    fn check_first_block(&self, b: &Block) -> Result<(), Reject> {
        self.check_generic_block(b)?;

        if b.block_no != 0 {
            return Err(Reject::NotFirstBlock(b.block_no));
        }

        let image_end = u64::from(b.target_addr) + u64::from(PAGE_SIZE) * u64::from(b.num_blocks);
        if image_end > u64::from(self.layout.prog_area_end()) {
            return Err(Reject::ImageTooLarge(b.num_blocks));
        }

        Ok(())
    }

    fn check_next_block(&self, b: &Block) -> Result<(), Reject> {
        self.check_generic_block(b)?;

        let s = &self.session;

        if b.num_blocks != s.num_blks {
            return Err(Reject::BlockCountChanged(s.num_blks, b.num_blocks));
        }
        if b.block_no != s.num_blks_recv {
            return Err(Reject::BlockOutOfOrder(s.num_blks_recv, b.block_no));
        }

        let expected_addr = s.prog_addr + PAGE_SIZE * s.num_blks_recv;
        if b.target_addr != expected_addr {
            return Err(Reject::TargetNotContiguous(expected_addr, b.target_addr));
        }

        Ok(())
    }

    /// Erases the image's sector span and writes its first page.
    fn commit_first_block(&mut self, b: &Block) {
        let sec1 = self.layout.sector_index(b.target_addr);
        // Sector holding the image's last byte
        let sec2 = self
            .layout
            .sector_index(b.target_addr + PAGE_SIZE * b.num_blocks - 1);

        if sec1 == 0 {
            // The span includes sector 0, whose first page is the
            // second-stage loader that cold boot depends on: carry it
            // across the erase.
            let mut boot2 = [0u8; BOOT2_SIZE as usize];
            self.flash.read(0, &mut boot2);

            self.flash
                .erase(SECTOR_SIZE * sec1, SECTOR_SIZE * (sec2 - sec1 + 1));
            self.flash.program(0, &boot2);

            if b.target_addr != self.layout.xip_base {
                self.flash.program(
                    b.target_addr - self.layout.xip_base,
                    &b.data[..PAGE_SIZE as usize],
                );
            }
        } else {
            self.flash
                .erase(SECTOR_SIZE * sec1, SECTOR_SIZE * (sec2 - sec1 + 1));
            self.flash.program(
                b.target_addr - self.layout.xip_base,
                &b.data[..PAGE_SIZE as usize],
            );
        }

        // Invalidate the program-info record; it is rewritten only once an
        // EOT closes a complete image.
        self.flash.erase(self.layout.prog_info_offset, SECTOR_SIZE);

        self.session.prog_addr = b.target_addr;
        self.session.num_blks = b.num_blocks;
    }

    /// On EOT: if the image arrived whole, write the program-info record.
    fn commit_prog_info(&mut self) {
        let s = &self.session;

        // EOT before any block: an empty transfer, flash untouched.
        if s.num_blks == 0 {
            return;
        }

        // A partial image keeps the record erased.
        if s.num_blks_recv != s.num_blks || s.num_pkts_recv != 0 {
            debug!(
                "incomplete transfer at EOT: {}/{} blocks, {} stray packets",
                s.num_blks_recv, s.num_blks, s.num_pkts_recv
            );
            return;
        }

        let info = ProgInfo {
            prog_addr: s.prog_addr,
            size: PAGE_SIZE * s.num_blks,
        };

        info!(
            "installed {} byte program at {:#010x}",
            info.size, info.prog_addr
        );

        self.flash
            .program(self.layout.prog_info_offset, &info.to_page());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::MemFlash;
    use crate::io::testkit::ScriptPort;
    use crate::io::NoIndicator;
    use crate::uf2::testkit::BlockBuilder;
    use crate::xmodem::testkit::frame;

    const ACK: u8 = 0x06;
    const NAK: u8 = 0x15;
    const CAN: u8 = 0x18;
    const EOT: u8 = 0x04;
    const CRC: u8 = 0x43;

    // Small geometry so the tests stay readable: 128 kB flash, 64 kB
    // bootloader reservation, program area [0x10010000, 0x10020000).
    const LAYOUT: Layout = Layout {
        xip_base: 0x1000_0000,
        flash_size: 128 << 10,
        bl_size: 64 << 10,
        prog_info_offset: (64 << 10) - SECTOR_SIZE,
    };

    // No bootloader reservation at all: the program area starts in sector
    // 0 and first-block commits go through the boot-sector preservation
    // path.
    const BARE_LAYOUT: Layout = Layout {
        xip_base: 0x1000_0000,
        flash_size: 64 << 10,
        bl_size: 0,
        prog_info_offset: (64 << 10) - SECTOR_SIZE,
    };

    fn bootloader(
        port: ScriptPort,
        flash: MemFlash,
        layout: Layout,
    ) -> Bootloader<ScriptPort, MemFlash, NoIndicator> {
        let config = BootConfig {
            layout,
            timeouts: Timeouts::default(),
            xmodem: xmodem::Config {
                purge_timeout_ms: 10,
                retry: 2,
            },
        };

        Bootloader::new(port, flash, NoIndicator, config)
    }

    /// Splits a block into its four transport frames, first one numbered
    /// `first_seq`.
    fn feed_block(port: &mut ScriptPort, first_seq: u8, block: &[u8; uf2::BLOCK_SIZE]) {
        for (i, chunk) in block.chunks(xmodem::PAYLOAD_SIZE).enumerate() {
            let mut payload = [0u8; xmodem::PAYLOAD_SIZE];
            payload.copy_from_slice(chunk);
            port.feed(&frame(first_seq.wrapping_add(i as u8), &payload));
        }
    }

    fn prog_offset(layout: &Layout, addr: u32) -> usize {
        (addr - layout.xip_base) as usize
    }

    #[test]
    fn it_should_install_a_two_block_image() {
        let begin = LAYOUT.prog_area_begin();
        let b0 = BlockBuilder::new(begin, 0, 2).payload(&[0x11; 256]).build();
        let b1 = BlockBuilder::new(begin + PAGE_SIZE, 1, 2)
            .payload(&[0x22; 256])
            .build();

        let mut port = ScriptPort::new();
        port.silence();
        feed_block(&mut port, 1, &b0);
        feed_block(&mut port, 5, &b1);
        port.feed(&[EOT]);

        let mut bl = bootloader(port, MemFlash::new((128 << 10) as usize), LAYOUT);
        assert_eq!(bl.attempt().unwrap(), None);

        // Both pages landed at the target
        let off = prog_offset(&LAYOUT, begin);
        assert_eq!(&bl.flash.data()[off..off + 256], &[0x11u8; 256][..]);
        assert_eq!(&bl.flash.data()[off + 256..off + 512], &[0x22u8; 256][..]);

        // The record points at the image
        assert_eq!(
            ProgInfo::load(&bl.flash, &LAYOUT),
            Some(ProgInfo {
                prog_addr: begin,
                size: 512,
            })
        );

        // One C, one ACK per packet following the first, one per committed
        // block boundary and one for the EOT
        assert_eq!(
            bl.xmodem.port.sent,
            [CRC, ACK, ACK, ACK, ACK, ACK, ACK, ACK, ACK, ACK]
        );
    }

    #[test]
    fn it_should_recover_from_a_corrupt_first_packet() {
        let begin = LAYOUT.prog_area_begin();
        let block = BlockBuilder::new(begin, 0, 1).payload(&[0x33; 256]).build();

        let mut payload = [0u8; xmodem::PAYLOAD_SIZE];
        payload.copy_from_slice(&block[..xmodem::PAYLOAD_SIZE]);
        let mut first = frame(1, &payload);
        *first.last_mut().unwrap() ^= 0xff;

        let mut port = ScriptPort::new();
        port.silence();
        port.feed(&first);
        port.silence();
        feed_block(&mut port, 1, &block);
        port.feed(&[EOT]);

        let mut bl = bootloader(port, MemFlash::new((128 << 10) as usize), LAYOUT);
        assert_eq!(bl.attempt().unwrap(), None);

        let off = prog_offset(&LAYOUT, begin);
        assert_eq!(&bl.flash.data()[off..off + 256], &[0x33u8; 256][..]);
        assert_eq!(
            ProgInfo::load(&bl.flash, &LAYOUT),
            Some(ProgInfo {
                prog_addr: begin,
                size: 256,
            })
        );
        assert_eq!(bl.xmodem.port.sent, [CRC, NAK, ACK, ACK, ACK, ACK, ACK]);
    }

    #[test]
    fn it_should_launch_the_stored_program_when_the_link_stays_silent() {
        #[derive(Default)]
        struct TestLed {
            on: bool,
        }

        impl Indicator for TestLed {
            fn set(&mut self, on: bool) {
                self.on = on;
            }

            fn toggle(&mut self) {
                self.on = !self.on;
            }
        }

        let begin = LAYOUT.prog_area_begin();
        let mut flash = MemFlash::new((128 << 10) as usize);
        flash.program(
            LAYOUT.prog_info_offset,
            &ProgInfo {
                prog_addr: begin,
                size: 1024,
            }
            .to_page(),
        );

        let mut port = ScriptPort::new();
        port.silence();

        let config = BootConfig {
            layout: LAYOUT,
            timeouts: Timeouts::default(),
            xmodem: xmodem::Config {
                purge_timeout_ms: 10,
                retry: 2,
            },
        };
        let mut bl = Bootloader::new(port, flash, TestLed::default(), config);

        assert_eq!(
            bl.attempt().unwrap(),
            Some(Launch {
                vector_addr: begin + BOOT2_SIZE,
            })
        );
        assert!(!bl.indicator.on);
    }

    #[test]
    fn it_should_wait_again_when_silent_with_nothing_stored() {
        let mut port = ScriptPort::new();
        port.silence();

        let mut bl = bootloader(port, MemFlash::new((128 << 10) as usize), LAYOUT);

        assert_eq!(bl.attempt().unwrap(), None);
        assert!(bl.flash.data().iter().all(|&b| b == 0xff));
    }

    #[test]
    fn it_should_leave_the_record_erased_after_a_mid_transfer_cancel() {
        let begin = LAYOUT.prog_area_begin();
        let b0 = BlockBuilder::new(begin, 0, 2).payload(&[0x44; 256]).build();
        let b1 = BlockBuilder::new(begin + PAGE_SIZE, 1, 2)
            .payload(&[0x55; 256])
            .build();

        let mut flash = MemFlash::new((128 << 10) as usize);
        flash.program(
            LAYOUT.prog_info_offset,
            &ProgInfo {
                prog_addr: begin,
                size: 512,
            }
            .to_page(),
        );

        let mut port = ScriptPort::new();
        port.silence();
        feed_block(&mut port, 1, &b0);
        // One packet into block 1, then the sender gives up.
        let mut payload = [0u8; xmodem::PAYLOAD_SIZE];
        payload.copy_from_slice(&b1[..xmodem::PAYLOAD_SIZE]);
        port.feed(&frame(5, &payload));
        port.feed(&[CAN]);

        let mut bl = bootloader(port, flash, LAYOUT);
        assert_eq!(bl.attempt().unwrap(), None);

        // Block 0 landed, but the record is gone until a full image makes
        // it across.
        let off = prog_offset(&LAYOUT, begin);
        assert_eq!(&bl.flash.data()[off..off + 256], &[0x44u8; 256][..]);
        assert_eq!(ProgInfo::load(&bl.flash, &LAYOUT), None);
    }

    #[test]
    fn it_should_cancel_an_image_that_overruns_the_program_area() {
        let begin = LAYOUT.prog_area_begin();
        let block = BlockBuilder::new(begin, 0, 10_000)
            .payload(&[0x66; 256])
            .build();

        let mut port = ScriptPort::new();
        port.silence();
        feed_block(&mut port, 1, &block);

        let mut bl = bootloader(port, MemFlash::new((128 << 10) as usize), LAYOUT);
        assert_eq!(bl.attempt().unwrap(), None);

        assert!(bl.flash.data().iter().all(|&b| b == 0xff));
        assert_eq!(bl.xmodem.port.sent, [CRC, ACK, ACK, ACK, CAN]);
    }

    #[test]
    fn it_should_cancel_a_target_below_the_program_area() {
        let block = BlockBuilder::new(LAYOUT.prog_area_begin() - PAGE_SIZE, 0, 1)
            .payload(&[0x77; 256])
            .build();

        let mut port = ScriptPort::new();
        port.silence();
        feed_block(&mut port, 1, &block);

        let mut bl = bootloader(port, MemFlash::new((128 << 10) as usize), LAYOUT);
        assert_eq!(bl.attempt().unwrap(), None);

        assert!(bl.flash.data().iter().all(|&b| b == 0xff));
        assert_eq!(*bl.xmodem.port.sent.last().unwrap(), CAN);
    }

    #[test]
    fn it_should_accept_an_image_ending_exactly_at_the_area_end() {
        let target = LAYOUT.prog_area_end() - 2 * PAGE_SIZE;
        let b0 = BlockBuilder::new(target, 0, 2).payload(&[0x88; 256]).build();
        let b1 = BlockBuilder::new(target + PAGE_SIZE, 1, 2)
            .payload(&[0x99; 256])
            .build();

        let mut port = ScriptPort::new();
        port.silence();
        feed_block(&mut port, 1, &b0);
        feed_block(&mut port, 5, &b1);
        port.feed(&[EOT]);

        let mut bl = bootloader(port, MemFlash::new((128 << 10) as usize), LAYOUT);
        assert_eq!(bl.attempt().unwrap(), None);

        assert_eq!(
            ProgInfo::load(&bl.flash, &LAYOUT),
            Some(ProgInfo {
                prog_addr: target,
                size: 512,
            })
        );
    }

    #[test]
    fn it_should_preserve_the_boot_sector_when_the_image_covers_it() {
        let base = BARE_LAYOUT.xip_base;
        let b0 = BlockBuilder::new(base, 0, 2).payload(&[0xAA; 256]).build();
        let b1 = BlockBuilder::new(base + PAGE_SIZE, 1, 2)
            .payload(&[0xBB; 256])
            .build();

        // Give the boot sector a recognizable second-stage loader.
        let mut flash = MemFlash::new((64 << 10) as usize);
        flash.program(0, &[0xB2; BOOT2_SIZE as usize]);

        let mut port = ScriptPort::new();
        port.silence();
        feed_block(&mut port, 1, &b0);
        feed_block(&mut port, 5, &b1);
        port.feed(&[EOT]);

        let mut bl = bootloader(port, flash, BARE_LAYOUT);
        assert_eq!(bl.attempt().unwrap(), None);

        // The second-stage loader survived the erase; the image's own
        // first page was skipped in its favour, the second landed.
        assert_eq!(&bl.flash.data()[..256], &[0xB2u8; 256][..]);
        assert_eq!(&bl.flash.data()[256..512], &[0xBBu8; 256][..]);
        assert_eq!(
            ProgInfo::load(&bl.flash, &BARE_LAYOUT),
            Some(ProgInfo {
                prog_addr: base,
                size: 512,
            })
        );
    }

    #[test]
    fn it_should_survive_a_sequence_number_wrap() {
        // 80 blocks is 320 packets: the 8-bit sequence counter wraps past
        // 255 partway through.
        let begin = LAYOUT.prog_area_begin();
        let num_blocks = 80u32;

        let mut port = ScriptPort::new();
        port.silence();

        for i in 0..num_blocks {
            let block = BlockBuilder::new(begin + PAGE_SIZE * i, i, num_blocks)
                .payload(&[i as u8; 256])
                .build();
            feed_block(&mut port, (1 + 4 * i) as u8, &block);
        }
        port.feed(&[EOT]);

        let mut bl = bootloader(port, MemFlash::new((128 << 10) as usize), LAYOUT);
        assert_eq!(bl.attempt().unwrap(), None);

        assert_eq!(
            ProgInfo::load(&bl.flash, &LAYOUT),
            Some(ProgInfo {
                prog_addr: begin,
                size: PAGE_SIZE * num_blocks,
            })
        );

        let off = prog_offset(&LAYOUT, begin);
        for i in 0..num_blocks as usize {
            assert_eq!(
                &bl.flash.data()[off + 256 * i..off + 256 * (i + 1)],
                &[i as u8; 256][..],
            );
        }
    }

    #[test]
    fn it_should_absorb_a_duplicated_packet_once() {
        let begin = LAYOUT.prog_area_begin();
        let block = BlockBuilder::new(begin, 0, 1).payload(&[0xCC; 256]).build();

        let mut port = ScriptPort::new();
        port.silence();

        // Packet 2 arrives twice; the duplicate is re-ACKed, not absorbed.
        for (i, chunk) in block.chunks(xmodem::PAYLOAD_SIZE).enumerate() {
            let mut payload = [0u8; xmodem::PAYLOAD_SIZE];
            payload.copy_from_slice(chunk);
            port.feed(&frame(1 + i as u8, &payload));

            if i == 1 {
                port.feed(&frame(1 + i as u8, &payload));
            }
        }
        port.feed(&[EOT]);

        let mut bl = bootloader(port, MemFlash::new((128 << 10) as usize), LAYOUT);
        assert_eq!(bl.attempt().unwrap(), None);

        let off = prog_offset(&LAYOUT, begin);
        assert_eq!(&bl.flash.data()[off..off + 256], &[0xCCu8; 256][..]);
        assert_eq!(
            ProgInfo::load(&bl.flash, &LAYOUT),
            Some(ProgInfo {
                prog_addr: begin,
                size: 256,
            })
        );
        // C, one ACK per packet after the first, one extra for the
        // duplicate, one at the block boundary and one for the EOT.
        assert_eq!(bl.xmodem.port.sent, [CRC, ACK, ACK, ACK, ACK, ACK, ACK]);
    }

    #[test]
    fn it_should_not_touch_flash_on_an_empty_transfer() {
        let mut port = ScriptPort::new();
        port.silence();
        port.feed(&[EOT]);

        let mut bl = bootloader(port, MemFlash::new((128 << 10) as usize), LAYOUT);
        assert_eq!(bl.attempt().unwrap(), None);

        assert!(bl.flash.data().iter().all(|&b| b == 0xff));
        assert_eq!(bl.xmodem.port.sent, [CRC, ACK]);
    }

    #[test]
    fn it_should_keep_the_record_erased_after_a_short_image() {
        // The first block promises two blocks but the sender EOTs after
        // one.
        let begin = LAYOUT.prog_area_begin();
        let block = BlockBuilder::new(begin, 0, 2).payload(&[0xDD; 256]).build();

        let mut flash = MemFlash::new((128 << 10) as usize);
        flash.program(
            LAYOUT.prog_info_offset,
            &ProgInfo {
                prog_addr: begin,
                size: 512,
            }
            .to_page(),
        );

        let mut port = ScriptPort::new();
        port.silence();
        feed_block(&mut port, 1, &block);
        port.feed(&[EOT]);

        let mut bl = bootloader(port, flash, LAYOUT);
        assert_eq!(bl.attempt().unwrap(), None);

        assert_eq!(ProgInfo::load(&bl.flash, &LAYOUT), None);
    }

    #[test]
    fn it_should_keep_the_record_erased_after_a_mid_block_eot() {
        let begin = LAYOUT.prog_area_begin();
        let b0 = BlockBuilder::new(begin, 0, 2).payload(&[0xEE; 256]).build();
        let b1 = BlockBuilder::new(begin + PAGE_SIZE, 1, 2)
            .payload(&[0xEF; 256])
            .build();

        let mut flash = MemFlash::new((128 << 10) as usize);
        flash.program(
            LAYOUT.prog_info_offset,
            &ProgInfo {
                prog_addr: begin,
                size: 512,
            }
            .to_page(),
        );

        let mut port = ScriptPort::new();
        port.silence();
        feed_block(&mut port, 1, &b0);
        // Two packets into block 1, then the sender declares the transfer
        // done.
        for (i, chunk) in b1.chunks(xmodem::PAYLOAD_SIZE).take(2).enumerate() {
            let mut payload = [0u8; xmodem::PAYLOAD_SIZE];
            payload.copy_from_slice(chunk);
            port.feed(&frame(5 + i as u8, &payload));
        }
        port.feed(&[EOT]);

        let mut bl = bootloader(port, flash, LAYOUT);
        assert_eq!(bl.attempt().unwrap(), None);

        // Block 0 landed, but the EOT in the middle of block 1 keeps the
        // record erased.
        let off = prog_offset(&LAYOUT, begin);
        assert_eq!(&bl.flash.data()[off..off + 256], &[0xEEu8; 256][..]);
        assert_eq!(ProgInfo::load(&bl.flash, &LAYOUT), None);
    }

    #[test]
    fn it_should_keep_the_record_erased_after_trailing_stray_packets() {
        // The whole single-block image arrives, but the sender pushes one
        // more packet before the EOT: block counts agree, yet the stray
        // packet alone must keep the record erased.
        let begin = LAYOUT.prog_area_begin();
        let block = BlockBuilder::new(begin, 0, 1).payload(&[0xE1; 256]).build();

        let mut port = ScriptPort::new();
        port.silence();
        feed_block(&mut port, 1, &block);
        port.feed(&frame(5, &[0u8; xmodem::PAYLOAD_SIZE]));
        port.feed(&[EOT]);

        let mut bl = bootloader(port, MemFlash::new((128 << 10) as usize), LAYOUT);
        assert_eq!(bl.attempt().unwrap(), None);

        let off = prog_offset(&LAYOUT, begin);
        assert_eq!(&bl.flash.data()[off..off + 256], &[0xE1u8; 256][..]);
        assert_eq!(ProgInfo::load(&bl.flash, &LAYOUT), None);
    }

    #[test]
    fn it_should_cancel_a_block_count_change_mid_transfer() {
        let begin = LAYOUT.prog_area_begin();
        let b0 = BlockBuilder::new(begin, 0, 2).payload(&[0x10; 256]).build();
        let b1 = BlockBuilder::new(begin + PAGE_SIZE, 1, 3)
            .payload(&[0x20; 256])
            .build();

        let mut port = ScriptPort::new();
        port.silence();
        feed_block(&mut port, 1, &b0);
        feed_block(&mut port, 5, &b1);

        let mut bl = bootloader(port, MemFlash::new((128 << 10) as usize), LAYOUT);
        assert_eq!(bl.attempt().unwrap(), None);

        assert_eq!(ProgInfo::load(&bl.flash, &LAYOUT), None);
        assert_eq!(*bl.xmodem.port.sent.last().unwrap(), CAN);
    }

    #[test]
    fn it_should_cancel_a_non_contiguous_target_address() {
        let begin = LAYOUT.prog_area_begin();
        let b0 = BlockBuilder::new(begin, 0, 3).payload(&[0x10; 256]).build();
        // Block 1 skips a page.
        let b1 = BlockBuilder::new(begin + 2 * PAGE_SIZE, 1, 3)
            .payload(&[0x20; 256])
            .build();

        let mut port = ScriptPort::new();
        port.silence();
        feed_block(&mut port, 1, &b0);
        feed_block(&mut port, 5, &b1);

        let mut bl = bootloader(port, MemFlash::new((128 << 10) as usize), LAYOUT);
        assert_eq!(bl.attempt().unwrap(), None);

        assert_eq!(ProgInfo::load(&bl.flash, &LAYOUT), None);
        assert_eq!(*bl.xmodem.port.sent.last().unwrap(), CAN);
    }

    #[test]
    fn it_should_cancel_a_wrong_family_id() {
        let block = BlockBuilder::new(LAYOUT.prog_area_begin(), 0, 1)
            .payload(&[0x30; 256])
            .family(0xDEAD_BEEF)
            .build();

        let mut port = ScriptPort::new();
        port.silence();
        feed_block(&mut port, 1, &block);

        let mut bl = bootloader(port, MemFlash::new((128 << 10) as usize), LAYOUT);
        assert_eq!(bl.attempt().unwrap(), None);

        assert!(bl.flash.data().iter().all(|&b| b == 0xff));
        assert_eq!(*bl.xmodem.port.sent.last().unwrap(), CAN);
    }

    #[test]
    fn it_should_cancel_a_block_not_for_main_flash() {
        let block = BlockBuilder::new(LAYOUT.prog_area_begin(), 0, 1)
            .payload(&[0x50; 256])
            .flags(uf2::FLAG_NOT_MAIN_FLASH)
            .build();

        let mut port = ScriptPort::new();
        port.silence();
        feed_block(&mut port, 1, &block);

        let mut bl = bootloader(port, MemFlash::new((128 << 10) as usize), LAYOUT);
        assert_eq!(bl.attempt().unwrap(), None);

        assert!(bl.flash.data().iter().all(|&b| b == 0xff));
        assert_eq!(*bl.xmodem.port.sent.last().unwrap(), CAN);
    }

    #[test]
    fn it_should_cancel_a_wrong_payload_size() {
        let block = BlockBuilder::new(LAYOUT.prog_area_begin(), 0, 1)
            .payload(&[0x40; 256])
            .payload_size(128)
            .build();

        let mut port = ScriptPort::new();
        port.silence();
        feed_block(&mut port, 1, &block);

        let mut bl = bootloader(port, MemFlash::new((128 << 10) as usize), LAYOUT);
        assert_eq!(bl.attempt().unwrap(), None);

        assert!(bl.flash.data().iter().all(|&b| b == 0xff));
        assert_eq!(*bl.xmodem.port.sent.last().unwrap(), CAN);
    }
}
