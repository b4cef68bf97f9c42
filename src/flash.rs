//! Flash geometry, the flash-access seam and the program-info record.

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt};
use log::debug;

/// Smallest erase unit.
pub const SECTOR_SIZE: u32 = 4096;
/// Smallest program unit.
pub const PAGE_SIZE: u32 = 256;
/// Bytes of second-stage loader at the very start of any flash image.
pub const BOOT2_SIZE: u32 = 256;

/// Where the bootloader reservation, the program area and the program-info
/// record sit in the XIP-mapped flash.
///
/// This is a value rather than a set of constants so test geometries can
/// shrink the flash or drop the bootloader reservation to zero, which
/// routes first-block commits through the boot-sector preservation path.
#[derive(Debug, Copy, Clone)]
pub struct Layout {
    /// Address at which flash is mapped for execute-in-place.
    pub xip_base: u32,
    /// Total flash size in bytes.
    pub flash_size: u32,
    /// Bytes reserved at the start of flash for the bootloader itself.
    pub bl_size: u32,
    /// Offset of the program-info page, relative to `xip_base`. Must be
    /// sector aligned and outside the program area.
    pub prog_info_offset: u32,
}

/// The reference geometry: 2 MB of flash mapped at 0x10000000, a 64 kB
/// bootloader reservation, the program-info record in the reservation's
/// last sector.
pub const RP2040_LAYOUT: Layout = Layout {
    xip_base: 0x1000_0000,
    flash_size: 2 << 20,
    bl_size: 64 << 10,
    prog_info_offset: (64 << 10) - SECTOR_SIZE,
};

impl Layout {
    /// First address user programs may occupy.
    pub fn prog_area_begin(&self) -> u32 {
        self.xip_base + self.bl_size
    }

    /// One past the last address user programs may occupy.
    pub fn prog_area_end(&self) -> u32 {
        self.xip_base + self.flash_size
    }

    /// Index of the sector containing `addr`.
    pub fn sector_index(&self, addr: u32) -> u32 {
        (addr - self.xip_base) / SECTOR_SIZE
    }
}

/// Sector-erase/page-program access to the flash.
///
/// Offsets are relative to the XIP base. On the target these calls map
/// straight onto the flash driver; [`MemFlash`] provides the same interface
/// over RAM for host runs and tests.
pub trait FlashIo {
    /// Erases `len` bytes starting at `offset`; both must be sector
    /// aligned.
    fn erase(&mut self, offset: u32, len: u32);

    /// Programs `data` starting at the page-aligned `offset`.
    fn program(&mut self, offset: u32, data: &[u8]);

    /// Reads flash contents into `buf`.
    fn read(&self, offset: u32, buf: &mut [u8]);
}

/// The program-info record: the single durable marker that a user program
/// is installed. Stored as the first two words of its own flash page.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ProgInfo {
    /// Absolute address the installed image starts at.
    pub prog_addr: u32,
    /// Length of the installed image in bytes.
    pub size: u32,
}

impl ProgInfo {
    /// Loads the record from its flash page.
    ///
    /// Returns `None` unless the stored words describe a program inside the
    /// program area; an erased page (all ones) and a zeroed one both fail
    /// that test.
    pub fn load<F: FlashIo>(flash: &F, layout: &Layout) -> Option<ProgInfo> {
        let mut words = [0u8; 8];
        flash.read(layout.prog_info_offset, &mut words);

        let mut cursor = Cursor::new(&words[..]);
        let prog_addr = cursor.read_u32::<LittleEndian>().ok()?;
        let size = cursor.read_u32::<LittleEndian>().ok()?;

        let info = ProgInfo { prog_addr, size };

        if info.is_valid(layout) {
            Some(info)
        } else {
            None
        }
    }

    /// Whether the record describes an installed program under `layout`.
    pub fn is_valid(&self, layout: &Layout) -> bool {
        if self.prog_addr < layout.prog_area_begin() || self.prog_addr >= layout.prog_area_end() {
            return false;
        }
        if self.size == 0 || self.size == 0xffff_ffff {
            return false;
        }

        true
    }

    /// Renders the record as the full page that gets programmed on commit.
    pub fn to_page(&self) -> [u8; PAGE_SIZE as usize] {
        let mut page = [0u8; PAGE_SIZE as usize];

        page[0..4].copy_from_slice(&self.prog_addr.to_le_bytes());
        page[4..8].copy_from_slice(&self.size.to_le_bytes());

        page
    }
}

/// RAM-backed flash with erased-state semantics, for host runs and tests.
pub struct MemFlash {
    data: Vec<u8>,
}

impl MemFlash {
    /// A fully erased flash of `size` bytes.
    pub fn new(size: usize) -> MemFlash {
        MemFlash {
            data: vec![0xff; size],
        }
    }

    /// Wraps existing flash contents, e.g. loaded from an image file.
    pub fn from_vec(data: Vec<u8>) -> MemFlash {
        MemFlash { data }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

impl FlashIo for MemFlash {
    fn erase(&mut self, offset: u32, len: u32) {
        debug!("flash erase {:#x}..{:#x}", offset, offset + len);

        let offset = offset as usize;
        for byte in &mut self.data[offset..offset + len as usize] {
            *byte = 0xff;
        }
    }

    fn program(&mut self, offset: u32, data: &[u8]) {
        debug!("flash program {:#x} len {}", offset, data.len());

        let offset = offset as usize;
        self.data[offset..offset + data.len()].copy_from_slice(data);
    }

    fn read(&self, offset: u32, buf: &mut [u8]) {
        let offset = offset as usize;
        buf.copy_from_slice(&self.data[offset..offset + buf.len()]);
    }
}
