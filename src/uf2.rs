//! The UF2 firmware-image container format.
//!
//! A UF2 file is a sequence of fixed-size 512-byte blocks, each carrying
//! one flash page of payload plus enough addressing metadata that a
//! receiver can validate and commit the image block by block, in order,
//! without ever holding more than one block in memory.

use std::io::{self, Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt};
use thiserror::Error;

/// Size of one block on the wire.
pub const BLOCK_SIZE: usize = 512;

/// First magic word; spells "UF2\n" in little endian.
pub const MAGIC_START0: u32 = 0x0A32_4655;
/// Second magic word
pub const MAGIC_START1: u32 = 0x9E5D_5157;
/// Final magic word
pub const MAGIC_END: u32 = 0x0AB1_6F30;

/// The block carries metadata only and must not be written to flash.
pub const FLAG_NOT_MAIN_FLASH: u32 = 0x0000_0001;
/// `file_size` carries a device family id instead of a byte count.
pub const FLAG_FAMILY_ID_PRESENT: u32 = 0x0000_2000;

/// Family id of the device this bootloader is built for.
pub const RP2040_FAMILY_ID: u32 = 0xE48B_FF56;

/// Size of the payload region inside a block.
pub const DATA_AREA: usize = 476;

/// One decoded block.
#[derive(Debug, Clone)]
pub struct Block {
    pub flags: u32,
    /// Absolute address the payload is destined for.
    pub target_addr: u32,
    /// Number of meaningful bytes at the start of `data`.
    pub payload_size: u32,
    /// Position of this block in the image, counted from 0.
    pub block_no: u32,
    /// Total number of blocks in the image.
    pub num_blocks: u32,
    /// Size of the overall file, or a family id when
    /// [`FLAG_FAMILY_ID_PRESENT`] is set.
    pub file_size: u32,
    /// The payload region; only the first `payload_size` bytes matter.
    pub data: [u8; DATA_AREA],
}

/// Structural errors raised while decoding a block.
#[derive(Error, Debug)]
pub enum BlockError {
    #[error("The start magic values are invalid: {0:#010x} {1:#010x}")]
    InvalidStartMagic(u32, u32),

    #[error("The end magic value is invalid: {0:#010x}")]
    InvalidEndMagic(u32),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Block {
    /// Decodes one block from its 512-byte wire form.
    ///
    /// Only the container structure is judged here; whether the block is
    /// acceptable for this device and this transfer is the caller's call.
    pub fn from_bytes(buf: &[u8; BLOCK_SIZE]) -> Result<Block, BlockError> {
        let mut cursor = Cursor::new(&buf[..]);

        // Read and check both start magic words
        let magic_start0 = cursor.read_u32::<LittleEndian>()?;
        let magic_start1 = cursor.read_u32::<LittleEndian>()?;

        if magic_start0 != MAGIC_START0 || magic_start1 != MAGIC_START1 {
            return Err(BlockError::InvalidStartMagic(magic_start0, magic_start1));
        }

        // Read the addressing metadata
        let flags = cursor.read_u32::<LittleEndian>()?;
        let target_addr = cursor.read_u32::<LittleEndian>()?;
        let payload_size = cursor.read_u32::<LittleEndian>()?;
        let block_no = cursor.read_u32::<LittleEndian>()?;
        let num_blocks = cursor.read_u32::<LittleEndian>()?;
        let file_size = cursor.read_u32::<LittleEndian>()?;

        // Read the payload region
        let mut data = [0u8; DATA_AREA];
        cursor.read_exact(&mut data)?;

        // Read and check the end magic word
        let magic_end = cursor.read_u32::<LittleEndian>()?;

        if magic_end != MAGIC_END {
            return Err(BlockError::InvalidEndMagic(magic_end));
        }

        Ok(Block {
            flags,
            target_addr,
            payload_size,
            block_no,
            num_blocks,
            file_size,
            data,
        })
    }

    /// Whether `file_size` is to be read as a family id.
    pub fn has_family_id(&self) -> bool {
        self.flags & FLAG_FAMILY_ID_PRESENT != 0
    }
}
