//! bgfs volume layout.
//!
//! ```text
//! block size 1024:  | boot | super | GDT ... | group 0 data ... | group 1 ... |
//! block size >1024: | boot+super | GDT ... | group 0 data ...  | group 1 ... |
//! ```
//!
//! The superblock always lives at byte offset 1024. `first_data_block` is 1
//! for 1 KiB blocks (block 0 is the boot block) and 0 otherwise. The group
//! descriptor table starts at the block after the superblock's block.
//!
//! Block numbers inside address arrays are 32-bit little-endian; `0` is a hole.

use bgfs_types::{
    BGFS_MAGIC, GROUP_DESC_SIZE, INODE_RECORD_SIZE, N_BLOCK_SLOTS, ParseError, SUPERBLOCK_SIZE,
    block_size_from_log, ensure_slice, read_le_u16, read_le_u32, read_le_u64, write_le_u16,
    write_le_u32, write_le_u64,
};
use serde::{Deserialize, Serialize};

// ── Superblock ──────────────────────────────────────────────────────────────

/// Mount state recorded in the superblock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FsState {
    /// Cleanly unmounted / consistent.
    Clean,
    /// Corruption was detected while mounted.
    ErrorsDetected,
}

impl FsState {
    const CLEAN: u16 = 1;
    const ERRORS: u16 = 2;

    #[must_use]
    pub fn to_raw(self) -> u16 {
        match self {
            Self::Clean => Self::CLEAN,
            Self::ErrorsDetected => Self::ERRORS,
        }
    }

    pub fn from_raw(raw: u16) -> Result<Self, ParseError> {
        match raw {
            Self::CLEAN => Ok(Self::Clean),
            Self::ERRORS => Ok(Self::ErrorsDetected),
            _ => Err(ParseError::InvalidField {
                field: "s_state",
                reason: "unknown state value",
            }),
        }
    }
}

/// Parsed superblock (1024 bytes at byte offset 1024).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Superblock {
    pub blocks_count: u32,
    pub r_blocks_count: u32,
    pub free_blocks_count: u32,
    pub first_data_block: u32,
    pub log_block_size: u32,
    /// Derived from `log_block_size`.
    pub block_size: u32,
    pub blocks_per_group: u32,
    pub mtime: u32,
    pub wtime: u32,
    pub magic: u16,
    pub state: FsState,
}

impl Superblock {
    const OFF_BLOCKS_COUNT: usize = 0x00;
    const OFF_R_BLOCKS_COUNT: usize = 0x04;
    const OFF_FREE_BLOCKS_COUNT: usize = 0x08;
    const OFF_FIRST_DATA_BLOCK: usize = 0x0C;
    const OFF_LOG_BLOCK_SIZE: usize = 0x10;
    const OFF_BLOCKS_PER_GROUP: usize = 0x14;
    const OFF_MTIME: usize = 0x18;
    const OFF_WTIME: usize = 0x1C;
    const OFF_MAGIC: usize = 0x20;
    const OFF_STATE: usize = 0x22;

    /// Byte offset of `free_blocks_count` inside the superblock region.
    pub const FREE_BLOCKS_COUNT_OFFSET: usize = Self::OFF_FREE_BLOCKS_COUNT;
    /// Byte offset of `state` inside the superblock region.
    pub const STATE_OFFSET: usize = Self::OFF_STATE;

    pub fn parse_superblock_region(region: &[u8]) -> Result<Self, ParseError> {
        if region.len() < SUPERBLOCK_SIZE {
            return Err(ParseError::InsufficientData {
                needed: SUPERBLOCK_SIZE,
                offset: 0,
                actual: region.len(),
            });
        }

        let magic = read_le_u16(region, Self::OFF_MAGIC)?;
        if magic != BGFS_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(BGFS_MAGIC),
                actual: u64::from(magic),
            });
        }

        let log_block_size = read_le_u32(region, Self::OFF_LOG_BLOCK_SIZE)?;
        let Some(block_size) = block_size_from_log(log_block_size) else {
            return Err(ParseError::InvalidField {
                field: "s_log_block_size",
                reason: "invalid shift",
            });
        };

        Ok(Self {
            blocks_count: read_le_u32(region, Self::OFF_BLOCKS_COUNT)?,
            r_blocks_count: read_le_u32(region, Self::OFF_R_BLOCKS_COUNT)?,
            free_blocks_count: read_le_u32(region, Self::OFF_FREE_BLOCKS_COUNT)?,
            first_data_block: read_le_u32(region, Self::OFF_FIRST_DATA_BLOCK)?,
            log_block_size,
            block_size,
            blocks_per_group: read_le_u32(region, Self::OFF_BLOCKS_PER_GROUP)?,
            mtime: read_le_u32(region, Self::OFF_MTIME)?,
            wtime: read_le_u32(region, Self::OFF_WTIME)?,
            magic,
            state: FsState::from_raw(read_le_u16(region, Self::OFF_STATE)?)?,
        })
    }

    /// Serialise into a superblock region. Bytes not owned by a field are
    /// left untouched.
    pub fn write_to_bytes(&self, region: &mut [u8]) -> Result<(), ParseError> {
        if region.len() < SUPERBLOCK_SIZE {
            return Err(ParseError::InsufficientData {
                needed: SUPERBLOCK_SIZE,
                offset: 0,
                actual: region.len(),
            });
        }
        write_le_u32(region, Self::OFF_BLOCKS_COUNT, self.blocks_count)?;
        write_le_u32(region, Self::OFF_R_BLOCKS_COUNT, self.r_blocks_count)?;
        write_le_u32(region, Self::OFF_FREE_BLOCKS_COUNT, self.free_blocks_count)?;
        write_le_u32(region, Self::OFF_FIRST_DATA_BLOCK, self.first_data_block)?;
        write_le_u32(region, Self::OFF_LOG_BLOCK_SIZE, self.log_block_size)?;
        write_le_u32(region, Self::OFF_BLOCKS_PER_GROUP, self.blocks_per_group)?;
        write_le_u32(region, Self::OFF_MTIME, self.mtime)?;
        write_le_u32(region, Self::OFF_WTIME, self.wtime)?;
        write_le_u16(region, Self::OFF_MAGIC, self.magic)?;
        write_le_u16(region, Self::OFF_STATE, self.state.to_raw())?;
        Ok(())
    }

    /// Validate geometry fields against each other.
    pub fn validate(&self) -> Result<(), ParseError> {
        if !(1024..=65536).contains(&self.block_size) {
            return Err(ParseError::InvalidField {
                field: "s_log_block_size",
                reason: "block size must be in 1024..=65536",
            });
        }
        if self.blocks_per_group == 0 {
            return Err(ParseError::InvalidField {
                field: "s_blocks_per_group",
                reason: "cannot be zero",
            });
        }
        if self.blocks_per_group > self.block_size.saturating_mul(8) {
            return Err(ParseError::InvalidField {
                field: "s_blocks_per_group",
                reason: "exceeds block_size * 8 (block bitmap capacity)",
            });
        }
        let expected_first = u32::from(self.block_size == 1024);
        if self.first_data_block != expected_first {
            return Err(ParseError::InvalidField {
                field: "s_first_data_block",
                reason: "must be 1 for 1K blocks and 0 otherwise",
            });
        }
        if self.blocks_count <= self.first_data_block {
            return Err(ParseError::InvalidField {
                field: "s_blocks_count",
                reason: "volume has no data blocks",
            });
        }
        if self.r_blocks_count > self.blocks_count {
            return Err(ParseError::InvalidField {
                field: "s_r_blocks_count",
                reason: "exceeds s_blocks_count",
            });
        }
        if self.free_blocks_count > self.blocks_count {
            return Err(ParseError::InvalidField {
                field: "s_free_blocks_count",
                reason: "exceeds s_blocks_count",
            });
        }
        Ok(())
    }

    /// Number of block groups covering the data region.
    #[must_use]
    pub fn group_count(&self) -> u32 {
        if self.blocks_per_group == 0 {
            return 0;
        }
        (self.blocks_count.saturating_sub(self.first_data_block)).div_ceil(self.blocks_per_group)
    }
}

// ── Group descriptor ────────────────────────────────────────────────────────

/// One 32-byte group descriptor record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupDesc {
    pub block_bitmap: u32,
    pub free_blocks_count: u32,
    pub flags: u16,
}

impl GroupDesc {
    const OFF_BLOCK_BITMAP: usize = 0x00;
    const OFF_FREE_BLOCKS_COUNT: usize = 0x04;
    const OFF_FLAGS: usize = 0x08;

    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        let record = ensure_slice(bytes, 0, GROUP_DESC_SIZE)?;
        Ok(Self {
            block_bitmap: read_le_u32(record, Self::OFF_BLOCK_BITMAP)?,
            free_blocks_count: read_le_u32(record, Self::OFF_FREE_BLOCKS_COUNT)?,
            flags: read_le_u16(record, Self::OFF_FLAGS)?,
        })
    }

    /// Serialise into a 32-byte record; the reserved tail is zeroed.
    pub fn write_to_bytes(&self, bytes: &mut [u8]) -> Result<(), ParseError> {
        if bytes.len() < GROUP_DESC_SIZE {
            return Err(ParseError::InsufficientData {
                needed: GROUP_DESC_SIZE,
                offset: 0,
                actual: bytes.len(),
            });
        }
        bytes[..GROUP_DESC_SIZE].fill(0);
        write_le_u32(bytes, Self::OFF_BLOCK_BITMAP, self.block_bitmap)?;
        write_le_u32(bytes, Self::OFF_FREE_BLOCKS_COUNT, self.free_blocks_count)?;
        write_le_u16(bytes, Self::OFF_FLAGS, self.flags)?;
        Ok(())
    }
}

/// Number of descriptor records held by one block.
#[must_use]
pub fn descs_per_block(block_size: u32) -> u32 {
    // GROUP_DESC_SIZE is 32, which always fits.
    #[expect(clippy::cast_possible_truncation)]
    let desc = GROUP_DESC_SIZE as u32;
    block_size / desc
}

// ── Inode record ────────────────────────────────────────────────────────────

/// On-disk inode record (128 bytes).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeRecord {
    pub mode: u16,
    pub links_count: u16,
    pub size: u64,
    pub mtime: u32,
    /// Blocks in use, counted in filesystem blocks (data + address blocks).
    pub blocks: u32,
    /// 12 direct pointers, then single, double and triple indirect roots.
    pub block: [u32; N_BLOCK_SLOTS],
}

impl InodeRecord {
    const OFF_MODE: usize = 0x00;
    const OFF_LINKS: usize = 0x02;
    const OFF_SIZE: usize = 0x04;
    const OFF_MTIME: usize = 0x0C;
    const OFF_BLOCKS: usize = 0x10;
    const OFF_BLOCK: usize = 0x14;

    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        let record = ensure_slice(bytes, 0, INODE_RECORD_SIZE)?;
        let mut block = [0_u32; N_BLOCK_SLOTS];
        for (i, slot) in block.iter_mut().enumerate() {
            *slot = read_le_u32(record, Self::OFF_BLOCK + i * 4)?;
        }
        Ok(Self {
            mode: read_le_u16(record, Self::OFF_MODE)?,
            links_count: read_le_u16(record, Self::OFF_LINKS)?,
            size: read_le_u64(record, Self::OFF_SIZE)?,
            mtime: read_le_u32(record, Self::OFF_MTIME)?,
            blocks: read_le_u32(record, Self::OFF_BLOCKS)?,
            block,
        })
    }

    pub fn write_to_bytes(&self, bytes: &mut [u8]) -> Result<(), ParseError> {
        if bytes.len() < INODE_RECORD_SIZE {
            return Err(ParseError::InsufficientData {
                needed: INODE_RECORD_SIZE,
                offset: 0,
                actual: bytes.len(),
            });
        }
        bytes[..INODE_RECORD_SIZE].fill(0);
        write_le_u16(bytes, Self::OFF_MODE, self.mode)?;
        write_le_u16(bytes, Self::OFF_LINKS, self.links_count)?;
        write_le_u64(bytes, Self::OFF_SIZE, self.size)?;
        write_le_u32(bytes, Self::OFF_MTIME, self.mtime)?;
        write_le_u32(bytes, Self::OFF_BLOCKS, self.blocks)?;
        for (i, slot) in self.block.iter().enumerate() {
            write_le_u32(bytes, Self::OFF_BLOCK + i * 4, *slot)?;
        }
        Ok(())
    }
}

// ── Address blocks ──────────────────────────────────────────────────────────

/// Read pointer `index` from an address block.
pub fn read_address_slot(block: &[u8], index: usize) -> Result<u32, ParseError> {
    let offset = index.checked_mul(4).ok_or(ParseError::InvalidField {
        field: "address_slot",
        reason: "index overflow",
    })?;
    read_le_u32(block, offset)
}

/// Write pointer `index` into an address block.
pub fn write_address_slot(block: &mut [u8], index: usize, value: u32) -> Result<(), ParseError> {
    let offset = index.checked_mul(4).ok_or(ParseError::InvalidField {
        field: "address_slot",
        reason: "index overflow",
    })?;
    write_le_u32(block, offset, value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_superblock() -> Superblock {
        Superblock {
            blocks_count: 8193,
            r_blocks_count: 400,
            free_blocks_count: 8000,
            first_data_block: 1,
            log_block_size: 0,
            block_size: 1024,
            blocks_per_group: 1024,
            mtime: 11,
            wtime: 12,
            magic: BGFS_MAGIC,
            state: FsState::Clean,
        }
    }

    #[test]
    fn superblock_field_offsets_are_stable() {
        let sb = sample_superblock();
        let mut region = vec![0_u8; SUPERBLOCK_SIZE];
        sb.write_to_bytes(&mut region).expect("write");

        assert_eq!(read_le_u32(&region, 0x00).unwrap(), 8193);
        assert_eq!(read_le_u32(&region, 0x08).unwrap(), 8000);
        assert_eq!(read_le_u32(&region, 0x14).unwrap(), 1024);
        assert_eq!(read_le_u16(&region, 0x20).unwrap(), BGFS_MAGIC);
        assert_eq!(read_le_u16(&region, 0x22).unwrap(), 1);

        let parsed = Superblock::parse_superblock_region(&region).expect("parse");
        assert_eq!(parsed, sb);
        parsed.validate().expect("valid");
        assert_eq!(parsed.group_count(), 8);
    }

    #[test]
    fn superblock_rejects_bad_magic() {
        let region = vec![0_u8; SUPERBLOCK_SIZE];
        let err = Superblock::parse_superblock_region(&region).expect_err("magic");
        assert!(matches!(err, ParseError::InvalidMagic { .. }));
    }

    #[test]
    fn superblock_rejects_short_region() {
        let err = Superblock::parse_superblock_region(&[0_u8; 100]).expect_err("short");
        assert!(matches!(err, ParseError::InsufficientData { .. }));
    }

    #[test]
    fn superblock_validate_catches_geometry_errors() {
        let mut sb = sample_superblock();
        sb.blocks_per_group = 0;
        assert!(sb.validate().is_err());

        let mut sb = sample_superblock();
        sb.blocks_per_group = 1024 * 8 + 1;
        assert!(sb.validate().is_err());

        let mut sb = sample_superblock();
        sb.first_data_block = 0;
        assert!(sb.validate().is_err());

        let mut sb = sample_superblock();
        sb.r_blocks_count = sb.blocks_count + 1;
        assert!(sb.validate().is_err());
    }

    #[test]
    fn last_group_may_be_short() {
        let mut sb = sample_superblock();
        sb.blocks_count = 1 + 1024 * 2 + 10;
        assert_eq!(sb.group_count(), 3);
    }

    #[test]
    fn group_desc_layout() {
        let gd = GroupDesc {
            block_bitmap: 0x0102_0304,
            free_blocks_count: 777,
            flags: 0,
        };
        let mut bytes = vec![0xAA_u8; GROUP_DESC_SIZE];
        gd.write_to_bytes(&mut bytes).expect("write");
        assert_eq!(&bytes[0..4], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(read_le_u32(&bytes, 4).unwrap(), 777);
        assert!(bytes[10..].iter().all(|b| *b == 0));
        assert_eq!(GroupDesc::parse_from_bytes(&bytes).expect("parse"), gd);
        assert_eq!(descs_per_block(1024), 32);
    }

    #[test]
    fn inode_record_block_array_layout() {
        let mut block = [0_u32; N_BLOCK_SLOTS];
        for (i, slot) in block.iter_mut().enumerate() {
            *slot = 100 + u32::try_from(i).unwrap();
        }
        let rec = InodeRecord {
            mode: bgfs_types::S_IFREG | 0o644,
            links_count: 1,
            size: 5000,
            mtime: 99,
            blocks: 6,
            block,
        };
        let mut bytes = vec![0_u8; INODE_RECORD_SIZE];
        rec.write_to_bytes(&mut bytes).expect("write");
        assert_eq!(read_le_u32(&bytes, 0x14).unwrap(), 100);
        assert_eq!(read_le_u32(&bytes, 0x14 + 14 * 4).unwrap(), 114);
        assert_eq!(InodeRecord::parse_from_bytes(&bytes).expect("parse"), rec);
    }

    #[test]
    fn address_slots() {
        let mut block = vec![0_u8; 1024];
        write_address_slot(&mut block, 255, 42).expect("write");
        assert_eq!(read_address_slot(&block, 255).unwrap(), 42);
        assert!(read_address_slot(&block, 256).is_err());
    }
}
