#![forbid(unsafe_code)]
//! On-disk format codecs for bgfs volumes.
//!
//! Pure parsing crate with no I/O. Parses byte slices into the
//! superblock, the packed group descriptor records, and inode records with
//! their 15-slot block address array, and serialises them back bit-exactly.

pub mod layout;

pub use layout::{
    FsState, GroupDesc, InodeRecord, Superblock, descs_per_block, read_address_slot,
    write_address_slot,
};
