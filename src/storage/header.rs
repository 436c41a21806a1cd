//! # Tree-File Header
//!
//! The first 16 bytes of the `.tree` file hold the file header: two
//! little-endian 64-bit words that anchor everything else in the pair of
//! files.
//!
//! ```text
//! Offset  Size  Field       Description
//! ------  ----  ----------  -------------------------------------------
//! 0       8     node_count  Count of ever-allocated node slots
//! 8       8     root_pos    Slot index of the root, or NO_NODE if empty
//! ```
//!
//! `node_count` only grows: slots are allocated by incrementing it and are
//! never freed. `root_pos` is `NO_NODE` (`u64::MAX`) exactly when the tree
//! holds no keys. Node slots follow the header contiguously, indexed by
//! their `self_pos`.
//!
//! There is no magic or version word — the header layout is fixed by the
//! file format and the full 16 bytes are load-bearing.

use eyre::{ensure, Result};
use zerocopy::little_endian::U64;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Byte size of the header at the start of the `.tree` file.
pub const TREE_HEADER_SIZE: usize = 16;

/// Sentinel slot index meaning "no node": the root of an empty tree.
pub const NO_NODE: u64 = u64::MAX;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct TreeFileHeader {
    node_count: U64,
    root_pos: U64,
}

const _: () = assert!(std::mem::size_of::<TreeFileHeader>() == TREE_HEADER_SIZE);

impl TreeFileHeader {
    pub fn new(node_count: u64, root_pos: u64) -> Self {
        Self {
            node_count: U64::new(node_count),
            root_pos: U64::new(root_pos),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<&Self> {
        ensure!(
            bytes.len() >= TREE_HEADER_SIZE,
            "buffer too small for TreeFileHeader: {} < {}",
            bytes.len(),
            TREE_HEADER_SIZE
        );

        Self::ref_from_bytes(&bytes[..TREE_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse TreeFileHeader: {:?}", e))
    }

    pub fn node_count(&self) -> u64 {
        self.node_count.get()
    }

    pub fn root_pos(&self) -> u64 {
        self.root_pos.get()
    }
}
