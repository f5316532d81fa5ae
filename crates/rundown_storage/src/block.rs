//! On-page layout of database blocks.
//!
//! ```text
//! +---------+-------+-----+------+----------------+
//! | version | level | pad | used | commit counter |   block header (16 bytes)
//! |   u16   |  u8   | u8  | u32  |      u64       |
//! +---------+-------+-----+------+----------------+
//! | size u16 | cmpc u8 | pad u8 | payload ...     |   record (repeated)
//! +----------+---------+--------+-----------------+
//! ```
//!
//! All integers are little-endian. A block pointer inside a record is a
//! 4-byte block number. While a multi-region commit is in flight, pointer
//! slots whose block numbers are not yet known hold a [`ChainLink`] instead.
//!
//! Local bitmap pages use the same header followed by two bits per block.

/// Size of the block header.
pub const BLOCK_HEADER_SIZE: u32 = 16;

/// Size of a record header.
pub const RECORD_HEADER_SIZE: u32 = 4;

/// Size of an on-page block number.
pub const BLOCK_ID_SIZE: u32 = 4;

/// Current block version.
pub const BLOCK_VERSION: u16 = 2;

/// Decoded block header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockHeader {
    /// Layout version.
    pub version: u16,
    /// Tree level (0 for leaves and bitmaps).
    pub level: u8,
    /// Bytes in use, header included.
    pub used: u32,
    /// Commit counter of the last change.
    pub commit_counter: u64,
}

impl BlockHeader {
    /// Reads the header at the start of `page`.
    #[must_use]
    pub fn read(page: &[u8]) -> Option<Self> {
        let raw = page.get(..BLOCK_HEADER_SIZE as usize)?;
        Some(Self {
            version: u16::from_le_bytes([raw[0], raw[1]]),
            level: raw[2],
            used: u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]),
            commit_counter: u64::from_le_bytes(raw[8..16].try_into().ok()?),
        })
    }

    /// Writes the header at the start of `page`.
    pub fn write(&self, page: &mut [u8]) -> bool {
        let Some(raw) = page.get_mut(..BLOCK_HEADER_SIZE as usize) else {
            return false;
        };
        raw[0..2].copy_from_slice(&self.version.to_le_bytes());
        raw[2] = self.level;
        raw[3] = 0;
        raw[4..8].copy_from_slice(&self.used.to_le_bytes());
        raw[8..16].copy_from_slice(&self.commit_counter.to_le_bytes());
        true
    }
}

/// Declared used size of `page`, or 0 if the header does not fit.
#[must_use]
pub fn used_size(page: &[u8]) -> u32 {
    BlockHeader::read(page).map_or(0, |h| h.used)
}

/// Overwrites the commit counter in the header of `page`.
pub fn set_commit_counter(page: &mut [u8], counter: u64) -> bool {
    match page.get_mut(8..16) {
        Some(raw) => {
            raw.copy_from_slice(&counter.to_le_bytes());
            true
        }
        None => false,
    }
}

/// Reads the 4-byte word at `off`.
#[must_use]
pub fn read_word(page: &[u8], off: u32) -> Option<u32> {
    let off = off as usize;
    let raw = page.get(off..off.checked_add(BLOCK_ID_SIZE as usize)?)?;
    Some(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
}

/// Writes the 4-byte word `value` at `off`.
pub fn write_word(page: &mut [u8], off: u32, value: u32) -> bool {
    let off = off as usize;
    let Some(end) = off.checked_add(BLOCK_ID_SIZE as usize) else {
        return false;
    };
    match page.get_mut(off..end) {
        Some(raw) => {
            raw.copy_from_slice(&value.to_le_bytes());
            true
        }
        None => false,
    }
}

/// Placeholder written into a pointer slot whose target block is created by
/// a later element of the same multi-region commit.
///
/// Links form a chain through the page: `next_off` is the distance from this
/// link to the next one, 0 ending the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainLink {
    /// Set on every valid link.
    pub flag: bool,
    /// Position of the element that creates the target block.
    pub index: u16,
    /// Distance to the next link, or 0.
    pub next_off: u16,
}

impl ChainLink {
    /// Largest encodable element index.
    pub const MAX_INDEX: u16 = 0x7fff;

    /// Packs the link into a pointer-sized word.
    #[must_use]
    pub const fn encode(self) -> u32 {
        ((self.flag as u32) << 31)
            | (((self.index & Self::MAX_INDEX) as u32) << 16)
            | self.next_off as u32
    }

    /// Unpacks a pointer-sized word.
    #[must_use]
    pub const fn decode(word: u32) -> Self {
        Self {
            flag: word >> 31 == 1,
            index: ((word >> 16) as u16) & Self::MAX_INDEX,
            next_off: word as u16,
        }
    }
}

/// Local bitmap encoding: two bits per block.
pub mod bitmap {
    use super::BLOCK_HEADER_SIZE;

    /// Block is in use.
    pub const BUSY: u8 = 0b00;
    /// Block was never used.
    pub const FREE: u8 = 0b01;
    /// Block was used and freed.
    pub const RECYCLED: u8 = 0b11;

    /// Marker bit in an update-list entry asking for the block to be freed.
    pub const FREE_REQUEST: u32 = 1 << 31;

    /// Bytes needed for the bits of `blocks` blocks, header excluded.
    #[must_use]
    pub const fn bits_len(blocks: u32) -> u32 {
        ((blocks as u64 + 3) >> 2) as u32
    }

    /// State of block `bit` in `page`.
    #[must_use]
    pub fn get(page: &[u8], bit: u32) -> Option<u8> {
        let byte = page.get((BLOCK_HEADER_SIZE + (bit >> 2)) as usize)?;
        Some((byte >> ((bit & 3) << 1)) & 0b11)
    }

    /// Sets block `bit` in `page` to `state`.
    pub fn set(page: &mut [u8], bit: u32, state: u8) -> bool {
        let Some(byte) = page.get_mut((BLOCK_HEADER_SIZE + (bit >> 2)) as usize) else {
            return false;
        };
        let shift = (bit & 3) << 1;
        *byte = (*byte & !(0b11 << shift)) | ((state & 0b11) << shift);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout() {
        let mut page = [0u8; 64];
        let header = BlockHeader {
            version: BLOCK_VERSION,
            level: 1,
            used: 40,
            commit_counter: 99,
        };
        assert!(header.write(&mut page));
        assert_eq!(BlockHeader::read(&page), Some(header));
        assert_eq!(used_size(&page), 40);
        assert!(set_commit_counter(&mut page, 100));
        assert_eq!(BlockHeader::read(&page).unwrap().commit_counter, 100);
    }

    #[test]
    fn short_page_has_no_header() {
        assert_eq!(BlockHeader::read(&[0u8; 15]), None);
        assert_eq!(used_size(&[0u8; 3]), 0);
    }

    #[test]
    fn word_access_is_bounded() {
        let mut page = [0u8; 8];
        assert!(write_word(&mut page, 4, 0xdead_beef));
        assert_eq!(read_word(&page, 4), Some(0xdead_beef));
        assert!(!write_word(&mut page, 5, 1));
        assert_eq!(read_word(&page, 5), None);
    }

    #[test]
    fn chain_link_packing() {
        let link = ChainLink {
            flag: true,
            index: 3,
            next_off: 24,
        };
        let word = link.encode();
        assert_eq!(word, 0x8003_0018);
        assert_eq!(ChainLink::decode(word), link);
        assert!(!ChainLink::decode(7).flag);
    }

    #[test]
    fn bits_len_covers_every_map_size() {
        assert_eq!(bitmap::bits_len(0), 0);
        assert_eq!(bitmap::bits_len(5), 2);
        assert_eq!(bitmap::bits_len(u32::MAX), 1 << 30);
    }

    #[test]
    fn bitmap_bits() {
        let mut page = [0u8; 32];
        assert!(bitmap::set(&mut page, 5, bitmap::FREE));
        assert!(bitmap::set(&mut page, 6, bitmap::RECYCLED));
        assert_eq!(bitmap::get(&page, 5), Some(bitmap::FREE));
        assert_eq!(bitmap::get(&page, 6), Some(bitmap::RECYCLED));
        assert_eq!(bitmap::get(&page, 4), Some(bitmap::BUSY));
        assert_eq!(bitmap::bits_len(5), 2);
    }
}
