//! Page builders used while replaying commit elements.
//!
//! The sweep never interprets update records itself. It hands them to a
//! [`BlockBuilder`] (ordinary blocks) or a [`BitmapBuilder`] (local bitmaps)
//! together with a page that has already been probed writable for one full
//! block. Builders must stay inside the slices they are given and must not
//! allocate.

use rundown_storage::block::{self, bitmap, BlockHeader, BLOCK_HEADER_SIZE, RECORD_HEADER_SIZE};

/// Input to [`BlockBuilder::build`].
#[derive(Debug, Clone, Copy)]
pub struct BuildInput<'a> {
    /// Block being built.
    pub block: u32,
    /// Tree level of the block.
    pub level: u8,
    /// Update records.
    pub update: &'a [u8],
    /// Commit counter to stamp into the header.
    pub commit_counter: u64,
}

/// Builds a block image from update records.
pub trait BlockBuilder {
    /// Writes the block into `page`. Returns false if the records do not
    /// describe a block that fits.
    fn build(&self, input: &BuildInput<'_>, page: &mut [u8]) -> bool;
}

/// Input to [`BitmapBuilder::rebuild`].
#[derive(Debug, Clone, Copy)]
pub struct BitmapInput<'a> {
    /// Block-list of the bitmap update.
    pub list: &'a [u8],
    /// Commit counter to stamp into the header.
    pub commit_counter: u64,
    /// Blocks covered by the map.
    pub map_blocks: u32,
}

/// Applies a block-list to a bitmap page.
pub trait BitmapBuilder {
    /// Applies `input.list` to `page`, which already holds the before-image,
    /// and stores the net number of blocks taken from the free count into
    /// `reference_delta`. Returns false on a malformed list.
    fn rebuild(&self, input: &BitmapInput<'_>, page: &mut [u8], reference_delta: &mut i32)
        -> bool;
}

/// [`BlockBuilder`] for length-prefixed record lists.
///
/// The update is a sequence of `(len: u16, payload)` entries. Each becomes a
/// record with a 4-byte record header `(size: u16, cmpc: u8, pad: u8)`
/// where `size` counts the header.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecordBlockBuilder;

impl BlockBuilder for RecordBlockBuilder {
    fn build(&self, input: &BuildInput<'_>, page: &mut [u8]) -> bool {
        let mut src = input.update;
        let mut used = BLOCK_HEADER_SIZE as usize;
        if page.len() < used {
            return false;
        }
        while !src.is_empty() {
            let Some((len, rest)) = src.split_first_chunk::<2>() else {
                return false;
            };
            let len = usize::from(u16::from_le_bytes(*len));
            let Some(payload) = rest.get(..len) else {
                return false;
            };
            let size = RECORD_HEADER_SIZE as usize + len;
            let Ok(size16) = u16::try_from(size) else {
                return false;
            };
            let Some(dst) = page.get_mut(used..used + size) else {
                return false;
            };
            dst[..2].copy_from_slice(&size16.to_le_bytes());
            dst[2] = 0;
            dst[3] = 0;
            dst[RECORD_HEADER_SIZE as usize..].copy_from_slice(payload);
            used += size;
            src = &rest[len..];
        }
        page[used..].fill(0);
        let header = BlockHeader {
            version: block::BLOCK_VERSION,
            level: input.level,
            used: used as u32,
            commit_counter: input.commit_counter,
        };
        header.write(page)
    }
}

/// [`BitmapBuilder`] for two-bit local maps.
///
/// The list is a sequence of little-endian `u32` entries, ended by a zero
/// entry or by the end of the slice. An entry names a block relative to the
/// map; [`bitmap::FREE_REQUEST`] asks for it to be freed, otherwise it is
/// marked busy.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalMapBuilder;

impl BitmapBuilder for LocalMapBuilder {
    fn rebuild(
        &self,
        input: &BitmapInput<'_>,
        page: &mut [u8],
        reference_delta: &mut i32,
    ) -> bool {
        let bits_end = BLOCK_HEADER_SIZE + bitmap::bits_len(input.map_blocks);
        if (page.len() as u64) < u64::from(bits_end) {
            return false;
        }
        let mut delta = 0_i32;
        for raw in input.list.chunks(4) {
            let Ok(raw) = <[u8; 4]>::try_from(raw) else {
                return false;
            };
            let entry = u32::from_le_bytes(raw);
            if entry == 0 {
                break;
            }
            let bit = entry & !bitmap::FREE_REQUEST;
            if bit >= input.map_blocks {
                return false;
            }
            let Some(state) = bitmap::get(page, bit) else {
                return false;
            };
            if entry & bitmap::FREE_REQUEST != 0 {
                if state == bitmap::BUSY {
                    bitmap::set(page, bit, bitmap::RECYCLED);
                    delta -= 1;
                }
            } else if state != bitmap::BUSY {
                bitmap::set(page, bit, bitmap::BUSY);
                delta += 1;
            }
        }
        *reference_delta = delta;
        let header = BlockHeader {
            version: block::BLOCK_VERSION,
            level: 0,
            used: bits_end,
            commit_counter: input.commit_counter,
        };
        header.write(page)
    }
}

/// Encodes records in the format [`RecordBlockBuilder`] reads.
#[must_use]
pub fn encode_records(records: &[&[u8]]) -> Vec<u8> {
    let mut out = Vec::new();
    for record in records {
        out.extend_from_slice(&(record.len() as u16).to_le_bytes());
        out.extend_from_slice(record);
    }
    out
}

/// Encodes a bitmap block-list in the format [`LocalMapBuilder`] reads.
#[must_use]
pub fn encode_block_list(busy: &[u32], free: &[u32]) -> Vec<u8> {
    let mut out = Vec::new();
    for &bit in busy {
        out.extend_from_slice(&bit.to_le_bytes());
    }
    for &bit in free {
        out.extend_from_slice(&(bit | bitmap::FREE_REQUEST).to_le_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn builds_header_and_records() {
        let update = encode_records(&[b"abc", b"\x01\x02\x03\x04\x05\x06\x07\x08"]);
        let mut page = vec![0xffu8; 64];
        let input = BuildInput {
            block: 9,
            level: 1,
            update: &update,
            commit_counter: 41,
        };
        assert!(RecordBlockBuilder.build(&input, &mut page));
        let header = BlockHeader::read(&page).unwrap();
        assert_eq!(header.level, 1);
        assert_eq!(header.commit_counter, 41);
        assert_eq!(header.used, 16 + 7 + 12);
        assert_eq!(&page[16..18], &7u16.to_le_bytes());
        assert_eq!(&page[20..23], b"abc");
        assert!(page[header.used as usize..].iter().all(|&b| b == 0));
    }

    #[test]
    fn empty_update_builds_bare_header() {
        let mut page = vec![0u8; 32];
        let input = BuildInput {
            block: 1,
            level: 0,
            update: &[],
            commit_counter: 1,
        };
        assert!(RecordBlockBuilder.build(&input, &mut page));
        assert_eq!(block::used_size(&page), BLOCK_HEADER_SIZE);
    }

    #[test]
    fn overflowing_update_is_rejected() {
        let update = encode_records(&[&[0u8; 40]]);
        let mut page = vec![0u8; 32];
        let input = BuildInput {
            block: 1,
            level: 0,
            update: &update,
            commit_counter: 1,
        };
        assert!(!RecordBlockBuilder.build(&input, &mut page));
    }

    #[test]
    fn truncated_update_is_rejected() {
        let mut update = encode_records(&[b"abcdef"]);
        update.truncate(5);
        let mut page = vec![0u8; 64];
        let input = BuildInput {
            block: 1,
            level: 0,
            update: &update,
            commit_counter: 1,
        };
        assert!(!RecordBlockBuilder.build(&input, &mut page));
    }

    #[test]
    fn bitmap_marks_and_counts() {
        let mut page = vec![0u8; 64];
        bitmap::set(&mut page, 3, bitmap::FREE);
        bitmap::set(&mut page, 4, bitmap::FREE);
        let list = encode_block_list(&[3, 4], &[5]);
        let mut delta = 99;
        let input = BitmapInput {
            list: &list,
            commit_counter: 12,
            map_blocks: 16,
        };
        assert!(LocalMapBuilder.rebuild(&input, &mut page, &mut delta));
        assert_eq!(delta, 1);
        assert_eq!(bitmap::get(&page, 3), Some(bitmap::BUSY));
        assert_eq!(bitmap::get(&page, 5), Some(bitmap::RECYCLED));
        assert_eq!(BlockHeader::read(&page).unwrap().commit_counter, 12);
    }

    #[test]
    fn bitmap_rejects_out_of_map_block() {
        let mut page = vec![0u8; 64];
        let list = encode_block_list(&[40], &[]);
        let mut delta = 0;
        let input = BitmapInput {
            list: &list,
            commit_counter: 1,
            map_blocks: 16,
        };
        assert!(!LocalMapBuilder.rebuild(&input, &mut page, &mut delta));
    }

    proptest! {
        #[test]
        fn bitmap_delta_matches_state_changes(
            busy in proptest::collection::vec(1u32..64, 0..16),
            free in proptest::collection::vec(1u32..64, 0..16),
        ) {
            let mut page = vec![0u8; 64];
            for bit in 0..64 {
                bitmap::set(&mut page, bit, bitmap::FREE);
            }
            let before = (0..64).filter(|&b| bitmap::get(&page, b) == Some(bitmap::BUSY)).count() as i32;
            let list = encode_block_list(&busy, &free);
            let mut delta = 0;
            let input = BitmapInput { list: &list, commit_counter: 1, map_blocks: 64 };
            prop_assert!(LocalMapBuilder.rebuild(&input, &mut page, &mut delta));
            let after = (0..64).filter(|&b| bitmap::get(&page, b) == Some(bitmap::BUSY)).count() as i32;
            prop_assert_eq!(after - before, delta);
        }
    }
}
