//! Forward references inside freshly built blocks.
//!
//! A new block may point at a block whose number was not known when its
//! records were built. Single-region updates leave one such slot at
//! `ins_off`. Multi-region updates thread a chain of [`ChainLink`] words
//! through the block starting at `first_off`, each naming an element of the
//! same sub-transaction by index.

use rundown_storage::block::{self, ChainLink, BLOCK_HEADER_SIZE, BLOCK_ID_SIZE, RECORD_HEADER_SIZE};

/// Returns true if a block number written at `off` lies inside the records
/// of a block using `used` bytes.
pub(super) fn insertion_in_bounds(off: u32, used: u32) -> bool {
    off >= BLOCK_HEADER_SIZE + RECORD_HEADER_SIZE
        && off
            .checked_add(BLOCK_ID_SIZE)
            .is_some_and(|end| end <= used)
}

/// Returns true if `index` names an element before `position`.
pub(super) fn index_precedes(index: i32, position: usize) -> bool {
    usize::try_from(index).is_ok_and(|index| index < position)
}

/// Where a chain walk gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct BrokenChain {
    pub offset: u32,
    pub word: u32,
}

/// Replaces every link of the chain starting at `first_off` with the block
/// number `resolve` returns for its index.
///
/// A link must be flagged, lie within `min(used, page.len())`, and carry an
/// index below `depth` that resolves. The walk ends at a link whose
/// `next_off` is zero. Offsets only grow and at most `page.len() / 4` links
/// are visited, so a corrupt chain cannot loop. Links rewritten before a
/// failure stay rewritten.
pub(super) fn resolve_links(
    page: &mut [u8],
    first_off: u32,
    depth: u32,
    mut resolve: impl FnMut(u16) -> Option<u32>,
) -> Result<u32, BrokenChain> {
    let page_len = u32::try_from(page.len()).unwrap_or(u32::MAX);
    let limit = block::used_size(page).min(page_len);
    let mut offset = first_off;
    let mut word = 0;
    for visited in 0..(page_len >> 2) {
        let broken = BrokenChain { offset, word };
        word = block::read_word(page, offset).ok_or(broken)?;
        let link = ChainLink::decode(word);
        let in_bounds = offset
            .checked_add(BLOCK_ID_SIZE)
            .is_some_and(|end| end <= limit);
        if !link.flag || !in_bounds || u32::from(link.index) >= depth {
            return Err(BrokenChain { offset, word });
        }
        let target = resolve(link.index).ok_or(BrokenChain { offset, word })?;
        block::write_word(page, offset, target);
        if link.next_off == 0 {
            return Ok(visited + 1);
        }
        offset = offset
            .checked_add(u32::from(link.next_off))
            .ok_or(BrokenChain { offset, word })?;
    }
    Err(BrokenChain { offset, word })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rundown_storage::block::BlockHeader;

    fn page_with_used(len: usize, used: u32) -> Vec<u8> {
        let mut page = vec![0u8; len];
        BlockHeader {
            version: block::BLOCK_VERSION,
            level: 0,
            used,
            commit_counter: 1,
        }
        .write(&mut page);
        page
    }

    fn link(page: &mut [u8], off: u32, index: u16, next_off: u16) {
        let word = ChainLink {
            flag: true,
            index,
            next_off,
        }
        .encode();
        block::write_word(page, off, word);
    }

    #[test]
    fn insertion_bounds() {
        assert!(!insertion_in_bounds(19, 64));
        assert!(insertion_in_bounds(20, 64));
        assert!(insertion_in_bounds(60, 64));
        assert!(!insertion_in_bounds(61, 64));
        assert!(!insertion_in_bounds(u32::MAX - 1, u32::MAX));
    }

    #[test]
    fn index_must_precede_position() {
        assert!(index_precedes(0, 1));
        assert!(!index_precedes(1, 1));
        assert!(!index_precedes(-1, 5));
    }

    #[test]
    fn resolves_every_link() {
        let mut page = page_with_used(128, 96);
        link(&mut page, 24, 1, 16);
        link(&mut page, 40, 2, 40);
        link(&mut page, 80, 0, 0);
        let blocks = [100, 200, 300];
        let visited = resolve_links(&mut page, 24, 3, |i| blocks.get(usize::from(i)).copied());
        assert_eq!(visited, Ok(3));
        assert_eq!(block::read_word(&page, 24), Some(200));
        assert_eq!(block::read_word(&page, 40), Some(300));
        assert_eq!(block::read_word(&page, 80), Some(100));
    }

    #[test]
    fn unflagged_link_stops_walk() {
        let mut page = page_with_used(64, 64);
        link(&mut page, 24, 0, 8);
        block::write_word(&mut page, 32, 7);
        let err = resolve_links(&mut page, 24, 2, |_| Some(9)).unwrap_err();
        assert_eq!(err.offset, 32);
        assert_eq!(block::read_word(&page, 24), Some(9));
    }

    #[test]
    fn link_beyond_used_size_is_rejected() {
        let mut page = page_with_used(128, 40);
        link(&mut page, 24, 0, 20);
        link(&mut page, 44, 0, 0);
        assert_eq!(
            resolve_links(&mut page, 24, 1, |_| Some(5)).unwrap_err().offset,
            44
        );
    }

    #[test]
    fn index_beyond_depth_is_rejected() {
        let mut page = page_with_used(64, 64);
        link(&mut page, 24, 4, 0);
        assert!(resolve_links(&mut page, 24, 4, |_| Some(1)).is_err());
    }

    #[test]
    fn unresolvable_index_is_rejected() {
        let mut page = page_with_used(64, 64);
        link(&mut page, 24, 1, 0);
        assert!(resolve_links(&mut page, 24, 4, |_| None).is_err());
    }

    proptest! {
        #[test]
        fn arbitrary_pages_terminate(
            bytes in proptest::collection::vec(any::<u8>(), 16..256),
            first_off in 0u32..300,
            depth in 0u32..64,
        ) {
            let mut page = bytes;
            let len = page.len() as u32;
            let mut calls = 0u32;
            let _ = resolve_links(&mut page, first_off, depth, |i| {
                calls += 1;
                Some(u32::from(i))
            });
            prop_assert!(calls <= len / 4);
        }
    }
}
