//! Probed pointer chasing shared by the classifier and the engine.

use crate::accounting::DiagSite;
use rundown_storage::{
    Access, AccessMethod, Arena, CommitElement, FileControl, MemoryProbe, Ptr, RegionDescriptor,
    RegionState, SharedMemory,
};

/// A region whose descriptor chain probed clean.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RegionView {
    pub file: Ptr<FileControl>,
    pub state: Ptr<RegionState>,
    pub access_method: AccessMethod,
    pub shared_size: u64,
}

/// Why a region was not processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Skip {
    /// Not opened by this process, or an alias of a file already opened
    /// through another descriptor.
    NotOpen,
    /// Access method the sweep does not handle.
    Unsupported,
    /// A probe failed.
    Unreadable(DiagSite),
}

/// Probes the chain descriptor, segment, file control and region state.
pub(crate) fn region(
    mem: &SharedMemory,
    descriptor: Option<Ptr<RegionDescriptor>>,
    probe: &dyn MemoryProbe,
) -> Result<RegionView, Skip> {
    let reg = mem
        .regions
        .probe_read(descriptor, probe)
        .ok_or(Skip::Unreadable(DiagSite::RegionUnreadable))?;
    if !reg.open || reg.was_open {
        return Err(Skip::NotOpen);
    }
    let segment = mem
        .segments
        .probe_read(reg.segment, probe)
        .ok_or(Skip::Unreadable(DiagSite::SegmentUnreadable))?;
    if !matches!(
        segment.access_method,
        AccessMethod::Buffered | AccessMethod::MemoryMapped
    ) {
        return Err(Skip::Unsupported);
    }
    let file = mem
        .files
        .probe_read(segment.file, probe)
        .ok_or(Skip::Unreadable(DiagSite::FileControlUnreadable))?;
    let state_len = std::mem::size_of::<RegionState>() as u64;
    if !mem
        .states
        .probe_extent(file.state, state_len, Access::Write, probe)
    {
        return Err(Skip::Unreadable(DiagSite::RegionStateUnwritable));
    }
    match (segment.file, file.state) {
        (Some(file), Some(state)) => Ok(RegionView {
            file,
            state,
            access_method: segment.access_method,
            shared_size: reg.shared_size,
        }),
        _ => Err(Skip::Unreadable(DiagSite::RegionUnreadable)),
    }
}

/// Probes descriptor and segment and returns the file control handle.
///
/// Used to match sub-transactions to regions by storage identity.
pub(crate) fn file_of(
    mem: &SharedMemory,
    descriptor: Option<Ptr<RegionDescriptor>>,
    probe: &dyn MemoryProbe,
) -> Result<Option<Ptr<FileControl>>, DiagSite> {
    let reg = mem
        .regions
        .probe_read(descriptor, probe)
        .ok_or(DiagSite::RegionUnreadable)?;
    let segment = mem
        .segments
        .probe_read(reg.segment, probe)
        .ok_or(DiagSite::SegmentUnreadable)?;
    Ok(segment.file)
}

/// Follows `newer` links to the deepest version of an element.
///
/// Fails if a link does not probe or if the chain is longer than the arena
/// (a cycle).
pub(crate) fn terminal(
    elements: &Arena<CommitElement>,
    start: Ptr<CommitElement>,
    probe: &dyn MemoryProbe,
) -> Option<Ptr<CommitElement>> {
    let mut current = start;
    let mut cse = elements.probe_read(Some(current), probe)?;
    for _ in 0..=elements.len() {
        match cse.newer {
            None => return Some(current),
            Some(newer) => {
                cse = elements.probe_read(Some(newer), probe)?;
                current = newer;
            }
        }
    }
    None
}

/// Walks `index` `next` links from `first`, then chases `newer`.
pub(crate) fn nth(
    elements: &Arena<CommitElement>,
    first: Ptr<CommitElement>,
    index: u32,
    probe: &dyn MemoryProbe,
) -> Option<Ptr<CommitElement>> {
    let mut current = first;
    for _ in 0..index {
        current = elements.probe_read(Some(current), probe)?.next?;
    }
    terminal(elements, current, probe)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rundown_storage::{CommitMode, FileId, MappingProbe, Protection, SegmentDescriptor};

    fn open_region(mem: &mut SharedMemory, access_method: AccessMethod) -> Ptr<RegionDescriptor> {
        let state = mem.states.alloc(RegionState::default());
        let file = mem.files.alloc(FileControl {
            file_id: FileId(1),
            state: Some(state),
        });
        let segment = mem.segments.alloc(SegmentDescriptor {
            access_method,
            file: Some(file),
        });
        mem.regions.alloc(RegionDescriptor {
            name: "DEFAULT".into(),
            open: true,
            was_open: false,
            read_only: false,
            segment: Some(segment),
            shared_size: 4096,
        })
    }

    #[test]
    fn resolves_open_region() {
        let mut mem = SharedMemory::new();
        let reg = open_region(&mut mem, AccessMethod::Buffered);
        let view = region(&mem, Some(reg), &MappingProbe).unwrap();
        assert_eq!(view.access_method, AccessMethod::Buffered);
        assert_eq!(view.shared_size, 4096);
    }

    #[test]
    fn skips_aliases_and_unsupported() {
        let mut mem = SharedMemory::new();
        let reg = open_region(&mut mem, AccessMethod::Unsupported);
        assert_eq!(region(&mem, Some(reg), &MappingProbe).err(), Some(Skip::Unsupported));

        let alias = open_region(&mut mem, AccessMethod::Buffered);
        mem.regions.get_mut(alias).unwrap().was_open = true;
        assert_eq!(region(&mem, Some(alias), &MappingProbe).err(), Some(Skip::NotOpen));
    }

    #[test]
    fn read_only_state_is_unusable() {
        let mut mem = SharedMemory::new();
        let reg = open_region(&mut mem, AccessMethod::MemoryMapped);
        let state = region(&mem, Some(reg), &MappingProbe).unwrap().state;
        mem.states.protect(state, Protection::ReadOnly).unwrap();
        assert_eq!(
            region(&mem, Some(reg), &MappingProbe).err(),
            Some(Skip::Unreadable(DiagSite::RegionStateUnwritable))
        );
    }

    #[test]
    fn newer_chain_resolves_to_deepest() {
        let mut mem = SharedMemory::new();
        let deep = mem.elements.alloc(CommitElement::new(3, CommitMode::Write));
        let mut mid = CommitElement::new(3, CommitMode::Write);
        mid.newer = Some(deep);
        let mid = mem.elements.alloc(mid);
        let mut base = CommitElement::new(3, CommitMode::Write);
        base.newer = Some(mid);
        let base = mem.elements.alloc(base);
        assert_eq!(terminal(&mem.elements, base, &MappingProbe), Some(deep));

        mem.elements.unmap(deep).unwrap();
        assert_eq!(terminal(&mem.elements, base, &MappingProbe), None);
    }

    #[test]
    fn newer_cycle_is_rejected() {
        let mut mem = SharedMemory::new();
        let a = mem.elements.alloc(CommitElement::new(1, CommitMode::Write));
        let b = mem.elements.alloc(CommitElement::new(1, CommitMode::Write));
        mem.elements.get_mut(a).unwrap().newer = Some(b);
        mem.elements.get_mut(b).unwrap().newer = Some(a);
        assert_eq!(terminal(&mem.elements, a, &MappingProbe), None);
    }

    #[test]
    fn nth_walks_next_links() {
        let mut mem = SharedMemory::new();
        let third = mem.elements.alloc(CommitElement::new(30, CommitMode::Acquired));
        let mut second = CommitElement::new(20, CommitMode::Acquired);
        second.next = Some(third);
        let second = mem.elements.alloc(second);
        let mut first = CommitElement::new(10, CommitMode::Write);
        first.next = Some(second);
        let first = mem.elements.alloc(first);
        assert_eq!(nth(&mem.elements, first, 0, &MappingProbe), Some(first));
        assert_eq!(nth(&mem.elements, first, 2, &MappingProbe), Some(third));
        assert_eq!(nth(&mem.elements, first, 3, &MappingProbe), None);
    }
}
