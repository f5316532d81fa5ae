//! Index-addressed arenas with per-slot mapping metadata.

use crate::error::{StorageError, StorageResult};
use crate::probe::{Access, Mapping, MemoryProbe, Protection};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::mem;

/// Spacing between synthetic slot base addresses.
const SLOT_SHIFT: u32 = 12;

/// A typed offset into an [`Arena`].
///
/// Shared structures refer to each other through `Option<Ptr<T>>`; `None`
/// plays the part of a null pointer.
pub struct Ptr<T> {
    index: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Ptr<T> {
    /// Creates a handle for slot `index`.
    ///
    /// Nothing checks that the slot exists; that is the probe's job.
    #[must_use]
    pub const fn from_index(index: u32) -> Self {
        Self {
            index,
            _marker: PhantomData,
        }
    }

    /// Returns the slot index.
    #[must_use]
    pub const fn index(self) -> u32 {
        self.index
    }
}

impl<T> Clone for Ptr<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Ptr<T> {}

impl<T> PartialEq for Ptr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}

impl<T> Eq for Ptr<T> {}

impl<T> Hash for Ptr<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.hash(state);
    }
}

impl<T> fmt::Debug for Ptr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ptr({})", self.index)
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Slot<T> {
    mapping: Option<Mapping>,
    value: T,
}

/// Storage for one kind of shared structure.
///
/// Slots are never reused. Unmapping a slot keeps its bytes around (the
/// value stays readable through the unprobed fixture API) but every probe
/// against it fails, which is how freed or corrupt memory looks to the
/// cleanup sweep.
#[derive(Debug, Clone, PartialEq)]
pub struct Arena<T> {
    tag: u32,
    slots: Vec<Slot<T>>,
}

impl<T> Arena<T> {
    /// Creates an empty arena. `tag` distinguishes synthetic base addresses.
    #[must_use]
    pub const fn new(tag: u32) -> Self {
        Self {
            tag,
            slots: Vec::new(),
        }
    }

    /// Returns the number of slots ever allocated.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Returns true if nothing has been allocated.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn base_for(&self, index: u32) -> u64 {
        (u64::from(self.tag) << 40) | (u64::from(index) << SLOT_SHIFT)
    }

    /// Allocates a read-write slot sized for `T`.
    pub fn alloc(&mut self, value: T) -> Ptr<T> {
        self.alloc_sized(value, mem::size_of::<T>() as u64, Protection::ReadWrite)
    }

    /// Allocates a slot with an explicit extent and protection.
    ///
    /// Structures that own a trailing array (cache slots, element arrays)
    /// record the array in the extent so the probe can validate it.
    pub fn alloc_sized(&mut self, value: T, len: u64, protection: Protection) -> Ptr<T> {
        let index = self.slots.len() as u32;
        let mapping = Mapping {
            base: self.base_for(index),
            len,
            protection,
        };
        self.slots.push(Slot {
            mapping: Some(mapping),
            value,
        });
        Ptr::from_index(index)
    }

    fn slot(&self, ptr: Ptr<T>) -> StorageResult<&Slot<T>> {
        self.slots
            .get(ptr.index as usize)
            .ok_or(StorageError::DanglingHandle {
                tag: self.tag,
                index: ptr.index,
            })
    }

    fn slot_mut(&mut self, ptr: Ptr<T>) -> StorageResult<&mut Slot<T>> {
        let tag = self.tag;
        self.slots
            .get_mut(ptr.index as usize)
            .ok_or(StorageError::DanglingHandle {
                tag,
                index: ptr.index,
            })
    }

    /// Unmaps a slot. Subsequent probes fail.
    pub fn unmap(&mut self, ptr: Ptr<T>) -> StorageResult<()> {
        self.slot_mut(ptr)?.mapping = None;
        Ok(())
    }

    /// Changes the protection of a mapped slot.
    pub fn protect(&mut self, ptr: Ptr<T>, protection: Protection) -> StorageResult<()> {
        let tag = self.tag;
        let slot = self.slot_mut(ptr)?;
        let mapping = slot.mapping.as_mut().ok_or(StorageError::Unmapped {
            tag,
            index: ptr.index,
        })?;
        mapping.protection = protection;
        Ok(())
    }

    /// Shrinks or grows the recorded extent of a mapped slot.
    pub fn resize_mapping(&mut self, ptr: Ptr<T>, len: u64) -> StorageResult<()> {
        let tag = self.tag;
        let slot = self.slot_mut(ptr)?;
        let mapping = slot.mapping.as_mut().ok_or(StorageError::Unmapped {
            tag,
            index: ptr.index,
        })?;
        mapping.len = len;
        Ok(())
    }

    /// Returns the mapping metadata of a slot, if mapped.
    #[must_use]
    pub fn mapping(&self, ptr: Ptr<T>) -> Option<&Mapping> {
        self.slots
            .get(ptr.index as usize)
            .and_then(|slot| slot.mapping.as_ref())
    }

    /// Returns the synthetic base address of a slot, or 0 for a null handle.
    ///
    /// Used only as a diagnostic word.
    #[must_use]
    pub fn address_of(&self, ptr: Option<Ptr<T>>) -> u64 {
        ptr.map_or(0, |p| self.base_for(p.index))
    }

    /// Probes `len` bytes of a slot with `access`.
    #[must_use]
    pub fn probe_extent(
        &self,
        ptr: Option<Ptr<T>>,
        len: u64,
        access: Access,
        probe: &dyn MemoryProbe,
    ) -> bool {
        let mapping = ptr.and_then(|p| self.mapping(p));
        probe.probe(mapping, 0, len, access)
    }

    /// Probes a slot for reading and returns it on success.
    #[must_use]
    pub fn probe_read(&self, ptr: Option<Ptr<T>>, probe: &dyn MemoryProbe) -> Option<&T> {
        self.probe_read_extent(ptr, mem::size_of::<T>() as u64, probe)
    }

    /// Probes `len` bytes of a slot for reading and returns it on success.
    #[must_use]
    pub fn probe_read_extent(
        &self,
        ptr: Option<Ptr<T>>,
        len: u64,
        probe: &dyn MemoryProbe,
    ) -> Option<&T> {
        let ptr = ptr?;
        if !self.probe_extent(Some(ptr), len, Access::Read, probe) {
            return None;
        }
        self.slots.get(ptr.index as usize).map(|slot| &slot.value)
    }

    /// Probes a slot for writing and returns it on success.
    pub fn probe_write(&mut self, ptr: Option<Ptr<T>>, probe: &dyn MemoryProbe) -> Option<&mut T> {
        self.probe_write_extent(ptr, mem::size_of::<T>() as u64, probe)
    }

    /// Probes `len` bytes of a slot for writing and returns it on success.
    pub fn probe_write_extent(
        &mut self,
        ptr: Option<Ptr<T>>,
        len: u64,
        probe: &dyn MemoryProbe,
    ) -> Option<&mut T> {
        let ptr = ptr?;
        if !self.probe_extent(Some(ptr), len, Access::Write, probe) {
            return None;
        }
        self.slots.get_mut(ptr.index as usize).map(|slot| &mut slot.value)
    }

    /// Returns a slot without probing. Fixture and test use only.
    pub fn get(&self, ptr: Ptr<T>) -> StorageResult<&T> {
        Ok(&self.slot(ptr)?.value)
    }

    /// Returns a slot mutably without probing. Fixture and test use only.
    pub fn get_mut(&mut self, ptr: Ptr<T>) -> StorageResult<&mut T> {
        Ok(&mut self.slot_mut(ptr)?.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::MappingProbe;

    #[test]
    fn alloc_and_probe() {
        let mut arena = Arena::new(3);
        let ptr = arena.alloc(7_u32);
        assert_eq!(arena.probe_read(Some(ptr), &MappingProbe), Some(&7));
        *arena.probe_write(Some(ptr), &MappingProbe).unwrap() = 9;
        assert_eq!(*arena.get(ptr).unwrap(), 9);
    }

    #[test]
    fn null_handle_fails_probe() {
        let arena: Arena<u32> = Arena::new(3);
        assert!(arena.probe_read(None, &MappingProbe).is_none());
        assert_eq!(arena.address_of(None), 0);
    }

    #[test]
    fn dangling_handle_fails_probe() {
        let arena: Arena<u32> = Arena::new(3);
        let ptr = Ptr::from_index(5);
        assert!(arena.probe_read(Some(ptr), &MappingProbe).is_none());
        assert!(matches!(
            arena.get(ptr),
            Err(StorageError::DanglingHandle { index: 5, .. })
        ));
    }

    #[test]
    fn unmapped_slot_fails_probe_but_keeps_value() {
        let mut arena = Arena::new(1);
        let ptr = arena.alloc(1_u64);
        arena.unmap(ptr).unwrap();
        assert!(arena.probe_read(Some(ptr), &MappingProbe).is_none());
        assert_eq!(*arena.get(ptr).unwrap(), 1);
        assert!(arena.protect(ptr, Protection::ReadOnly).is_err());
    }

    #[test]
    fn read_only_slot_refuses_write_probe() {
        let mut arena = Arena::new(1);
        let ptr = arena.alloc(1_u64);
        arena.protect(ptr, Protection::ReadOnly).unwrap();
        assert!(arena.probe_read(Some(ptr), &MappingProbe).is_some());
        assert!(arena.probe_write(Some(ptr), &MappingProbe).is_none());
    }

    #[test]
    fn extent_probe_checks_trailing_array() {
        let mut arena = Arena::new(1);
        let ptr = arena.alloc_sized(0_u8, 64, Protection::ReadWrite);
        assert!(arena.probe_read_extent(Some(ptr), 64, &MappingProbe).is_some());
        assert!(arena.probe_read_extent(Some(ptr), 65, &MappingProbe).is_none());
        arena.resize_mapping(ptr, 128).unwrap();
        assert!(arena.probe_read_extent(Some(ptr), 65, &MappingProbe).is_some());
    }

    #[test]
    fn bases_are_distinct_across_tags() {
        let mut a = Arena::new(1);
        let mut b = Arena::new(2);
        let pa = a.alloc(0_u8);
        let pb = b.alloc(0_u8);
        assert_ne!(a.address_of(Some(pa)), b.address_of(Some(pb)));
    }
}
