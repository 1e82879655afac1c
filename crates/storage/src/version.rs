//! Version arena
//!
//! Version chains are singly linked lists, newest first. Instead of boxed
//! nodes the versions live in one arena per storage and link to each other
//! through generation-checked handles. Retiring a slot bumps its generation,
//! so a handle that outlived its version resolves to `None` rather than to
//! whatever value reused the slot.
//!
//! Only the writer holding a record's lock relinks that record's chain, and
//! only the garbage collector retires slots.

use epochkv_core::{Epoch, TidWord};
use parking_lot::RwLock;

/// Handle to one arena slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VersionHandle {
    index: u32,
    generation: u32,
}

impl VersionHandle {
    const NONE: u64 = u64::MAX;

    /// Pack into a word suitable for an `AtomicU64`.
    pub fn pack(handle: Option<VersionHandle>) -> u64 {
        match handle {
            Some(h) => ((h.generation as u64) << 32) | h.index as u64,
            None => Self::NONE,
        }
    }

    /// Inverse of [`VersionHandle::pack`].
    pub fn unpack(word: u64) -> Option<VersionHandle> {
        if word == Self::NONE {
            None
        } else {
            Some(VersionHandle {
                index: word as u32,
                generation: (word >> 32) as u32,
            })
        }
    }
}

/// One committed version of a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    /// Commit timestamp of the writer that produced this version
    pub tid: TidWord,
    /// Payload, `None` for a delete
    pub value: Option<Vec<u8>>,
    /// Next older version
    pub next: Option<VersionHandle>,
}

impl Version {
    /// Epoch the version was committed in.
    pub fn epoch(&self) -> Epoch {
        self.tid.epoch()
    }
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    version: Option<Version>,
}

#[derive(Debug, Default)]
struct ArenaInner {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

impl ArenaInner {
    fn get(&self, handle: VersionHandle) -> Option<&Version> {
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.version.as_ref()
    }

    fn get_mut(&mut self, handle: VersionHandle) -> Option<&mut Version> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.version.as_mut()
    }

    fn retire(&mut self, handle: VersionHandle) -> Option<Version> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let version = slot.version.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        self.live -= 1;
        Some(version)
    }

    fn retire_from(&mut self, mut cursor: Option<VersionHandle>) -> usize {
        let mut freed = 0;
        while let Some(handle) = cursor {
            match self.retire(handle) {
                Some(version) => {
                    freed += 1;
                    cursor = version.next;
                }
                None => break,
            }
        }
        freed
    }
}

/// Arena of versions shared by all records of one storage.
#[derive(Debug, Default)]
pub struct VersionArena {
    inner: RwLock<ArenaInner>,
}

impl VersionArena {
    /// Empty arena.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `version` and return its handle.
    pub fn alloc(&self, version: Version) -> VersionHandle {
        let mut inner = self.inner.write();
        inner.live += 1;
        if let Some(index) = inner.free.pop() {
            let slot = &mut inner.slots[index as usize];
            slot.version = Some(version);
            return VersionHandle {
                index,
                generation: slot.generation,
            };
        }
        let index = inner.slots.len() as u32;
        inner.slots.push(Slot {
            generation: 0,
            version: Some(version),
        });
        VersionHandle {
            index,
            generation: 0,
        }
    }

    /// Copy of the version behind `handle`, if it is still live.
    pub fn get(&self, handle: VersionHandle) -> Option<Version> {
        self.inner.read().get(handle).cloned()
    }

    /// Timestamp of the version behind `handle`.
    pub fn tid(&self, handle: VersionHandle) -> Option<TidWord> {
        self.inner.read().get(handle).map(|v| v.tid)
    }

    /// Payload of the version behind `handle`. The outer `Option` is `None`
    /// for a stale handle.
    pub fn value(&self, handle: VersionHandle) -> Option<Option<Vec<u8>>> {
        self.inner.read().get(handle).map(|v| v.value.clone())
    }

    /// Replace tid and payload in place. Used for rewrites within the epoch
    /// the head version was committed in.
    pub fn overwrite(&self, handle: VersionHandle, tid: TidWord, value: Option<Vec<u8>>) -> bool {
        let mut inner = self.inner.write();
        match inner.get_mut(handle) {
            Some(version) => {
                version.tid = tid;
                version.value = value;
                true
            }
            None => false,
        }
    }

    /// Walk the chain from `head` and return the first version matching
    /// `visible`.
    pub fn find(
        &self,
        head: Option<VersionHandle>,
        mut visible: impl FnMut(&Version) -> bool,
    ) -> Option<Version> {
        let inner = self.inner.read();
        let mut cursor = head;
        while let Some(handle) = cursor {
            let version = inner.get(handle)?;
            if visible(version) {
                return Some(version.clone());
            }
            cursor = version.next;
        }
        None
    }

    /// Number of versions reachable from `head`.
    pub fn chain_len(&self, head: Option<VersionHandle>) -> usize {
        let inner = self.inner.read();
        let mut len = 0;
        let mut cursor = head;
        while let Some(handle) = cursor {
            match inner.get(handle) {
                Some(version) => {
                    len += 1;
                    cursor = version.next;
                }
                None => break,
            }
        }
        len
    }

    /// Sever the chain after the newest version whose epoch is below `floor`
    /// and retire everything older. Returns the number of retired versions.
    ///
    /// That version stays: it is what a reader with a snapshot at `floor`
    /// still sees.
    pub fn prune(&self, head: Option<VersionHandle>, floor: Epoch) -> usize {
        let mut inner = self.inner.write();
        let mut cursor = head;
        while let Some(handle) = cursor {
            let Some(version) = inner.get_mut(handle) else {
                return 0;
            };
            if version.epoch() < floor {
                let suffix = version.next.take();
                return inner.retire_from(suffix);
            }
            cursor = version.next;
        }
        0
    }

    /// Retire the whole chain starting at `head`.
    pub fn retire_chain(&self, head: Option<VersionHandle>) -> usize {
        self.inner.write().retire_from(head)
    }

    /// Number of live versions.
    pub fn len(&self) -> usize {
        self.inner.read().live
    }

    /// Whether the arena holds no live version.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn version(epoch: Epoch, value: &str, next: Option<VersionHandle>) -> Version {
        Version {
            tid: TidWord::new(epoch, 0),
            value: Some(value.as_bytes().to_vec()),
            next,
        }
    }

    fn chain(arena: &VersionArena, epochs: &[Epoch]) -> Option<VersionHandle> {
        // epochs oldest first
        let mut head = None;
        for &e in epochs {
            head = Some(arena.alloc(version(e, &format!("v{e}"), head)));
        }
        head
    }

    #[test]
    fn handle_packing() {
        let arena = VersionArena::new();
        let h = arena.alloc(version(1, "a", None));
        assert_eq!(VersionHandle::unpack(VersionHandle::pack(Some(h))), Some(h));
        assert_eq!(VersionHandle::unpack(VersionHandle::pack(None)), None);
    }

    #[test]
    fn stale_handle_resolves_to_none() {
        let arena = VersionArena::new();
        let h = arena.alloc(version(1, "a", None));
        assert_eq!(arena.retire_chain(Some(h)), 1);
        assert!(arena.get(h).is_none());

        // slot reuse does not resurrect the old handle
        let h2 = arena.alloc(version(2, "b", None));
        assert_ne!(h, h2);
        assert!(arena.get(h).is_none());
        assert_eq!(arena.get(h2).unwrap().value.as_deref(), Some(&b"b"[..]));
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn find_walks_newest_first() {
        let arena = VersionArena::new();
        let head = chain(&arena, &[1, 3, 5]);
        let seen = arena.find(head, |v| v.epoch() < 4).unwrap();
        assert_eq!(seen.epoch(), 3);
        assert!(arena.find(head, |v| v.epoch() < 1).is_none());
        assert_eq!(arena.chain_len(head), 3);
    }

    #[test]
    fn prune_keeps_first_version_below_floor() {
        let arena = VersionArena::new();
        let head = chain(&arena, &[1, 2, 3, 6, 8]);
        assert_eq!(arena.prune(head, 5), 2);
        assert_eq!(arena.chain_len(head), 3);
        assert_eq!(arena.len(), 3);

        // idempotent
        assert_eq!(arena.prune(head, 5), 0);
        assert_eq!(arena.chain_len(head), 3);
    }

    #[test]
    fn prune_above_every_version_keeps_head_only() {
        let arena = VersionArena::new();
        let head = chain(&arena, &[1, 2]);
        assert_eq!(arena.prune(head, 100), 1);
        assert_eq!(arena.chain_len(head), 1);
    }

    #[test]
    fn overwrite_in_place() {
        let arena = VersionArena::new();
        let h = arena.alloc(version(4, "a", None));
        assert!(arena.overwrite(h, TidWord::new(4, 1), Some(b"z".to_vec())));
        let v = arena.get(h).unwrap();
        assert_eq!(v.tid.counter(), 1);
        assert_eq!(v.value.as_deref(), Some(&b"z"[..]));
    }
}
