use crate::sqe::errors::IoError;
use crate::sqe::raw::{CompletionEffect, RawSqe};
use slab::{Slab, VacantEntry};
use std::any::Any;
use std::io::{self, Error, ErrorKind};
use std::ops::{Deref, DerefMut};

/// A dedicated slab allocator for in-flight operations.
///
/// The key of each entry is stored in the SQE `user_data` field. It utilizes a
/// "Reserve-Commit" pattern so an entry is only occupied once the SQE was
/// actually pushed to the ring.
pub(crate) struct RawSqeSlab {
    slab: Slab<RawSqe>,
}

impl RawSqeSlab {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            slab: Slab::with_capacity(capacity),
        }
    }

    /// Reserve a single slab entry for insertion. Insertion is a 2-step process
    /// where we first reserve the entry, but need to insert the entry to commit.
    pub(crate) fn reserve_entry(&'_ mut self) -> Result<SlabReservedEntry<'_>, IoError> {
        if self.slab.len() == self.slab.capacity() {
            return Err(IoError::SlabFull);
        }

        Ok(SlabReservedEntry::new(self.slab.vacant_entry()))
    }

    pub(crate) fn get(&self, key: usize) -> io::Result<&RawSqe> {
        self.slab.get(key).ok_or_else(|| not_found(key))
    }

    pub(crate) fn get_mut(&mut self, key: usize) -> io::Result<&mut RawSqe> {
        self.slab.get_mut(key).ok_or_else(|| not_found(key))
    }

    /// Records a completion for `key`. Orphaned entries are removed here and
    /// their owner is returned inside the effect.
    pub(crate) fn complete(
        &mut self,
        key: usize,
        result: i32,
        flags: u32,
    ) -> io::Result<CompletionEffect> {
        let effect = self.get_mut(key)?.on_completion(result, flags);

        if matches!(effect, CompletionEffect::Release(_)) {
            self.slab.remove(key);
        }

        Ok(effect)
    }

    /// Takes the result of a completed entry and frees it. Returns `None` if the
    /// kernel has not answered yet.
    pub(crate) fn take_result(&mut self, key: usize) -> io::Result<Option<(i32, u32)>> {
        match self.get(key)? {
            RawSqe::Completed { result, flags } => {
                let out = (*result, *flags);
                self.slab.remove(key);
                Ok(Some(out))
            }
            _ => Ok(None),
        }
    }

    /// Hands ownership of `owner` to the slot until its completion arrives. If
    /// the completion already arrived, the slot is freed and `owner` is
    /// returned so the caller drops it.
    pub(crate) fn orphan(
        &mut self,
        key: usize,
        owner: Box<dyn Any + Send>,
    ) -> Option<Box<dyn Any + Send>> {
        match self.slab.get_mut(key) {
            Some(RawSqe::Pending { .. }) => {
                self.slab[key] = RawSqe::Orphaned(owner);
                None
            }
            Some(RawSqe::Completed { .. }) => {
                self.slab.remove(key);
                Some(owner)
            }
            _ => Some(owner),
        }
    }
}

fn not_found(key: usize) -> Error {
    Error::new(
        ErrorKind::NotFound,
        format!("Key {:?} not found in slab.", key),
    )
}

#[doc(hidden)]
impl Deref for RawSqeSlab {
    type Target = Slab<RawSqe>;

    fn deref(&self) -> &Self::Target {
        &self.slab
    }
}

#[doc(hidden)]
impl DerefMut for RawSqeSlab {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.slab
    }
}

/// A wrapper around slab::VacantEntry, the key is known before the value is
/// inserted so it can be written into the SQE first.
pub(crate) struct SlabReservedEntry<'a> {
    entry: VacantEntry<'a, RawSqe>,
}

impl<'a> SlabReservedEntry<'a> {
    fn new(entry: VacantEntry<'a, RawSqe>) -> Self {
        Self { entry }
    }

    /// Gets the key that will be used for the next insertion.
    pub(crate) fn key(&self) -> usize {
        self.entry.key()
    }

    pub(crate) fn commit(self, value: RawSqe) -> &'a mut RawSqe {
        self.entry.insert(value)
    }
}
