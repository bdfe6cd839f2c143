//! Enumeration primitives over `IEnumString` and `IEnumGUID`.
//!
//! `next_batch(count)` fetches at most `count` elements per foreign call;
//! the `Iterator` impls refill an internal cache of [`MAX_CACHE_SIZE`]
//! elements until the enumerator reports exhaustion.

use std::collections::VecDeque;

use crate::com::memory::RemoteString;
use crate::com::vtables::{IEnumGuid, IEnumString};
use crate::com::{Guid, Handle};
use crate::errors::OpcResult;

const MAX_CACHE_SIZE: u32 = 16;

/// Iterator over the strings produced by an `IEnumString`.
pub struct StringIterator {
    inner: Handle<IEnumString>,
    cache: VecDeque<String>,
    done: bool,
}

impl StringIterator {
    pub fn new(inner: Handle<IEnumString>) -> Self {
        Self {
            inner,
            cache: VecDeque::new(),
            done: false,
        }
    }

    /// Fetches up to `count` strings. An empty result means exhaustion.
    pub fn next_batch(&mut self, count: u32) -> OpcResult<Vec<String>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let mut slots: Vec<*mut u16> = vec![std::ptr::null_mut(); count as usize];
        let mut fetched = 0u32;
        // SAFETY: `slots` holds `count` out slots and `fetched` is valid.
        let status = unsafe {
            (self.inner.vtable().next)(self.inner.as_raw(), count, slots.as_mut_ptr(), &mut fetched)
        };
        // Take ownership before checking the status so nothing leaks.
        let taken = fetched.min(count) as usize;
        let strings: Vec<String> = slots[..taken]
            .iter()
            .map(|&raw| RemoteString::from_raw(raw).to_string_lossy())
            .collect();
        status.ok_or_com("IEnumString::Next")?;
        Ok(strings)
    }

    /// Restarts the enumeration from the beginning.
    pub fn reset(&mut self) -> OpcResult<()> {
        self.cache.clear();
        self.done = false;
        // SAFETY: plain call on a live handle.
        unsafe { (self.inner.vtable().reset)(self.inner.as_raw()) }.ok_or_com("IEnumString::Reset")
    }
}

impl Iterator for StringIterator {
    type Item = OpcResult<String>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(item) = self.cache.pop_front() {
            return Some(Ok(item));
        }
        if self.done {
            return None;
        }
        match self.next_batch(MAX_CACHE_SIZE) {
            Ok(batch) => {
                if batch.len() < MAX_CACHE_SIZE as usize {
                    self.done = true;
                }
                self.cache.extend(batch);
                self.cache.pop_front().map(Ok)
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Iterator over the identifiers produced by an `IEnumGUID`.
pub struct GuidIterator {
    inner: Handle<IEnumGuid>,
    cache: VecDeque<Guid>,
    done: bool,
}

impl GuidIterator {
    pub fn new(inner: Handle<IEnumGuid>) -> Self {
        Self {
            inner,
            cache: VecDeque::new(),
            done: false,
        }
    }

    /// Fetches up to `count` identifiers. An empty result means exhaustion.
    pub fn next_batch(&mut self, count: u32) -> OpcResult<Vec<Guid>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let mut slots = vec![Guid::zeroed(); count as usize];
        let mut fetched = 0u32;
        // SAFETY: `slots` holds `count` elements and `fetched` is valid.
        let status = unsafe {
            (self.inner.vtable().next)(self.inner.as_raw(), count, slots.as_mut_ptr(), &mut fetched)
        };
        status.ok_or_com("IEnumGUID::Next")?;
        slots.truncate(fetched.min(count) as usize);
        Ok(slots)
    }

    pub fn reset(&mut self) -> OpcResult<()> {
        self.cache.clear();
        self.done = false;
        // SAFETY: plain call on a live handle.
        unsafe { (self.inner.vtable().reset)(self.inner.as_raw()) }.ok_or_com("IEnumGUID::Reset")
    }
}

impl Iterator for GuidIterator {
    type Item = OpcResult<Guid>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(item) = self.cache.pop_front() {
            return Some(Ok(item));
        }
        if self.done {
            return None;
        }
        match self.next_batch(MAX_CACHE_SIZE) {
            Ok(batch) => {
                if batch.len() < MAX_CACHE_SIZE as usize {
                    self.done = true;
                }
                self.cache.extend(batch);
                self.cache.pop_front().map(Ok)
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::enumerators;

    #[test]
    fn test_string_iterator_exhausts_in_chunks() {
        let names: Vec<String> = (0..40).map(|i| format!("Tag{i}")).collect();
        let iter = StringIterator::new(enumerators::strings(names.clone()));
        let collected: Vec<String> = iter.collect::<OpcResult<_>>().unwrap();
        assert_eq!(collected, names);
    }

    #[test]
    fn test_next_batch_and_reset() {
        let mut iter = StringIterator::new(enumerators::strings(vec![
            "a".into(),
            "b".into(),
            "c".into(),
        ]));
        assert_eq!(iter.next_batch(2).unwrap(), vec!["a", "b"]);
        assert_eq!(iter.next_batch(2).unwrap(), vec!["c"]);
        assert!(iter.next_batch(2).unwrap().is_empty());
        iter.reset().unwrap();
        assert_eq!(iter.next_batch(10).unwrap().len(), 3);
        assert!(iter.next_batch(0).unwrap().is_empty());
    }

    #[test]
    fn test_guid_iterator() {
        let ids = vec![Guid::from_u128(1), Guid::from_u128(2)];
        let iter = GuidIterator::new(enumerators::guids(ids.clone()));
        assert_eq!(iter.collect::<OpcResult<Vec<_>>>().unwrap(), ids);
    }

    #[test]
    fn test_empty_enumeration() {
        let mut iter = StringIterator::new(enumerators::strings(Vec::new()));
        assert!(iter.next().is_none());
        assert!(iter.next().is_none());
    }
}
