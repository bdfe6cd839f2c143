//! String and GUID enumerators over fixed lists.
//!
//! Strings are handed out in task memory, one allocation per element, as
//! the enumeration contract requires.

use std::ffi::c_void;
use std::sync::Mutex;

use super::{call, lock, object};
use crate::com::alloc::task_alloc_wide;
use crate::com::object::{ComBox, ComObject, unknown_vtbl};
use crate::com::vtables::{IEnumGuid, IEnumGuidVtbl, IEnumString, IEnumStringVtbl};
use crate::com::{Guid, Handle, StatusCode};

/// An `IEnumString` over `items`.
pub fn strings(items: Vec<String>) -> Handle<IEnumString> {
    ComBox::create(EnumStrings {
        cursor: Cursor::new(items),
    })
}

/// An `IEnumGUID` over `items`.
pub fn guids(items: Vec<Guid>) -> Handle<IEnumGuid> {
    ComBox::create(EnumGuids {
        cursor: Cursor::new(items),
    })
}

struct Cursor<T> {
    items: Vec<T>,
    position: Mutex<usize>,
}

impl<T: Clone> Cursor<T> {
    fn new(items: Vec<T>) -> Self {
        Self {
            items,
            position: Mutex::new(0),
        }
    }

    fn take(&self, count: usize) -> Vec<T> {
        let mut position = lock(&self.position);
        let end = (*position + count).min(self.items.len());
        let batch = self.items[*position..end].to_vec();
        *position = end;
        batch
    }

    fn skip(&self, count: usize) -> bool {
        self.take(count).len() == count
    }

    fn reset(&self) {
        *lock(&self.position) = 0;
    }

    fn fork(&self) -> Self {
        Self {
            items: self.items.clone(),
            position: Mutex::new(*lock(&self.position)),
        }
    }
}

fn fetched_status(fetched: usize, requested: u32) -> StatusCode {
    if fetched == requested as usize {
        StatusCode::S_OK
    } else {
        StatusCode::S_FALSE
    }
}

// ── Strings ─────────────────────────────────────────────────────────

struct EnumStrings {
    cursor: Cursor<String>,
}

static STRINGS_VTBL: IEnumStringVtbl = IEnumStringVtbl {
    base: unknown_vtbl::<EnumStrings>(),
    next: next_strings,
    skip: skip::<EnumStrings>,
    reset: reset::<EnumStrings>,
    clone: clone::<EnumStrings>,
};

// SAFETY: every entry of the table treats `this` as `ComBox<EnumStrings>`.
unsafe impl ComObject for EnumStrings {
    type Interface = IEnumString;

    fn vtable() -> &'static IEnumStringVtbl {
        &STRINGS_VTBL
    }
}

unsafe extern "system" fn next_strings(
    this: *mut c_void,
    celt: u32,
    elements: *mut *mut u16,
    fetched: *mut u32,
) -> StatusCode {
    call(|| {
        if elements.is_null() {
            return StatusCode::E_POINTER;
        }
        // SAFETY: `this` is a `ComBox<EnumStrings>`.
        let enumerator = unsafe { object::<EnumStrings>(this) };
        let batch = enumerator.cursor.take(celt as usize);
        let mut written = 0usize;
        for item in &batch {
            let Ok(ptr) = task_alloc_wide(item) else {
                break;
            };
            // SAFETY: the caller provides room for `celt` elements.
            unsafe { *elements.add(written) = ptr };
            written += 1;
        }
        if !fetched.is_null() {
            // SAFETY: `fetched` is writable; `written <= celt`.
            unsafe { *fetched = u32::try_from(written).unwrap_or(celt) };
        }
        fetched_status(written, celt)
    })
}

// ── GUIDs ───────────────────────────────────────────────────────────

struct EnumGuids {
    cursor: Cursor<Guid>,
}

static GUIDS_VTBL: IEnumGuidVtbl = IEnumGuidVtbl {
    base: unknown_vtbl::<EnumGuids>(),
    next: next_guids,
    skip: skip::<EnumGuids>,
    reset: reset::<EnumGuids>,
    clone: clone::<EnumGuids>,
};

// SAFETY: every entry of the table treats `this` as `ComBox<EnumGuids>`.
unsafe impl ComObject for EnumGuids {
    type Interface = IEnumGuid;

    fn vtable() -> &'static IEnumGuidVtbl {
        &GUIDS_VTBL
    }
}

unsafe extern "system" fn next_guids(
    this: *mut c_void,
    celt: u32,
    elements: *mut Guid,
    fetched: *mut u32,
) -> StatusCode {
    call(|| {
        if elements.is_null() {
            return StatusCode::E_POINTER;
        }
        // SAFETY: `this` is a `ComBox<EnumGuids>`.
        let enumerator = unsafe { object::<EnumGuids>(this) };
        let batch = enumerator.cursor.take(celt as usize);
        for (index, guid) in batch.iter().enumerate() {
            // SAFETY: the caller provides room for `celt` elements.
            unsafe { *elements.add(index) = *guid };
        }
        if !fetched.is_null() {
            // SAFETY: `fetched` is writable; the batch holds at most `celt`.
            unsafe { *fetched = u32::try_from(batch.len()).unwrap_or(celt) };
        }
        fetched_status(batch.len(), celt)
    })
}

// ── Shared slots ────────────────────────────────────────────────────

trait Enumerator: ComObject {
    fn skip(&self, count: usize) -> bool;
    fn reset(&self);
    fn fork(&self) -> Self;
}

impl Enumerator for EnumStrings {
    fn skip(&self, count: usize) -> bool {
        self.cursor.skip(count)
    }

    fn reset(&self) {
        self.cursor.reset();
    }

    fn fork(&self) -> Self {
        Self {
            cursor: self.cursor.fork(),
        }
    }
}

impl Enumerator for EnumGuids {
    fn skip(&self, count: usize) -> bool {
        self.cursor.skip(count)
    }

    fn reset(&self) {
        self.cursor.reset();
    }

    fn fork(&self) -> Self {
        Self {
            cursor: self.cursor.fork(),
        }
    }
}

unsafe extern "system" fn skip<E: Enumerator>(this: *mut c_void, celt: u32) -> StatusCode {
    call(|| {
        // SAFETY: `this` is a `ComBox<E>`.
        let enumerator = unsafe { object::<E>(this) };
        if enumerator.skip(celt as usize) {
            StatusCode::S_OK
        } else {
            StatusCode::S_FALSE
        }
    })
}

unsafe extern "system" fn reset<E: Enumerator>(this: *mut c_void) -> StatusCode {
    call(|| {
        // SAFETY: `this` is a `ComBox<E>`.
        unsafe { object::<E>(this) }.reset();
        StatusCode::S_OK
    })
}

unsafe extern "system" fn clone<E: Enumerator>(this: *mut c_void, out: *mut *mut c_void) -> StatusCode {
    call(|| {
        if out.is_null() {
            return StatusCode::E_POINTER;
        }
        // SAFETY: `this` is a `ComBox<E>`; `out` is writable.
        unsafe {
            let fork = object::<E>(this).fork();
            *out = ComBox::create_raw(fork).as_ptr();
        }
        StatusCode::S_OK
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::com::StringIterator;

    #[test]
    fn test_clone_keeps_position() {
        let handle = strings(vec!["a".into(), "b".into(), "c".into()]);
        let mut first = StringIterator::new(handle.clone());
        assert_eq!(first.next_batch(1).unwrap(), vec!["a"]);

        let mut out = std::ptr::null_mut();
        // SAFETY: valid enumerator and output slot.
        let status = unsafe { (handle.vtable().clone)(handle.as_raw(), &mut out) };
        assert_eq!(status, StatusCode::S_OK);
        // SAFETY: `Clone` returned a counted `IEnumString` reference.
        let forked = unsafe { Handle::<IEnumString>::from_raw(out) }.unwrap();
        let rest: Vec<String> = StringIterator::new(forked).map(Result::unwrap).collect();
        assert_eq!(rest, vec!["b", "c"]);
    }

    #[test]
    fn test_skip_past_the_end() {
        let handle = guids(vec![Guid::from_u128(1)]);
        // SAFETY: valid enumerator.
        let status = unsafe { (handle.vtable().skip)(handle.as_raw(), 5) };
        assert_eq!(status, StatusCode::S_FALSE);
    }
}
