//! Ownership wrappers for memory crossing the foreign boundary.
//!
//! Outputs allocated by the server (`Remote*`) are freed with the foreign
//! allocator exactly once on drop. Inputs owned by the client (`LocalWide`)
//! stay in Rust memory and are only borrowed for the duration of a call.

use std::fmt;

use crate::com::alloc;

// ── Memory Management ───────────────────────────────────────────────

/// An array allocated by the foreign side.
///
/// Deliberately not `Clone`: two owners would free the block twice.
pub struct RemoteArray<T> {
    pointer: RemotePointer<T>,
    len: u32,
}

impl<T> RemoteArray<T> {
    /// An output slot for a call that returns exactly `len` elements.
    #[inline]
    pub fn new(len: u32) -> Self {
        Self {
            pointer: RemotePointer::null(),
            len,
        }
    }

    #[inline]
    pub fn empty() -> Self {
        Self::new(0)
    }

    /// Takes ownership of a foreign array.
    ///
    /// # Safety
    /// `pointer` must be null or task memory holding `len` elements.
    #[inline]
    pub unsafe fn from_raw(pointer: *mut T, len: u32) -> Self {
        Self {
            pointer: RemotePointer::from_raw(pointer),
            len,
        }
    }

    /// Out-pointer for calls that return the array through `T**`.
    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut *mut T {
        self.pointer.as_mut_ptr()
    }

    /// Out-pointer for calls that also return the element count.
    #[inline]
    pub fn as_mut_len_ptr(&mut self) -> *mut u32 {
        &mut self.len
    }

    /// Records the element count of an output filled by the last call.
    ///
    /// # Safety
    /// The pointer must be null or hold at least `len` elements.
    #[inline]
    pub unsafe fn set_len(&mut self, len: u32) {
        self.len = len;
    }

    #[inline]
    pub fn as_slice(&self) -> &[T] {
        if self.pointer.inner.is_null() || self.len == 0 {
            return &[];
        }
        // SAFETY: a non-null pointer holds `len` elements by construction.
        unsafe { std::slice::from_raw_parts(self.pointer.inner, self.len as usize) }
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        if self.pointer.inner.is_null() || self.len == 0 {
            return &mut [];
        }
        // SAFETY: as in `as_slice`, with exclusive access through `&mut self`.
        unsafe { std::slice::from_raw_parts_mut(self.pointer.inner, self.len as usize) }
    }

    #[inline]
    pub fn len(&self) -> u32 {
        if self.pointer.inner.is_null() { 0 } else { self.len }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Copy> RemoteArray<T> {
    /// Copies the elements out, padding with `fill` up to `expected` when the
    /// server returned fewer (or none).
    pub fn to_vec_padded(&self, expected: usize, fill: T) -> Vec<T> {
        let mut out = self.as_slice().to_vec();
        out.resize(expected, fill);
        out
    }
}

impl RemoteArray<*mut u16> {
    /// Copies every string out and frees each element.
    pub fn take_strings(mut self) -> Vec<String> {
        self.as_mut_slice()
            .iter_mut()
            .map(|slot| RemoteString::from_raw(std::mem::replace(slot, std::ptr::null_mut())))
            .map(|s| s.to_string_lossy())
            .collect()
    }
}

impl<T> Default for RemoteArray<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T> fmt::Debug for RemoteArray<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteArray")
            .field("pointer", &self.pointer.inner)
            .field("len", &self.len)
            .finish()
    }
}

/// A single block allocated by the foreign side.
#[repr(transparent)]
pub struct RemotePointer<T> {
    inner: *mut T,
}

impl<T> RemotePointer<T> {
    #[inline]
    pub fn null() -> Self {
        Self {
            inner: std::ptr::null_mut(),
        }
    }

    #[inline]
    pub(crate) fn from_raw(pointer: *mut T) -> Self {
        Self { inner: pointer }
    }

    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut *mut T {
        &mut self.inner
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.inner.is_null()
    }

    #[inline]
    pub fn get(&self) -> Option<&T> {
        // SAFETY: a non-null pointer refers to an initialized `T`.
        unsafe { self.inner.as_ref() }
    }

    #[inline]
    pub fn get_mut(&mut self) -> Option<&mut T> {
        // SAFETY: as in `get`, with exclusive access.
        unsafe { self.inner.as_mut() }
    }
}

impl<T> Default for RemotePointer<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T> Drop for RemotePointer<T> {
    #[inline]
    fn drop(&mut self) {
        // SAFETY: the block is task memory owned by this wrapper.
        unsafe { alloc::task_free(self.inner.cast()) }
    }
}

/// A null-terminated UTF-16 string allocated by the foreign side.
#[repr(transparent)]
#[derive(Default)]
pub struct RemoteString(RemotePointer<u16>);

impl RemoteString {
    #[inline]
    pub fn null() -> Self {
        Self(RemotePointer::null())
    }

    #[inline]
    pub(crate) fn from_raw(pointer: *mut u16) -> Self {
        Self(RemotePointer::from_raw(pointer))
    }

    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut *mut u16 {
        self.0.as_mut_ptr()
    }

    pub fn is_null(&self) -> bool {
        self.0.is_null()
    }

    /// Copies the text out. Null reads as empty; invalid UTF-16 is replaced.
    pub fn to_string_lossy(&self) -> String {
        // SAFETY: a non-null pointer is a terminated wide string.
        unsafe { wide_ptr_to_string(self.0.inner) }
    }

    /// Copies the text out, `None` when the server returned null.
    pub fn to_option(&self) -> Option<String> {
        (!self.is_null()).then(|| self.to_string_lossy())
    }
}

impl fmt::Debug for RemoteString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RemoteString({:?})", self.to_option())
    }
}

/// Reads a null-terminated wide string. Null reads as empty.
///
/// # Safety
/// `ptr` must be null or point to a terminated UTF-16 string.
pub unsafe fn wide_ptr_to_string(ptr: *const u16) -> String {
    if ptr.is_null() {
        return String::new();
    }
    // SAFETY: scanning stops at the terminator guaranteed by the caller.
    unsafe {
        let mut len = 0usize;
        while *ptr.add(len) != 0 {
            len += 1;
        }
        String::from_utf16_lossy(std::slice::from_raw_parts(ptr, len))
    }
}

/// A null-terminated UTF-16 copy of a Rust string for passing into calls.
#[derive(Clone, PartialEq, Eq)]
pub struct LocalWide(Vec<u16>);

impl LocalWide {
    pub fn new(value: &str) -> Self {
        Self(value.encode_utf16().chain(std::iter::once(0)).collect())
    }

    #[inline]
    pub fn as_ptr(&self) -> *const u16 {
        self.0.as_ptr()
    }

    /// Pointer for fields declared mutable by the ABI but never written.
    #[inline]
    pub fn as_mut_ptr(&self) -> *mut u16 {
        self.0.as_ptr().cast_mut()
    }

    /// Length in code units, without the terminator.
    pub fn len(&self) -> usize {
        self.0.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<S: AsRef<str>> From<S> for LocalWide {
    fn from(value: S) -> Self {
        Self::new(value.as_ref())
    }
}

impl fmt::Debug for LocalWide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LocalWide({:?})", String::from_utf16_lossy(&self.0[..self.len()]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_wide_is_terminated() {
        let wide = LocalWide::from("Tag.1");
        assert_eq!(wide.len(), 5);
        // SAFETY: `wide` is a terminated string alive for the call.
        assert_eq!(unsafe { wide_ptr_to_string(wide.as_ptr()) }, "Tag.1");
        assert!(LocalWide::new("").is_empty());
    }

    #[test]
    fn test_remote_string_frees_and_reads() {
        let raw = alloc::task_alloc_wide("vendor").unwrap();
        let s = RemoteString::from_raw(raw);
        assert_eq!(s.to_string_lossy(), "vendor");
        assert_eq!(s.to_option().as_deref(), Some("vendor"));
        assert_eq!(RemoteString::null().to_option(), None);
    }

    #[test]
    fn test_remote_array_slices() {
        let raw = alloc::task_alloc_slice(&[7u32, 8, 9]).unwrap();
        // SAFETY: three elements of task memory.
        let mut array = unsafe { RemoteArray::from_raw(raw, 3) };
        assert_eq!(array.as_slice(), &[7, 8, 9]);
        array.as_mut_slice()[0] = 1;
        assert_eq!(array.to_vec_padded(4, 0), vec![1, 8, 9, 0]);
        assert_eq!(array.len(), 3);

        let null: RemoteArray<u32> = RemoteArray::new(5);
        assert!(null.is_empty());
        assert!(null.as_slice().is_empty());
    }

    #[test]
    fn test_take_strings() {
        let a = alloc::task_alloc_wide("a").unwrap();
        let b = alloc::task_alloc_wide("bc").unwrap();
        let raw = alloc::task_alloc_slice(&[a, std::ptr::null_mut(), b]).unwrap();
        // SAFETY: three string slots of task memory.
        let array = unsafe { RemoteArray::from_raw(raw, 3) };
        assert_eq!(array.take_strings(), vec!["a", "", "bc"]);
    }
}
