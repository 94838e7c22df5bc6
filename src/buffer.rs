//! Caller-owned memory view
//!
//! A `Buffer` is the only payload channel of a `send` call. Depending on the
//! command it is read as a native int, read as raw bytes, or used as a slot
//! that receives an int or a pointer. Every coercion is bounds-checked against
//! the size the host declared.

use std::mem::size_of;
use std::os::raw::{c_int, c_uint, c_void};
use std::ptr;

use crate::error::BufferError;

/// Value returned by [`Buffer::read_int`] when the buffer is not int-sized.
pub const INT_SENTINEL: c_int = -9999;

/// Plain-old-data records that may be read out of a buffer.
///
/// # Safety
/// Every bit pattern of `size_of::<Self>()` bytes must be a valid `Self`.
pub unsafe trait Record: Copy {}

/// Borrowed view over the memory region of one `send` call.
///
/// Never outlives the call that supplied it.
pub struct Buffer<'a> {
    bytes: &'a mut [u8],
}

impl<'a> Buffer<'a> {
    pub fn new(bytes: &'a mut [u8]) -> Self {
        Self { bytes }
    }

    /// View `size` bytes at `data`. A null pointer yields an empty buffer.
    ///
    /// # Safety
    /// If `data` is non-null it must be valid for reads and writes of `size`
    /// bytes for the whole lifetime `'a`, and not aliased by Rust references.
    pub unsafe fn from_raw(size: c_uint, data: *mut c_void) -> Self {
        if data.is_null() || size == 0 {
            return Self { bytes: Default::default() };
        }
        Self {
            bytes: std::slice::from_raw_parts_mut(data.cast::<u8>(), size as usize),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// True when the region is exactly one native int wide.
    pub fn is_int_sized(&self) -> bool {
        self.bytes.len() == size_of::<c_int>()
    }

    /// Interpret the region as a native int, or [`INT_SENTINEL`] if its size
    /// differs from the native int width.
    pub fn read_int(&self) -> c_int {
        match <[u8; size_of::<c_int>()]>::try_from(&*self.bytes) {
            Ok(raw) => c_int::from_ne_bytes(raw),
            Err(_) => INT_SENTINEL,
        }
    }

    /// Checked variant of [`Buffer::read_int`].
    pub fn try_read_int(&self) -> Result<c_int, BufferError> {
        if !self.is_int_sized() {
            return Err(BufferError::NotAnInteger {
                expected: size_of::<c_int>(),
                actual: self.bytes.len(),
            });
        }
        Ok(self.read_int())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &*self.bytes
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut *self.bytes
    }

    /// Owned copy of the whole region.
    pub fn to_byte_string(&self) -> Vec<u8> {
        self.bytes.to_vec()
    }

    /// Write `value` into the first native-int-width bytes.
    pub fn write_int(&mut self, value: c_int) -> Result<(), BufferError> {
        self.write_prefix(&value.to_ne_bytes())
    }

    /// Write a read-only pointer into the region, treated as a pointer slot.
    pub fn write_ptr<T>(&mut self, value: *const T) -> Result<(), BufferError> {
        self.write_prefix(&(value as usize).to_ne_bytes())
    }

    /// Write a writable pointer into the region, treated as a pointer slot.
    pub fn write_mut_ptr<T>(&mut self, value: *mut T) -> Result<(), BufferError> {
        self.write_ptr(value as *const T)
    }

    /// Copy a fixed-layout record out of the start of the region.
    pub fn read_record<T: Record>(&self) -> Result<T, BufferError> {
        self.require(size_of::<T>())?;
        // SAFETY: length checked above; `Record` guarantees any bit pattern is
        // valid and `read_unaligned` has no alignment requirement.
        Ok(unsafe { ptr::read_unaligned(self.bytes.as_ptr().cast::<T>()) })
    }

    fn write_prefix(&mut self, raw: &[u8]) -> Result<(), BufferError> {
        self.require(raw.len())?;
        self.bytes[..raw.len()].copy_from_slice(raw);
        Ok(())
    }

    fn require(&self, needed: usize) -> Result<(), BufferError> {
        if self.bytes.len() < needed {
            return Err(BufferError::TooSmall {
                needed,
                actual: self.bytes.len(),
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for Buffer<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer").field("size", &self.bytes.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[repr(C)]
    #[derive(Clone, Copy, Debug, PartialEq)]
    struct Pair {
        a: *const f32,
        n: c_int,
    }

    unsafe impl Record for Pair {}

    #[test]
    fn test_int_sized_roundtrip() {
        let mut raw = [0u8; 4];
        let mut buffer = Buffer::new(&mut raw);
        for value in [0, 1, -1, 42, c_int::MAX, c_int::MIN, INT_SENTINEL] {
            buffer.write_int(value).unwrap();
            assert_eq!(buffer.read_int(), value);
        }
    }

    #[test]
    fn test_read_int_sentinel_on_size_mismatch() {
        for size in [0usize, 1, 3, 5, 8, 64] {
            let mut raw = vec![0x11u8; size];
            let buffer = Buffer::new(&mut raw);
            assert_eq!(buffer.read_int(), INT_SENTINEL, "size {}", size);
            assert!(buffer.try_read_int().is_err());
        }
    }

    #[test]
    fn test_write_int_into_larger_buffer() {
        let mut raw = [0xffu8; 8];
        Buffer::new(&mut raw).write_int(7).unwrap();
        assert_eq!(&raw[..4], &7i32.to_ne_bytes());
        assert_eq!(&raw[4..], &[0xff; 4]);
    }

    #[test]
    fn test_write_int_too_small() {
        let mut raw = [0u8; 2];
        let err = Buffer::new(&mut raw).write_int(7).unwrap_err();
        assert_eq!(err, BufferError::TooSmall { needed: 4, actual: 2 });
        assert_eq!(raw, [0, 0]);
    }

    #[test]
    fn test_byte_string_any_size() {
        let mut empty: [u8; 0] = [];
        assert!(Buffer::new(&mut empty).to_byte_string().is_empty());

        let mut raw = *b"net: \"x\"";
        assert_eq!(Buffer::new(&mut raw).to_byte_string(), b"net: \"x\"".to_vec());
    }

    #[test]
    fn test_pointer_slot() {
        let values = [1.0f32, 2.0, 3.0];
        let mut slot = [0u8; size_of::<usize>()];
        Buffer::new(&mut slot).write_ptr(values.as_ptr()).unwrap();
        assert_eq!(usize::from_ne_bytes(slot), values.as_ptr() as usize);

        let mut short = [0u8; 2];
        assert!(Buffer::new(&mut short).write_ptr(values.as_ptr()).is_err());
    }

    #[test]
    fn test_read_record() {
        let data = [0.5f32];
        let pair = Pair { a: data.as_ptr(), n: 3 };
        let mut raw = vec![0u8; size_of::<Pair>()];
        unsafe { ptr::write_unaligned(raw.as_mut_ptr().cast::<Pair>(), pair) };

        let read: Pair = Buffer::new(&mut raw).read_record().unwrap();
        assert_eq!(read, pair);

        let mut short = vec![0u8; size_of::<Pair>() - 1];
        assert!(Buffer::new(&mut short).read_record::<Pair>().is_err());
    }

    #[test]
    fn test_from_raw_null_is_empty() {
        let buffer = unsafe { Buffer::from_raw(16, ptr::null_mut()) };
        assert!(buffer.is_empty());
        assert_eq!(buffer.read_int(), INT_SENTINEL);
    }
}
