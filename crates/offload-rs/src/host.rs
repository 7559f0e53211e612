use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;

use crate::error::{OffloadError, OffloadResult};

const HOST_ALIGN: usize = 64;

/// Zeroed, 64-byte aligned host allocation.
///
/// Used as the host shadow of managed memory on separate-memory devices and as the backing
/// store of host backends. The buffer is addressed through raw pointers because kernels and
/// the address-range index hold its address while the runtime still owns it.
pub struct HostBuffer {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: HostBuffer exclusively owns its allocation; concurrent access goes through raw
// pointers whose synchronization is the caller's contract, as for device memory.
unsafe impl Send for HostBuffer {}
unsafe impl Sync for HostBuffer {}

impl HostBuffer {
    pub fn zeroed(len: usize) -> OffloadResult<Self> {
        if len == 0 {
            return Ok(Self {
                ptr: NonNull::<u64>::dangling().cast(),
                len,
            });
        }
        let layout = Self::layout(len)?;
        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or_else(|| {
            OffloadError::backend("host alloc", format!("failed to allocate {len} bytes"))
        })?;
        Ok(Self { ptr, len })
    }

    fn layout(len: usize) -> OffloadResult<Layout> {
        Layout::from_size_align(len, HOST_ALIGN)
            .map_err(|err| OffloadError::backend("host alloc", err.to_string()))
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Copies `src` into the buffer at `offset`. Range must be in bounds.
    pub fn write(&self, offset: usize, src: &[u8]) {
        debug_assert!(offset + src.len() <= self.len);
        if src.is_empty() {
            return;
        }
        // SAFETY: range checked by the caller. `src` may point into this buffer through the
        // uva view, so the copy must tolerate overlap.
        unsafe {
            std::ptr::copy(src.as_ptr(), self.ptr.as_ptr().add(offset), src.len());
        }
    }

    /// Copies from the buffer at `offset` into `dst`. Range must be in bounds.
    pub fn read(&self, offset: usize, dst: &mut [u8]) {
        debug_assert!(offset + dst.len() <= self.len);
        if dst.is_empty() {
            return;
        }
        // SAFETY: range checked by the caller; `dst` may overlap through the uva view.
        unsafe {
            std::ptr::copy(self.ptr.as_ptr().add(offset), dst.as_mut_ptr(), dst.len());
        }
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.len];
        self.read(0, &mut out);
        out
    }
}

impl Drop for HostBuffer {
    fn drop(&mut self) {
        if self.len == 0 {
            return;
        }
        if let Ok(layout) = Self::layout(self.len) {
            // SAFETY: allocated in `zeroed` with the same layout and released once.
            unsafe { dealloc(self.ptr.as_ptr(), layout) };
        }
    }
}

impl std::fmt::Debug for HostBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostBuffer")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffers_are_zeroed_and_aligned() {
        let buffer = HostBuffer::zeroed(100).expect("alloc");
        assert_eq!(buffer.as_ptr() as usize % HOST_ALIGN, 0);
        assert!(buffer.to_vec().iter().all(|byte| *byte == 0));
        buffer.write(10, &[1, 2, 3]);
        let mut out = [0u8; 4];
        buffer.read(9, &mut out);
        assert_eq!(out, [0, 1, 2, 3]);
    }

    #[test]
    fn empty_buffer_does_not_allocate() {
        let buffer = HostBuffer::zeroed(0).expect("alloc");
        assert!(buffer.is_empty());
        assert!(buffer.to_vec().is_empty());
    }
}
