//! Device allocations and the managed-memory state machine.
//!
//! A [`Memory`] is a shared handle over one backend allocation. Managed memory additionally
//! carries a host shadow (on separate-memory devices) addressed through its unified pointer;
//! kernel launches and `Device::finish` move it between the states of [`UvaState`].

use std::fmt;
use std::ops::Range;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tracing::{debug, trace};

use crate::backend::MemoryBackend;
use crate::device::{Device, DeviceInner};
use crate::error::{OffloadError, OffloadResult};
use crate::host::HostBuffer;
use crate::properties::Properties;
use crate::uva;

/// Byte count meaning "everything from the offset to the end of the allocation".
pub const REST_OF_BUFFER: i64 = -1;

/// Validates a copy of `bytes` at `offset` against an allocation of `size` bytes.
///
/// Fails when `offset < 0`, `bytes < -1`, or the range runs past `size`. Returns the
/// resolved byte range.
pub fn resolve_copy_range(
    op: &'static str,
    bytes: i64,
    offset: i64,
    size: usize,
) -> OffloadResult<Range<usize>> {
    let out_of_bounds = || OffloadError::bounds(op, bytes, offset, size);
    if offset < 0 || bytes < REST_OF_BUFFER {
        return Err(out_of_bounds());
    }
    let size_i = i64::try_from(size).map_err(|_| out_of_bounds())?;
    let len = if bytes == REST_OF_BUFFER {
        if offset > size_i {
            return Err(out_of_bounds());
        }
        size_i - offset
    } else {
        match offset.checked_add(bytes) {
            Some(end) if end <= size_i => bytes,
            _ => return Err(out_of_bounds()),
        }
    };
    let start = offset as usize;
    Ok(start..start + len as usize)
}

/// Managed-memory state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UvaState {
    /// Not tracked; copies go straight to the native allocation.
    Unmanaged,
    /// Managed; the host shadow is authoritative and the device copy is missing or outdated.
    HostOnly,
    /// Managed; the device copy mirrors the host view.
    Resident,
    /// Managed; the device holds writes not yet flushed to the host shadow.
    DeviceDirty,
}

struct UvaRegistration {
    ptr: usize,
    /// Native handle registered as a single-pointer entry when it differs from `ptr`.
    handle: Option<usize>,
}

struct MemoryState {
    uva: UvaState,
    shadow: Option<HostBuffer>,
    registration: Option<UvaRegistration>,
}

impl MemoryState {
    /// Shadow buffer that currently holds the authoritative host view, if any.
    fn host_view(&self) -> Option<&HostBuffer> {
        match self.uva {
            UvaState::HostOnly | UvaState::Resident => self.shadow.as_ref(),
            UvaState::Unmanaged | UvaState::DeviceDirty => None,
        }
    }
}

pub(crate) struct MemoryInner {
    device: Weak<DeviceInner>,
    mode: String,
    separate_memory_space: bool,
    size: usize,
    props: Properties,
    state: Mutex<MemoryState>,
    backend: Box<dyn MemoryBackend>,
}

impl Drop for MemoryInner {
    fn drop(&mut self) {
        let owner: *const MemoryInner = self;
        let state = match self.state.get_mut() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        let registration = state.registration.take();
        if let Some(reg) = &registration {
            uva::with_global(|global| {
                global.index.remove_range(reg.ptr, self.size, owner);
                if let Some(handle) = reg.handle {
                    global.index.remove_point(handle, owner);
                }
            });
        }
        if let Some(device) = self.device.upgrade() {
            device.release_allocation(self.size, registration.map(|reg| reg.ptr), owner);
        }
        trace!(mode = %self.mode, bytes = self.size, "memory released");
        // The backend allocation and the shadow are dropped after this body, once the index
        // no longer points at them.
    }
}

/// Shared handle over one device allocation.
#[derive(Clone)]
pub struct Memory {
    inner: Arc<MemoryInner>,
}

impl Memory {
    pub(crate) fn new(
        device: &Arc<DeviceInner>,
        backend: Box<dyn MemoryBackend>,
        props: Properties,
    ) -> Self {
        Memory {
            inner: Arc::new(MemoryInner {
                device: Arc::downgrade(device),
                mode: device.mode().to_string(),
                separate_memory_space: device.has_separate_memory_space(),
                size: backend.size(),
                props,
                state: Mutex::new(MemoryState {
                    uva: UvaState::Unmanaged,
                    shadow: None,
                    registration: None,
                }),
                backend,
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<MemoryInner>) -> Self {
        Memory { inner }
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.inner.state.lock().expect("memory state poisoned")
    }

    pub fn size(&self) -> usize {
        self.inner.size
    }

    pub fn mode(&self) -> &str {
        &self.inner.mode
    }

    pub fn properties(&self) -> &Properties {
        &self.inner.props
    }

    /// Owning device, while it is alive.
    pub fn device(&self) -> Option<Device> {
        self.inner.device.upgrade().map(Device::from_inner)
    }

    pub(crate) fn owned_by(&self, device: *const DeviceInner) -> bool {
        Weak::as_ptr(&self.inner.device) == device
    }

    pub fn native_handle(&self) -> usize {
        self.inner.backend.native_handle()
    }

    pub fn backend(&self) -> &dyn MemoryBackend {
        self.inner.backend.as_ref()
    }

    /// True when both handles refer to the same allocation.
    pub fn ptr_eq(&self, other: &Memory) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Number of live handles over this allocation.
    pub fn use_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    pub fn uva_state(&self) -> UvaState {
        self.state().uva
    }

    pub fn is_managed(&self) -> bool {
        self.uva_state() != UvaState::Unmanaged
    }

    pub fn in_device(&self) -> bool {
        matches!(
            self.uva_state(),
            UvaState::Resident | UvaState::DeviceDirty
        )
    }

    pub fn is_stale(&self) -> bool {
        self.uva_state() == UvaState::DeviceDirty
    }

    /// Unified host-visible pointer, once [`Memory::setup_uva`] ran.
    pub fn uva_ptr(&self) -> Option<*mut u8> {
        self.state()
            .registration
            .as_ref()
            .map(|reg| reg.ptr as *mut u8)
    }

    /// Looks up the allocation owning `ptr` in the global address-range index.
    pub fn resolve_ptr<T>(ptr: *const T) -> Option<Memory> {
        uva::resolve(ptr as usize).map(|(memory, _)| memory)
    }

    /// Like [`Memory::resolve_ptr`], also returning the offset of `ptr` in the allocation.
    pub fn resolve_ptr_with_offset<T>(ptr: *const T) -> Option<(Memory, usize)> {
        uva::resolve(ptr as usize)
    }

    /// Gives the allocation a unified pointer and registers it in the address-range indices.
    ///
    /// On shared-memory devices the pointer is the allocation itself. On separate-memory
    /// devices a host shadow is allocated and filled from the device copy. Idempotent.
    pub fn setup_uva(&self) -> OffloadResult<*mut u8> {
        let mut state = self.state();
        if let Some(reg) = &state.registration {
            return Ok(reg.ptr as *mut u8);
        }
        let handle = self.native_handle();
        let ptr = if self.inner.separate_memory_space {
            let shadow = HostBuffer::zeroed(self.inner.size)?;
            if self.inner.size != 0 {
                // SAFETY: the shadow is exactly `size` bytes and exclusively owned here.
                let view = unsafe {
                    std::slice::from_raw_parts_mut(shadow.as_ptr(), self.inner.size)
                };
                self.inner.backend.copy_to_host(view, 0)?;
            }
            let ptr = shadow.as_ptr() as usize;
            state.shadow = Some(shadow);
            ptr
        } else {
            match self.inner.backend.host_ptr() {
                Some(ptr) => ptr.as_ptr() as usize,
                None => handle,
            }
        };
        let registration = UvaRegistration {
            ptr,
            handle: (handle != ptr).then_some(handle),
        };
        let weak = Arc::downgrade(&self.inner);
        uva::with_global(|global| {
            global.index.insert_range(ptr, self.inner.size, weak.clone());
            if let Some(handle) = registration.handle {
                global.index.insert_point(handle, weak.clone());
            }
        });
        if let Some(device) = self.inner.device.upgrade() {
            device.register_uva(ptr, self.inner.size, weak);
        }
        state.registration = Some(registration);
        debug!(mode = %self.inner.mode, bytes = self.inner.size, "uva pointer registered");
        Ok(ptr as *mut u8)
    }

    /// Starts automatic host/device tracking; sets up the unified pointer if needed.
    pub fn start_managing(&self) -> OffloadResult<()> {
        self.setup_uva()?;
        let mut state = self.state();
        if state.uva == UvaState::Unmanaged {
            state.uva = if self.inner.separate_memory_space {
                UvaState::HostOnly
            } else {
                UvaState::Resident
            };
        }
        Ok(())
    }

    /// Stops tracking. Host shadow and device copy are made consistent first.
    pub fn stop_managing(&self) -> OffloadResult<()> {
        let mut state = self.state();
        let was_dirty = match state.uva {
            UvaState::Unmanaged => return Ok(()),
            UvaState::HostOnly => {
                if let Some(shadow) = &state.shadow {
                    self.inner.backend.copy_from_host(&shadow.to_vec(), 0)?;
                }
                false
            }
            UvaState::Resident => false,
            UvaState::DeviceDirty => {
                self.flush_locked(&mut state)?;
                true
            }
        };
        state.uva = UvaState::Unmanaged;
        drop(state);
        if was_dirty {
            self.forget_pending();
        }
        Ok(())
    }

    /// Copies `bytes` (or [`REST_OF_BUFFER`]) from `src` into the allocation at `offset`.
    pub fn copy_from(&self, src: &[u8], bytes: i64, offset: i64) -> OffloadResult<()> {
        let range = resolve_copy_range("copy_from", bytes, offset, self.size())?;
        let src = host_prefix("copy_from", src, &range, bytes, offset)?;
        self.write_range(src, range.start)
    }

    /// Copies `bytes` (or [`REST_OF_BUFFER`]) at `offset` into `dst`.
    pub fn copy_to(&self, dst: &mut [u8], bytes: i64, offset: i64) -> OffloadResult<()> {
        let range = resolve_copy_range("copy_to", bytes, offset, self.size())?;
        let len = range.len();
        if dst.len() < len {
            return Err(OffloadError::bounds("copy_to", bytes, offset, dst.len()));
        }
        self.read_range(&mut dst[..len], range.start)
    }

    /// Raw-pointer form of [`Memory::copy_from`].
    ///
    /// # Safety
    /// `src` must be valid for reads of the resolved byte count.
    pub unsafe fn copy_from_ptr(&self, src: *const u8, bytes: i64, offset: i64) -> OffloadResult<()> {
        let range = resolve_copy_range("copy_from", bytes, offset, self.size())?;
        if range.is_empty() {
            return Ok(());
        }
        // `src` may point into this allocation's uva view, so it is staged before the write.
        let mut staging = vec![0u8; range.len()];
        // SAFETY: guaranteed by the caller; `staging` is a fresh allocation.
        unsafe { std::ptr::copy_nonoverlapping(src, staging.as_mut_ptr(), range.len()) };
        self.write_range(&staging, range.start)
    }

    /// Raw-pointer form of [`Memory::copy_to`].
    ///
    /// # Safety
    /// `dst` must be valid for writes of the resolved byte count.
    pub unsafe fn copy_to_ptr(&self, dst: *mut u8, bytes: i64, offset: i64) -> OffloadResult<()> {
        let range = resolve_copy_range("copy_to", bytes, offset, self.size())?;
        if range.is_empty() {
            return Ok(());
        }
        let mut staging = vec![0u8; range.len()];
        self.read_range(&mut staging, range.start)?;
        // SAFETY: guaranteed by the caller. `dst` may overlap the uva view.
        unsafe { std::ptr::copy(staging.as_ptr(), dst, range.len()) };
        Ok(())
    }

    /// Copies from `src` into this allocation. [`REST_OF_BUFFER`] copies the rest of `self`
    /// from `dest_offset`; both ranges are checked.
    pub fn copy_from_memory(
        &self,
        src: &Memory,
        bytes: i64,
        dest_offset: i64,
        src_offset: i64,
    ) -> OffloadResult<()> {
        let dst_range = resolve_copy_range("copy_from_memory", bytes, dest_offset, self.size())?;
        let len = dst_range.len() as i64;
        let src_range = resolve_copy_range("copy_from_memory", len, src_offset, src.size())?;
        transfer(src, src_range.start, self, dst_range.start, dst_range.len())
    }

    /// Copies from this allocation into `dest`. [`REST_OF_BUFFER`] copies the rest of `self`
    /// from `src_offset`; both ranges are checked.
    pub fn copy_to_memory(
        &self,
        dest: &Memory,
        bytes: i64,
        dest_offset: i64,
        src_offset: i64,
    ) -> OffloadResult<()> {
        let src_range = resolve_copy_range("copy_to_memory", bytes, src_offset, self.size())?;
        let len = src_range.len() as i64;
        let dst_range = resolve_copy_range("copy_to_memory", len, dest_offset, dest.size())?;
        transfer(self, src_range.start, dest, dst_range.start, src_range.len())
    }

    /// Pushes the host shadow to the device. Managed memory becomes resident and leaves the
    /// pending-flush queue. No-op without a shadow.
    pub fn sync_to_device(&self, bytes: i64, offset: i64) -> OffloadResult<()> {
        let range = resolve_copy_range("sync_to_device", bytes, offset, self.size())?;
        let mut state = self.state();
        let Some(shadow) = &state.shadow else {
            return Ok(());
        };
        let mut staging = vec![0u8; range.len()];
        shadow.read(range.start, &mut staging);
        self.inner.backend.copy_from_host(&staging, range.start)?;
        let was_dirty = state.uva == UvaState::DeviceDirty;
        if state.uva != UvaState::Unmanaged {
            state.uva = UvaState::Resident;
        }
        drop(state);
        if was_dirty {
            self.forget_pending();
        }
        Ok(())
    }

    /// Pulls device contents into the host shadow. Managed memory returns to host-only and
    /// leaves the pending-flush queue. No-op without a shadow.
    pub fn sync_from_device(&self, bytes: i64, offset: i64) -> OffloadResult<()> {
        let range = resolve_copy_range("sync_from_device", bytes, offset, self.size())?;
        let mut state = self.state();
        let Some(shadow) = &state.shadow else {
            return Ok(());
        };
        let mut staging = vec![0u8; range.len()];
        self.inner.backend.copy_to_host(&mut staging, range.start)?;
        shadow.write(range.start, &staging);
        let was_dirty = state.uva == UvaState::DeviceDirty;
        if state.uva != UvaState::Unmanaged {
            state.uva = UvaState::HostOnly;
        }
        drop(state);
        if was_dirty {
            self.forget_pending();
        }
        Ok(())
    }

    /// Releases this handle. The last release unregisters the allocation and frees it.
    pub fn free(self) {
        drop(self);
    }

    /// Releases this handle without freeing the native allocation, which stays with its
    /// external owner.
    ///
    /// Ownership is a property of the allocation, not of the handle: once any handle is
    /// detached, releasing the remaining siblings never frees the native allocation either.
    /// Siblings stay usable until the last one is released.
    pub fn detach(self) {
        self.inner.backend.detach();
        drop(self);
    }

    /// Prepares the allocation for a kernel launch.
    ///
    /// Host-only managed memory is uploaded. Returns `true` when a writable launch newly made
    /// the device copy dirty; the caller queues the memory on its device for flushing.
    pub(crate) fn stage_for_launch(&self, is_const: bool) -> OffloadResult<bool> {
        if !self.inner.separate_memory_space {
            return Ok(false);
        }
        let mut state = self.state();
        if state.uva == UvaState::Unmanaged {
            return Ok(false);
        }
        if state.uva == UvaState::HostOnly {
            if let Some(shadow) = &state.shadow {
                self.inner.backend.copy_from_host(&shadow.to_vec(), 0)?;
            }
            state.uva = UvaState::Resident;
        }
        if !is_const && state.uva != UvaState::DeviceDirty {
            state.uva = UvaState::DeviceDirty;
            return Ok(true);
        }
        Ok(false)
    }

    /// Copies dirty device contents back into the shadow. Returns whether anything moved.
    pub(crate) fn flush_to_host(&self) -> OffloadResult<bool> {
        let mut state = self.state();
        if state.uva != UvaState::DeviceDirty {
            return Ok(false);
        }
        self.flush_locked(&mut state)?;
        Ok(true)
    }

    fn flush_locked(&self, state: &mut MemoryState) -> OffloadResult<()> {
        if let Some(shadow) = &state.shadow {
            let mut staging = vec![0u8; self.inner.size];
            self.inner.backend.copy_to_host(&mut staging, 0)?;
            shadow.write(0, &staging);
        }
        state.uva = UvaState::HostOnly;
        Ok(())
    }

    fn forget_pending(&self) {
        if let Some(device) = self.inner.device.upgrade() {
            device.forget_pending(self);
        }
    }

    fn write_range(&self, src: &[u8], offset: usize) -> OffloadResult<()> {
        if src.is_empty() {
            return Ok(());
        }
        let state = self.state();
        match state.uva {
            UvaState::HostOnly => {
                if let Some(shadow) = &state.shadow {
                    shadow.write(offset, src);
                    return Ok(());
                }
                self.inner.backend.copy_from_host(src, offset)
            }
            UvaState::Resident => {
                self.inner.backend.copy_from_host(src, offset)?;
                if let Some(shadow) = &state.shadow {
                    shadow.write(offset, src);
                }
                Ok(())
            }
            UvaState::Unmanaged | UvaState::DeviceDirty => {
                self.inner.backend.copy_from_host(src, offset)
            }
        }
    }

    fn read_range(&self, dst: &mut [u8], offset: usize) -> OffloadResult<()> {
        if dst.is_empty() {
            return Ok(());
        }
        let state = self.state();
        match state.host_view() {
            Some(shadow) => {
                shadow.read(offset, dst);
                Ok(())
            }
            None => self.inner.backend.copy_to_host(dst, offset),
        }
    }

    /// True when reads and writes go straight to the native allocation.
    fn is_native_view(&self) -> bool {
        let state = self.state();
        matches!(state.uva, UvaState::Unmanaged | UvaState::DeviceDirty) || state.shadow.is_none()
    }
}

fn host_prefix<'a>(
    op: &'static str,
    src: &'a [u8],
    range: &Range<usize>,
    bytes: i64,
    offset: i64,
) -> OffloadResult<&'a [u8]> {
    src.get(..range.len())
        .ok_or_else(|| OffloadError::bounds(op, bytes, offset, src.len()))
}

fn transfer(
    src: &Memory,
    src_offset: usize,
    dst: &Memory,
    dst_offset: usize,
    len: usize,
) -> OffloadResult<()> {
    if len == 0 {
        return Ok(());
    }
    if src.is_native_view() && dst.is_native_view() {
        return dst
            .inner
            .backend
            .copy_from_memory(src.backend(), len, dst_offset, src_offset);
    }
    let mut staging = vec![0u8; len];
    src.read_range(&mut staging, src_offset)?;
    dst.write_range(&staging, dst_offset)
}

impl fmt::Debug for Memory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Memory")
            .field("mode", &self.inner.mode)
            .field("size", &self.inner.size)
            .field("handle", &format_args!("{:#x}", self.native_handle()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fails(bytes: i64, offset: i64, size: usize) -> bool {
        resolve_copy_range("test", bytes, offset, size).is_err()
    }

    #[test]
    fn bounds_follow_the_copy_contract() {
        for size in [0usize, 1, 7, 64] {
            let n = size as i64;
            for offset in -2..=n + 2 {
                for bytes in -3..=n + 2 {
                    let expected = offset < 0
                        || bytes < -1
                        || if bytes == -1 {
                            offset > n
                        } else {
                            offset + bytes > n
                        };
                    assert_eq!(
                        fails(bytes, offset, size),
                        expected,
                        "bytes={bytes} offset={offset} size={size}"
                    );
                }
            }
        }
    }

    #[test]
    fn rest_of_buffer_resolves_to_remaining_bytes() {
        assert_eq!(
            resolve_copy_range("test", REST_OF_BUFFER, 10, 64).expect("in bounds"),
            10..64
        );
        assert_eq!(
            resolve_copy_range("test", REST_OF_BUFFER, 64, 64).expect("in bounds"),
            64..64
        );
    }

    #[test]
    fn bounds_errors_name_the_operation() {
        let err = resolve_copy_range("copy_to", 8, 60, 64).expect_err("out of bounds");
        assert!(err.is_bounds());
        assert!(err.to_string().contains("copy_to"));
    }

    #[test]
    fn overflowing_ranges_are_rejected() {
        assert!(fails(i64::MAX, 1, 64));
    }
}
