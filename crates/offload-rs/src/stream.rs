use std::any::Any;
use std::fmt;
use std::sync::Weak;
use std::time::Instant;

use crate::device::{Device, DeviceInner};
use crate::error::OffloadResult;

/// Opaque backend queue handle. `StreamHandle::DEFAULT` is the backend's implicit queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StreamHandle(pub usize);

impl StreamHandle {
    pub const DEFAULT: StreamHandle = StreamHandle(0);
}

/// Backend event resource carried by a [`StreamTag`]; released when the tag is dropped.
pub trait NativeEvent: Send + Sync {
    fn as_any(&self) -> &dyn Any;
}

/// Point-in-time marker on a stream.
pub struct StreamTag {
    wall_time: Option<Instant>,
    event: Option<Box<dyn NativeEvent>>,
}

impl StreamTag {
    /// Tag for backends that execute synchronously and time with the host clock.
    pub fn wall_clock() -> Self {
        Self {
            wall_time: Some(Instant::now()),
            event: None,
        }
    }

    pub fn from_event(event: impl NativeEvent + 'static) -> Self {
        Self {
            wall_time: None,
            event: Some(Box::new(event)),
        }
    }

    pub fn wall_time(&self) -> Option<Instant> {
        self.wall_time
    }

    pub fn event<T: 'static>(&self) -> Option<&T> {
        self.event
            .as_ref()
            .and_then(|event| event.as_any().downcast_ref::<T>())
    }
}

impl fmt::Debug for StreamTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamTag")
            .field("wall_time", &self.wall_time)
            .field("has_event", &self.event.is_some())
            .finish()
    }
}

/// Ordered command queue owned by a [`Device`].
///
/// Streams are plain values: copies name the same queue, and the queue lives until it is freed
/// through its device or the device is torn down.
#[derive(Clone)]
pub struct Stream {
    device: Weak<DeviceInner>,
    handle: StreamHandle,
}

impl Stream {
    pub(crate) fn new(device: Weak<DeviceInner>, handle: StreamHandle) -> Self {
        Self { device, handle }
    }

    pub fn handle(&self) -> StreamHandle {
        self.handle
    }

    pub fn device(&self) -> Option<Device> {
        self.device.upgrade().map(Device::from_inner)
    }

    pub(crate) fn belongs_to(&self, device: &Weak<DeviceInner>) -> bool {
        Weak::ptr_eq(&self.device, device)
    }

    /// Frees the queue through its device. A no-op once the device is gone.
    pub fn free(self) -> OffloadResult<()> {
        match self.device() {
            Some(device) => device.free_stream(&self),
            None => Ok(()),
        }
    }
}

impl PartialEq for Stream {
    fn eq(&self, other: &Self) -> bool {
        self.handle == other.handle && Weak::ptr_eq(&self.device, &other.device)
    }
}

impl Eq for Stream {}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream").field("handle", &self.handle).finish()
    }
}
