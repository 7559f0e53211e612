use std::fmt;

use crate::backend::LaunchArg;
use crate::memory::Memory;

/// Scalar kernel argument.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Scalar {
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
}

impl Scalar {
    pub fn size(&self) -> usize {
        match self {
            Scalar::I8(_) | Scalar::U8(_) => 1,
            Scalar::I16(_) | Scalar::U16(_) => 2,
            Scalar::I32(_) | Scalar::U32(_) | Scalar::F32(_) => 4,
            Scalar::I64(_) | Scalar::U64(_) | Scalar::F64(_) => 8,
        }
    }

    fn to_launch(self) -> LaunchArg {
        let mut bytes = [0u8; 8];
        let len = self.size();
        match self {
            Scalar::I8(v) => bytes[..1].copy_from_slice(&v.to_ne_bytes()),
            Scalar::I16(v) => bytes[..2].copy_from_slice(&v.to_ne_bytes()),
            Scalar::I32(v) => bytes[..4].copy_from_slice(&v.to_ne_bytes()),
            Scalar::I64(v) => bytes.copy_from_slice(&v.to_ne_bytes()),
            Scalar::U8(v) => bytes[..1].copy_from_slice(&v.to_ne_bytes()),
            Scalar::U16(v) => bytes[..2].copy_from_slice(&v.to_ne_bytes()),
            Scalar::U32(v) => bytes[..4].copy_from_slice(&v.to_ne_bytes()),
            Scalar::U64(v) => bytes.copy_from_slice(&v.to_ne_bytes()),
            Scalar::F32(v) => bytes[..4].copy_from_slice(&v.to_ne_bytes()),
            Scalar::F64(v) => bytes.copy_from_slice(&v.to_ne_bytes()),
        }
        LaunchArg::Value { bytes, len }
    }
}

/// One positional kernel argument.
#[derive(Clone)]
pub enum KernelArg {
    Scalar(Scalar),
    /// Pointer the address-range index does not know; passed through unchanged.
    Pointer(usize),
    /// Device memory, optionally at a byte offset into the allocation.
    Memory { memory: Memory, offset: usize },
}

impl KernelArg {
    /// Wraps a raw pointer. Pointers into a registered allocation become memory arguments so
    /// the kernel receives the native handle (plus offset) and managed memory is tracked.
    pub fn ptr<T>(ptr: *const T) -> KernelArg {
        match Memory::resolve_ptr_with_offset(ptr) {
            Some((memory, offset)) => KernelArg::Memory { memory, offset },
            None => KernelArg::Pointer(ptr as usize),
        }
    }

    pub fn memory(&self) -> Option<&Memory> {
        match self {
            KernelArg::Memory { memory, .. } => Some(memory),
            _ => None,
        }
    }

    pub(crate) fn to_launch(&self) -> LaunchArg {
        match self {
            KernelArg::Scalar(scalar) => scalar.to_launch(),
            KernelArg::Pointer(ptr) => LaunchArg::Pointer(*ptr),
            KernelArg::Memory { memory, offset } => {
                LaunchArg::Pointer(memory.native_handle() + offset)
            }
        }
    }
}

impl fmt::Debug for KernelArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelArg::Scalar(scalar) => write!(f, "{scalar:?}"),
            KernelArg::Pointer(ptr) => write!(f, "Pointer({ptr:#x})"),
            KernelArg::Memory { memory, offset } => f
                .debug_struct("Memory")
                .field("memory", memory)
                .field("offset", offset)
                .finish(),
        }
    }
}

macro_rules! scalar_arg {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for KernelArg {
                fn from(value: $ty) -> Self {
                    KernelArg::Scalar(Scalar::$variant(value))
                }
            }
        )*
    };
}

scalar_arg!(
    i8 => I8,
    i16 => I16,
    i32 => I32,
    i64 => I64,
    u8 => U8,
    u16 => U16,
    u32 => U32,
    u64 => U64,
    f32 => F32,
    f64 => F64,
);

impl From<Scalar> for KernelArg {
    fn from(value: Scalar) -> Self {
        KernelArg::Scalar(value)
    }
}

impl From<Memory> for KernelArg {
    fn from(memory: Memory) -> Self {
        KernelArg::Memory { memory, offset: 0 }
    }
}

impl From<&Memory> for KernelArg {
    fn from(memory: &Memory) -> Self {
        KernelArg::Memory {
            memory: memory.clone(),
            offset: 0,
        }
    }
}

impl<T> From<*const T> for KernelArg {
    fn from(ptr: *const T) -> Self {
        KernelArg::ptr(ptr)
    }
}

impl<T> From<*mut T> for KernelArg {
    fn from(ptr: *mut T) -> Self {
        KernelArg::ptr(ptr.cast_const())
    }
}
