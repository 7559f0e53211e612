//! Kernel handles and argument marshalling.

mod arg;
mod builder;

use std::ffi::c_void;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use smallvec::SmallVec;
use tracing::{error, trace};

pub use arg::{KernelArg, Scalar};
pub use builder::KernelBuilder;

use crate::backend::{KernelBackend, Launch, LaunchArg};
use crate::compiler::KernelMetadata;
use crate::device::{Device, DeviceInner};
use crate::dim::Dim;
use crate::error::{OffloadError, OffloadResult};
use crate::memory::Memory;

/// Upper bound on positional kernel arguments.
pub const MAX_ARGS: usize = 50;

type LaunchArgs = SmallVec<[LaunchArg; 8]>;

struct KernelState {
    outer: Option<Dim>,
    inner: Option<Dim>,
    arguments: Vec<Option<KernelArg>>,
}

struct KernelInner {
    // Field order is drop order: nested kernels go before the kernel that launches them,
    // and a private launcher device goes last.
    nested: NestedKernels,
    backend: Box<dyn KernelBackend>,
    name: String,
    metadata: KernelMetadata,
    state: Mutex<KernelState>,
    device: Weak<DeviceInner>,
    launcher_device: Option<Device>,
}

/// Shared handle over one compiled kernel.
#[derive(Clone)]
pub struct Kernel {
    inner: Arc<KernelInner>,
}

impl Kernel {
    pub(crate) fn new(
        device: &Device,
        backend: Box<dyn KernelBackend>,
        metadata: KernelMetadata,
        nested: Vec<Kernel>,
        launcher_device: Option<Device>,
    ) -> Self {
        Kernel {
            inner: Arc::new(KernelInner {
                nested: NestedKernels::new(nested),
                name: backend.name().to_string(),
                backend,
                metadata,
                state: Mutex::new(KernelState {
                    outer: None,
                    inner: None,
                    arguments: Vec::new(),
                }),
                device: device.downgrade(),
                launcher_device,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, KernelState> {
        self.inner.state.lock().expect("kernel state poisoned")
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn metadata(&self) -> &KernelMetadata {
        &self.inner.metadata
    }

    pub fn binary_path(&self) -> Option<&Path> {
        self.inner.backend.binary_path()
    }

    pub fn max_dims(&self) -> usize {
        self.inner.backend.max_dims()
    }

    /// Device the kernel runs on (the private launcher device for kernels with nested
    /// launches).
    pub fn device(&self) -> Option<Device> {
        self.inner.device.upgrade().map(Device::from_inner)
    }

    pub fn nested_kernels(&self) -> &NestedKernels {
        &self.inner.nested
    }

    pub fn ptr_eq(&self, other: &Kernel) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn use_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    pub fn set_run_dims(&self, outer: impl Into<Dim>, inner: impl Into<Dim>) {
        let mut state = self.state();
        state.outer = Some(outer.into());
        state.inner = Some(inner.into());
    }

    pub fn run_dims(&self) -> Option<(Dim, Dim)> {
        let state = self.state();
        state.outer.zip(state.inner)
    }

    /// Binds `arg` at `position`, replacing any previous value there.
    pub fn add_argument(&self, position: usize, arg: impl Into<KernelArg>) -> OffloadResult<()> {
        if position >= MAX_ARGS {
            return Err(OffloadError::Capacity {
                op: "add_argument",
                position,
                max: MAX_ARGS,
            });
        }
        let mut state = self.state();
        if state.arguments.len() <= position {
            state.arguments.resize(position + 1, None);
        }
        state.arguments[position] = Some(arg.into());
        Ok(())
    }

    pub fn clear_argument_list(&self) {
        self.state().arguments.clear();
    }

    /// Number of bound argument slots (the nested-kernel slot is never counted).
    pub fn argument_count(&self) -> usize {
        self.state().arguments.len()
    }

    pub fn argument(&self, position: usize) -> Option<KernelArg> {
        self.state().arguments.get(position).cloned().flatten()
    }

    /// Binds `args` positionally and launches.
    pub fn run(&self, args: &[KernelArg]) -> OffloadResult<()> {
        if args.len() > MAX_ARGS {
            return Err(OffloadError::Capacity {
                op: "run",
                position: args.len() - 1,
                max: MAX_ARGS,
            });
        }
        {
            let mut state = self.state();
            state.arguments = args.iter().cloned().map(Some).collect();
        }
        self.run_from_arguments()
    }

    /// Launches with the bound arguments.
    ///
    /// The argument count, geometry and owning device are checked before anything else.
    /// Managed memory arguments are then staged: host-only data is uploaded and writable
    /// arguments are queued on their device for the next flush. Nested kernels are passed
    /// ahead of the bound arguments for this launch only.
    pub fn run_from_arguments(&self) -> OffloadResult<()> {
        let (outer, inner, arguments) = {
            let state = self.state();
            let (Some(outer), Some(inner)) = (state.outer, state.inner) else {
                return Err(self.launch_error("launch geometry is not set"));
            };
            let mut arguments = Vec::with_capacity(state.arguments.len());
            for (position, slot) in state.arguments.iter().enumerate() {
                match slot {
                    Some(arg) => arguments.push(arg.clone()),
                    None => {
                        return Err(self.launch_error(format!("argument {position} is not set")))
                    }
                }
            }
            (outer, inner, arguments)
        };

        let prefix = usize::from(!self.inner.nested.is_empty());
        let device = self.check_launch(outer, inner, arguments.len() + prefix)?;

        let mut dirty: Vec<Memory> = Vec::new();
        for (position, arg) in arguments.iter().enumerate() {
            if let Some(memory) = arg.memory() {
                let is_const = self.inner.metadata.arg_is_const(position + prefix);
                if memory.stage_for_launch(is_const)? {
                    dirty.push(memory.clone());
                }
            }
        }
        for memory in dirty {
            if let Some(owner) = memory.device() {
                owner.defer_flush(memory);
            }
        }

        let mut launch_args = LaunchArgs::with_capacity(arguments.len() + prefix);
        if prefix == 1 {
            launch_args.push(LaunchArg::Nested(self.inner.nested.clone()));
        }
        launch_args.extend(arguments.iter().map(KernelArg::to_launch));
        self.launch(&device, outer, inner, &launch_args)
    }

    /// Launches with already-marshalled arguments; used for nested sub-launches.
    pub fn run_marshalled(&self, outer: Dim, inner: Dim, args: &[LaunchArg]) -> OffloadResult<()> {
        let device = self.check_launch(outer, inner, args.len())?;
        self.launch(&device, outer, inner, args)
    }

    /// Rejects a launch of `argc` arguments before anything is staged or sent to the backend.
    fn check_launch(&self, outer: Dim, inner: Dim, argc: usize) -> OffloadResult<Device> {
        if let Some(expected) = self.inner.metadata.argument_count {
            if argc != expected {
                return Err(self.launch_error(format!(
                    "kernel takes {expected} arguments, {argc} given"
                )));
            }
        }
        let max_dims = self.inner.backend.max_dims();
        if usize::from(outer.dims) > max_dims || usize::from(inner.dims) > max_dims {
            return Err(self.launch_error(format!(
                "launch uses {}/{} dimensions, backend supports {max_dims}",
                outer.dims, inner.dims
            )));
        }
        self.device()
            .ok_or_else(|| self.launch_error("owning device was released"))
    }

    fn launch(&self, device: &Device, outer: Dim, inner: Dim, args: &[LaunchArg]) -> OffloadResult<()> {
        trace!(kernel = %self.inner.name, ?outer, ?inner, args = args.len(), "launch");
        self.inner.backend.run(&Launch {
            stream: device.current_stream_handle(),
            outer,
            inner,
            args,
        })
    }

    fn launch_error(&self, message: impl Into<String>) -> OffloadError {
        OffloadError::launch(&self.inner.name, message)
    }

    /// Releases this handle; the last release frees nested kernels, then this kernel.
    pub fn free(self) {
        drop(self);
    }
}

impl fmt::Debug for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kernel")
            .field("name", &self.inner.name)
            .field("nested", &self.inner.nested.len())
            .finish()
    }
}

/// C-callable view of a kernel's nested kernels, handed to host launchers as the first
/// argument. `launch(table, index, dims, argc, args, sizes)` runs nested kernel `index` with
/// `dims` = outer z,y,x then inner z,y,x and returns 0 on success.
#[repr(C)]
pub struct NestedKernelTable {
    pub count: u32,
    pub context: *const c_void,
    pub launch: unsafe extern "C" fn(
        table: *const NestedKernelTable,
        index: u32,
        dims: *const i32,
        argc: i32,
        args: *const *const c_void,
        sizes: *const usize,
    ) -> i32,
}

struct NestedInner {
    kernels: Vec<Kernel>,
    table: Box<NestedKernelTable>,
    /// Address of `table`; launch arguments point at this slot.
    table_addr: usize,
}

// SAFETY: the table is immutable after construction and only points back into this value.
unsafe impl Send for NestedInner {}
unsafe impl Sync for NestedInner {}

/// Sub-kernels launched by a kernel built with nested launches.
#[derive(Clone)]
pub struct NestedKernels {
    inner: Arc<NestedInner>,
}

impl NestedKernels {
    fn new(kernels: Vec<Kernel>) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<NestedInner>| {
            let table = Box::new(NestedKernelTable {
                count: kernels.len() as u32,
                context: weak.as_ptr().cast(),
                launch: launch_nested,
            });
            let table_addr = table.as_ref() as *const NestedKernelTable as usize;
            NestedInner {
                kernels,
                table,
                table_addr,
            }
        });
        NestedKernels { inner }
    }

    pub fn len(&self) -> usize {
        self.inner.kernels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.kernels.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Kernel> {
        self.inner.kernels.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Kernel> {
        self.inner.kernels.iter()
    }

    /// Runs nested kernel `index` with marshalled arguments.
    pub fn launch(&self, index: usize, outer: Dim, inner: Dim, args: &[LaunchArg]) -> OffloadResult<()> {
        let kernel = self.get(index).ok_or_else(|| {
            OffloadError::launch(
                format!("nested[{index}]"),
                format!("only {} nested kernels", self.len()),
            )
        })?;
        kernel.run_marshalled(outer, inner, args)
    }

    pub fn table(&self) -> &NestedKernelTable {
        &self.inner.table
    }

    /// Pointer to the slot holding the table address, in the shape of a launch argument.
    pub(crate) fn table_ptr(&self) -> *const u8 {
        (&self.inner.table_addr as *const usize).cast()
    }
}

fn dim_from_zyx(zyx: &[i32]) -> Dim {
    let axis = |value: i32| value.max(1) as u32;
    Dim::new3(axis(zyx[2]), axis(zyx[1]), axis(zyx[0]))
}

unsafe extern "C" fn launch_nested(
    table: *const NestedKernelTable,
    index: u32,
    dims: *const i32,
    argc: i32,
    args: *const *const c_void,
    sizes: *const usize,
) -> i32 {
    if table.is_null() || dims.is_null() || argc < 0 {
        return -1;
    }
    if argc > 0 && (args.is_null() || sizes.is_null()) {
        return -1;
    }
    // SAFETY: `table` comes from a live NestedKernels, whose context points at its inner value.
    let nested = unsafe { &*((*table).context as *const NestedInner) };
    // SAFETY: host launchers pass six dims and `argc` argument/size pairs.
    let dims = unsafe { std::slice::from_raw_parts(dims, 6) };
    let mut launch_args = LaunchArgs::with_capacity(argc as usize);
    for i in 0..argc as usize {
        // SAFETY: both arrays hold `argc` entries.
        let (ptr, size) = unsafe { (*args.add(i), *sizes.add(i)) };
        if ptr.is_null() || size == 0 || size > 8 {
            error!(index, argument = i, size, "nested launch argument is not a scalar");
            return -1;
        }
        let mut bytes = [0u8; 8];
        // SAFETY: `ptr` is valid for `size` bytes per the launcher contract.
        unsafe { std::ptr::copy_nonoverlapping(ptr.cast::<u8>(), bytes.as_mut_ptr(), size) };
        launch_args.push(LaunchArg::Value { bytes, len: size });
    }
    let Some(kernel) = nested.kernels.get(index as usize) else {
        error!(index, count = nested.kernels.len(), "nested kernel index out of range");
        return -1;
    };
    match kernel.run_marshalled(dim_from_zyx(&dims[..3]), dim_from_zyx(&dims[3..]), &launch_args) {
        Ok(()) => 0,
        Err(err) => {
            error!(kernel = kernel.name(), "nested launch failed: {err}");
            -1
        }
    }
}
