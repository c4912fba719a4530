use aya_ebpf::{
    bindings::BPF_F_REUSE_STACKID,
    macros::map,
    maps::{HashMap, PerCpuArray, PerfEventArray, ProgramArray, StackTrace},
    EbpfContext,
};
use pytail_common::python::{
    offsets::StructOffsets,
    state::{Event, Symbol, pid_data},
};
pub use pytail_common::{GET_THREAD_STATE_PROG_IDX, READ_PYTHON_STACK_PROG_IDX};

/// Table of processes currently being profiled, keyed by tgid. Written by
/// the discovery pass; the sampler updates the cached interpreter pointer in
/// place.
#[map(name = "PID_CONFIG")]
pub static PID_CONFIG: HashMap<u32, pid_data> = HashMap::with_max_entries(10240, 0);

/// Symbol to unique id. Shipping ids instead of full symbol records keeps
/// the event small; the driver snapshots this map at flush time to map ids
/// back. Capacity is overridden at load time from --symbols-map-size.
#[map(name = "SYMBOLS")]
pub static SYMBOLS: HashMap<Symbol, i32> = HashMap::with_max_entries(16384, 0);

#[map(name = "STATE_HEAP")]
pub static STATE_HEAP: PerCpuArray<SampleState> = PerCpuArray::with_max_entries(1, 0);

#[map(name = "EVENTS")]
pub static EVENTS: PerfEventArray<Event> = PerfEventArray::new(0);

#[map(name = "KERNEL_STACKS")]
pub static KERNEL_STACKS: StackTrace = StackTrace::with_max_entries(16384, 0);

/// Holds the get_thread_state and read_python_stack programs for chaining.
#[map(name = "PROGS")]
pub static PROGS: ProgramArray = ProgramArray::with_max_entries(2, 0);

/// See pytail_common::ConfigKey.
#[map(name = "CONFIG")]
pub static CONFIG: HashMap<u32, u64> = HashMap::with_max_entries(4, 0);

/// Per-CPU scratch shared by the three sampler programs. The only mutable
/// state the sampler has; one sample runs to completion on its CPU, so there
/// is a single writer by construction.
#[repr(C)]
pub struct SampleState {
    pub current_thread_id: u64,
    pub constant_buffer_addr: u64,
    pub interp_head: u64,
    pub thread_state: u64,
    pub frame_ptr: u64,
    pub offsets: StructOffsets,
    pub cur_cpu: u32,
    pub num_cpus: u32,
    pub get_thread_state_call_count: u32,
    pub python_stack_prog_call_cnt: u32,
    /// Per-CPU symbol counter; never reset, it seeds the id progression.
    pub symbol_counter: i64,
    pub sym: Symbol,
    pub event: Event,
}

#[inline(always)]
pub fn get_state() -> Option<&'static mut SampleState> {
    // state_heap has size 1, the lookup can only fail before the map exists
    unsafe { STATE_HEAP.get_ptr_mut(0).map(|p| &mut *p) }
}

/// Attach the kernel stack and ship the event. Every sample ends here
/// exactly once, whichever program it ends in.
#[inline(always)]
pub fn submit_event<C: EbpfContext>(ctx: &C, state: &mut SampleState) {
    state.event.kernel_stack_id =
        match unsafe { KERNEL_STACKS.get_stackid(ctx, BPF_F_REUSE_STACKID as u64) } {
            Ok(id) => id as i32,
            Err(e) => e as i32,
        };
    EVENTS.output(ctx, &state.event, 0);
}
