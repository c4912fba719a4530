#![allow(non_camel_case_types, non_snake_case)]
#![cfg_attr(not(feature = "user"), no_std)]

pub mod python;

/// Slots in the PROGS program array chaining the sampler stages.
pub const GET_THREAD_STATE_PROG_IDX: u32 = 0;
pub const READ_PYTHON_STACK_PROG_IDX: u32 = 1;

/// Keys into the CONFIG map the driver fills in before attaching.
pub enum ConfigKey {
    /// Number of possible CPUs, for the symbol id progression.
    NumCpus = 0,
    /// Byte offset of thread.fsbase within task_struct, resolved from the
    /// running kernel's BTF.
    FsbaseOffset = 1,
}
