use core::fmt::Debug;

use super::offsets::StructOffsets;

// The thread-state search runs as a restartable program: up to
// THREAD_STATES_PER_PROG list nodes per invocation, chained up to
// THREAD_STATES_PROG_CNT times. Maximum threads: 32x8 = 256.
pub const THREAD_STATES_PER_PROG: usize = 32;
pub const THREAD_STATES_PROG_CNT: usize = 8;

// Same scheme for the frame walk. Maximum Python stack frames: 20x4 = 80.
pub const PYTHON_STACK_FRAMES_PER_PROG: usize = 20;
pub const PYTHON_STACK_PROG_CNT: usize = 4;
pub const STACK_MAX_LEN: usize = PYTHON_STACK_FRAMES_PER_PROG * PYTHON_STACK_PROG_CNT;

pub const CLASS_NAME_LEN: usize = 32;
pub const FUNCTION_NAME_LEN: usize = 64;
pub const FILE_NAME_LEN: usize = 256;
pub const TASK_COMM_LEN: usize = 16;

/// Bytes of raw user stack shipped with each event, starting at the page
/// below the x86-64 red zone.
pub const RAW_USER_STACK_LEN: usize = 8192;

/// Sentinel stack entry for a frame whose code object pointer was NULL.
/// Negative ids are reserved for sentinels; real symbol ids are in [0, 2^31).
pub const FRAME_CODE_IS_NULL: i32 = 0x80000001u32 as i32;

/// Returned by the thread-id read when the thread state itself is unreadable.
pub const BAD_THREAD_ID: u64 = !0;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// No error.
    ERROR_NONE = 0,
    /// Expected one of _PyThreadState_Current/_PyRuntime to be set, but both are NULL.
    ERROR_MISSING_PYSTATE = 1,
    /// Read _PyThreadState_Current and it's NULL: the GIL is released, and we
    /// have to wait until it is grabbed again to get the PyInterpreterState.
    ERROR_THREAD_STATE_NULL = 2,
    /// Read the address of PyInterpreterState from _PyThreadState_Current/_PyRuntime
    /// and got NULL. Happens at process startup/shutdown when the interpreter
    /// hasn't been created yet or has been torn down.
    ERROR_INTERPRETER_NULL = 3,
    /// Iterated through the maximum thread states without finding a match.
    ERROR_TOO_MANY_THREADS = 4,
    /// Iterated through _all_ the thread states without finding a match.
    ERROR_THREAD_STATE_NOT_FOUND = 5,
    /// The frame pointer in the current PyThreadState is NULL: the Python
    /// stack for this thread is empty.
    ERROR_EMPTY_STACK = 6,
    /// A frame's code object pointer was NULL. Only used as the stack
    /// sentinel FRAME_CODE_IS_NULL, kept here so the numbering stays dense.
    ERROR_FRAME_CODE_IS_NULL = 7,
    /// Reading from the thread descriptor (at %fs) faulted. Happens when a
    /// thread was just created and pthreads hasn't initialized it yet.
    ERROR_BAD_FSBASE = 8,
    /// The pthreads implementation configured for the process is invalid.
    ERROR_INVALID_PTHREADS_IMPL = 9,
    /// The head of the thread states list in the PyInterpreterState is NULL.
    ERROR_THREAD_STATE_HEAD_NULL = 10,
    /// Reading a field from a thread state in the thread states list failed.
    ERROR_BAD_THREAD_STATE = 11,
    /// A tail call between sampler programs failed.
    ERROR_CALL_FAILED = 12,
}

impl ErrorCode {
    pub fn from_u8(v: u8) -> Self {
        use ErrorCode::*;
        match v {
            0 => ERROR_NONE,
            1 => ERROR_MISSING_PYSTATE,
            2 => ERROR_THREAD_STATE_NULL,
            3 => ERROR_INTERPRETER_NULL,
            4 => ERROR_TOO_MANY_THREADS,
            5 => ERROR_THREAD_STATE_NOT_FOUND,
            6 => ERROR_EMPTY_STACK,
            7 => ERROR_FRAME_CODE_IS_NULL,
            8 => ERROR_BAD_FSBASE,
            9 => ERROR_INVALID_PTHREADS_IMPL,
            10 => ERROR_THREAD_STATE_HEAD_NULL,
            11 => ERROR_BAD_THREAD_STATE,
            _ => ERROR_CALL_FAILED,
        }
    }

    /// Symbolic name, as rendered in `[Sample Error <name>]` frames.
    pub fn name(&self) -> &'static str {
        use ErrorCode::*;
        match self {
            ERROR_NONE => "ERROR_NONE",
            ERROR_MISSING_PYSTATE => "ERROR_MISSING_PYSTATE",
            ERROR_THREAD_STATE_NULL => "ERROR_THREAD_STATE_NULL",
            ERROR_INTERPRETER_NULL => "ERROR_INTERPRETER_NULL",
            ERROR_TOO_MANY_THREADS => "ERROR_TOO_MANY_THREADS",
            ERROR_THREAD_STATE_NOT_FOUND => "ERROR_THREAD_STATE_NOT_FOUND",
            ERROR_EMPTY_STACK => "ERROR_EMPTY_STACK",
            ERROR_FRAME_CODE_IS_NULL => "ERROR_FRAME_CODE_IS_NULL",
            ERROR_BAD_FSBASE => "ERROR_BAD_FSBASE",
            ERROR_INVALID_PTHREADS_IMPL => "ERROR_INVALID_PTHREADS_IMPL",
            ERROR_THREAD_STATE_HEAD_NULL => "ERROR_THREAD_STATE_HEAD_NULL",
            ERROR_BAD_THREAD_STATE => "ERROR_BAD_THREAD_STATE",
            ERROR_CALL_FAILED => "ERROR_CALL_FAILED",
        }
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackStatus {
    /// Read all the Python stack frames for the running thread.
    STACK_STATUS_COMPLETE = 0,
    /// Gave up before reaching the stack; the event carries the error code.
    STACK_STATUS_ERROR = 1,
    /// Read the top STACK_MAX_LEN frames and there were more we didn't read.
    STACK_STATUS_TRUNCATED = 2,
}

impl StackStatus {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => StackStatus::STACK_STATUS_COMPLETE,
            2 => StackStatus::STACK_STATUS_TRUNCATED,
            _ => StackStatus::STACK_STATUS_ERROR,
        }
    }
}

/// Identifies the POSIX threads implementation used by a Python process.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum pthreads_impl {
    PTI_GLIBC = 0,
    PTI_MUSL = 1,
}

/// Resolved virtual addresses of the interpreter's global anchors. Exactly
/// one of _PyThreadState_Current/_PyRuntime is non-zero, depending on the
/// Python version.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct py_globals {
    /// Any stable readable address in the target; used to clear per-frame
    /// scratch to constant contents.
    pub constant_buffer: u64,
    /// 3.6 and 2.7
    pub _PyThreadState_Current: u64,
    /// 3.7+
    pub _PyRuntime: u64,
}

/// Per-PID record the sampler consults. Written by the discovery pass,
/// except `interp` which the sampler fills in lazily at the first
/// successful sample (and which reverts to 0 while the GIL is released).
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct pid_data {
    pub pthreads_impl: pthreads_impl,
    pub globals: py_globals,
    pub offsets: StructOffsets,
    /// vaddr of PyInterpreterState, 0 until first resolved
    pub interp: u64,
}

/// Everything we need to name one Python stack frame. Two symbols are the
/// same frame iff all three fields are byte-equal.
///
/// Storing `classname` and `file` here duplicates them across symbols in the
/// same class or file. Splitting them into separate maps isn't worth it:
/// symbols are generally spread across many files and classes, and `name` is
/// mostly unique anyway.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Symbol {
    pub classname: [u8; CLASS_NAME_LEN],
    pub name: [u8; FUNCTION_NAME_LEN],
    pub file: [u8; FILE_NAME_LEN],
}

impl Default for Symbol {
    fn default() -> Self {
        unsafe { core::mem::zeroed() }
    }
}

impl Debug for Symbol {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Symbol")
            .field("classname", &&self.classname[..8])
            .field("name", &&self.name[..8])
            .field("file", &&self.file[..8])
            .finish()
    }
}

/// One sample, as shipped to the user-mode driver. The Python stack is a
/// sequence of symbol ids, deepest frame first; negative ids are sentinels.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Event {
    pub pid: u32,
    pub tid: u32,
    pub comm: [u8; TASK_COMM_LEN],
    pub error_code: u8,
    pub stack_status: u8,
    pub kernel_stack_id: i32,
    pub stack_len: u32,
    pub stack: [i32; STACK_MAX_LEN],
    pub user_ip: u64,
    pub user_sp: u64,
    pub user_stack_len: u32,
    pub raw_user_stack: [u8; RAW_USER_STACK_LEN],
}

impl Default for Event {
    fn default() -> Self {
        unsafe { core::mem::zeroed() }
    }
}

impl Debug for Event {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Event")
            .field("pid", &self.pid)
            .field("tid", &self.tid)
            .field("error_code", &self.error_code)
            .field("stack_status", &self.stack_status)
            .field("kernel_stack_id", &self.kernel_stack_id)
            .field("stack_len", &self.stack_len)
            .field("user_ip", &self.user_ip)
            .field("user_sp", &self.user_sp)
            .field("user_stack_len", &self.user_stack_len)
            .finish()
    }
}

#[cfg(feature = "user")]
unsafe impl aya::Pod for Symbol {}

#[cfg(feature = "user")]
unsafe impl aya::Pod for Event {}

#[cfg(feature = "user")]
unsafe impl aya::Pod for pid_data {}
