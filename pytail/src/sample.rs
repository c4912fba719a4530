use pytail_common::python::state::{
    ErrorCode, Event, StackStatus, RAW_USER_STACK_LEN, STACK_MAX_LEN,
};

use crate::symbols;
use crate::unwind::{NativeStackTrace, NativeUnwinder};

/// One decoded sample: the event fields plus the native stack, unwound at
/// ingest time while the captured slice is hot.
#[derive(Debug, Clone)]
pub struct Sample {
    pub pid: u32,
    pub tid: u32,
    pub comm: String,
    pub error_code: ErrorCode,
    pub stack_status: StackStatus,
    pub kernel_stack_id: i32,
    /// Python symbol ids, deepest frame first; negative ids are sentinels.
    pub py_stack: Vec<i32>,
    pub native_stack: NativeStackTrace,
}

impl Sample {
    pub fn resolve(event: &Event, unwinder: &mut NativeUnwinder) -> Self {
        let stack_len = (event.stack_len as usize).min(STACK_MAX_LEN);
        let user_len = (event.user_stack_len as usize).min(RAW_USER_STACK_LEN);
        let native_stack = unwinder.unwind(
            event.pid,
            event.user_ip,
            event.user_sp,
            &event.raw_user_stack[..user_len],
        );

        Self {
            pid: event.pid,
            tid: event.tid,
            comm: symbols::cstr(&event.comm),
            error_code: ErrorCode::from_u8(event.error_code),
            stack_status: StackStatus::from_u8(event.stack_status),
            kernel_stack_id: event.kernel_stack_id,
            py_stack: event.stack[..stack_len].to_vec(),
            native_stack,
        }
    }
}
