use aya_ebpf::{
    helpers::{bpf_get_current_task, bpf_get_smp_processor_id, bpf_probe_read_kernel,
        bpf_probe_read_user},
    macros::perf_event,
    programs::PerfEventContext,
};
use pytail_common::python::state::{
    pid_data, ErrorCode, BAD_THREAD_ID, THREAD_STATES_PER_PROG, THREAD_STATES_PROG_CNT,
};
use pytail_common::ConfigKey;

use crate::maps::{
    get_state, submit_event, SampleState, CONFIG, PROGS, GET_THREAD_STATE_PROG_IDX,
    READ_PYTHON_STACK_PROG_IDX,
};
use crate::{offset_of, read_user_u64};

/// The thread id Python records in PyThreadState is the value of
/// `pthread_self()`, which lives behind the thread's TLS base. Reproduce it
/// from the task's saved fsbase without running target code:
/// glibc keeps `self` at 0x10 into tcbhead_t; musl's pthread starts with it.
pub fn get_task_thread_id(pid_data: &pid_data) -> Result<u64, ErrorCode> {
    let fsbase_offset = unsafe { CONFIG.get(&(ConfigKey::FsbaseOffset as u32)) }
        .copied()
        .unwrap_or(0);
    if fsbase_offset == 0 {
        return Err(ErrorCode::ERROR_BAD_FSBASE);
    }

    let task = unsafe { bpf_get_current_task() };
    let fsbase: u64 =
        unsafe { bpf_probe_read_kernel((task + fsbase_offset) as *const u64) }
            .map_err(|_| ErrorCode::ERROR_BAD_FSBASE)?;

    // The map value comes from user space; don't trust the discriminant.
    let flavor = unsafe { *(core::ptr::addr_of!(pid_data.pthreads_impl) as *const u32) };
    let thread_id = match flavor {
        // 0x10 = offsetof(tcbhead_t, self)
        0 => unsafe { bpf_probe_read_user((fsbase + 0x10) as *const u64) },
        // __pthread_self reads %fs:0x0, the `self` field of struct pthread
        1 => unsafe { bpf_probe_read_user(fsbase as *const u64) },
        _ => return Err(ErrorCode::ERROR_INVALID_PTHREADS_IMPL),
    };
    thread_id.map_err(|_| ErrorCode::ERROR_BAD_FSBASE)
}

#[inline(always)]
fn read_tstate_thread_id(state: &SampleState) -> u64 {
    read_user_u64(offset_of(
        state.thread_state,
        state.offsets.py_thread_state.thread,
    ))
    .unwrap_or(BAD_THREAD_ID)
}

/// Program B. Walks the PyThreadState list looking for the state whose
/// thread id matches the sampled task, then chains into the frame walk.
/// Re-invokes itself through the program array while the per-stage budget
/// allows; the combined cap bounds walks of corrupt (cyclic) lists.
#[perf_event]
fn get_thread_state(ctx: PerfEventContext) -> u32 {
    let Some(state) = get_state() else { return 0 };

    state.get_thread_state_call_count += 1;

    let mut found = false;
    for _ in 0..THREAD_STATES_PER_PROG {
        let thread_id = read_tstate_thread_id(state);
        if thread_id == state.current_thread_id {
            found = true;
            break;
        }
        if thread_id == BAD_THREAD_ID {
            state.event.error_code = ErrorCode::ERROR_BAD_THREAD_STATE as u8;
            submit_event(&ctx, state);
            return 0;
        }
        state.thread_state = read_user_u64(offset_of(
            state.thread_state,
            state.offsets.py_thread_state.next,
        ))
        .unwrap_or(0);
        if state.thread_state == 0 {
            // ERROR_THREAD_STATE_NOT_FOUND was set before the first call
            submit_event(&ctx, state);
            return 0;
        }
    }

    if !found {
        if state.get_thread_state_call_count == THREAD_STATES_PROG_CNT as u32 {
            state.event.error_code = ErrorCode::ERROR_TOO_MANY_THREADS as u8;
            submit_event(&ctx, state);
            return 0;
        }
        unsafe {
            if PROGS.tail_call(&ctx, GET_THREAD_STATE_PROG_IDX).is_err() {
                state.event.error_code = ErrorCode::ERROR_CALL_FAILED as u8;
                submit_event(&ctx, state);
            }
        }
        return 0;
    }

    // Top frame of the matched thread
    state.frame_ptr = read_user_u64(offset_of(
        state.thread_state,
        state.offsets.py_thread_state.frame,
    ))
    .unwrap_or(0);
    if state.frame_ptr == 0 {
        state.event.error_code = ErrorCode::ERROR_EMPTY_STACK as u8;
        submit_event(&ctx, state);
        return 0;
    }

    state.event.error_code = ErrorCode::ERROR_NONE as u8;
    state.cur_cpu = unsafe { bpf_get_smp_processor_id() };
    state.python_stack_prog_call_cnt = 0;
    unsafe {
        if PROGS.tail_call(&ctx, READ_PYTHON_STACK_PROG_IDX).is_err() {
            state.event.error_code = ErrorCode::ERROR_CALL_FAILED as u8;
            submit_event(&ctx, state);
        }
    }
    0
}
