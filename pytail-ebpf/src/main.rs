#![no_std]
#![no_main]
#![allow(nonstandard_style, dead_code, unused_unsafe)]

mod maps;
mod stack;
mod thread;

use aya_ebpf::{
    bindings::pt_regs,
    helpers::{
        bpf_get_current_comm, bpf_get_current_pid_tgid, bpf_probe_read_user,
        bpf_probe_read_user_buf,
    },
    macros::perf_event,
    programs::PerfEventContext,
    EbpfContext,
};
use pytail_common::python::state::{ErrorCode, Event, StackStatus, RAW_USER_STACK_LEN};
use pytail_common::ConfigKey;

use crate::maps::{get_state, submit_event, CONFIG, PID_CONFIG, PROGS, GET_THREAD_STATE_PROG_IDX};
use crate::thread::get_task_thread_id;

const PAGE_SIZE: u64 = 4096;

#[inline(always)]
pub(crate) fn offset_of(base: u64, off: i64) -> u64 {
    base.wrapping_add(off as u64)
}

#[inline(always)]
pub(crate) fn read_user_u64(addr: u64) -> Option<u64> {
    unsafe { bpf_probe_read_user(addr as *const u64).ok() }
}

/// Program A. Fires on every timer sample; bails out fast for processes
/// without a config record, otherwise resolves the interpreter anchor and
/// chains into the thread-state search.
#[perf_event]
fn on_event(ctx: PerfEventContext) -> u32 {
    let pid_tgid = bpf_get_current_pid_tgid();
    let pid = (pid_tgid >> 32) as u32;
    let tid = pid_tgid as u32;

    let Some(pid_data_ptr) = PID_CONFIG.get_ptr_mut(&pid) else {
        // not a process we profile
        return 0;
    };
    let pid_data = unsafe { &mut *pid_data_ptr };

    let Some(state) = get_state() else { return 0 };

    state.event.pid = pid;
    state.event.tid = tid;
    if let Ok(comm) = bpf_get_current_comm() {
        state.event.comm = comm;
    }
    state.event.error_code = ErrorCode::ERROR_NONE as u8;
    state.event.stack_status = StackStatus::STACK_STATUS_ERROR as u8;
    state.event.stack_len = 0;
    state.num_cpus = unsafe { CONFIG.get(&(ConfigKey::NumCpus as u32)) }
        .copied()
        .unwrap_or(1) as u32;

    // Native stacks are useful even when the Python walk fails (e.g. while
    // the GIL is released), so capture the user stack slice up front.
    capture_user_stack(&ctx, &mut state.event);

    if pid_data.interp == 0 {
        // First time we sample this process, or the GIL was released last
        // time we looked. Find PyInterpreterState.
        let interp_ptr = if pid_data.globals._PyRuntime != 0 {
            offset_of(
                pid_data.globals._PyRuntime,
                pid_data.offsets.py_runtime_state.interp_main,
            )
        } else {
            if pid_data.globals._PyThreadState_Current == 0 {
                state.event.error_code = ErrorCode::ERROR_MISSING_PYSTATE as u8;
                submit_event(&ctx, state);
                return 0;
            }

            // PyThreadState of the thread currently holding the GIL
            let tstate_current =
                read_user_u64(pid_data.globals._PyThreadState_Current).unwrap_or(0);
            if tstate_current == 0 {
                // The GIL is released; only native stacks until it is held
                // again.
                state.event.error_code = ErrorCode::ERROR_THREAD_STATE_NULL as u8;
                submit_event(&ctx, state);
                return 0;
            }
            offset_of(tstate_current, pid_data.offsets.py_thread_state.interp)
        };

        pid_data.interp = read_user_u64(interp_ptr).unwrap_or(0);
        if pid_data.interp == 0 {
            state.event.error_code = ErrorCode::ERROR_INTERPRETER_NULL as u8;
            submit_event(&ctx, state);
            return 0;
        }
    }

    match get_task_thread_id(pid_data) {
        Ok(id) => state.current_thread_id = id,
        Err(code) => {
            state.event.error_code = code as u8;
            submit_event(&ctx, state);
            return 0;
        }
    }

    state.offsets = pid_data.offsets;
    state.interp_head = pid_data.interp;
    state.constant_buffer_addr = pid_data.globals.constant_buffer;

    // Pointer to the first PyThreadState in the thread states list
    state.thread_state = read_user_u64(offset_of(
        state.interp_head,
        state.offsets.py_interpreter_state.tstate_head,
    ))
    .unwrap_or(0);
    if state.thread_state == 0 {
        state.event.error_code = ErrorCode::ERROR_THREAD_STATE_HEAD_NULL as u8;
        submit_event(&ctx, state);
        return 0;
    }

    // Pre-set so get_thread_state can submit as-is when it walks off the
    // end of the list.
    state.event.error_code = ErrorCode::ERROR_THREAD_STATE_NOT_FOUND as u8;
    state.get_thread_state_call_count = 0;
    unsafe {
        if PROGS.tail_call(&ctx, GET_THREAD_STATE_PROG_IDX).is_err() {
            state.event.error_code = ErrorCode::ERROR_CALL_FAILED as u8;
            submit_event(&ctx, state);
        }
    }
    0
}

/// Copy a slice of the target's user stack into the event, starting at the
/// page containing sp minus the x86-64 red zone. The stack may end less than
/// RAW_USER_STACK_LEN bytes above sp, so retry at halved sizes until a read
/// succeeds.
#[inline(always)]
fn capture_user_stack<C: EbpfContext>(ctx: &C, event: &mut Event) {
    let regs = ctx.as_ptr() as *const pt_regs;
    let ip = unsafe { (*regs).rip };
    let sp = unsafe { (*regs).rsp };
    event.user_ip = ip;
    event.user_sp = sp;
    event.user_stack_len = 0;

    let start = sp.wrapping_sub(128) & !(PAGE_SIZE - 1);
    let src = start as *const u8;
    unsafe {
        if bpf_probe_read_user_buf(src, &mut event.raw_user_stack).is_ok() {
            event.user_stack_len = RAW_USER_STACK_LEN as u32;
        } else if bpf_probe_read_user_buf(src, &mut event.raw_user_stack[..RAW_USER_STACK_LEN / 2])
            .is_ok()
        {
            event.user_stack_len = (RAW_USER_STACK_LEN / 2) as u32;
        } else if bpf_probe_read_user_buf(src, &mut event.raw_user_stack[..RAW_USER_STACK_LEN / 4])
            .is_ok()
        {
            event.user_stack_len = (RAW_USER_STACK_LEN / 4) as u32;
        } else if bpf_probe_read_user_buf(src, &mut event.raw_user_stack[..RAW_USER_STACK_LEN / 8])
            .is_ok()
        {
            event.user_stack_len = (RAW_USER_STACK_LEN / 8) as u32;
        }
    }
}

#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    unsafe { core::hint::unreachable_unchecked() }
}
