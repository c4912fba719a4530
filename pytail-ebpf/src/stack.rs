use aya_ebpf::{
    bindings::BPF_NOEXIST,
    helpers::{bpf_probe_read_user, bpf_probe_read_user_buf, bpf_probe_read_user_str_bytes},
    macros::perf_event,
    programs::PerfEventContext,
};
use pytail_common::python::{
    offsets::StructOffsets,
    state::{
        ErrorCode, StackStatus, Symbol, FRAME_CODE_IS_NULL, PYTHON_STACK_FRAMES_PER_PROG,
        PYTHON_STACK_PROG_CNT, STACK_MAX_LEN,
    },
};

use crate::maps::{
    get_state, submit_event, SampleState, PROGS, SYMBOLS, READ_PYTHON_STACK_PROG_IDX,
};
use crate::{offset_of, read_user_u64};

/// Program C. Reads up to PYTHON_STACK_FRAMES_PER_PROG frames per
/// invocation, deduplicating each frame's symbol into an id, and re-invokes
/// itself until the chain ends or the frame budget runs out.
#[perf_event]
fn read_python_stack(ctx: PerfEventContext) -> u32 {
    let Some(state) = get_state() else { return 0 };

    state.python_stack_prog_call_cnt += 1;

    for _ in 0..PYTHON_STACK_FRAMES_PER_PROG {
        let cur_frame = state.frame_ptr;

        // Read the code object first; a frame without one still gets a
        // placeholder entry so the rest of the stack isn't lost.
        let code_ptr =
            read_user_u64(offset_of(cur_frame, state.offsets.py_frame_object.f_code)).unwrap_or(0);
        if code_ptr == 0 {
            push_frame(state, FRAME_CODE_IS_NULL);
        } else {
            clear_symbol(state);
            read_symbol_names(state, cur_frame, code_ptr);
            let id = get_symbol_id(state);
            push_frame(state, id);
        }

        // Next PyFrameObject, updated in place so a chained invocation
        // resumes where this one stopped.
        state.frame_ptr =
            read_user_u64(offset_of(cur_frame, state.offsets.py_frame_object.f_back)).unwrap_or(0);
        if state.frame_ptr == 0 {
            state.event.stack_status = StackStatus::STACK_STATUS_COMPLETE as u8;
            submit_event(&ctx, state);
            return 0;
        }
    }

    if state.python_stack_prog_call_cnt < PYTHON_STACK_PROG_CNT as u32 {
        unsafe {
            if PROGS.tail_call(&ctx, READ_PYTHON_STACK_PROG_IDX).is_err() {
                state.event.error_code = ErrorCode::ERROR_CALL_FAILED as u8;
                submit_event(&ctx, state);
            }
        }
        return 0;
    }

    state.event.stack_status = StackStatus::STACK_STATUS_TRUNCATED as u8;
    submit_event(&ctx, state);
    0
}

#[inline(always)]
fn push_frame(state: &mut SampleState, id: i32) {
    let len = state.event.stack_len as usize;
    if len < STACK_MAX_LEN {
        state.event.stack[len] = id;
        state.event.stack_len += 1;
    }
}

/// The symbol scratch is reused across iterations and leftover bytes would
/// defeat deduplication. There is no memset for a struct this large, so read
/// from a constant, always-readable address instead: the contents don't
/// matter as long as every iteration starts from the same bytes.
#[inline(always)]
fn clear_symbol(state: &mut SampleState) {
    let src = state.constant_buffer_addr as *const u8;
    let buf = unsafe {
        core::slice::from_raw_parts_mut(
            &mut state.sym as *mut Symbol as *mut u8,
            core::mem::size_of::<Symbol>(),
        )
    };
    let _ = unsafe { bpf_probe_read_user_buf(src, buf) };
}

/// Name of the first argument of a code object, as a short C string:
/// ((PyTupleObject *)code->co_varnames)->ob_item[0]
#[inline(always)]
fn get_first_arg_name(offsets: &StructOffsets, code_ptr: u64, argname: &mut [u8; 5]) -> bool {
    let Some(args_ptr) = read_user_u64(offset_of(code_ptr, offsets.py_code_object.co_varnames))
    else {
        return false;
    };
    // Versions where the tuple length is readable let us skip no-arg code
    // objects; elsewhere (size == -1) the item read below just fails.
    if offsets.string.size >= 0 {
        let ob_size = unsafe {
            bpf_probe_read_user(offset_of(args_ptr, offsets.string.size) as *const i64)
        }
        .unwrap_or(0);
        if ob_size <= 0 {
            return false;
        }
    }
    let Some(item) = read_user_u64(offset_of(args_ptr, offsets.py_tuple_object.ob_item)) else {
        return false;
    };
    unsafe {
        bpf_probe_read_user_str_bytes(offset_of(item, offsets.string.data) as *const u8, argname)
    }
    .is_ok()
}

/// Best-effort class name for the frame. If the first argument is `self`,
/// the class is the type of the first local; if it's `cls`, the first local
/// is the class itself. Not perfect, but the code object offers nothing
/// better.
#[inline(always)]
fn get_classname(state: &mut SampleState, cur_frame: u64, code_ptr: u64) {
    state.sym.classname[0] = 0;

    let mut argname = [0u8; 5];
    if !get_first_arg_name(&state.offsets, code_ptr, &mut argname) {
        return;
    }

    // compare as a 32-bit word to save instructions
    let first4 = u32::from_ne_bytes([argname[0], argname[1], argname[2], argname[3]]);
    let first_self = first4 == u32::from_ne_bytes(*b"self") && argname[4] == 0;
    let first_cls = first4 == u32::from_ne_bytes(*b"cls\0");
    if !first_self && !first_cls {
        return;
    }

    // frame->f_localsplus[0] is the first argument
    let Some(mut obj) =
        read_user_u64(offset_of(cur_frame, state.offsets.py_frame_object.f_localsplus))
    else {
        return;
    };
    if obj == 0 {
        // self/cls is a cellvar, deleted, or not an argument. Tough luck.
        return;
    }
    if first_self {
        // an instance; go through its type
        let Some(ob_type) = read_user_u64(offset_of(obj, state.offsets.py_object.ob_type)) else {
            return;
        };
        obj = ob_type;
    }
    let Some(tp_name) = read_user_u64(offset_of(obj, state.offsets.py_type_object.tp_name)) else {
        return;
    };
    let _ = unsafe {
        bpf_probe_read_user_str_bytes(tp_name as *const u8, &mut state.sym.classname)
    };
}

#[inline(always)]
fn read_symbol_names(state: &mut SampleState, cur_frame: u64, code_ptr: u64) {
    get_classname(state, cur_frame, code_ptr);

    if let Some(pystr_ptr) =
        read_user_u64(offset_of(code_ptr, state.offsets.py_code_object.co_filename))
    {
        let _ = unsafe {
            bpf_probe_read_user_str_bytes(
                offset_of(pystr_ptr, state.offsets.string.data) as *const u8,
                &mut state.sym.file,
            )
        };
    }
    if let Some(pystr_ptr) =
        read_user_u64(offset_of(code_ptr, state.offsets.py_code_object.co_name))
    {
        let _ = unsafe {
            bpf_probe_read_user_str_bytes(
                offset_of(pystr_ptr, state.offsets.string.data) as *const u8,
                &mut state.sym.name,
            )
        };
    }
}

/// Map the symbol to its id, allocating one on first sight. Each CPU
/// allocates from a disjoint arithmetic progression
/// (counter * num_cpus + cpu) so concurrent inserts can't collide without a
/// lock. First writer wins on a race; the loser's id is unique anyway, so
/// the event entry stays valid.
#[inline(always)]
fn get_symbol_id(state: &mut SampleState) -> i32 {
    if let Some(id) = unsafe { SYMBOLS.get(&state.sym) } {
        return *id;
    }
    let id = (state.symbol_counter * state.num_cpus as i64 + state.cur_cpu as i64) as i32;
    state.symbol_counter += 1;
    let _ = SYMBOLS.insert(&state.sym, &id, BPF_NOEXIST as u64);
    id
}
