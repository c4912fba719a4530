use super::PythonVersion;

/*
Struct offsets per Python version.

Most of these records are named after the CPython struct they index into, and
their fields are 64-bit offsets named after the fields of that struct. Two
exceptions:
1. PyString - offsets into the Python string object. The representation of
   strings varies a lot between versions and depends on encoding and
   interning, so the field names don't correspond to any one struct. `data`
   is the offset of the first character, `size` the offset of the 32-bit
   byte length.
2. PyThreadState.thread - named "thread_id" in some versions.

An offset of -1 means the field does not exist (or must not be used) in that
version and is never dereferenced.
*/

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PyObjectOffsets {
    pub ob_type: i64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PyStringOffsets {
    pub data: i64,
    pub size: i64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PyTypeObjectOffsets {
    pub tp_name: i64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PyThreadStateOffsets {
    pub next: i64,
    pub interp: i64,
    pub frame: i64,
    pub thread: i64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PyInterpreterStateOffsets {
    pub tstate_head: i64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PyRuntimeStateOffsets {
    /// offsetof(_PyRuntimeState, interpreters.main)
    pub interp_main: i64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PyFrameObjectOffsets {
    pub f_back: i64,
    pub f_code: i64,
    pub f_lineno: i64,
    pub f_localsplus: i64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PyCodeObjectOffsets {
    pub co_filename: i64,
    pub co_name: i64,
    pub co_varnames: i64,
    pub co_firstlineno: i64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PyTupleObjectOffsets {
    pub ob_item: i64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StructOffsets {
    pub py_object: PyObjectOffsets,
    pub string: PyStringOffsets,
    pub py_type_object: PyTypeObjectOffsets,
    pub py_thread_state: PyThreadStateOffsets,
    pub py_interpreter_state: PyInterpreterStateOffsets,
    pub py_runtime_state: PyRuntimeStateOffsets,
    pub py_frame_object: PyFrameObjectOffsets,
    pub py_code_object: PyCodeObjectOffsets,
    pub py_tuple_object: PyTupleObjectOffsets,
}

pub const PY27_OFFSETS: StructOffsets = StructOffsets {
    py_object: PyObjectOffsets { ob_type: 8 },
    string: PyStringOffsets {
        data: 36, // offsetof(PyStringObject, ob_sval)
        size: 16, // offsetof(PyVarObject, ob_size)
    },
    py_type_object: PyTypeObjectOffsets { tp_name: 24 },
    py_thread_state: PyThreadStateOffsets {
        next: 0,
        interp: 8,
        frame: 16,
        thread: 144,
    },
    py_interpreter_state: PyInterpreterStateOffsets { tstate_head: 8 },
    py_runtime_state: PyRuntimeStateOffsets { interp_main: -1 },
    py_frame_object: PyFrameObjectOffsets {
        f_back: 24,
        f_code: 32,
        f_lineno: 124,
        f_localsplus: 376,
    },
    py_code_object: PyCodeObjectOffsets {
        co_filename: 80,
        co_name: 88,
        co_varnames: 56,
        co_firstlineno: 96,
    },
    py_tuple_object: PyTupleObjectOffsets { ob_item: 24 },
};

pub const PY36_OFFSETS: StructOffsets = StructOffsets {
    py_object: PyObjectOffsets { ob_type: 8 },
    string: PyStringOffsets {
        data: 48, // sizeof(PyASCIIObject)
        size: 16, // offsetof(PyVarObject, ob_size)
    },
    py_type_object: PyTypeObjectOffsets { tp_name: 24 },
    py_thread_state: PyThreadStateOffsets {
        next: 8,
        interp: 16,
        frame: 24,
        thread: 152,
    },
    py_interpreter_state: PyInterpreterStateOffsets { tstate_head: 8 },
    // 3.6 has no _PyRuntime; the anchor must be _PyThreadState_Current.
    py_runtime_state: PyRuntimeStateOffsets { interp_main: -1 },
    py_frame_object: PyFrameObjectOffsets {
        f_back: 24,
        f_code: 32,
        f_lineno: 124,
        f_localsplus: 376,
    },
    py_code_object: PyCodeObjectOffsets {
        co_filename: 96,
        co_name: 104,
        co_varnames: 64,
        co_firstlineno: 36,
    },
    py_tuple_object: PyTupleObjectOffsets { ob_item: 24 },
};

pub const PY37_OFFSETS: StructOffsets = StructOffsets {
    py_object: PyObjectOffsets { ob_type: 8 },
    string: PyStringOffsets {
        data: 48, // sizeof(PyASCIIObject)
        size: 16, // offsetof(PyVarObject, ob_size)
    },
    py_type_object: PyTypeObjectOffsets { tp_name: 24 },
    py_thread_state: PyThreadStateOffsets {
        next: 8,
        interp: 16,
        frame: 24,
        thread: 176,
    },
    py_interpreter_state: PyInterpreterStateOffsets { tstate_head: 8 },
    py_runtime_state: PyRuntimeStateOffsets { interp_main: 32 },
    py_frame_object: PyFrameObjectOffsets {
        f_back: 24,
        f_code: 32,
        f_lineno: 108,
        f_localsplus: 360,
    },
    py_code_object: PyCodeObjectOffsets {
        co_filename: 96,
        co_name: 104,
        co_varnames: 64,
        co_firstlineno: 36,
    },
    py_tuple_object: PyTupleObjectOffsets { ob_item: 24 },
};

pub const PY38_OFFSETS: StructOffsets = StructOffsets {
    py_object: PyObjectOffsets { ob_type: 8 },
    string: PyStringOffsets {
        data: 48, // sizeof(PyASCIIObject)
        size: 16, // offsetof(PyVarObject, ob_size)
    },
    py_type_object: PyTypeObjectOffsets { tp_name: 24 },
    py_thread_state: PyThreadStateOffsets {
        next: 8,
        interp: 16,
        frame: 24,
        thread: 176,
    },
    py_interpreter_state: PyInterpreterStateOffsets { tstate_head: 8 },
    py_runtime_state: PyRuntimeStateOffsets { interp_main: 40 },
    py_frame_object: PyFrameObjectOffsets {
        f_back: 24,
        f_code: 32,
        f_lineno: 108,
        f_localsplus: 360,
    },
    py_code_object: PyCodeObjectOffsets {
        co_filename: 104,
        co_name: 112,
        co_varnames: 72,
        co_firstlineno: 40,
    },
    py_tuple_object: PyTupleObjectOffsets { ob_item: 24 },
};

pub const PY310_OFFSETS: StructOffsets = StructOffsets {
    py_object: PyObjectOffsets { ob_type: 8 },
    string: PyStringOffsets {
        data: 48, // offsetof(PyStringObject, ob_sval)
        size: -1,
    },
    py_type_object: PyTypeObjectOffsets { tp_name: 24 },
    py_thread_state: PyThreadStateOffsets {
        next: 8,
        interp: 16,
        frame: 24,
        thread: 176,
    },
    py_interpreter_state: PyInterpreterStateOffsets { tstate_head: 8 },
    py_runtime_state: PyRuntimeStateOffsets { interp_main: 40 },
    py_frame_object: PyFrameObjectOffsets {
        f_back: 24,
        f_code: 32,
        f_lineno: 100,
        f_localsplus: 352,
    },
    py_code_object: PyCodeObjectOffsets {
        co_filename: 104,
        co_name: 112,
        co_varnames: 72,
        co_firstlineno: 40,
    },
    py_tuple_object: PyTupleObjectOffsets { ob_item: 24 },
};

/// Python 3 minor versions to offsets. `get_offsets` depends on this list
/// being sorted in ascending version order.
pub const PYTHON3_VERSIONS: [(PythonVersion, StructOffsets); 4] = [
    (PythonVersion::new(3, 6, 0), PY36_OFFSETS),
    (PythonVersion::new(3, 7, 0), PY37_OFFSETS),
    (PythonVersion::new(3, 8, 0), PY38_OFFSETS),
    // 3.9 is the same as 3.8
    (PythonVersion::new(3, 10, 0), PY310_OFFSETS),
];

/// Offsets for the greatest registered version <= `version`. Any 2.x maps to
/// the 2.7 entry. Callers must reject 3.x versions below the smallest
/// registered one before getting here.
pub fn get_offsets(version: &PythonVersion) -> StructOffsets {
    if version.major == 2 {
        return PY27_OFFSETS;
    }
    let idx = PYTHON3_VERSIONS.partition_point(|(v, _)| v <= version);
    PYTHON3_VERSIONS[idx.saturating_sub(1)].1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_exact_and_inherited() {
        assert_eq!(get_offsets(&PythonVersion::new(3, 6, 0)), PY36_OFFSETS);
        assert_eq!(get_offsets(&PythonVersion::new(3, 6, 15)), PY36_OFFSETS);
        assert_eq!(get_offsets(&PythonVersion::new(3, 7, 4)), PY37_OFFSETS);
        assert_eq!(get_offsets(&PythonVersion::new(3, 8, 0)), PY38_OFFSETS);
        // 3.9 inherits from 3.8
        assert_eq!(get_offsets(&PythonVersion::new(3, 9, 18)), PY38_OFFSETS);
        assert_eq!(get_offsets(&PythonVersion::new(3, 10, 12)), PY310_OFFSETS);
        // later versions inherit the latest entry
        assert_eq!(get_offsets(&PythonVersion::new(3, 11, 0)), PY310_OFFSETS);
    }

    #[test]
    fn lookup_python2() {
        assert_eq!(get_offsets(&PythonVersion::new(2, 7, 18)), PY27_OFFSETS);
        assert_eq!(get_offsets(&PythonVersion::new(2, 6, 0)), PY27_OFFSETS);
    }

    #[test]
    fn lookup_is_greatest_entry_not_above_query() {
        // For every registered version v, no registered entry e satisfies
        // lookup(q) < e <= q.
        for q in [
            PythonVersion::new(3, 6, 9),
            PythonVersion::new(3, 7, 0),
            PythonVersion::new(3, 9, 2),
            PythonVersion::new(3, 12, 1),
        ] {
            let chosen = get_offsets(&q);
            let chosen_version = PYTHON3_VERSIONS
                .iter()
                .find(|(_, offs)| *offs == chosen)
                .map(|(v, _)| *v)
                .unwrap();
            assert!(chosen_version <= q);
            for (v, _) in PYTHON3_VERSIONS.iter() {
                assert!(!(chosen_version < *v && *v <= q), "missed entry {v} for query {q}");
            }
        }
    }
}
