use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use log::{debug, info, warn};
use procfs::process::Process;
use pytail_common::python::offsets::{get_offsets, StructOffsets};
use pytail_common::python::state::{pid_data, pthreads_impl, py_globals};
use pytail_common::python::PythonVersion;

use crate::python::binary::{find_python_module, inspect_elf, PythonModule, PythonSymbols};
use crate::python::version::scan_python_version;

/// Everything derived from one Python binary. Cached by (device, inode) so
/// processes sharing a binary share the work.
#[derive(Debug, Clone)]
pub struct PythonBinaryInfo {
    pub device: u64,
    pub inode: u64,
    /// p_vaddr of the first executable LOAD segment
    pub exec_vaddr: u64,
    pub symbols: PythonSymbols,
    pub version: PythonVersion,
    pub offsets: StructOffsets,
    pub pthreads_impl: pthreads_impl,
}

/// Target discovery and per-PID configuration. `configure_pid` produces the
/// record the kernel sampler consumes, or None for processes that aren't
/// profileable Python.
pub struct Processes {
    pythons: Vec<PythonBinaryInfo>,
}

impl Default for Processes {
    fn default() -> Self {
        Self::new()
    }
}

impl Processes {
    pub fn new() -> Self {
        Self { pythons: Vec::new() }
    }

    pub fn running_pids() -> Result<Vec<u32>> {
        let mut pids = Vec::new();
        for p in procfs::process::all_processes()? {
            if let Ok(prc) = p {
                pids.push(prc.pid as u32);
            }
        }
        Ok(pids)
    }

    /// Kernel threads have no /proc/<pid>/exe target.
    pub fn is_user_process(pid: u32) -> bool {
        std::fs::read_link(format!("/proc/{pid}/exe")).is_ok()
    }

    pub fn configure_pid(&mut self, pid: u32) -> Option<pid_data> {
        if !Self::is_user_process(pid) {
            return None;
        }
        let process = Process::new(pid as i32).ok()?;
        let module = match find_python_module(&process) {
            Ok(Some(module)) => module,
            Ok(None) => {
                debug!("[{pid}] process does not map a Python binary");
                return None;
            }
            Err(e) => {
                debug!("[{pid}] reading maps failed: {e}");
                return None;
            }
        };

        let info = self.lookup_binary(pid, &module)?;
        let base = module.exec_start.wrapping_sub(info.exec_vaddr);
        info!("[{pid}] {} @ {base:#018x}", module.path.display());

        let data = build_pid_data(info, module.exec_start);
        if data.is_none() {
            warn!(
                "[{pid}] Python {} needs _PyThreadState_Current but the binary only exports _PyRuntime",
                info.version
            );
        }
        data
    }

    fn lookup_binary(&mut self, pid: u32, module: &PythonModule) -> Option<&PythonBinaryInfo> {
        if let Some(idx) = self
            .pythons
            .iter()
            .position(|p| p.device == module.device && p.inode == module.inode)
        {
            return Some(&self.pythons[idx]);
        }

        // Resolve through the target's root so containerized binaries open.
        let root_path = PathBuf::from(format!("/proc/{pid}/root{}", module.path.display()));
        match Self::new_python_binary(&root_path, module) {
            Ok(info) => {
                info!("[{pid}] detected Python {}", info.version);
                self.pythons.push(info);
                self.pythons.last()
            }
            Err(e) => {
                warn!("[{pid}] setting up Python binary failed: {e:#}");
                None
            }
        }
    }

    fn new_python_binary(path: &Path, module: &PythonModule) -> Result<PythonBinaryInfo> {
        let (exec_vaddr, symbols) = inspect_elf(path)?;
        if !symbols.any() {
            bail!("Python symbols not found in {}", path.display());
        }

        let file = File::open(path)?;
        let version = scan_python_version(BufReader::new(file), &module.version_hint)?;
        match version.major {
            2 => {}
            3 if version >= PythonVersion::new(3, 6, 0) => {}
            _ => bail!("unsupported Python version {version}"),
        }

        Ok(PythonBinaryInfo {
            device: module.device,
            inode: module.inode,
            exec_vaddr,
            symbols,
            version,
            offsets: get_offsets(&version),
            pthreads_impl: module.pthreads_impl,
        })
    }
}

/// Resolve the binary's symbol vaddrs through the load bias into the record
/// the sampler reads. Exactly one of _PyRuntime/_PyThreadState_Current ends
/// up set; a version without an interp_main offset (3.6) can't go through
/// _PyRuntime even if the binary happens to export that name.
pub fn build_pid_data(info: &PythonBinaryInfo, exec_start: u64) -> Option<pid_data> {
    let base = exec_start.wrapping_sub(info.exec_vaddr);

    let mut globals = py_globals {
        // Any constant readable address works for the scratch-clearing
        // buffer; the start of the executable segment certainly is one.
        constant_buffer: base.wrapping_add(info.exec_vaddr),
        _PyThreadState_Current: 0,
        _PyRuntime: 0,
    };

    if info.symbols._PyRuntime != 0 && info.offsets.py_runtime_state.interp_main >= 0 {
        globals._PyRuntime = base.wrapping_add(info.symbols._PyRuntime);
    } else if info.symbols._PyThreadState_Current != 0 {
        globals._PyThreadState_Current = base.wrapping_add(info.symbols._PyThreadState_Current);
    } else {
        return None;
    }

    Some(pid_data {
        pthreads_impl: info.pthreads_impl,
        globals,
        offsets: info.offsets,
        interp: 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pytail_common::python::offsets::{PY36_OFFSETS, PY38_OFFSETS};

    fn binary_info(version: PythonVersion, symbols: PythonSymbols) -> PythonBinaryInfo {
        PythonBinaryInfo {
            device: 1,
            inode: 2,
            exec_vaddr: 0x1000,
            symbols,
            version,
            offsets: get_offsets(&version),
            pthreads_impl: pthreads_impl::PTI_GLIBC,
        }
    }

    const EXEC_START: u64 = 0x5000_1000;

    #[test]
    fn py38_uses_the_runtime_anchor() {
        let info = binary_info(
            PythonVersion::new(3, 8, 10),
            PythonSymbols {
                _PyRuntime: 0x2000,
                _PyThreadState_Current: 0,
            },
        );
        let data = build_pid_data(&info, EXEC_START).unwrap();
        // base = 0x5000_1000 - 0x1000
        assert_eq!(data.globals._PyRuntime, 0x5000_0000 + 0x2000);
        assert_eq!(data.globals._PyThreadState_Current, 0);
        assert_eq!(data.globals.constant_buffer, EXEC_START);
        assert_eq!(data.offsets, PY38_OFFSETS);
        assert_eq!(data.interp, 0);
    }

    #[test]
    fn static_exe_with_runtime_symbol_configures() {
        // a statically linked python* binary: no libpython in maps, but the
        // executable itself provides _PyRuntime
        let info = binary_info(
            PythonVersion::new(3, 8, 2),
            PythonSymbols {
                _PyRuntime: 0xabc0,
                _PyThreadState_Current: 0,
            },
        );
        let data = build_pid_data(&info, EXEC_START).unwrap();
        assert_ne!(data.globals._PyRuntime, 0);
    }

    #[test]
    fn py36_refuses_the_runtime_anchor() {
        // 3.6 has interp_main == -1; a binary exporting only _PyRuntime is
        // not usable.
        let info = binary_info(
            PythonVersion::new(3, 6, 8),
            PythonSymbols {
                _PyRuntime: 0x2000,
                _PyThreadState_Current: 0,
            },
        );
        assert!(build_pid_data(&info, EXEC_START).is_none());

        // with _PyThreadState_Current present, 3.6 goes through it
        let info = binary_info(
            PythonVersion::new(3, 6, 8),
            PythonSymbols {
                _PyRuntime: 0x2000,
                _PyThreadState_Current: 0x3000,
            },
        );
        let data = build_pid_data(&info, EXEC_START).unwrap();
        assert_eq!(data.globals._PyRuntime, 0);
        assert_eq!(data.globals._PyThreadState_Current, 0x5000_0000 + 0x3000);
        assert_eq!(data.offsets, PY36_OFFSETS);
    }

    #[test]
    fn py27_uses_thread_state_current() {
        let info = binary_info(
            PythonVersion::new(2, 7, 18),
            PythonSymbols {
                _PyRuntime: 0,
                _PyThreadState_Current: 0x4000,
            },
        );
        let data = build_pid_data(&info, EXEC_START).unwrap();
        assert_eq!(data.globals._PyThreadState_Current, 0x5000_0000 + 0x4000);
        assert_eq!(data.globals._PyRuntime, 0);
    }
}
