use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use memmap2::Mmap;
use object::elf::{FileHeader64, PF_X, PT_LOAD};
use object::read::elf::{FileHeader, ProgramHeader};
use object::{Endianness, Object, ObjectSymbol, SymbolKind};
use procfs::process::{MMapPath, Process};
use pytail_common::python::state::pthreads_impl;

const PY_LIB_NAME: &str = "libpython";
const PY_EXE_NAME: &str = "python";

/// A Python-like module found in a target's memory maps.
#[derive(Debug, Clone)]
pub struct PythonModule {
    /// path as mapped in the target's namespace
    pub path: PathBuf,
    /// MAJOR.MINOR from the filename (just MAJOR for unversioned names)
    pub version_hint: String,
    /// start of the mapped executable segment
    pub exec_start: u64,
    pub device: u64,
    pub inode: u64,
    pub pthreads_impl: pthreads_impl,
}

/// vaddrs of the global anchors rooting the interpreter traversal. Which
/// one a binary exports depends on the Python version; one is enough.
#[derive(Debug, Default, Clone, Copy)]
pub struct PythonSymbols {
    pub _PyRuntime: u64,
    pub _PyThreadState_Current: u64,
}

impl PythonSymbols {
    pub fn any(&self) -> bool {
        self._PyRuntime != 0 || self._PyThreadState_Current != 0
    }
}

/// Walk the target's executable mappings for its Python binary.
///
/// There are two cases: a static build where the executable carries all the
/// Python symbols, and a dynamic build where they live in libpython*.so. A
/// "python*" executable is mapped either way, so "libpython*" wins, and the
/// scan must not stop at "python*" because the library most likely appears
/// in a later entry.
pub fn find_python_module(process: &Process) -> Result<Option<PythonModule>> {
    let mut module: Option<PythonModule> = None;
    let mut found_lib = false;
    let mut is_musl = false;

    for entry in process.maps()? {
        let MMapPath::Path(path) = &entry.pathname else {
            continue;
        };
        if !entry.perms.contains('x') {
            continue;
        }
        if !is_musl && path.to_string_lossy().contains("musl") {
            is_musl = true;
        }
        if found_lib {
            continue;
        }

        let Some(basename) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let prefix_len = if basename.starts_with(PY_LIB_NAME) {
            found_lib = true;
            PY_LIB_NAME.len()
        } else if basename.starts_with(PY_EXE_NAME) {
            PY_EXE_NAME.len()
        } else {
            continue;
        };

        module = Some(PythonModule {
            path: path.clone(),
            version_hint: version_hint(basename, prefix_len),
            exec_start: entry.address.0,
            device: nix::sys::stat::makedev(entry.dev.0 as u64, entry.dev.1 as u64),
            inode: entry.inode,
            pthreads_impl: pthreads_impl::PTI_GLIBC,
        });
    }

    if let Some(m) = module.as_mut() {
        m.pthreads_impl = if is_musl {
            pthreads_impl::PTI_MUSL
        } else {
            pthreads_impl::PTI_GLIBC
        };
    }
    Ok(module)
}

/// The version substring starts right after the matched prefix and runs
/// through the last digit. The major and its dot are assumed ("3."); the
/// minor may have more than one digit.
fn version_hint(basename: &str, prefix_len: usize) -> String {
    let bytes = basename.as_bytes();
    let mut end = basename.len();
    for i in (prefix_len + 2).min(end)..bytes.len() {
        if !bytes[i].is_ascii_digit() {
            end = i;
            break;
        }
    }
    basename[prefix_len..end].to_string()
}

/// ELF pass over the chosen binary: the vaddr of the first executable LOAD
/// segment (LOAD segments are sorted by ascending vaddr, and there is only
/// one executable one anyway) and the global anchor symbols.
pub fn inspect_elf(path: &Path) -> Result<(u64, PythonSymbols)> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let mmap = unsafe { Mmap::map(&file)? };

    let elf = FileHeader64::<Endianness>::parse(&*mmap)?;
    let endian = elf.endian()?;
    let mut exec_vaddr = 0u64;
    for seg in elf.program_headers(endian, &*mmap)? {
        if seg.p_type(endian) == PT_LOAD && seg.p_flags(endian) & PF_X != 0 {
            exec_vaddr = seg.p_vaddr(endian);
            break;
        }
    }

    let obj = object::File::parse(&*mmap)?;
    let mut symbols = PythonSymbols::default();
    for sym in obj.dynamic_symbols().chain(obj.symbols()) {
        if !matches!(sym.kind(), SymbolKind::Data | SymbolKind::Text) {
            continue;
        }
        match sym.name() {
            Ok("_PyRuntime") if symbols._PyRuntime == 0 => {
                symbols._PyRuntime = sym.address();
            }
            Ok("_PyThreadState_Current") if symbols._PyThreadState_Current == 0 => {
                symbols._PyThreadState_Current = sym.address();
            }
            _ => {}
        }
        if symbols.any() {
            // only one anchor is needed per version
            break;
        }
    }
    Ok((exec_vaddr, symbols))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_hint_from_library_name() {
        assert_eq!(version_hint("libpython3.10.so.1.0", PY_LIB_NAME.len()), "3.10");
        assert_eq!(version_hint("libpython3.6m.so", PY_LIB_NAME.len()), "3.6");
        assert_eq!(version_hint("libpython2.7.so.1.0", PY_LIB_NAME.len()), "2.7");
    }

    #[test]
    fn version_hint_from_executable_name() {
        assert_eq!(version_hint("python3.8", PY_EXE_NAME.len()), "3.8");
        assert_eq!(version_hint("python3.12", PY_EXE_NAME.len()), "3.12");
        // unversioned binaries leave only the major
        assert_eq!(version_hint("python3", PY_EXE_NAME.len()), "3");
    }
}
