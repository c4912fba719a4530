pub mod elf;
pub mod memory;

use std::collections::HashMap;
use std::ops::Range;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use framehop::x86_64::{CacheX86_64, UnwindRegsX86_64, UnwinderX86_64};
use framehop::{ExplicitModuleSectionInfo, Module, Unwinder};
use log::debug;
use object::{Object, ObjectSection, ObjectSegment};
use procfs::process::{MMapPath, Process};

use crate::unwind::elf::ElfSymbols;
use crate::unwind::memory::StackMemory;

/// Native frames resolved for one sample, innermost first.
#[derive(Debug, Default, Clone)]
pub struct NativeStackTrace {
    pub symbols: Vec<String>,
    pub error_occurred: bool,
}

const MAX_NATIVE_FRAMES: usize = 128;

/// The interpreter's evaluation loop. Frames above it are already described
/// by the event's Python stack, so the native walk stops here.
const EVAL_FRAME_SYMBOLS: [&str; 2] = ["_PyEval_EvalFrameDefault", "PyEval_EvalFrameEx"];

struct ModuleSymbols {
    avma: Range<u64>,
    base_avma: u64,
    symbols: Option<Arc<ElfSymbols>>,
}

struct PidModules {
    unwinder: UnwinderX86_64<Vec<u8>>,
    cache: CacheX86_64,
    modules: Vec<ModuleSymbols>,
}

/// Unwinds the raw stack slice captured with each sample. Per-target module
/// tables are built from /proc/<pid>/maps on first use; symbol tables are
/// shared between targets mapping the same file.
pub struct NativeUnwinder {
    pids: HashMap<u32, PidModules>,
    elf_cache: HashMap<PathBuf, Option<Arc<ElfSymbols>>>,
}

impl Default for NativeUnwinder {
    fn default() -> Self {
        Self::new()
    }
}

impl NativeUnwinder {
    pub fn new() -> Self {
        Self {
            pids: HashMap::new(),
            elf_cache: HashMap::new(),
        }
    }

    /// Drop per-pid state for targets that no longer exist.
    pub fn prune(&mut self) {
        self.pids
            .retain(|pid, _| std::path::Path::new(&format!("/proc/{pid}")).exists());
    }

    pub fn unwind(&mut self, pid: u32, ip: u64, sp: u64, stack: &[u8]) -> NativeStackTrace {
        let mut trace = NativeStackTrace::default();
        if stack.is_empty() {
            return trace;
        }

        let state = match self.pid_state(pid) {
            Ok(state) => state,
            Err(e) => {
                trace.symbols.push(format!("[Error unwind setup ({e})]"));
                trace.error_occurred = true;
                return trace;
            }
        };
        let PidModules {
            unwinder,
            cache,
            modules,
        } = state;

        let mut mem = StackMemory::new(pid, sp, stack);
        let mut read_stack = |addr: u64| mem.read_u64(addr).map_err(|_| ());

        let regs = UnwindRegsX86_64::new(ip, sp, 0);
        let mut iter = unwinder.iter_frames(ip, regs, cache, &mut read_stack);
        loop {
            match iter.next() {
                Ok(Some(frame)) => {
                    match resolve(modules, frame.address_for_lookup()) {
                        Some(name) => {
                            let is_eval_frame = EVAL_FRAME_SYMBOLS.contains(&name.as_str());
                            trace.symbols.push(name);
                            if is_eval_frame {
                                break;
                            }
                        }
                        None => {
                            trace.symbols.push("(missing)".to_string());
                            trace.error_occurred = true;
                            break;
                        }
                    }
                }
                Ok(None) => break,
                Err(_) => break,
            }
            if trace.symbols.len() >= MAX_NATIVE_FRAMES {
                break;
            }
        }
        trace
    }

    fn pid_state(&mut self, pid: u32) -> Result<&mut PidModules> {
        if !self.pids.contains_key(&pid) {
            let state = self.build_pid_state(pid)?;
            self.pids.insert(pid, state);
        }
        Ok(self.pids.get_mut(&pid).unwrap())
    }

    fn build_pid_state(&mut self, pid: u32) -> Result<PidModules> {
        let process = Process::new(pid as i32)?;

        // coalesce the mappings of each file into one avma range, and only
        // keep files that are executable somewhere
        let mut ranges: HashMap<PathBuf, Range<u64>> = HashMap::new();
        let mut executable: Vec<PathBuf> = Vec::new();
        for entry in process.maps()? {
            let MMapPath::Path(path) = &entry.pathname else {
                continue;
            };
            let range = ranges
                .entry(path.clone())
                .or_insert(entry.address.0..entry.address.1);
            range.start = range.start.min(entry.address.0);
            range.end = range.end.max(entry.address.1);
            if entry.perms.contains('x') && !executable.contains(path) {
                executable.push(path.clone());
            }
        }

        let mut unwinder = UnwinderX86_64::new();
        let mut modules = Vec::new();
        for path in executable {
            let avma = ranges[&path].clone();
            let root_path = PathBuf::from(format!("/proc/{pid}/root{}", path.display()));
            let Ok(data) = std::fs::read(&root_path) else {
                debug!("[{pid}] cannot read {}", root_path.display());
                continue;
            };
            let Ok(obj) = object::File::parse(&data[..]) else {
                continue;
            };

            let base_svma = obj.segments().map(|s| s.address()).min().unwrap_or(0);
            let base_avma = avma.start.wrapping_sub(base_svma);
            unwinder.add_module(Module::new(
                path.display().to_string(),
                avma.clone(),
                base_avma,
                section_info(&obj),
            ));
            modules.push(ModuleSymbols {
                avma,
                base_avma,
                symbols: self.elf_symbols(&root_path),
            });
        }
        modules.sort_by_key(|m| m.avma.start);

        Ok(PidModules {
            unwinder,
            cache: CacheX86_64::new(),
            modules,
        })
    }

    fn elf_symbols(&mut self, path: &PathBuf) -> Option<Arc<ElfSymbols>> {
        self.elf_cache
            .entry(path.clone())
            .or_insert_with(|| match ElfSymbols::from_path(path) {
                Ok(syms) if !syms.is_empty() => Some(Arc::new(syms)),
                _ => None,
            })
            .clone()
    }
}

fn section_info(obj: &object::File) -> ExplicitModuleSectionInfo<Vec<u8>> {
    fn section(obj: &object::File, name: &str) -> (Option<Range<u64>>, Option<Vec<u8>>) {
        match obj.section_by_name(name) {
            Some(s) => (
                Some(s.address()..s.address() + s.size()),
                s.data().ok().map(|d| d.to_vec()),
            ),
            None => (None, None),
        }
    }

    let (text_svma, text) = section(obj, ".text");
    let (eh_frame_svma, eh_frame) = section(obj, ".eh_frame");
    let (eh_frame_hdr_svma, eh_frame_hdr) = section(obj, ".eh_frame_hdr");
    let (_, debug_frame) = section(obj, ".debug_frame");

    ExplicitModuleSectionInfo {
        base_svma: obj.segments().map(|s| s.address()).min().unwrap_or(0),
        text_svma,
        text,
        eh_frame_svma,
        eh_frame,
        eh_frame_hdr_svma,
        eh_frame_hdr,
        debug_frame,
        ..Default::default()
    }
}

fn resolve(modules: &[ModuleSymbols], addr: u64) -> Option<String> {
    let module = modules.iter().find(|m| m.avma.contains(&addr))?;
    let symbols = module.symbols.as_ref()?;
    symbols
        .find(addr.wrapping_sub(module.base_avma))
        .map(str::to_string)
}
