use std::collections::HashMap;
use std::fmt::Write as _;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

use chrono::Local;
use pytail_common::python::state::{StackStatus, FRAME_CODE_IS_NULL};

use crate::sample::Sample;

const LOST_SYMBOL: &str = "[Lost Symbol]";
const TRUNCATED_STACK: &str = "[Truncated]";

#[derive(Debug, Default)]
pub struct FlushCounters {
    pub errors: u32,
    pub symbol_errors: u32,
    pub lost_symbols: u32,
    pub truncated_stacks: u32,
    pub kernel_stack_errors: u32,
}

/// Emits one flame-graph-ready line per sample. With an output path the
/// batch goes to a working file that is renamed to `<path>.<timestamp>` on
/// flush; without one it goes to stdout.
pub struct FoldedPrinter {
    output: Option<PathBuf>,
    file: Option<BufWriter<File>>,
    final_path: Option<PathBuf>,
}

impl FoldedPrinter {
    pub fn new(output: Option<PathBuf>) -> Self {
        Self {
            output,
            file: None,
            final_path: None,
        }
    }

    /// Open a fresh working file. Called once before profiling starts and
    /// again after every flush.
    pub fn prepare(&mut self) -> io::Result<()> {
        if let Some(path) = &self.output {
            self.file = Some(BufWriter::new(File::create(path)?));
            self.final_path = Some(PathBuf::from(format!(
                "{}.{}",
                path.display(),
                timestamp()
            )));
        }
        Ok(())
    }

    pub fn process_samples(
        &mut self,
        samples: &[Sample],
        symbols: &HashMap<i32, String>,
        resolve_kernel: &mut dyn FnMut(i32) -> Option<Vec<String>>,
        total_samples: u64,
        lost_samples: u64,
    ) -> io::Result<()> {
        let mut counters = FlushCounters::default();
        let mut text = String::new();
        for sample in samples {
            let kernel_frames = if sample.kernel_stack_id > 0 {
                resolve_kernel(sample.kernel_stack_id)
            } else {
                None
            };
            format_sample(
                sample,
                symbols,
                kernel_frames.as_deref(),
                &mut counters,
                &mut text,
            );
        }

        match &mut self.file {
            Some(file) => {
                file.write_all(text.as_bytes())?;
                file.flush()?;
            }
            None => {
                let mut out = io::stdout().lock();
                out.write_all(text.as_bytes())?;
                out.flush()?;
            }
        }

        eprintln!("{total_samples} samples collected");
        eprintln!("{lost_samples} samples lost");
        eprintln!("{} samples with truncated stack", counters.truncated_stacks);
        eprintln!("{} Python symbol errors", counters.symbol_errors);
        eprintln!("{} times Python symbol lost", counters.lost_symbols);
        eprintln!("{} kernel stack errors", counters.kernel_stack_errors);
        eprintln!("{} errors", counters.errors);

        if let (Some(output), Some(final_path)) = (self.output.clone(), self.final_path.take()) {
            // closes the working file before the rename
            self.file = None;
            fs::rename(&output, &final_path)?;
            eprintln!("Wrote {}", final_path.display());
        }
        Ok(())
    }
}

/// One line: `comm-pid/tid(;frame_[annotation])* 1`. Frames run from the
/// outermost caller to the innermost: the Python stack reversed, then the
/// native frames reversed (they sit below the innermost Python frame), then
/// the kernel frames reversed.
fn format_sample(
    sample: &Sample,
    symbols: &HashMap<i32, String>,
    kernel_frames: Option<&[String]>,
    counters: &mut FlushCounters,
    out: &mut String,
) {
    let _ = write!(out, "{}-{}/{}", sample.comm, sample.pid, sample.tid);

    match sample.stack_status {
        StackStatus::STACK_STATUS_TRUNCATED => {
            let _ = write!(out, ";{TRUNCATED_STACK}_[pe]");
            counters.truncated_stacks += 1;
        }
        StackStatus::STACK_STATUS_ERROR => {
            let _ = write!(out, ";[Sample Error {}]_[pe]", sample.error_code.name());
            counters.errors += 1;
        }
        StackStatus::STACK_STATUS_COMPLETE => {}
    }

    for &stack_id in sample.py_stack.iter().rev() {
        if stack_id < 0 {
            if stack_id == FRAME_CODE_IS_NULL {
                out.push_str(";(missing)_[pe]");
            } else {
                let _ = write!(out, ";[Error (errnos) {}]_[pe]", -stack_id);
                counters.symbol_errors += 1;
            }
        } else if let Some(name) = symbols.get(&stack_id) {
            let _ = write!(out, ";{name}_[p]");
        } else {
            let _ = write!(out, ";{LOST_SYMBOL}_[pe]");
            counters.lost_symbols += 1;
        }
    }

    for frame in sample.native_stack.symbols.iter().rev() {
        let _ = write!(out, ";{frame}_[pn]");
    }

    if sample.kernel_stack_id > 0 {
        match kernel_frames {
            Some(frames) => {
                for frame in frames.iter().rev() {
                    let _ = write!(out, ";{frame}_[k]");
                }
            }
            None => counters.kernel_stack_errors += 1,
        }
    } else if sample.kernel_stack_id != -libc::EFAULT {
        // EFAULT just means there was no kernel stack at that point
        counters.kernel_stack_errors += 1;
    }

    out.push_str(" 1\n");
}

fn timestamp() -> String {
    let now = Local::now();
    format!(
        "{}{:02}",
        now.format("%Y%m%d%H%M%S"),
        now.timestamp_subsec_millis() / 10
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unwind::NativeStackTrace;
    use pytail_common::python::state::ErrorCode;

    fn sample(status: StackStatus, error: ErrorCode, py_stack: Vec<i32>) -> Sample {
        Sample {
            pid: 1234,
            tid: 1234,
            comm: "python38".into(),
            error_code: error,
            stack_status: status,
            kernel_stack_id: -libc::EFAULT,
            py_stack,
            native_stack: NativeStackTrace::default(),
        }
    }

    fn format(sample: &Sample, symbols: &HashMap<i32, String>) -> (String, FlushCounters) {
        let mut counters = FlushCounters::default();
        let mut out = String::new();
        format_sample(sample, symbols, None, &mut counters, &mut out);
        (out, counters)
    }

    fn symbols(entries: &[(i32, &str)]) -> HashMap<i32, String> {
        entries.iter().map(|(id, s)| (*id, s.to_string())).collect()
    }

    #[test]
    fn complete_stack_renders_outermost_first() {
        // event stacks are deepest-first; the line runs caller to callee
        let sample = sample(
            StackStatus::STACK_STATUS_COMPLETE,
            ErrorCode::ERROR_NONE,
            vec![3, 2, 1],
        );
        let symbols = symbols(&[(1, "job.main"), (2, "job.foo"), (3, "job.bar")]);
        let (line, counters) = format(&sample, &symbols);
        assert_eq!(
            line,
            "python38-1234/1234;job.main_[p];job.foo_[p];job.bar_[p] 1\n"
        );
        assert_eq!(counters.errors, 0);
        assert_eq!(counters.kernel_stack_errors, 0);
    }

    #[test]
    fn error_sample_renders_the_symbolic_name() {
        let sample = sample(
            StackStatus::STACK_STATUS_ERROR,
            ErrorCode::ERROR_THREAD_STATE_NULL,
            vec![],
        );
        let (line, counters) = format(&sample, &HashMap::new());
        assert_eq!(
            line,
            "python38-1234/1234;[Sample Error ERROR_THREAD_STATE_NULL]_[pe] 1\n"
        );
        assert_eq!(counters.errors, 1);
    }

    #[test]
    fn truncated_stack_is_prefixed() {
        let sample = sample(
            StackStatus::STACK_STATUS_TRUNCATED,
            ErrorCode::ERROR_NONE,
            vec![1],
        );
        let symbols = symbols(&[(1, "job.deep")]);
        let (line, counters) = format(&sample, &symbols);
        assert_eq!(
            line,
            "python38-1234/1234;[Truncated]_[pe];job.deep_[p] 1\n"
        );
        assert_eq!(counters.truncated_stacks, 1);
    }

    #[test]
    fn sentinel_and_negative_ids() {
        let sample = sample(
            StackStatus::STACK_STATUS_COMPLETE,
            ErrorCode::ERROR_NONE,
            vec![FRAME_CODE_IS_NULL, -5],
        );
        let (line, counters) = format(&sample, &HashMap::new());
        assert_eq!(
            line,
            "python38-1234/1234;[Error (errnos) 5]_[pe];(missing)_[pe] 1\n"
        );
        assert_eq!(counters.symbol_errors, 1);
    }

    #[test]
    fn unknown_id_renders_lost_symbol() {
        let sample = sample(
            StackStatus::STACK_STATUS_COMPLETE,
            ErrorCode::ERROR_NONE,
            vec![42],
        );
        let (line, counters) = format(&sample, &HashMap::new());
        assert_eq!(line, "python38-1234/1234;[Lost Symbol]_[pe] 1\n");
        assert_eq!(counters.lost_symbols, 1);
    }

    #[test]
    fn native_frames_sit_between_python_and_kernel() {
        let mut s = sample(
            StackStatus::STACK_STATUS_COMPLETE,
            ErrorCode::ERROR_NONE,
            vec![1],
        );
        s.native_stack = NativeStackTrace {
            // innermost first, as the unwinder produces them
            symbols: vec!["read".into(), "_PyEval_EvalFrameDefault".into()],
            error_occurred: false,
        };
        s.kernel_stack_id = 7;
        let symbols = symbols(&[(1, "job.main")]);

        let mut counters = FlushCounters::default();
        let mut out = String::new();
        let kernel = vec!["vfs_read".to_string(), "ksys_read".to_string()];
        format_sample(&s, &symbols, Some(&kernel), &mut counters, &mut out);
        assert_eq!(
            out,
            "python38-1234/1234;job.main_[p];_PyEval_EvalFrameDefault_[pn];read_[pn];ksys_read_[k];vfs_read_[k] 1\n"
        );
    }

    #[test]
    fn unresolvable_kernel_stack_counts_as_error() {
        let mut s = sample(
            StackStatus::STACK_STATUS_COMPLETE,
            ErrorCode::ERROR_NONE,
            vec![],
        );
        s.kernel_stack_id = -1; // EPERM, not EFAULT
        let (_, counters) = format(&s, &HashMap::new());
        assert_eq!(counters.kernel_stack_errors, 1);

        let mut s2 = sample(
            StackStatus::STACK_STATUS_COMPLETE,
            ErrorCode::ERROR_NONE,
            vec![],
        );
        s2.kernel_stack_id = -libc::EFAULT;
        let (_, counters) = format(&s2, &HashMap::new());
        assert_eq!(counters.kernel_stack_errors, 0);
    }
}
