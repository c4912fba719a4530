use std::collections::{BTreeMap, HashMap};
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use aya::maps::{AsyncPerfEventArray, HashMap as AyaHashMap, MapData, ProgramArray, StackTraceMap};
use aya::programs::{perf_event, PerfEvent, PerfEventScope, PerfTypeId, SamplePolicy};
use aya::util::{kernel_symbols, nr_cpus, online_cpus};
use aya::{Bpf, BpfLoader};
use aya_log::EbpfLogger;
use bytes::BytesMut;
use log::{debug, error, info, warn};
use pytail_common::python::state::{pid_data, Event, Symbol};
use pytail_common::{ConfigKey, GET_THREAD_STATE_PROG_IDX, READ_PYTHON_STACK_PROG_IDX};
use thiserror::Error;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

use crate::args::Opt;
use crate::btf;
use crate::output::folded::FoldedPrinter;
use crate::processes::Processes;
use crate::sample::Sample;
use crate::symbols;
use crate::unwind::NativeUnwinder;

/// Ring pages per CPU.
const PERF_BUF_PAGES: usize = 32;

/// Paths tried for the BPF object when PYTAIL_BPF is unset; built with
/// `cargo xtask build-ebpf [--release]`.
const BPF_OBJECT_PATHS: &[&str] = &[
    "target/bpfel-unknown-none/release/pytail",
    "target/bpfel-unknown-none/debug/pytail",
];

#[derive(Debug, Error)]
pub enum ProfilerError {
    #[error("initialization failed: {0}")]
    Init(anyhow::Error),
    #[error("opening the sample ring failed: {0}")]
    RingOpen(anyhow::Error),
    #[error("attaching to the CPU clock event failed: {0}")]
    Attach(anyhow::Error),
    #[error("writing output failed: {0}")]
    Output(#[from] std::io::Error),
}

impl ProfilerError {
    pub fn exit_code(&self) -> i32 {
        match self {
            ProfilerError::Init(_) => 1,
            ProfilerError::RingOpen(_) => 3,
            ProfilerError::Attach(_) => 5,
            ProfilerError::Output(_) => 1,
        }
    }
}

pub struct Profiler {
    bpf: Bpf,
    pids: Vec<u32>,
    sample_rate: Option<u64>,
    frequency: Option<u64>,
    duration: u64,
    update_interval: Duration,
    unwinder: NativeUnwinder,
    ksyms: BTreeMap<u64, String>,
    total_samples: u64,
    lost_samples: Arc<AtomicU64>,
}

impl Profiler {
    pub fn init(opt: &Opt) -> Result<Self, ProfilerError> {
        Self::init_inner(opt).map_err(ProfilerError::Init)
    }

    fn init_inner(opt: &Opt) -> Result<Self> {
        ensure_root()?;
        bump_memlock_rlimit()?;

        let object = load_bpf_object()?;
        let mut bpf = BpfLoader::new()
            .set_max_entries("SYMBOLS", opt.symbols_map_size)
            .load(&object)
            .context("loading BPF programs failed")?;
        if let Err(e) = EbpfLogger::init(&mut bpf) {
            debug!("BPF logger not available: {e}");
        }

        let mut config: AyaHashMap<_, u32, u64> =
            AyaHashMap::try_from(bpf.map_mut("CONFIG").context("no CONFIG map")?)?;
        let num_cpus = nr_cpus().map_err(|(ctx, e)| anyhow::anyhow!("{ctx}: {e}"))?;
        config.insert(ConfigKey::NumCpus as u32, num_cpus as u64, 0)?;
        let fsbase_offset = btf::task_fsbase_offset()?;
        debug!("task_struct thread.fsbase offset: {fsbase_offset:#x}");
        config.insert(ConfigKey::FsbaseOffset as u32, fsbase_offset, 0)?;

        // the two chained stages go live through the program array; on_event
        // is loaded at attach time
        let mut progs = ProgramArray::try_from(bpf.take_map("PROGS").context("no PROGS map")?)?;
        for (name, idx) in [
            ("get_thread_state", GET_THREAD_STATE_PROG_IDX),
            ("read_python_stack", READ_PYTHON_STACK_PROG_IDX),
        ] {
            let program: &mut PerfEvent = bpf
                .program_mut(name)
                .with_context(|| format!("no {name} program"))?
                .try_into()?;
            program.load()?;
            progs.set(idx, program.fd()?, 0)?;
        }

        let ksyms = kernel_symbols().context("reading kernel symbols failed")?;

        Ok(Self {
            bpf,
            pids: opt.pids.clone(),
            sample_rate: opt.sampling().0,
            frequency: opt.sampling().1,
            duration: opt.duration,
            update_interval: Duration::from_secs(opt.update_interval),
            unwinder: NativeUnwinder::new(),
            ksyms,
            total_samples: 0,
            lost_samples: Arc::new(AtomicU64::new(0)),
        })
    }

    pub async fn profile(&mut self, printer: &mut FoldedPrinter) -> Result<(), ProfilerError> {
        // readers first, so nothing is dropped once the event fires
        let mut events = AsyncPerfEventArray::try_from(
            self.bpf
                .take_map("EVENTS")
                .context("no EVENTS map")
                .map_err(ProfilerError::RingOpen)?,
        )
        .map_err(|e| ProfilerError::RingOpen(e.into()))?;

        let (tx, mut rx) = mpsc::channel::<Box<Event>>(512);
        let (stop_tx, stop_rx) = watch::channel(());
        let mut readers = Vec::new();
        for cpu_id in online_cpus()
            .map_err(|(ctx, e)| ProfilerError::RingOpen(anyhow::anyhow!("{ctx}: {e}")))?
        {
            let buf = events
                .open(cpu_id, Some(PERF_BUF_PAGES))
                .map_err(|e| ProfilerError::RingOpen(e.into()))?;
            readers.push(spawn_reader(
                buf,
                tx.clone(),
                Arc::clone(&self.lost_samples),
                stop_rx.clone(),
            ));
        }
        drop(tx);

        // per-PID config: populate once, then refresh in the background
        let pid_config: AyaHashMap<MapData, u32, pid_data> = AyaHashMap::try_from(
            self.bpf
                .take_map("PID_CONFIG")
                .context("no PID_CONFIG map")
                .map_err(ProfilerError::Init)?,
        )
        .map_err(|e| ProfilerError::Init(e.into()))?;
        let discovery = spawn_discovery(
            pid_config,
            self.pids.clone(),
            self.update_interval,
            stop_rx.clone(),
        );

        let links = self.attach().map_err(ProfilerError::Attach)?;
        info!("attached to the profiling event");

        let mut dump_signal =
            signal(SignalKind::user_defined2()).map_err(|e| ProfilerError::Init(e.into()))?;
        let mut interrupt =
            signal(SignalKind::interrupt()).map_err(|e| ProfilerError::Init(e.into()))?;

        printer.prepare()?;

        let mut samples: Vec<Sample> = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(self.duration);
        loop {
            tokio::select! {
                maybe_event = rx.recv() => match maybe_event {
                    Some(event) => self.ingest(&event, &mut samples),
                    None => break,
                },
                _ = dump_signal.recv() => {
                    self.flush(printer, &mut samples)?;
                    printer.prepare()?;
                }
                _ = interrupt.recv() => break,
                _ = time::sleep_until(deadline), if self.duration > 0 => break,
            }
        }
        info!("profiling finished");

        self.detach(links);
        info!("detached from the profiling event");

        // one last pass over the rings before stopping the readers, then
        // drain whatever they forwarded
        time::sleep(Duration::from_millis(200)).await;
        let _ = stop_tx.send(());
        for reader in readers {
            let _ = reader.await;
        }
        let _ = discovery.await;
        while let Ok(event) = rx.try_recv() {
            self.ingest(&event, &mut samples);
        }

        self.flush(printer, &mut samples)?;
        Ok(())
    }

    fn ingest(&mut self, event: &Event, samples: &mut Vec<Sample>) {
        self.total_samples += 1;
        samples.push(Sample::resolve(event, &mut self.unwinder));
    }

    fn attach(&mut self) -> Result<Vec<perf_event::PerfEventLinkId>> {
        let program: &mut PerfEvent = self
            .bpf
            .program_mut("on_event")
            .context("no on_event program")?
            .try_into()?;
        program.load()?;

        let mut links = Vec::new();
        for cpu in online_cpus().map_err(|(ctx, e)| anyhow::anyhow!("{ctx}: {e}"))? {
            let policy = match (self.sample_rate, self.frequency) {
                (_, Some(freq)) => SamplePolicy::Frequency(freq),
                (Some(rate), None) => SamplePolicy::Period(rate),
                (None, None) => SamplePolicy::Period(1_000_000),
            };
            links.push(program.attach(
                PerfTypeId::Software,
                perf_event::perf_sw_ids::PERF_COUNT_SW_CPU_CLOCK as u64,
                PerfEventScope::AllProcessesOneCpu { cpu },
                policy,
                false,
            )?);
        }
        Ok(links)
    }

    fn detach(&mut self, links: Vec<perf_event::PerfEventLinkId>) {
        let Some(program) = self.bpf.program_mut("on_event") else {
            return;
        };
        let Ok(program) = <&mut PerfEvent>::try_from(program) else {
            return;
        };
        for link in links {
            if let Err(e) = program.detach(link) {
                warn!("detaching perf event failed: {e}");
            }
        }
    }

    /// Snapshot the batch to the printer and reset the per-flush counters.
    fn flush(
        &mut self,
        printer: &mut FoldedPrinter,
        samples: &mut Vec<Sample>,
    ) -> Result<(), ProfilerError> {
        let symbol_table = self.symbol_table();
        let kernel_stacks = StackTraceMap::try_from(
            self.bpf
                .map("KERNEL_STACKS")
                .context("no KERNEL_STACKS map")
                .map_err(ProfilerError::Init)?,
        )
        .map_err(|e| ProfilerError::Init(e.into()))?;

        let ksyms = &self.ksyms;
        let mut resolve_kernel = |stack_id: i32| -> Option<Vec<String>> {
            let stack = kernel_stacks.get(&(stack_id as u32), 0).ok()?;
            let frames = stack
                .frames()
                .iter()
                .map(|frame| {
                    ksyms
                        .range(..=frame.ip)
                        .next_back()
                        .map(|(_, name)| name.clone())
                        .unwrap_or_else(|| format!("{:#x}", frame.ip))
                })
                .collect();
            Some(frames)
        };

        printer.process_samples(
            samples,
            &symbol_table,
            &mut resolve_kernel,
            self.total_samples,
            self.lost_samples.load(Ordering::Relaxed),
        )?;
        samples.clear();
        self.total_samples = 0;
        self.unwinder.prune();
        Ok(())
    }

    /// The sampler records symbol -> id; swap it here to map the ids back to
    /// the symbols they represent.
    fn symbol_table(&self) -> HashMap<i32, String> {
        let mut table = HashMap::new();
        let Some(map) = self.bpf.map("SYMBOLS") else {
            return table;
        };
        let Ok(map) = AyaHashMap::<_, Symbol, i32>::try_from(map) else {
            return table;
        };
        for entry in map.iter() {
            let Ok((sym, id)) = entry else { continue };
            table.insert(id, symbols::display_name(&sym));
        }
        info!("total {} unique Python symbols", table.len());
        table
    }
}

fn spawn_reader(
    mut buf: aya::maps::perf::AsyncPerfEventArrayBuffer<MapData>,
    tx: mpsc::Sender<Box<Event>>,
    lost: Arc<AtomicU64>,
    mut stop_rx: watch::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buffers = (0..4)
            .map(|_| BytesMut::with_capacity(mem::size_of::<Event>() + 128))
            .collect::<Vec<_>>();

        loop {
            tokio::select! {
                result = buf.read_events(&mut buffers) => {
                    let Ok(events) = result else { break };
                    lost.fetch_add(events.lost as u64, Ordering::Relaxed);
                    for b in buffers.iter().take(events.read) {
                        let event = unsafe { std::ptr::read_unaligned(b.as_ptr() as *const Event) };
                        if tx.try_send(Box::new(event)).is_err() {
                            error!("sample channel full, dropping");
                        }
                    }
                },
                _ = stop_rx.changed() => break,
            }
        }
    })
}

fn spawn_discovery(
    mut pid_config: AyaHashMap<MapData, u32, pid_data>,
    explicit_pids: Vec<u32>,
    interval: Duration,
    mut stop_rx: watch::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut processes = Processes::new();
        loop {
            refresh_pid_table(&mut pid_config, &mut processes, &explicit_pids);
            tokio::select! {
                _ = time::sleep(interval) => (),
                _ = stop_rx.changed() => break,
            }
        }
    })
}

fn refresh_pid_table(
    table: &mut AyaHashMap<MapData, u32, pid_data>,
    processes: &mut Processes,
    explicit_pids: &[u32],
) {
    // entries for exited processes just waste map slots
    let stale: Vec<u32> = table
        .keys()
        .filter_map(|key| key.ok())
        .filter(|pid| !Path::new(&format!("/proc/{pid}")).exists())
        .collect();
    for pid in stale {
        let _ = table.remove(&pid);
    }

    let pids = if explicit_pids.is_empty() {
        match Processes::running_pids() {
            Ok(pids) => pids,
            Err(e) => {
                warn!("listing /proc failed: {e}");
                return;
            }
        }
    } else {
        explicit_pids.to_vec()
    };

    let mut any = false;
    for pid in pids {
        if table.get(&pid, 0).is_ok() {
            any = true;
            continue;
        }
        if let Some(data) = processes.configure_pid(pid) {
            match table.insert(pid, data, 0) {
                Ok(()) => any = true,
                Err(e) => warn!("[{pid}] installing config failed: {e}"),
            }
        }
    }
    if !any {
        debug!("no processes to profile");
    }
}

fn load_bpf_object() -> Result<Vec<u8>> {
    let path = match std::env::var_os("PYTAIL_BPF") {
        Some(path) => PathBuf::from(path),
        None => BPF_OBJECT_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|p| p.exists())
            .context("BPF object not found; build it with `cargo xtask build-ebpf`")?,
    };
    std::fs::read(&path).with_context(|| format!("failed to read {}", path.display()))
}

fn ensure_root() -> Result<()> {
    if !nix::unistd::geteuid().is_root() {
        anyhow::bail!("pytail must be run with root privileges");
    }
    Ok(())
}

fn bump_memlock_rlimit() -> Result<()> {
    let rlimit = libc::rlimit {
        rlim_cur: 128 << 20,
        rlim_max: 128 << 20,
    };
    if unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlimit) } != 0 {
        anyhow::bail!("failed to increase the memlock rlimit");
    }
    Ok(())
}
