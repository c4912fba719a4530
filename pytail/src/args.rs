use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[clap(name = "pytail", about)]
pub struct Opt {
    /// Profile this pid; repeat for several. All Python processes are
    /// discovered when absent.
    #[clap(short, long = "pid")]
    pub pids: Vec<u32>,

    /// Take one sample every this many CPU clock events
    #[clap(short = 'c', long)]
    pub sample_rate: Option<u64>,

    /// Samples per second; mutually exclusive with --sample-rate
    #[clap(short = 'F', long)]
    pub frequency: Option<u64>,

    /// Profiling duration in seconds; 0 runs until terminated
    #[clap(short, long, default_value_t = 0)]
    pub duration: u64,

    /// Process rediscovery period in seconds
    #[clap(long, default_value_t = 10)]
    pub update_interval: u64,

    /// Capacity of the symbol dedup map
    #[clap(long, default_value_t = 16384)]
    pub symbols_map_size: u32,

    /// Log verbosity: 0 warnings, 1 info, 2 debug, 3 trace
    #[clap(short, long, default_value_t = 0)]
    pub verbose: u8,

    /// Write folded stacks here instead of stdout; the file is renamed to
    /// <output>.<timestamp> on every flush
    #[clap(short, long)]
    pub output: Option<PathBuf>,
}

impl Opt {
    /// Default to one sample per million events when neither knob is given.
    pub fn sampling(&self) -> (Option<u64>, Option<u64>) {
        match (self.sample_rate, self.frequency) {
            (None, None) => (Some(1_000_000), None),
            other => other,
        }
    }
}
