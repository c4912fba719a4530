use std::process::exit;

use clap::Parser;
use log::{error, info};
use pytail::args::Opt;
use pytail::output::folded::FoldedPrinter;
use pytail::Profiler;

fn verbosity_filter(level: u8) -> &'static str {
    match level {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

#[tokio::main]
async fn main() {
    let opt = Opt::parse();

    let env = env_logger::Env::default()
        .filter_or("LOG_LEVEL", verbosity_filter(opt.verbose))
        .write_style_or("LOG_STYLE", "auto");
    env_logger::init_from_env(env);

    if opt.sample_rate.is_some() && opt.frequency.is_some() {
        error!("only one of --sample-rate/--frequency may be given");
        exit(1);
    }

    let (sample_rate, frequency) = opt.sampling();
    if let Some(rate) = sample_rate {
        info!("profiling sample rate: {rate}");
    }
    if let Some(freq) = frequency {
        info!("profiling sample frequency: {freq}");
    }
    if opt.duration != 0 {
        info!("profiling duration: {}s", opt.duration);
    }

    let mut profiler = match Profiler::init(&opt) {
        Ok(profiler) => profiler,
        Err(e) => {
            error!("{e:#}");
            exit(e.exit_code());
        }
    };

    let mut printer = FoldedPrinter::new(opt.output.clone());
    eprintln!("Ready to profile");

    if let Err(e) = profiler.profile(&mut printer).await {
        error!("{e:#}");
        exit(e.exit_code());
    }
}
