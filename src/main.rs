#[macro_use]
extern crate log;

mod address;
mod counter;
mod membership;
mod planner;
mod progress_reporter;
mod scanner;
mod shared_types;

use std::error::Error;
use std::path::PathBuf;
use std::process;

use clap::builder::TypedValueParser as _;
use clap::Parser;
use counter::{start_count, CountPreferences};
use indicatif::{MultiProgress, ProgressDrawTarget};
use indicatif_log_bridge::LogWrapper;
use simplelog::LevelFilter;

/// Counts the distinct IPv4 addresses in a file with one address per line.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Input file
    #[arg(short, long)]
    file: PathBuf,

    /// Number of chunks scanned in parallel [default: number of CPUs]
    #[arg(short, long)]
    workers: Option<u32>,

    /// Bytes each worker reads at a time
    #[arg(short, long, default_value_t = scanner::DEFAULT_BLOCK_SIZE,
          value_parser = clap::value_parser!(u64).range(1..).map(|n| n as usize))]
    block_size: usize,

    /// Hide the progress bar
    #[arg(short, long)]
    quiet: bool,

    /// More log output (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_logging(verbose: u8, multi: &MultiProgress) -> Result<(), Box<dyn Error>> {
    let level = match verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    let logger = simplelog::TermLogger::new(
        level,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    );
    LogWrapper::new(multi.clone(), *logger).try_init()?;
    log::set_max_level(level);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = CliArgs::parse();

    let multi = if args.quiet {
        MultiProgress::with_draw_target(ProgressDrawTarget::hidden())
    } else {
        MultiProgress::new()
    };
    init_logging(args.verbose, &multi)?;

    let specs = CountPreferences {
        path: args.file,
        workers: args.workers.unwrap_or_else(|| num_cpus::get() as u32),
        block_size: args.block_size,
    };
    let report = match start_count(specs, multi).await {
        Ok(report) => report,
        Err(e) => {
            error!("{e}");
            process::exit(1);
        }
    };

    println!("Elapsed: {} s", report.elapsed.as_secs());
    println!("Unique addresses: {}", report.unique);
    println!("Workers: {}", report.workers);
    info!(
        "{} lines, {} bytes scanned in {:.3} s",
        report.lines,
        report.bytes,
        report.elapsed.as_secs_f64()
    );

    if let Err(e) = report.ensure_complete() {
        warn!("{e}");
        process::exit(1);
    }
    Ok(())
}
