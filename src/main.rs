//! Stormflow CLI
//!
//! Runs a complete simulation: `stormflow <input> <report> <output>`.
//! Exit code 0 on success, the engine error code on any fatal error;
//! warnings go to the report file and do not change the exit code.

use clap::Parser;
use log::error;
use std::path::PathBuf;
use std::process;
use stormflow::Engine;

#[derive(Parser)]
#[command(name = "stormflow")]
#[command(version)]
#[command(about = "Urban stormwater runoff and drainage network simulation", long_about = None)]
struct Cli {
    /// Project input file (JSON project document)
    input: PathBuf,

    /// Report file to write
    report: PathBuf,

    /// Binary results file to write
    output: PathBuf,

    /// Suppress the progress line
    #[arg(short, long)]
    quiet: bool,
}

fn run(cli: &Cli) -> stormflow::Result<()> {
    let mut engine = Engine::open(&cli.input, &cli.report, &cli.output)?;
    engine.start(true)?;
    let mut last_pct = -1;
    loop {
        let elapsed = engine.step()?;
        if elapsed <= 0.0 {
            break;
        }
        if !cli.quiet {
            let total = engine.project().options.end - engine.project().options.start;
            let pct = (elapsed / total.num_milliseconds() as f64 * 100.0) as i32;
            if pct != last_pct && pct % 10 == 0 {
                eprintln!("... {pct}%");
                last_pct = pct;
            }
        }
    }
    engine.end()?;
    engine.report()?;
    engine.close()
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();
    if let Err(e) = run(&cli) {
        error!("{e}");
        eprintln!("ERROR {}: {e}", e.code());
        process::exit(e.code());
    }
}
