//! cubes - interactive cubescript console
//!
//! Usage:
//!   cubes                       # interactive session
//!   cubes script.cfg            # run a script
//!   cubes -i script.cfg         # run a script, then stay interactive
//!   cubes -c 'echo (+ 1 2)'     # run one command and exit
//!
//! Session commands:
//!   :quit, :q                   # exit
//!
//! The engine ships bare; the command set of this console (echo, exec,
//! arithmetic, loops, ...) lives in `library.rs` and is registered through
//! the same public API any embedding application uses.

mod config;
mod library;
mod shell;

use std::path::PathBuf;

use clap::Parser;
use tracing::debug;

#[derive(Parser)]
#[command(name = "cubes")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Interactive cubescript console", long_about = None)]
struct Args {
    /// Scripts to execute before (or instead of) the interactive session
    files: Vec<PathBuf>,

    /// Execute a command string and exit
    #[arg(short = 'c', long = "command")]
    command: Option<String>,

    /// Stay interactive after running scripts
    #[arg(short, long)]
    interactive: bool,

    /// Skip history loading and saving
    #[arg(long)]
    no_history: bool,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() {
    let args = Args::parse();
    init_tracing(args.verbose);
    if let Err(e) = run(args) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Log to stderr at the level the `-v` flags ask for, on top of any
/// `RUST_LOG` directives for other targets.
fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(
                format!("cubes={}", level)
                    .parse()
                    .expect("built directive parses"),
            ),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn run(args: Args) -> Result<(), String> {
    let cfg = config::ReplConfig::load();
    let mut cs = cubescript::CsState::new();
    library::register(&mut cs);
    if let Some(depth) = cfg.trace_depth {
        cs.set_var_int("dbgalias", depth, true, true);
    }

    for file in &args.files {
        debug!("executing {}", file.display());
        cs.run_file(file)?;
    }

    if let Some(cmd) = &args.command {
        let out = cs.run_str(cmd);
        if !out.is_empty() {
            println!("{}", out);
        }
        return Ok(());
    }

    if args.files.is_empty() || args.interactive {
        shell::run(&mut cs, &cfg, !args.no_history)?;
    }
    Ok(())
}
