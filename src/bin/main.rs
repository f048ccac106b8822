use std::{
    io::{self, IsTerminal},
    process::ExitCode,
};

use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

use devsup::{
    cli::{Cli, Commands, parse_args},
    config::load_config,
    constants::INTERRUPTED_EXIT_CODE,
    error::SupervisorError,
    host::Host,
    readiness::Readiness,
    supervisor::{StartSummary, StopOutcome, StopResult, Supervisor},
};

fn main() -> ExitCode {
    let args = parse_args();
    init_logging(&args);

    if let Err(err) = register_interrupt_handler() {
        warn!("Failed to install Ctrl-C handler: {err}");
    }

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Cli) -> Result<(), SupervisorError> {
    let config = load_config(args.config.as_deref())?;
    debug!("Using log directory {}", config.resolved_log_dir().display());
    let mut supervisor = Supervisor::from_config(&config, Host::os()?)?;
    let color = io::stdout().is_terminal();

    match args.command {
        Commands::Start => match supervisor.start() {
            Ok(summary) => print_started(&summary, color),
            Err(err) if !err.is_fatal() => {
                print!("{}", supervisor.status(false).render(color));
                return Err(err);
            }
            Err(err) => return Err(err),
        },
        Commands::Stop { clean_logs } => {
            let stopped = supervisor.stop(clean_logs)?;
            print_stopped(&stopped);
            if clean_logs {
                println!("Logs cleared in {}", supervisor.logs().log_dir().display());
            }
        }
        Commands::Restart => match supervisor.restart() {
            Ok(summary) => {
                print_stopped(&summary.stopped);
                print_started(&summary.started, color);
            }
            Err(err) if !err.is_fatal() => {
                print!("{}", supervisor.status(false).render(color));
                return Err(err);
            }
            Err(err) => return Err(err),
        },
        Commands::Status {
            detailed,
            json,
            no_color,
        } => {
            let report = supervisor.status(detailed);
            if json {
                let rendered = report.to_json().map_err(io::Error::other)?;
                println!("{rendered}");
            } else {
                print!("{}", report.render(color && !no_color));
            }
        }
    }

    Ok(())
}

fn print_started(summary: &StartSummary, color: bool) {
    for outcome in &summary.outcomes {
        match &outcome.readiness {
            Readiness::Ready { url, .. } => {
                println!("{} is up (PID {}) at {url}", outcome.service, outcome.pid);
            }
            Readiness::Timeout { attempts } => {
                println!(
                    "{} was started (PID {}) but did not answer HTTP after {attempts} attempts",
                    outcome.service, outcome.pid
                );
            }
        }
    }
    println!();
    print!("{}", summary.report.render(color));
}

fn print_stopped(outcomes: &[StopOutcome]) {
    for outcome in outcomes {
        let service = &outcome.service;
        match outcome.result {
            StopResult::NotRunning => println!("{service} was not running"),
            StopResult::Stopped { pid, forced: false } => {
                println!("Stopped {service} (PID {pid})")
            }
            StopResult::Stopped { pid, forced: true } => {
                println!("Killed {service} (PID {pid}) after it ignored SIGTERM")
            }
            StopResult::StaleRecord { pid } => {
                println!("{service} was already gone (stale PID {pid} removed)")
            }
        }
        if !outcome.reclaimed.is_empty() {
            let pids: Vec<String> = outcome.reclaimed.iter().map(u32::to_string).collect();
            println!(
                "  also killed PID(s) {} still holding its port",
                pids.join(", ")
            );
        }
    }
}

fn init_logging(args: &Cli) {
    let filter = if let Some(level) = args.log_level {
        EnvFilter::new(level.as_str())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

fn register_interrupt_handler() -> Result<(), ctrlc::Error> {
    ctrlc::set_handler(|| {
        eprintln!(
            "\nInterrupted. Services that were already launched keep running; use `devsup stop` to stop them."
        );
        std::process::exit(INTERRUPTED_EXIT_CODE);
    })
}
