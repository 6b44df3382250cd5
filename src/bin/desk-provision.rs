use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;

use desk_provision::cancel::{install_interrupt_handler, CancelToken};
use desk_provision::executor::SystemExecutor;
use desk_provision::identity;
use desk_provision::log::InstallLog;
use desk_provision::plan::Plan;
use desk_provision::report::{self, ReportContext};
use desk_provision::retry::ThreadSleeper;
use desk_provision::session::{exit, Mode, Session, SessionReport};
use desk_provision::step::PlannedStep;

const EXIT_CODES_HELP: &str = "\
Exit codes:
  0    every step succeeded, was already satisfied or failed tolerably
  1    a fatal step failed
  2    could not start (identity, plan, lock or preflight)
  130  interrupted by the operator, even when no fatal step failed;
       an interrupted run is never reported as a success";

/// Provision a security-tooling Linux desktop.
///
/// Run with sudo. Every step is skipped when already satisfied, so the command
/// is safe to re-run after a partial failure.
#[derive(Parser, Debug)]
#[command(
    name = "desk-provision",
    version,
    about = "Idempotent, retryable provisioning of a security-tooling Linux desktop",
    after_help = EXIT_CODES_HELP
)]
struct Cli {
    /// Plan file (defaults to the built-in plan)
    #[arg(long, env = "DESK_PROVISION_PLAN")]
    plan: Option<PathBuf>,

    /// Install log location (overrides the plan's settings.log_file)
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Evaluate checks and print what would run; change nothing
    #[arg(long, conflicts_with = "verify_only")]
    dry_run: bool,

    /// Skip the steps; verify and report only
    #[arg(long)]
    verify_only: bool,

    /// Skip network, disk space and host tool checks
    #[arg(long)]
    skip_preflight: bool,

    /// Plain output without colors
    #[arg(long)]
    no_color: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let color = !cli.no_color && console::colors_enabled();

    let mut plan = match load_plan(cli.plan.as_ref()) {
        Ok(plan) => plan,
        Err(err) => {
            eprintln!("[desk-provision] [STOP] {err:#}");
            return code(exit::PRE_RUN);
        }
    };
    if let Some(path) = cli.log_file {
        plan.set_log_file(path);
    }

    let log = InstallLog::open(&plan.settings().log_file, color);
    let cancel = match install_interrupt_handler() {
        Ok(token) => token,
        Err(err) => {
            log.warn(format!("cannot install interrupt handler: {err}"));
            CancelToken::new()
        }
    };

    let mode = if cli.dry_run {
        Mode::DryRun
    } else if cli.verify_only {
        Mode::VerifyOnly
    } else {
        Mode::Provision
    };
    log.info(format!(
        "desk-provision {} ({}, plan {})",
        env!("CARGO_PKG_VERSION"),
        mode.label(),
        plan.origin()
    ));

    let session = Session {
        plan: &plan,
        executor: &SystemExecutor,
        sleeper: &ThreadSleeper,
        cancel: &cancel,
        log: &log,
        mode,
        skip_preflight: cli.skip_preflight,
    };

    match session.run(identity::resolve) {
        Ok(outcome) => {
            if mode == Mode::DryRun {
                print_plan(&outcome.planned);
            } else {
                print!("{}", render(&outcome, &plan, &log));
            }
            if let Some(path) = &outcome.manifest {
                log.info(format!("run manifest written to {}", path.display()));
            }
            code(outcome.exit_code())
        }
        Err(err) => {
            log.stop(&err);
            code(exit::PRE_RUN)
        }
    }
}

fn load_plan(path: Option<&PathBuf>) -> Result<Plan> {
    match path {
        Some(path) => Plan::load(path),
        None => Plan::builtin(),
    }
}

fn render(outcome: &SessionReport, plan: &Plan, log: &InstallLog) -> String {
    let ctx = ReportContext {
        color: log.color(),
        log_path: log.path().map(|path| path.to_path_buf()),
        warnings: outcome.warnings.clone(),
        follow_up: if outcome.run.cancelled {
            Vec::new()
        } else {
            plan.settings().follow_up.clone()
        },
        verify_only: outcome.mode == Mode::VerifyOnly,
    };
    report::render(&outcome.run, &outcome.verified, &ctx)
}

fn print_plan(planned: &[PlannedStep]) {
    println!();
    println!("Dry run: nothing will be changed.");
    for step in planned {
        if step.satisfied {
            println!("  already satisfied  {}", step.name);
        } else if step.touches.is_empty() {
            println!("  would run          {}", step.name);
        } else {
            let touches = step
                .touches
                .iter()
                .map(|path| path.display().to_string())
                .collect::<Vec<_>>()
                .join(", ");
            println!("  would run          {} (touches {})", step.name, touches);
        }
    }
    let pending = planned.iter().filter(|step| !step.satisfied).count();
    println!();
    println!("{pending} of {} step(s) would run.", planned.len());
}

fn code(value: i32) -> ExitCode {
    ExitCode::from(u8::try_from(value).unwrap_or(1))
}
