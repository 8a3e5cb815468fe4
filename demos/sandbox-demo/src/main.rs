//! Exercises the Launcher and Sandboxee bootstrap end to end: run with no arguments to launch a
//! sandboxed copy of this same binary; the child detects the `--job` handoff and runs the
//! sandboxee side instead of launching anything further.

#[macro_use]
extern crate tracing;

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::metadata::LevelFilter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};
use windows_sandbox::launcher::Launcher;
use windows_sandbox::wrappers::handle::HandleWrapper;
use windows_sandbox::wrappers::process::Process;
use windows_sandbox::{InitFlags, LauncherHooks, SandboxeeHooks, sandboxee};

/// Launches a target executable under the sandbox, or (internally, via `--job`) runs as the
/// sandboxed child itself.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Executable to sandbox. Defaults to this binary, so a bare `sandbox-demo` run launches a
    /// sandboxed copy of itself.
    #[arg(long)]
    target: Option<PathBuf>,

    /// Base command line passed to the target, before the `--job` handoff is appended.
    #[arg(long, default_value = "")]
    base_cmd_line: String,

    /// Create the sandbox desktop on the caller's existing window station instead of a fresh one.
    #[arg(long)]
    no_winstation: bool,
}

struct DemoLauncherHooks;

impl LauncherHooks for DemoLauncherHooks {
    fn pre_resume(&mut self, child: &Process) -> anyhow::Result<()> {
        info!(handle = ?child.handle().raw(), "pre_resume");
        Ok(())
    }
}

struct DemoSandboxeeHooks;

impl SandboxeeHooks for DemoSandboxeeHooks {
    fn on_priv_init(&mut self) -> anyhow::Result<()> {
        info!("sandboxee on_priv_init");
        Ok(())
    }

    fn on_init(&mut self) -> anyhow::Result<()> {
        info!("sandboxee on_init: running sandboxed payload");
        println!("hello from inside the sandbox");
        Ok(())
    }

    fn on_fini(&mut self) -> anyhow::Result<()> {
        info!("sandboxee on_fini");
        Ok(())
    }
}

fn setup_logger() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .with_env_var("SANDBOX_DEMO_LOG")
        .from_env()
        .expect("invalid filtering directive from env");

    tracing_subscriber::registry().with(fmt::layer()).with(env_filter).init();
}

fn run_launcher(args: Args) -> anyhow::Result<()> {
    let target = match args.target {
        Some(target) => target,
        None => Process::exe_path()?,
    };

    let init_flags = if args.no_winstation { InitFlags::NoSeparateWindowStation } else { InitFlags::Normal };

    let mut launcher = Launcher::new(init_flags)?;
    let mut hooks = DemoLauncherHooks;
    let process_information = launcher.launch(&target, &args.base_cmd_line, &mut hooks)?;

    info!(pid = process_information.process_id, "sandboxed process launched");
    Ok(())
}

fn run_sandboxee(args: &[String]) -> anyhow::Result<()> {
    let mut hooks = DemoSandboxeeHooks;
    sandboxee::bootstrap(args, &mut hooks)
}

fn main() -> ExitCode {
    setup_logger();

    let argv: Vec<String> = env::args().collect();

    // The `--job` handoff flag is parsed manually and never reaches clap, since it is an
    // internal protocol between the Launcher and the Sandboxee, not a user-facing option.
    let result = if argv.iter().any(|a| a == "--job") {
        run_sandboxee(&argv)
    } else {
        let args = Args::parse();
        run_launcher(args)
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "sandbox-demo failed");
            ExitCode::FAILURE
        }
    }
}
