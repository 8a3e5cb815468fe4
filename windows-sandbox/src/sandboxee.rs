//! The sandboxee bootstrap: validates the inherited job handle, runs the privileged-init hook
//! while impersonating, reverts, drops integrity, joins the job, applies deferred mitigations,
//! then hands off to the untrusted payload (spec §4.9).

use std::ffi::c_void;

use anyhow::{Context, Result};
use tracing::instrument;
use windows::Win32::Foundation::HANDLE;
use windows::Win32::Security::{RevertToSelf, TOKEN_ADJUST_DEFAULT};

use win_api_wrappers::identity::sid::WELL_KNOWN;
use win_api_wrappers::job::Job;
use win_api_wrappers::process::Process;
use win_api_wrappers::token::Token;

use crate::{Error, SandboxeeHooks, mitigation};

/// Scans `args` for the literal `--job` switch followed by a hexadecimal handle value
/// (spec §6). Fails if the switch is missing, unpaired, or the value does not parse.
pub fn parse_job_argument(args: &[String]) -> Result<HANDLE> {
    let index = args.iter().position(|a| a == "--job").ok_or(Error::MissingJobArgument)?;
    let value = args.get(index + 1).ok_or(Error::MissingJobArgument)?;
    let raw = usize::from_str_radix(value, 16).map_err(|_| Error::MissingJobArgument)?;

    Ok(HANDLE(raw as *mut c_void))
}

/// Runs the full bootstrap state machine (spec §4.9). `hooks` supplies `OnPrivInit`/`OnInit`/
/// `OnFini`; each is run at the point its name implies. Any failure before `OnInit` means the
/// job handle is still closed and no untrusted code runs.
#[instrument(skip(hooks))]
pub fn bootstrap(args: &[String], hooks: &mut impl SandboxeeHooks) -> Result<()> {
    info!("transition=parse_argv");
    let job_handle = parse_job_argument(args)?;

    info!("transition=validate_job_handle");
    Job::validate(job_handle).map_err(|_| Error::InvalidJobHandle).context("validating inherited job handle")?;
    debug!("transition=validate_job_handle ok");

    let result = run_privileged_phase(hooks);

    // SAFETY: No preconditions; reverts the calling thread to its process token regardless
    // of whether `OnPrivInit` succeeded, matching "every transition guarded, no retry" (§4.11).
    unsafe { RevertToSelf()? };

    result?;

    info!("transition=drop_integrity");
    drop_process_integrity_level().context("dropping integrity level to Low")?;
    debug!("transition=drop_integrity ok");

    info!("transition=assign_job");
    // SAFETY: `job_handle` was validated above to name a real job object, and is closed by
    // this wrapper's `Drop` once the block below ends, before `OnInit` runs (spec §4.9:
    // "closed before OnInit so the payload cannot pass it further").
    {
        let job = unsafe { win_api_wrappers::handle::Handle::new_owned(job_handle) }.map(Job::from)?;
        job.assign_process(&Process::current())?;
    }
    debug!("transition=assign_job ok");

    info!("transition=apply_mitigations");
    mitigation::apply_runtime_mitigations(hooks.get_deferred_mitigation_policies())
        .context("applying deferred runtime mitigations")?;
    debug!("transition=apply_mitigations ok");

    info!("transition=on_init");
    let init_result = hooks.on_init();

    if let Err(err) = &init_result {
        error!(error = %err, "transition=on_init failed");
    }

    let _ = hooks.on_fini();

    init_result
}

fn run_privileged_phase(hooks: &mut impl SandboxeeHooks) -> Result<()> {
    info!("transition=on_priv_init");
    hooks.on_priv_init()
}

/// Opens the current process token and sets its mandatory label to Low (spec §4.9).
fn drop_process_integrity_level() -> Result<()> {
    let token = Token::current_process_token(TOKEN_ADJUST_DEFAULT)?;
    token.set_integrity_level(WELL_KNOWN.low_integrity_label())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::hex_value(&["app.exe", "--job", "1a2b"], Some(0x1a2b))]
    #[case::missing_switch(&["app.exe"], None)]
    #[case::unpaired_switch(&["app.exe", "--job"], None)]
    #[case::non_hex_value(&["app.exe", "--job", "not-hex"], None)]
    fn parse_job_argument_cases(#[case] args: &[&str], #[case] expected: Option<usize>) {
        let args: Vec<String> = args.iter().map(|&a| a.to_owned()).collect();
        let result = parse_job_argument(&args);

        match expected {
            Some(expected) => assert_eq!(result.unwrap().0 as usize, expected),
            None => assert!(result.is_err()),
        }
    }
}
