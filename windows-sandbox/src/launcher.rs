//! The launcher: orchestrates token construction, window-station/desktop creation, job
//! creation, attribute-list assembly, suspended-process creation, impersonation hand-off, and
//! resume, in the exact order spec §5 mandates.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use windows::Win32::Foundation::{GENERIC_ALL, GENERIC_READ, HANDLE};
use windows::Win32::System::Com::CoTaskMemFree;
use windows::Win32::Security::{
    SecurityImpersonation, TOKEN_ADJUST_DEFAULT, TOKEN_ASSIGN_PRIMARY, TOKEN_DUPLICATE, TOKEN_IMPERSONATE, TOKEN_QUERY,
    TokenImpersonation,
};
use windows::Win32::System::StationsAndDesktops::{
    DESKTOP_ACCESS_FLAGS, DESKTOP_CREATEWINDOW, DESKTOP_READOBJECTS, DESKTOP_WRITEOBJECTS, WINSTA_CREATEDESKTOP, WINSTA_READATTRIBUTES,
};
use windows::Win32::System::SystemInformation::{GetVersionExW, OSVERSIONINFOEXW, OSVERSIONINFOW};
use windows::Win32::System::Threading::{CREATE_BREAKAWAY_FROM_JOB, PROCESS_CREATION_FLAGS};
use windows::Win32::UI::Shell::{FOLDERID_LocalAppDataLow, KNOWN_FOLDER_FLAG, SHGetKnownFolderPath};
use tracing::instrument;

use win_api_wrappers::identity::sid::{Sid, SidAndAttributes, WELL_KNOWN};
use win_api_wrappers::job::{self as job_api, Job};
use win_api_wrappers::process::{self as process_api, Process, ProcessInformation, StartupInfo};
use win_api_wrappers::security::acl::{DaclBuilder, InheritableAcl, InheritableAclKind};
use win_api_wrappers::security::attributes::{SecurityAttributes, SecurityAttributesInit, build_inheritable_security_descriptor};
use win_api_wrappers::thread::{ThreadAttributeList, ThreadAttributeType};
use win_api_wrappers::token::Token;
use win_api_wrappers::winstation::{Desktop, ScopedProcessWindowStation, WindowStation};

use crate::sid_attrs::{self, FILTER_ADD_RESTRICTED, FILTER_INTEGRITY, FILTER_RESTRICTED_DISABLE};
use crate::{InitFlags, LauncherHooks, mitigation};

/// `DISABLE_MAX_PRIVILEGE` / `SANDBOX_INERT`: `CreateRestrictedToken` flag bits not
/// re-exported by name at this `windows` crate version; reproduced from `winnt.h`.
const DISABLE_MAX_PRIVILEGE: u32 = 0x1;
const SANDBOX_INERT: u32 = 0x2;

/// Detects the Win8-class / Win10-class OS facts gating job nesting and binary-signature
/// mitigation (spec §6). `GetVersionExW` is deprecated and manifest-less callers may observe
/// a compatibility-shimmed value; see DESIGN.md for why this crate still uses it rather than
/// pulling in a dedicated version-detection dependency the rest of the corpus never reaches for.
fn os_version_class() -> Result<(bool, bool)> {
    let mut info = OSVERSIONINFOEXW { dwOSVersionInfoSize: size_of::<OSVERSIONINFOEXW>() as u32, ..Default::default() };

    // SAFETY: `info` is sized and tagged per `GetVersionExW`'s documented contract.
    unsafe { GetVersionExW(&mut info as *mut OSVERSIONINFOEXW as *mut OSVERSIONINFOW)? };

    let win8_class = info.dwMajorVersion > 6 || (info.dwMajorVersion == 6 && info.dwMinorVersion >= 2);
    let win10_class = info.dwMajorVersion >= 10;

    Ok((win8_class, win10_class))
}

/// Resolves `FOLDERID_LocalAppDataLow` under `token`: on Low integrity it is one of the few
/// locations the sandboxed child can still write to (spec §4.10).
fn local_app_data_low(token: &Token) -> Result<PathBuf> {
    use win_api_wrappers::utils::SafeWindowsString;

    // SAFETY: `token` is a live token handle; the returned string is CoTaskMem-allocated and
    // freed exactly once below.
    let raw = unsafe { SHGetKnownFolderPath(&FOLDERID_LocalAppDataLow, KNOWN_FOLDER_FLAG(0), Some(token.handle.raw()))? };

    let result = raw.to_string_safe();

    // SAFETY: `raw` was allocated by `SHGetKnownFolderPath` and is freed exactly once here.
    unsafe { CoTaskMemFree(Some(raw.0.cast())) };

    Ok(PathBuf::from(result?))
}

/// Everything the launcher has acquired for exactly one sandboxed child (spec §3
/// "Launcher state"). Every handle-bearing field closes on drop via its own RAII wrapper.
pub struct Launcher {
    win8_class: bool,
    win10_class: bool,
    mitigation_policies: u64,
    custom_sid: Sid,
    logon_sid: Sid,
    restricted_token: Token,
    impersonation_token: Token,
    #[allow(dead_code)]
    inheritable_sd: SecurityAttributes,
    winstation: Option<WindowStation>,
    desktop: Desktop,
    desktop_path: String,
    job: Job,
    handles_to_inherit: Vec<HANDLE>,
    child_process: Option<Process>,
}

impl Launcher {
    /// Runs steps 1–6 of spec §5's ordering: custom SID, tokens, inheritable SD, window
    /// station, desktop (patching the *current* desktop first), and job.
    #[instrument(skip_all)]
    pub fn new(init_flags: InitFlags) -> Result<Self> {
        let (win8_class, win10_class) = os_version_class()?;
        debug!(win8_class, win10_class, "detected OS capability class");

        // Step 1: custom SID.
        let custom_sid = Sid::init_custom().context("minting custom SID")?;
        info!(sid = %custom_sid, "step=custom_sid");

        // Step 2: tokens.
        let process_token =
            Token::current_process_token(TOKEN_ADJUST_DEFAULT | TOKEN_ASSIGN_PRIMARY | TOKEN_DUPLICATE | TOKEN_QUERY)
                .context("opening current process token")?;

        let (to_disable, logon_sid) = sid_attrs::create_from_token_groups(&process_token, FILTER_RESTRICTED_DISABLE)?;
        let logon_sid = logon_sid.context("current process token has no Logon SID")?;
        debug!(logon_sid = %logon_sid, "captured Logon SID");

        // Step 3: inheritable SD, built immediately after the Logon SID is known (spec §4.7).
        let inheritable_sd =
            build_inheritable_security_descriptor(&logon_sid).context("building inheritable security descriptor")?;
        info!("step=inheritable_sd");

        let restrict_list = [
            SidAndAttributes { sid: WELL_KNOWN.everyone().clone(), attributes: 0 },
            SidAndAttributes { sid: WELL_KNOWN.builtin_users().clone(), attributes: 0 },
            SidAndAttributes { sid: WELL_KNOWN.restricted_code().clone(), attributes: 0 },
            SidAndAttributes { sid: logon_sid.clone(), attributes: 0 },
            SidAndAttributes { sid: custom_sid.clone(), attributes: 0 },
        ];

        let restricted_token = process_token
            .create_restricted_token(DISABLE_MAX_PRIVILEGE | SANDBOX_INERT, &to_disable, &restrict_list)
            .context("creating restricted token")?;

        let default_dacl = {
            let mut builder = DaclBuilder::new();
            builder
                .add_allowed_ace(WELL_KNOWN.local_system().clone(), GENERIC_ALL.0)
                .add_allowed_ace(WELL_KNOWN.builtin_administrators().clone(), GENERIC_ALL.0)
                .add_allowed_ace(logon_sid.clone(), GENERIC_ALL.0);
            builder.materialize()?.clone()
        };
        restricted_token.set_default_dacl(&default_dacl).context("installing restricted token default DACL")?;
        info!("step=tokens_restricted");

        let (impersonation_source, _) =
            sid_attrs::create_from_token_groups(&process_token, FILTER_INTEGRITY | FILTER_ADD_RESTRICTED)?;
        let impersonation_base = process_token
            .create_restricted_token(SANDBOX_INERT, &[], &impersonation_source)
            .context("creating impersonation-source restricted token")?;
        let impersonation_token = impersonation_base
            .duplicate_ex(TOKEN_QUERY | TOKEN_DUPLICATE | TOKEN_IMPERSONATE, SecurityImpersonation, TokenImpersonation)
            .context("raising impersonation token to Impersonation level")?;
        info!("step=tokens_impersonation");

        // Step 4: window station.
        let (winstation, winstation_name) = match init_flags {
            InitFlags::Normal => {
                let winsta = WindowStation::create(WINSTA_READATTRIBUTES | WINSTA_CREATEDESKTOP, Some(&inheritable_sd))
                    .context("creating window station")?;
                let name = winsta.name()?;
                (Some(winsta), name)
            }
            InitFlags::NoSeparateWindowStation => (None, "winsta0".to_owned()),
        };
        info!(winstation_name, "step=window_station");

        // Step 5: desktop — patch the *current* desktop's DACL first (spec §4.5), then create
        // the new desktop on the (possibly new) window station carrying that same patched DACL.
        let patch =
            win_api_wrappers::winstation::patch_current_desktop_deny_sid(&custom_sid).context("patching current desktop DACL")?;

        let new_desktop_sd = SecurityAttributesInit {
            inherit_handle: true,
            dacl: Some(InheritableAcl { kind: InheritableAclKind::Protected, acl: patch.patched_dacl.clone() }),
            ..Default::default()
        }
        .init();

        let desktop_result = (|| -> Result<Desktop> {
            let _scoped_winstation = winstation.as_ref().map(|w| ScopedProcessWindowStation::enter(w.raw())).transpose()?;
            Desktop::create(
                "sandbox",
                0,
                DESKTOP_ACCESS_FLAGS(DESKTOP_CREATEWINDOW.0 | DESKTOP_READOBJECTS.0 | DESKTOP_WRITEOBJECTS.0 | GENERIC_READ.0),
                Some(&new_desktop_sd),
            )
            .context("creating desktop")
        })();

        let desktop = match desktop_result {
            Ok(d) => d,
            Err(err) => {
                // Roll back the parent-desktop patch before propagating (spec §8 scenario 6).
                let _ = win_api_wrappers::winstation::restore_current_desktop_security(patch.snapshot);
                return Err(err);
            }
        };

        let desktop_path = Desktop::desktop_path(&winstation_name, "sandbox");
        info!(desktop_path, "step=desktop");

        // Step 6: job.
        let job = Job::create(Some(&inheritable_sd)).context("creating job object")?;
        job.limit_active_process_count(1)?;
        job.restrict_ui(job_api::ALL_UI_RESTRICTIONS)?;
        info!("step=job");

        Ok(Self {
            win8_class,
            win10_class,
            mitigation_policies: mitigation::mask_for_os(mitigation::recommended(), win10_class),
            custom_sid,
            logon_sid,
            restricted_token,
            impersonation_token,
            inheritable_sd,
            winstation,
            desktop,
            desktop_path,
            job,
            handles_to_inherit: Vec::new(),
            child_process: None,
        })
    }

    pub fn set_mitigation_policies(&mut self, policies: u64) {
        self.mitigation_policies = mitigation::mask_for_os(policies, self.win10_class);
    }

    pub fn add_handle_to_inherit(&mut self, handle: HANDLE) {
        self.handles_to_inherit.push(handle);
    }

    /// Runs steps 7–11 of spec §5's ordering: attribute list, suspended process creation,
    /// `SetThreadToken`, `PreResume`, resume.
    #[instrument(skip_all)]
    pub fn launch(&mut self, application_name: &Path, base_cmd_line: &str, hooks: &mut impl LauncherHooks) -> Result<ProcessInformation> {
        let command_line = format!("{} {} --job {:x}", application_name.display(), base_cmd_line, self.job.handle.raw().0 as usize);

        // Step 7: attribute list — handle-inherit list plus creation-time mitigation blob.
        let mut handles = self.handles_to_inherit.clone();
        handles.push(self.impersonation_token.handle.raw());
        handles.push(self.job.handle.raw());

        let creation_blob = mitigation::creation_time_blob(self.mitigation_policies);

        let mut attribute_list = ThreadAttributeList::with_count(2)?;
        attribute_list.update(&ThreadAttributeType::HandleList(&handles))?;
        attribute_list.update(&ThreadAttributeType::MitigationPolicy(&creation_blob))?;
        info!("step=attribute_list");

        let mut startup_info = StartupInfo::new(Some(attribute_list), Some(&self.desktop_path));

        let extra_flags =
            if self.win8_class { PROCESS_CREATION_FLAGS(0) } else { PROCESS_CREATION_FLAGS(CREATE_BREAKAWAY_FROM_JOB.0) };

        // On Low integrity, LocalAppDataLow is one of the few locations the restricted token
        // can still write to (spec §4.10).
        let working_directory = local_app_data_low(&self.restricted_token).ok();

        // Step 8: suspended process.
        let process_information = process_api::create_process_as_user(
            &self.restricted_token,
            None,
            &command_line,
            extra_flags,
            working_directory.as_deref(),
            &mut startup_info,
        )
        .context("CreateProcessAsUser")?;
        info!(pid = process_information.process_id, "step=suspended_process");

        if let Err(err) = self.finish_launch(&process_information, hooks) {
            let _ = process_api::terminate(&process_information.process, 1);
            return Err(err);
        }

        self.child_process = Some(Process::open_for_wait(process_information.process_id)?);

        Ok(process_information)
    }

    /// Waits up to `timeout_ms` for the sandboxed child to exit (spec §3 `Wait`, §8 scenario
    /// forwarding to `WaitForSingleObject`). Returns `false` on timeout.
    pub fn wait(&self, timeout_ms: u32) -> Result<bool> {
        let child = self.child_process.as_ref().context("launch has not completed")?;
        child.wait(timeout_ms)
    }

    fn finish_launch(&mut self, process_information: &ProcessInformation, hooks: &mut impl LauncherHooks) -> Result<()> {
        // Step 9: install the impersonation token on the child's main thread.
        process_information.thread.set_token(Some(&self.impersonation_token)).context("SetThreadToken")?;
        info!("step=thread_token");

        // Step 10: PreResume hook.
        hooks.pre_resume(&process_information.process).context("PreResume hook")?;
        info!("step=pre_resume");

        // Step 11: resume.
        process_information.thread.resume().context("ResumeThread")?;
        info!("step=resume");

        Ok(())
    }

    pub fn is_sandbox_running(&self, process: &Process) -> Result<bool> {
        job_api::Job::is_process_in_job(process, Some(&self.job))
    }

    pub fn custom_sid(&self) -> &Sid {
        &self.custom_sid
    }

    pub fn logon_sid(&self) -> &Sid {
        &self.logon_sid
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    #[cfg_attr(miri, ignore)]
    fn new_launcher_with_default_flags() {
        let launcher = Launcher::new(InitFlags::Normal).unwrap();
        assert!(launcher.custom_sid().is_valid().unwrap());
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn no_separate_window_station_skips_winstation_creation() {
        let launcher = Launcher::new(InitFlags::NoSeparateWindowStation).unwrap();
        assert!(launcher.winstation.is_none());
    }
}
