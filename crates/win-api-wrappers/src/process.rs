//! Process creation and inspection: `CreateProcessAsUser` plus the `STARTUPINFOEX` plumbing
//! the launcher needs to hand over an attribute list (spec §4.10).

use std::path::{Path, PathBuf};

use anyhow::Result;
use windows::Win32::Foundation::MAX_PATH;
use windows::Win32::System::Threading::{
    CREATE_UNICODE_ENVIRONMENT, CreateProcessAsUserW, EXTENDED_STARTUPINFO_PRESENT, GetCurrentProcess,
    GetCurrentProcessId, LPPROC_THREAD_ATTRIBUTE_LIST, OpenProcess, PROCESS_CREATION_FLAGS, PROCESS_INFORMATION,
    SYNCHRONIZE, STARTUPINFOEXW, STARTUPINFOW,
};
use windows::core::PWSTR;

use crate::handle::{Handle, HandleWrapper};
use crate::thread::Thread;
use crate::token::Token;
use crate::utils::WideString;

#[derive(Debug)]
pub struct Process {
    pub handle: Handle,
}

impl From<Handle> for Process {
    fn from(handle: Handle) -> Self {
        Self { handle }
    }
}

impl HandleWrapper for Process {
    fn handle(&self) -> &Handle {
        &self.handle
    }
}

impl Process {
    pub fn current() -> Self {
        // SAFETY: No preconditions. Returns a pseudohandle, thus not owning it.
        let handle = unsafe { GetCurrentProcess() };
        let handle = Handle::new_borrowed(handle).expect("always valid");

        Self::from(handle)
    }

    pub fn current_id() -> u32 {
        // SAFETY: No preconditions.
        unsafe { GetCurrentProcessId() }
    }

    /// Opens a process by id with just enough access to be waited on.
    pub fn open_for_wait(pid: u32) -> Result<Self> {
        // SAFETY: `OpenProcess` returns a freshly opened handle this wrapper exclusively owns.
        let handle = unsafe {
            let raw = OpenProcess(SYNCHRONIZE, false, pid)?;
            Handle::new_owned(raw)?
        };
        Ok(Self::from(handle))
    }

    /// Waits up to `timeout_ms` for the process to exit. Returns `true` if it exited within
    /// the timeout, `false` on timeout (spec §3 `Wait(timeoutMs)`, forwarding to
    /// `WaitForSingleObject`).
    pub fn wait(&self, timeout_ms: u32) -> Result<bool> {
        use windows::Win32::Foundation::{WAIT_FAILED, WAIT_OBJECT_0};
        use windows::Win32::System::Threading::WaitForSingleObject;

        // SAFETY: `self.handle` is a valid, open process handle.
        let result = unsafe { WaitForSingleObject(self.handle.raw(), timeout_ms) };

        if result == WAIT_FAILED {
            anyhow::bail!(crate::Error::last_error());
        }

        Ok(result == WAIT_OBJECT_0)
    }

    pub fn exe_path() -> Result<PathBuf> {
        let mut path = vec![0u16; MAX_PATH as usize];
        let len;

        loop {
            // SAFETY: `path` always has capacity equal to its length.
            let written = unsafe {
                windows::Win32::System::LibraryLoader::GetModuleFileNameW(None, &mut path)
            };

            if written == 0 {
                return Err(crate::Error::last_error().into());
            }

            if (written as usize) < path.len() {
                len = written as usize;
                break;
            }

            path.resize(path.len() * 2, 0);
        }

        Ok(PathBuf::from(String::from_utf16(&path[..len])?))
    }
}

/// The result of `CreateProcessAsUserW`: a suspended child process and its main thread,
/// both owned by the caller.
pub struct ProcessInformation {
    pub process: Process,
    pub thread: Thread,
    pub process_id: u32,
    pub thread_id: u32,
}

/// A `STARTUPINFOEXW` owning the `PROC_THREAD_ATTRIBUTE_LIST` and desktop-name buffer it
/// points at, so both stay valid for the lifetime of this value.
pub struct StartupInfo {
    info: STARTUPINFOEXW,
    _desktop_name: WideString,
    _attribute_list: Option<crate::thread::ThreadAttributeList>,
}

impl StartupInfo {
    pub fn new(mut attribute_list: Option<crate::thread::ThreadAttributeList>, desktop: Option<&str>) -> Self {
        let mut desktop_name = desktop.map(WideString::from).unwrap_or_default();

        let info = STARTUPINFOEXW {
            StartupInfo: STARTUPINFOW {
                cb: crate::utils::u32size_of::<STARTUPINFOEXW>(),
                lpDesktop: desktop_name.as_pwstr(),
                ..Default::default()
            },
            lpAttributeList: attribute_list.as_mut().map(|l| l.raw()).unwrap_or_default(),
        };

        Self { info, _desktop_name: desktop_name, _attribute_list: attribute_list }
    }

    fn as_raw_mut(&mut self) -> &mut STARTUPINFOEXW {
        &mut self.info
    }
}

/// Calls `CreateProcessAsUserW` with `CREATE_SUSPENDED | EXTENDED_STARTUPINFO_PRESENT` plus
/// any caller-supplied flags (e.g. `CREATE_BREAKAWAY_FROM_JOB` on pre-Win8 systems).
pub fn create_process_as_user(
    token: &Token,
    application_name: Option<&Path>,
    command_line: &str,
    extra_flags: PROCESS_CREATION_FLAGS,
    current_directory: Option<&Path>,
    startup_info: &mut StartupInfo,
) -> Result<ProcessInformation> {
    let application_name = application_name.map(WideString::from).unwrap_or_default();
    let mut command_line = WideString::from(command_line);
    let current_directory = current_directory.map(WideString::from).unwrap_or_default();

    let mut process_information = PROCESS_INFORMATION::default();

    let flags = PROCESS_CREATION_FLAGS(
        windows::Win32::System::Threading::CREATE_SUSPENDED.0 | EXTENDED_STARTUPINFO_PRESENT.0 | CREATE_UNICODE_ENVIRONMENT.0 | extra_flags.0,
    );

    // SAFETY: `command_line`'s buffer is mutable as `CreateProcessAsUserW` requires and
    // outlives the call; `startup_info` owns a live attribute list for the call's duration.
    unsafe {
        CreateProcessAsUserW(
            Some(token.handle.raw()),
            application_name.as_pcwstr(),
            Some(command_line.as_pwstr()),
            None,
            None,
            true,
            flags,
            None,
            current_directory.as_pcwstr(),
            &startup_info.as_raw_mut().StartupInfo,
            &mut process_information,
        )?;
    }

    // SAFETY: Both handles are owned exclusively by this `PROCESS_INFORMATION` on success.
    let process = unsafe { Handle::new_owned(process_information.hProcess)? };
    // SAFETY: see above.
    let thread = unsafe { Handle::new_owned(process_information.hThread)? };

    Ok(ProcessInformation {
        process: Process::from(process),
        thread: Thread::from(thread),
        process_id: process_information.dwProcessId,
        thread_id: process_information.dwThreadId,
    })
}

/// Terminates `process` with the given exit code; used when a post-creation step fails and
/// the sandbox must not leave a half-confined child running (spec §4.11).
pub fn terminate(process: &Process, exit_code: u32) -> Result<()> {
    // SAFETY: `process.handle` is a valid, open process handle.
    unsafe { windows::Win32::System::Threading::TerminateProcess(process.handle.raw(), exit_code)? };
    Ok(())
}
