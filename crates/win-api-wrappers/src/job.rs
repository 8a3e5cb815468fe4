//! Job object wrapper: creation, limit/UI-restriction configuration, assignment, and the
//! accounting-information probe the sandboxee bootstrap uses to validate an inherited handle
//! (spec §4.6, §4.9).

use anyhow::Result;
use windows::Win32::Foundation::HANDLE;
use windows::Win32::Security::SECURITY_ATTRIBUTES;
use windows::Win32::System::JobObjects::{
    AssignProcessToJobObject, CreateJobObjectW, IsProcessInJob, JOB_OBJECT_LIMIT_ACTIVE_PROCESS,
    JOBOBJECT_BASIC_ACCOUNTING_INFORMATION, JOBOBJECT_BASIC_LIMIT_INFORMATION, JOBOBJECT_BASIC_UI_RESTRICTIONS,
    JOBOBJECTINFOCLASS, JobObjectBasicAccountingInformation, JobObjectBasicLimitInformation,
    JobObjectBasicUIRestrictions, QueryInformationJobObject, SetInformationJobObject,
};

use crate::handle::{Handle, HandleWrapper};
use crate::process::Process;
use crate::security::attributes::SecurityAttributes;
use crate::utils::u32size_of;

/// Every available UI-restriction bit: desktop switching, display settings, exit-windows,
/// global atoms, USER handles, read/write clipboard, and system parameters (spec §4.6).
pub const ALL_UI_RESTRICTIONS: u32 = windows::Win32::System::JobObjects::JOB_OBJECT_UILIMIT_HANDLES.0
    | windows::Win32::System::JobObjects::JOB_OBJECT_UILIMIT_READCLIPBOARD.0
    | windows::Win32::System::JobObjects::JOB_OBJECT_UILIMIT_WRITECLIPBOARD.0
    | windows::Win32::System::JobObjects::JOB_OBJECT_UILIMIT_SYSTEMPARAMETERS.0
    | windows::Win32::System::JobObjects::JOB_OBJECT_UILIMIT_DISPLAYSETTINGS.0
    | windows::Win32::System::JobObjects::JOB_OBJECT_UILIMIT_GLOBALATOMS.0
    | windows::Win32::System::JobObjects::JOB_OBJECT_UILIMIT_DESKTOP.0
    | windows::Win32::System::JobObjects::JOB_OBJECT_UILIMIT_EXITWINDOWS.0;

#[derive(Debug)]
pub struct Job {
    pub handle: Handle,
}

impl From<Handle> for Job {
    fn from(handle: Handle) -> Self {
        Self { handle }
    }
}

impl HandleWrapper for Job {
    fn handle(&self) -> &Handle {
        &self.handle
    }
}

impl Job {
    pub fn create(security_attributes: Option<&SecurityAttributes>) -> Result<Self> {
        let attrs = security_attributes.map(|a| a.as_ptr()).map(|p| p as *const SECURITY_ATTRIBUTES);

        // SAFETY: `attrs`, if present, points at a live `SECURITY_ATTRIBUTES`. The returned
        // handle is owned by the returned wrapper and closed on its drop.
        let handle = unsafe { CreateJobObjectW(attrs, None) }?;

        // SAFETY: `handle` was just returned by a successful `CreateJobObjectW` call.
        let handle = unsafe { Handle::new_owned(handle)? };

        Ok(Self::from(handle))
    }

    /// Caps the job to a single active process (spec §4.6: the sandboxee cannot spawn children).
    pub fn limit_active_process_count(&self, limit: u32) -> Result<()> {
        let mut info = JOBOBJECT_BASIC_LIMIT_INFORMATION {
            LimitFlags: JOB_OBJECT_LIMIT_ACTIVE_PROCESS,
            ActiveProcessLimit: limit,
            ..Default::default()
        };

        self.set_information(JobObjectBasicLimitInformation, &mut info)
    }

    /// Applies every available UI restriction bit.
    pub fn restrict_ui(&self, restrictions: u32) -> Result<()> {
        let mut info = JOBOBJECT_BASIC_UI_RESTRICTIONS { UIRestrictionsClass: restrictions };

        self.set_information(JobObjectBasicUIRestrictions, &mut info)
    }

    fn set_information<T>(&self, class: JOBOBJECTINFOCLASS, info: &mut T) -> Result<()> {
        // SAFETY: `info` is sized exactly for `T`, matching the documented struct for `class`.
        unsafe {
            SetInformationJobObject(self.handle.raw(), class, info as *mut T as *const _, u32size_of::<T>())?;
        }

        Ok(())
    }

    pub fn assign_process(&self, process: &Process) -> Result<()> {
        // SAFETY: Both handles are live.
        unsafe { AssignProcessToJobObject(self.handle.raw(), process.handle.raw())? };
        Ok(())
    }

    /// Confirms `handle` actually names a job object, defending against argv spoofing by a
    /// sibling process (spec §4.9): a handle to any other kernel object fails this query.
    pub fn validate(handle: HANDLE) -> Result<()> {
        let mut info = JOBOBJECT_BASIC_ACCOUNTING_INFORMATION::default();
        let mut returned = 0u32;

        // SAFETY: `info` is sized exactly for `JOBOBJECT_BASIC_ACCOUNTING_INFORMATION`. If
        // `handle` does not name a job object the call fails and no memory is touched beyond `info`.
        unsafe {
            QueryInformationJobObject(
                Some(handle),
                JobObjectBasicAccountingInformation,
                &mut info as *mut _ as *mut _,
                u32size_of::<JOBOBJECT_BASIC_ACCOUNTING_INFORMATION>(),
                Some(&mut returned),
            )?;
        }

        Ok(())
    }

    pub fn is_process_in_job(process: &Process, job: Option<&Job>) -> Result<bool> {
        let mut result = windows::core::BOOL::default();

        // SAFETY: `process.handle` is live; `job`, if present, is live.
        unsafe { IsProcessInJob(process.handle.raw(), job.map(|j| j.handle.raw()), &mut result)? };

        Ok(result.as_bool())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    #[cfg_attr(miri, ignore)]
    fn create_and_limit_job() {
        let job = Job::create(None).unwrap();
        job.limit_active_process_count(1).unwrap();
        job.restrict_ui(ALL_UI_RESTRICTIONS).unwrap();
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn validate_accepts_real_job_handle() {
        let job = Job::create(None).unwrap();
        Job::validate(job.handle.raw()).unwrap();
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn validate_rejects_non_job_handle() {
        let process = Process::current();
        assert!(Job::validate(process.handle.raw()).is_err());
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn current_process_not_in_fresh_job() {
        let job = Job::create(None).unwrap();
        let process = Process::current();
        // The test process was not assigned to `job`.
        assert!(!Job::is_process_in_job(&process, Some(&job)).unwrap());
    }
}
