//! Window station and desktop wrappers, including the current-desktop DACL snapshot/patch
//! dance that closes the SetThreadDesktop hole (spec §4.5).
//!
//! # Implementation
//!
//! Relevant links:
//! - <https://learn.microsoft.com/en-us/windows/win32/winstation/window-stations>
//! - <https://learn.microsoft.com/en-us/windows/win32/winstation/desktops>
//! - <https://learn.microsoft.com/en-us/windows/win32/api/winuser/nf-winuser-getuserobjectsecurity>

use anyhow::Result;
use windows::Win32::Foundation::HANDLE;
use windows::Win32::Security::{
    DACL_SECURITY_INFORMATION, MakeAbsoluteSD, MakeSelfRelativeSD, PSECURITY_DESCRIPTOR, SECURITY_DESCRIPTOR,
    SECURITY_INFORMATION,
};
use windows::Win32::System::Memory;
use windows::Win32::System::StationsAndDesktops::{
    CloseDesktop, CloseWindowStation, CreateDesktopW, CreateWindowStationW, DESKTOP_ACCESS_FLAGS, GetProcessWindowStation,
    GetThreadDesktop, GetUserObjectInformationW, GetUserObjectSecurity, HDESK, HWINSTA, SetProcessWindowStation,
    SetThreadDesktop, SetUserObjectSecurity, UOI_NAME, WINDOWSTATION_ACCESS_MASK,
};
use windows::core::PCWSTR;

use crate::security::acl::{Acl, DaclBuilder};
use crate::security::attributes::SecurityAttributes;
use crate::utils::WideString;

fn get_user_object_security(handle: HANDLE, info: SECURITY_INFORMATION) -> Result<Vec<u8>> {
    let mut required = 0u32;

    // SAFETY: A zero-length output buffer is the documented way to probe the required size.
    let probe = unsafe { GetUserObjectSecurity(handle, &info, PSECURITY_DESCRIPTOR::default(), 0, &mut required) };

    if probe.is_ok() {
        anyhow::bail!("first call to GetUserObjectSecurity did not fail as expected");
    }

    let mut buf = vec![0u8; required as usize];
    let mut out_size = required;

    // SAFETY: `buf` is sized exactly to `required`, matching `out_size`.
    unsafe {
        GetUserObjectSecurity(handle, &info, PSECURITY_DESCRIPTOR(buf.as_mut_ptr().cast()), out_size, &mut out_size)?;
    }

    Ok(buf)
}

fn set_user_object_security(handle: HANDLE, info: SECURITY_INFORMATION, sd: &mut [u8]) -> Result<()> {
    // SAFETY: `sd` holds a valid self-relative security descriptor matching `info`'s flags.
    unsafe {
        SetUserObjectSecurity(handle, &info, PSECURITY_DESCRIPTOR(sd.as_mut_ptr().cast()))?;
    }

    Ok(())
}

/// Extracts just the DACL from a self-relative security descriptor snapshot, converting it
/// to an owned [`Acl`] via the documented absolute round-trip (`MakeAbsoluteSD`).
fn dacl_from_self_relative(sd: &[u8]) -> Result<Acl> {
    let mut abs_sd_size = 0u32;
    let mut dacl_size = 0u32;
    let mut sacl_size = 0u32;
    let mut owner_size = 0u32;
    let mut group_size = 0u32;

    // SAFETY: Zero-length output buffers are the documented way to probe the required sizes.
    let probe = unsafe {
        MakeAbsoluteSD(
            PSECURITY_DESCRIPTOR(sd.as_ptr().cast_mut().cast()),
            PSECURITY_DESCRIPTOR::default(),
            &mut abs_sd_size,
            None,
            &mut dacl_size,
            None,
            &mut sacl_size,
            windows::Win32::Foundation::PSID::default(),
            &mut owner_size,
            windows::Win32::Foundation::PSID::default(),
            &mut group_size,
        )
    };

    if probe.is_ok() {
        anyhow::bail!("first call to MakeAbsoluteSD did not fail as expected");
    }

    let mut abs_sd = vec![0u8; abs_sd_size as usize];
    let mut dacl_buf = vec![0u8; dacl_size as usize];
    let mut sacl_buf = vec![0u8; sacl_size as usize];
    let mut owner_buf = vec![0u8; owner_size as usize];
    let mut group_buf = vec![0u8; group_size as usize];

    // SAFETY: Every output buffer above is sized exactly to the probed requirement.
    unsafe {
        MakeAbsoluteSD(
            PSECURITY_DESCRIPTOR(sd.as_ptr().cast_mut().cast()),
            PSECURITY_DESCRIPTOR(abs_sd.as_mut_ptr().cast()),
            &mut abs_sd_size,
            Some(dacl_buf.as_mut_ptr().cast()),
            &mut dacl_size,
            Some(sacl_buf.as_mut_ptr().cast()),
            &mut sacl_size,
            windows::Win32::Foundation::PSID(owner_buf.as_mut_ptr().cast()),
            &mut owner_size,
            windows::Win32::Foundation::PSID(group_buf.as_mut_ptr().cast()),
            &mut group_size,
        )?;
    }

    // `Acl`'s `Drop` frees its pointer with `LocalFree`, so the DACL bytes must live in a
    // `LocalAlloc`'d buffer, not a Rust-allocated `Vec` — copy `dacl_buf` into one.
    // SAFETY: `dacl_buf.len()` is a valid allocation size.
    let local = unsafe { Memory::LocalAlloc(Memory::LMEM_FIXED, dacl_buf.len())? };

    // SAFETY: `local` was just allocated with exactly `dacl_buf.len()` bytes.
    unsafe { std::ptr::copy_nonoverlapping(dacl_buf.as_ptr(), local.0.cast(), dacl_buf.len()) };

    // SAFETY: `local` holds the ACL bytes `MakeAbsoluteSD` populated above and is freeable with `LocalFree`.
    Ok(unsafe { Acl::from_raw(local.0.cast()) })
}

/// Rebuilds a self-relative security descriptor carrying only the (possibly patched) DACL,
/// suitable for `SetUserObjectSecurity`.
fn self_relative_with_dacl(acl: &Acl) -> Result<Vec<u8>> {
    let mut descriptor = SECURITY_DESCRIPTOR::default();

    // SAFETY: `descriptor` is a correctly sized, zeroed `SECURITY_DESCRIPTOR`.
    unsafe {
        windows::Win32::Security::InitializeSecurityDescriptor(
            PSECURITY_DESCRIPTOR(&mut descriptor as *mut _ as *mut _),
            windows::Win32::Security::SECURITY_DESCRIPTOR_REVISION,
        )?;

        windows::Win32::Security::SetSecurityDescriptorDacl(
            PSECURITY_DESCRIPTOR(&mut descriptor as *mut _ as *mut _),
            true,
            Some(acl.as_ptr().cast_mut()),
            false,
        )?;
    }

    let mut required = 0u32;

    // SAFETY: A zero-length output buffer is the documented way to probe the required size.
    let probe =
        unsafe { MakeSelfRelativeSD(PSECURITY_DESCRIPTOR(&mut descriptor as *mut _ as *mut _), PSECURITY_DESCRIPTOR::default(), &mut required) };

    if probe.is_ok() {
        anyhow::bail!("first call to MakeSelfRelativeSD did not fail as expected");
    }

    let mut buf = vec![0u8; required as usize];

    // SAFETY: `buf` is sized exactly to the probed requirement.
    unsafe {
        MakeSelfRelativeSD(
            PSECURITY_DESCRIPTOR(&mut descriptor as *mut _ as *mut _),
            PSECURITY_DESCRIPTOR(buf.as_mut_ptr().cast()),
            &mut required,
        )?;
    }

    Ok(buf)
}

fn object_name(handle: HANDLE) -> Result<String> {
    let mut required = 0u32;

    // SAFETY: A zero-length output buffer is the documented way to probe the required size.
    let probe = unsafe { GetUserObjectInformationW(handle, UOI_NAME, None, 0, Some(&mut required)) };

    if probe.is_ok() {
        anyhow::bail!("first call to GetUserObjectInformationW did not fail as expected");
    }

    let mut buf = vec![0u16; required as usize / 2 + 1];

    // SAFETY: `buf` is sized at least as large as the probed requirement.
    unsafe {
        GetUserObjectInformationW(handle, UOI_NAME, Some(buf.as_mut_ptr().cast()), (buf.len() * 2) as u32, Some(&mut required))?;
    }

    Ok(String::from_utf16(crate::utils::nul_slice_wide_str(&buf))?)
}

/// The result of [`patch_current_desktop_deny_sid`]: the pre-patch snapshot, for rollback, and
/// the patched DACL itself, so the caller can carry the *same* deny-ACE onto the new desktop
/// it is about to create (spec §4.5 step 4: "the new desktop gets the patched SD").
pub struct DesktopDaclPatch {
    pub snapshot: Vec<u8>,
    pub patched_dacl: Acl,
}

/// Patches the *current* desktop's DACL with a deny-all ACE for `custom_sid`, per spec §4.5
/// step 1–3. Returns the pre-patch snapshot so a caller can restore it if a later step fails
/// (spec scenario 6: "desktop patch survives failure"), plus the patched DACL for reuse.
pub fn patch_current_desktop_deny_sid(custom_sid: &crate::identity::sid::Sid) -> Result<DesktopDaclPatch> {
    // SAFETY: No preconditions; returns a pseudohandle for the calling thread's desktop.
    let desktop = unsafe { GetThreadDesktop(windows::Win32::System::Threading::GetCurrentThreadId()) };

    let snapshot = get_user_object_security(HANDLE(desktop.0), DACL_SECURITY_INFORMATION)?;
    let existing_dacl = dacl_from_self_relative(&snapshot)?;

    let mut builder = DaclBuilder::new();
    builder.merge(&existing_dacl)?;
    builder.add_denied_ace(custom_sid.clone(), windows::Win32::Foundation::GENERIC_ALL.0);

    let patched_dacl = builder.materialize()?.clone();
    let mut patched = self_relative_with_dacl(&patched_dacl)?;
    set_user_object_security(HANDLE(desktop.0), DACL_SECURITY_INFORMATION, &mut patched)?;

    Ok(DesktopDaclPatch { snapshot, patched_dacl })
}

/// Restores a DACL snapshot taken by [`patch_current_desktop_deny_sid`], used when a later
/// launcher step fails and the patch must not survive (spec scenario 6).
pub fn restore_current_desktop_security(mut snapshot: Vec<u8>) -> Result<()> {
    // SAFETY: No preconditions; returns a pseudohandle for the calling thread's desktop.
    let desktop = unsafe { GetThreadDesktop(windows::Win32::System::Threading::GetCurrentThreadId()) };
    set_user_object_security(HANDLE(desktop.0), DACL_SECURITY_INFORMATION, &mut snapshot)
}

/// Owned window station, closed with `CloseWindowStation` on drop.
pub struct WindowStation {
    handle: HWINSTA,
}

impl WindowStation {
    pub fn create(desired_access: WINDOWSTATION_ACCESS_MASK, security_attributes: Option<&SecurityAttributes>) -> Result<Self> {
        let attrs = security_attributes.map(|a| a.as_ptr());

        // SAFETY: `attrs`, if present, points at a live `SECURITY_ATTRIBUTES`. The handle is
        // owned by this wrapper and closed on drop.
        let handle = unsafe { CreateWindowStationW(PCWSTR::null(), Default::default(), desired_access, attrs)? };

        Ok(Self { handle })
    }

    pub fn name(&self) -> Result<String> {
        object_name(HANDLE(self.handle.0))
    }

    pub fn raw(&self) -> HWINSTA {
        self.handle
    }
}

impl Drop for WindowStation {
    fn drop(&mut self) {
        // SAFETY: `self.handle` is owned by this wrapper.
        let _ = unsafe { CloseWindowStation(self.handle) };
    }
}

/// Temporarily sets the process window station to `winsta`, restoring the previous one on
/// drop (spec §4.5 step 4: "restore the previous window station").
pub struct ScopedProcessWindowStation {
    previous: HWINSTA,
}

impl ScopedProcessWindowStation {
    pub fn enter(winsta: HWINSTA) -> Result<Self> {
        // SAFETY: No preconditions; returns a pseudohandle for the calling process's current winstation.
        let previous = unsafe { GetProcessWindowStation() };

        // SAFETY: `winsta` is a live window station handle.
        unsafe { SetProcessWindowStation(winsta)? };

        Ok(Self { previous })
    }
}

impl Drop for ScopedProcessWindowStation {
    fn drop(&mut self) {
        // SAFETY: `self.previous` was the process's window station before `enter`, so it is still live.
        let _ = unsafe { SetProcessWindowStation(self.previous) };
    }
}

/// Owned desktop, closed with `CloseDesktop` on drop.
pub struct Desktop {
    handle: HDESK,
}

impl Desktop {
    pub fn create(
        name: &str,
        flags: u32,
        desired_access: DESKTOP_ACCESS_FLAGS,
        security_attributes: Option<&SecurityAttributes>,
    ) -> Result<Self> {
        let name = WideString::from(name);
        let attrs = security_attributes.map(|a| a.as_ptr());

        // SAFETY: `attrs`, if present, points at a live `SECURITY_ATTRIBUTES`. The handle is
        // owned by this wrapper and closed on drop.
        let handle = unsafe { CreateDesktopW(name.as_pcwstr(), PCWSTR::null(), None, flags, desired_access, attrs)? };

        Ok(Self { handle })
    }

    pub fn raw(&self) -> HDESK {
        self.handle
    }

    /// Builds the `"winsta\desktop"` path string process creation expects (spec §4.5).
    pub fn desktop_path(winstation_name: &str, desktop_name: &str) -> String {
        format!("{winstation_name}\\{desktop_name}")
    }
}

impl Drop for Desktop {
    fn drop(&mut self) {
        // SAFETY: `self.handle` is owned by this wrapper.
        let _ = unsafe { CloseDesktop(self.handle) };
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn desktop_path_formats_as_backslash_joined() {
        assert_eq!(Desktop::desktop_path("winsta0", "default"), "winsta0\\default");
    }
}
