//! Access-token wrapper: opening, duplicating, restricting, and inspecting tokens.
//!
//! # Implementation
//!
//! Relevant links:
//! - <https://learn.microsoft.com/en-us/windows/win32/api/winbase/nf-winbase-createrestrictedtoken>
//! - <https://learn.microsoft.com/en-us/windows/win32/api/securitybaseapi/nf-securitybaseapi-gettokeninformation>

use anyhow::{Result, bail};
use windows::Win32::Foundation::HANDLE;
use windows::Win32::Security::Authorization::SE_GROUP_LOGON_ID;
use windows::Win32::Security::{
    CreateRestrictedToken, DuplicateTokenEx, GetTokenInformation, SECURITY_IMPERSONATION_LEVEL, SID_AND_ATTRIBUTES,
    TOKEN_ACCESS_MASK, TOKEN_DEFAULT_DACL, TOKEN_GROUPS, TOKEN_INFORMATION_CLASS, TOKEN_MANDATORY_LABEL, TOKEN_TYPE,
    TokenDefaultDacl, TokenGroups, TokenIntegrityLevel, TokenPrimary,
};
use windows::Win32::System::Threading::{GetCurrentProcess, OpenProcessToken};

use crate::handle::{Handle, HandleWrapper};
use crate::identity::sid::{RawSid, Sid, SidAndAttributes};
use crate::security::acl::Acl;
use crate::utils::u32size_of;

#[derive(Debug)]
pub struct Token {
    pub handle: Handle,
}

impl From<Handle> for Token {
    fn from(handle: Handle) -> Self {
        Self { handle }
    }
}

impl HandleWrapper for Token {
    fn handle(&self) -> &Handle {
        &self.handle
    }
}

impl Token {
    pub fn current_process_token(desired_access: TOKEN_ACCESS_MASK) -> Result<Self> {
        let mut handle = HANDLE::default();

        // SAFETY: `GetCurrentProcess` returns a valid pseudohandle; the opened token handle
        // is owned by the returned wrapper and closed on its drop.
        unsafe { OpenProcessToken(GetCurrentProcess(), desired_access, &mut handle) }?;

        // SAFETY: `handle` was just returned by a successful `OpenProcessToken` call.
        let handle = unsafe { Handle::new_owned(handle)? };

        Ok(Self::from(handle))
    }

    /// Duplicates this token as a primary or impersonation token at the requested level.
    pub fn duplicate_ex(
        &self,
        desired_access: TOKEN_ACCESS_MASK,
        level: SECURITY_IMPERSONATION_LEVEL,
        token_type: TOKEN_TYPE,
    ) -> Result<Self> {
        let mut new_token = HANDLE::default();

        // SAFETY: `self.handle` is a valid token handle; the duplicated handle is owned by
        // the returned wrapper and closed on its drop.
        unsafe {
            DuplicateTokenEx(self.handle.raw(), desired_access, None, level, token_type, &mut new_token)?;
        }

        // SAFETY: `new_token` was just returned by a successful `DuplicateTokenEx` call.
        let handle = unsafe { Handle::new_owned(new_token)? };

        Ok(Self::from(handle))
    }

    /// Builds a restricted token per `CreateRestrictedToken`. `sids_to_disable` and
    /// `sids_to_restrict` are materialised into OS-shaped arrays up front (their owning
    /// `RawSid` buffers are kept alive for the duration of this call, per the
    /// parallel-vector aliasing hazard in spec §9).
    pub fn create_restricted_token(
        &self,
        flags: u32,
        sids_to_disable: &[SidAndAttributes],
        sids_to_restrict: &[SidAndAttributes],
    ) -> Result<Self> {
        let disable = RawSidAttributeArray::build(sids_to_disable)?;
        let restrict = RawSidAttributeArray::build(sids_to_restrict)?;

        let mut new_token = HANDLE::default();

        // SAFETY: `disable.raw`/`restrict.raw` trustee pointers reference the
        // still-alive `disable.owners`/`restrict.owners` buffers for the duration of this call.
        // The new handle is owned by the returned wrapper and closed on its drop.
        unsafe {
            CreateRestrictedToken(
                self.handle.raw(),
                flags,
                disable.as_raw_slice(),
                None,
                restrict.as_raw_slice(),
                &mut new_token,
            )?;
        }

        // SAFETY: `new_token` was just returned by a successful `CreateRestrictedToken` call.
        let handle = unsafe { Handle::new_owned(new_token)? };

        Ok(Self::from(handle))
    }

    /// Installs a default DACL (`SetTokenInformation(TokenDefaultDacl)`) granting the
    /// access recorded in `dacl` to every future object created under this token without an
    /// explicit security descriptor.
    pub fn set_default_dacl(&self, dacl: &Acl) -> Result<()> {
        let mut info = TOKEN_DEFAULT_DACL { DefaultDacl: dacl.as_ptr().cast_mut() };

        // SAFETY: `info` is a correctly sized `TOKEN_DEFAULT_DACL` pointing at a live ACL.
        unsafe {
            windows::Win32::Security::SetTokenInformation(
                self.handle.raw(),
                TokenDefaultDacl,
                &mut info as *mut _ as *mut _,
                u32size_of::<TOKEN_DEFAULT_DACL>(),
            )?;
        }

        Ok(())
    }

    /// Sets this token's mandatory integrity label (`SetTokenInformation(TokenIntegrityLevel)`).
    pub fn set_integrity_level(&self, label: &Sid) -> Result<()> {
        let raw_label = RawSid::try_from(label)?;

        let mut info = TOKEN_MANDATORY_LABEL {
            Label: SID_AND_ATTRIBUTES {
                Sid: raw_label.as_psid(),
                Attributes: windows::Win32::Security::SE_GROUP_INTEGRITY.0,
            },
        };

        // SAFETY: `info` is a correctly sized `TOKEN_MANDATORY_LABEL`; `raw_label` outlives this call.
        unsafe {
            windows::Win32::Security::SetTokenInformation(
                self.handle.raw(),
                TokenIntegrityLevel,
                &mut info as *mut _ as *mut _,
                u32size_of::<TOKEN_MANDATORY_LABEL>(),
            )?;
        }

        Ok(())
    }

    /// Snapshots this token's groups via the standard two-call size-probe pattern.
    pub fn groups(&self) -> Result<Vec<SidAndAttributes>> {
        let buf = self.information_var_size(TokenGroups)?;

        // SAFETY: `buf` holds a `TOKEN_GROUPS` structure as documented for `TokenGroups`.
        let header = unsafe { &*buf.as_ptr().cast::<TOKEN_GROUPS>() };

        // SAFETY: `Groups` is a VLA of `GroupCount` entries trailing the header, within `buf`.
        let groups = unsafe { crate::utils::slice_from_ptr(header.Groups.as_ptr(), header.GroupCount as usize) };

        groups.iter().map(SidAndAttributes::try_from).collect()
    }

    /// Extracts the Logon SID (the group carrying `SE_GROUP_LOGON_ID`), if present.
    pub fn logon_sid(&self) -> Result<Option<Sid>> {
        for group in self.groups()? {
            if group.attributes & SE_GROUP_LOGON_ID.0 != 0 {
                return Ok(Some(group.sid));
            }
        }

        Ok(None)
    }

    fn information_var_size(&self, class: TOKEN_INFORMATION_CLASS) -> Result<Vec<u8>> {
        let mut required_size = 0u32;

        // SAFETY: A null/zero-size output buffer is the documented way to probe the required
        // size; the call is expected to fail with ERROR_INSUFFICIENT_BUFFER.
        let probe = unsafe { GetTokenInformation(self.handle.raw(), class, None, 0, &mut required_size) };

        if probe.is_ok() {
            bail!("first call to GetTokenInformation did not fail as expected");
        }

        let mut buf = vec![0u8; required_size as usize];
        let mut out_size = required_size;

        // SAFETY: `buf` is sized exactly to `required_size`, matching `out_size`.
        unsafe {
            GetTokenInformation(
                self.handle.raw(),
                class,
                Some(buf.as_mut_ptr().cast()),
                out_size,
                &mut out_size,
            )?;
        }

        Ok(buf)
    }
}

/// A Win32-shaped `SID_AND_ATTRIBUTES` array whose trustee pointers reference a parallel,
/// capacity-reserved vector of owning `RawSid` buffers. Building both vectors with reserved
/// capacity up front (spec §9, "parallel-vector aliasing hazard") guarantees neither
/// reallocates once the raw pointers have been taken.
struct RawSidAttributeArray {
    owners: Vec<RawSid>,
    raw: Vec<SID_AND_ATTRIBUTES>,
}

impl RawSidAttributeArray {
    fn build(entries: &[SidAndAttributes]) -> Result<Self> {
        let mut owners = Vec::with_capacity(entries.len());
        let mut raw = Vec::with_capacity(entries.len());

        for entry in entries {
            owners.push(RawSid::try_from(&entry.sid)?);
            let psid = owners.last().expect("just pushed").as_psid();
            raw.push(SID_AND_ATTRIBUTES { Sid: psid, Attributes: entry.attributes });
        }

        Ok(Self { owners, raw })
    }

    fn as_raw_slice(&self) -> Option<&[SID_AND_ATTRIBUTES]> {
        (!self.raw.is_empty()).then_some(self.raw.as_slice())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use windows::Win32::Security::{TOKEN_DUPLICATE, TOKEN_QUERY};

    #[test]
    #[cfg_attr(miri, ignore)]
    fn current_process_token_has_groups() {
        let token = Token::current_process_token(TOKEN_QUERY).unwrap();
        let groups = token.groups().unwrap();
        assert!(!groups.is_empty());
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn duplicate_ex_produces_usable_handle() {
        let token = Token::current_process_token(TOKEN_QUERY | TOKEN_DUPLICATE).unwrap();
        let duplicated = token
            .duplicate_ex(TOKEN_QUERY, windows::Win32::Security::SecurityImpersonation, TokenPrimary)
            .unwrap();
        assert!(!duplicated.handle.raw().is_invalid());
    }
}
