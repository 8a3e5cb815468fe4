//! DACL builder: an ordered sequence of `EXPLICIT_ACCESS` entries plus a cached, materialised
//! ACL and a dirty bit.
//!
//! # Implementation
//!
//! Relevant links:
//! - <https://learn.microsoft.com/en-us/windows/win32/api/winnt/ns-winnt-acl>
//! - <https://learn.microsoft.com/en-us/windows/win32/secauthz/creating-or-modifying-an-acl>
//! - <https://learn.microsoft.com/en-us/windows/win32/api/securitybaseapi/nf-securitybaseapi-initializeacl>

use core::ptr;

use anyhow::Result;
use windows::Win32::Foundation::{HLOCAL, LocalFree};
use windows::Win32::Security;
use windows::Win32::System::Memory;

use crate::identity::sid::{RawSid, Sid};
use crate::utils::u32size_of;

/// Owned ACL, freed by `LocalFree` on drop.
pub struct Acl {
    // INVARIANT: valid pointer to an initialized ACL structure, freed with LocalFree.
    ptr: HLOCAL,
}

impl Acl {
    pub fn new() -> Result<Self> {
        // https://learn.microsoft.com/en-us/windows/win32/api/securitybaseapi/nf-securitybaseapi-initializeacl
        // The Windows heap allocator aligns allocations well beyond the DWORD alignment
        // InitializeAcl requires, so no extra padding is needed here.

        // SAFETY: No preconditions.
        let ptr = unsafe { Memory::LocalAlloc(Memory::LMEM_ZEROINIT, size_of::<Security::ACL>())? };

        // SAFETY: `ptr` is sized for an `ACL` and DWORD-aligned per the allocator guarantee above.
        unsafe { Security::InitializeAcl(ptr.0.cast(), u32size_of::<Security::ACL>(), Security::ACL_REVISION)? };

        Ok(Self { ptr })
    }

    /// Wraps a raw ACL pointer.
    ///
    /// # Safety
    ///
    /// `ptr` must point to a valid, initialized ACL, freeable with `LocalFree`.
    pub unsafe fn from_raw(ptr: *mut Security::ACL) -> Self {
        Self { ptr: HLOCAL(ptr.cast()) }
    }

    pub fn as_ptr(&self) -> *const Security::ACL {
        self.ptr.0.cast_const().cast()
    }

    pub fn as_mut_ptr(&mut self) -> *mut Security::ACL {
        self.ptr.0.cast()
    }

    /// Materialises a new ACL from the accumulated entries, merged atop this ACL. Never
    /// mutates `self`; the builder's dirty-bit semantics (§4.2) live in [`DaclBuilder`].
    pub fn set_entries(&self, explicit_entries: &[ExplicitAccess]) -> Result<Acl> {
        let mut new_acl: *mut Security::ACL = ptr::null_mut();

        // Keep each entry's backing SID buffer alive until the call below returns.
        let raw_entries: Vec<(Security::Authorization::EXPLICIT_ACCESS_W, RawSid)> =
            explicit_entries.iter().map(ExplicitAccess::as_raw).collect::<Result<_>>()?;
        let raw: Vec<Security::Authorization::EXPLICIT_ACCESS_W> = raw_entries.iter().map(|(e, _)| *e).collect();
        let raw = (!raw.is_empty()).then_some(raw);

        // SAFETY: `raw`'s trustee pointers reference the still-alive `raw_entries` buffers.
        let ret = unsafe { Security::Authorization::SetEntriesInAclW(raw.as_deref(), Some(self.as_ref()), &mut new_acl) };

        ret.ok()?;

        // SAFETY: `SetEntriesInAclW` returns a valid, freeable ACL pointer on success.
        Ok(unsafe { Acl::from_raw(new_acl) })
    }
}

impl std::ops::Deref for Acl {
    type Target = AclRef;

    fn deref(&self) -> &Self::Target {
        // SAFETY: `AclRef` is `#[repr(transparent)]` over `Security::ACL`; `self.ptr` points
        // at a valid ACL per the `Acl` invariants.
        unsafe { self.as_ptr().cast::<AclRef>().as_ref().expect("non-null value") }
    }
}

impl Clone for Acl {
    fn clone(&self) -> Self {
        self.set_entries(&[]).expect("out of memory rebuilding ACL")
    }
}

impl Drop for Acl {
    fn drop(&mut self) {
        // SAFETY: Per invariants, `self.ptr` is freeable with `LocalFree`.
        unsafe {
            LocalFree(Some(self.ptr));
        }
    }
}

#[repr(transparent)]
pub struct AclRef {
    inner: Security::ACL,
}

impl AsRef<Security::ACL> for AclRef {
    fn as_ref(&self) -> &Security::ACL {
        &self.inner
    }
}

#[derive(Debug, Clone)]
pub enum Trustee {
    Sid(Sid),
}

#[derive(Debug, Clone)]
pub struct ExplicitAccess {
    pub access_permissions: u32,
    pub access_mode: Security::Authorization::ACCESS_MODE,
    pub inheritance: Security::ACE_FLAGS,
    pub trustee: Trustee,
}

impl ExplicitAccess {
    pub fn allow(sid: Sid, access_permissions: u32) -> Self {
        Self {
            access_permissions,
            access_mode: Security::Authorization::GRANT_ACCESS,
            inheritance: Security::NO_INHERITANCE,
            trustee: Trustee::Sid(sid),
        }
    }

    pub fn deny(sid: Sid, access_permissions: u32) -> Self {
        Self {
            access_permissions,
            access_mode: Security::Authorization::DENY_ACCESS,
            inheritance: Security::NO_INHERITANCE,
            trustee: Trustee::Sid(sid),
        }
    }

    /// Returns a raw `EXPLICIT_ACCESS_W`, plus the owned SID buffer its trustee pointer
    /// references: the buffer must outlive any use of the returned struct.
    fn as_raw(&self) -> Result<(Security::Authorization::EXPLICIT_ACCESS_W, RawSid)> {
        let Trustee::Sid(sid) = &self.trustee;
        let raw_sid = RawSid::try_from(sid)?;

        let mut raw_trustee = Security::Authorization::TRUSTEE_W::default();
        raw_trustee.TrusteeForm = Security::Authorization::TRUSTEE_IS_SID;
        raw_trustee.TrusteeType = Security::Authorization::TRUSTEE_IS_UNKNOWN;
        raw_trustee.ptstrName = windows::core::PWSTR(raw_sid.as_psid().0.cast());

        Ok((
            Security::Authorization::EXPLICIT_ACCESS_W {
                grfAccessPermissions: self.access_permissions,
                grfAccessMode: self.access_mode,
                grfInheritance: self.inheritance,
                Trustee: raw_trustee,
            },
            raw_sid,
        ))
    }
}

/// Accumulates allow/deny ACEs with a cached materialised ACL and a dirty bit, per §3/§4.2.
pub struct DaclBuilder {
    entries: Vec<ExplicitAccess>,
    cached: Option<Acl>,
    dirty: bool,
}

impl Default for DaclBuilder {
    fn default() -> Self {
        Self { entries: Vec::new(), cached: None, dirty: true }
    }
}

impl DaclBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_allowed_ace(&mut self, sid: Sid, mask: u32) -> &mut Self {
        self.entries.push(ExplicitAccess::allow(sid, mask));
        self.dirty = true;
        self
    }

    pub fn add_denied_ace(&mut self, sid: Sid, mask: u32) -> &mut Self {
        self.entries.push(ExplicitAccess::deny(sid, mask));
        self.dirty = true;
        self
    }

    /// Merges an externally obtained ACL underneath the accumulated entries.
    pub fn merge(&mut self, existing: &Acl) -> Result<()> {
        self.cached = Some(existing.set_entries(&[])?);
        self.dirty = true;
        Ok(())
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.cached = None;
        self.dirty = true;
    }

    /// Rebuilds the ACL via `SetEntriesInAcl` from the accumulated entries merged atop the
    /// cached ACL if dirty; otherwise returns the still-valid cache. On failure the prior
    /// cache, if any, is left untouched.
    pub fn materialize(&mut self) -> Result<&Acl> {
        if self.dirty {
            let base = match &self.cached {
                Some(acl) => acl.clone(),
                None => Acl::new()?,
            };

            let rebuilt = base.set_entries(&self.entries)?;
            self.cached = Some(rebuilt);
            self.dirty = false;
        }

        Ok(self.cached.as_ref().expect("materialized above"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum InheritableAclKind {
    Default,
    Protected,
    Inherit,
}

pub struct InheritableAcl {
    pub kind: InheritableAclKind,
    pub acl: Acl,
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use windows::Win32::Foundation::{GENERIC_ALL, GENERIC_READ, GENERIC_WRITE};

    #[test]
    #[cfg_attr(miri, ignore)]
    fn create_acl_with_allow_and_deny_aces() {
        let mut builder = DaclBuilder::new();
        builder
            .add_allowed_ace(Sid::from_well_known(Security::WinBuiltinUsersSid, None).unwrap(), GENERIC_READ.0 | GENERIC_WRITE.0)
            .add_denied_ace(Sid::from_well_known(Security::WinWorldSid, None).unwrap(), GENERIC_ALL.0);

        builder.materialize().unwrap();
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn materialize_is_idempotent_without_further_mutation() {
        let mut builder = DaclBuilder::new();
        builder.add_allowed_ace(Sid::from_well_known(Security::WinWorldSid, None).unwrap(), GENERIC_READ.0);

        let first = builder.materialize().unwrap().as_ptr();
        let second = builder.materialize().unwrap().as_ptr();
        assert_eq!(first, second, "materialize must not rebuild when not dirty");
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn clear_drops_cached_acl_and_entries() {
        let mut builder = DaclBuilder::new();
        builder.add_allowed_ace(Sid::from_well_known(Security::WinWorldSid, None).unwrap(), GENERIC_READ.0);
        builder.materialize().unwrap();

        builder.clear();
        assert!(builder.entries.is_empty());
        assert!(builder.cached.is_none());
    }
}
