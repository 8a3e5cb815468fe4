//! Builds a `SECURITY_ATTRIBUTES` (security descriptor + inheritable flag) that can be
//! handed to any Win32 object-creation call expecting one. Backs the inheritable security
//! descriptor component (spec §4.7).

use core::ptr;
use std::ffi::c_void;

use anyhow::Result;
use windows::Win32::Security;
use windows::Win32::System::SystemServices::SECURITY_DESCRIPTOR_REVISION;

use crate::identity::sid::RawSid;
use crate::security::acl::{InheritableAcl, InheritableAclKind};
use crate::utils::u32size_of;

#[derive(Default)]
pub struct SecurityAttributesInit {
    pub inherit_handle: bool,
    pub owner: Option<RawSid>,
    pub group: Option<RawSid>,
    pub sacl: Option<InheritableAcl>,
    pub dacl: Option<InheritableAcl>,
}

impl SecurityAttributesInit {
    pub fn init(mut self) -> SecurityAttributes {
        let mut control = Security::SECURITY_DESCRIPTOR_CONTROL(0);

        if let Some(kind) = self.sacl.as_ref().map(|x| x.kind) {
            control |= Security::SE_SACL_PRESENT;
            control |= match kind {
                InheritableAclKind::Protected => Security::SE_SACL_PROTECTED,
                InheritableAclKind::Inherit => Security::SE_SACL_AUTO_INHERITED,
                InheritableAclKind::Default => Security::SE_SACL_DEFAULTED,
            };
        }

        if let Some(kind) = self.dacl.as_ref().map(|x| x.kind) {
            control |= Security::SE_DACL_PRESENT;
            control |= match kind {
                InheritableAclKind::Protected => Security::SE_DACL_PROTECTED,
                InheritableAclKind::Inherit => Security::SE_DACL_AUTO_INHERITED,
                InheritableAclKind::Default => Security::SE_DACL_DEFAULTED,
            };
        }

        let descriptor = Security::SECURITY_DESCRIPTOR {
            // This is a constant equal to 1.
            #[expect(clippy::cast_possible_truncation)]
            Revision: SECURITY_DESCRIPTOR_REVISION as u8,
            Sbz1: 0,
            Control: control,
            Owner: self.owner.as_ref().map(RawSid::as_psid).unwrap_or_default(),
            Group: self.group.as_ref().map(RawSid::as_psid).unwrap_or_default(),
            Sacl: self.sacl.as_mut().map_or_else(ptr::null_mut, |x| x.acl.as_mut_ptr()),
            Dacl: self.dacl.as_mut().map_or_else(ptr::null_mut, |x| x.acl.as_mut_ptr()),
        };

        let ptr = Box::into_raw(Box::new(Security::SECURITY_ATTRIBUTES {
            nLength: u32size_of::<Security::SECURITY_ATTRIBUTES>(),
            lpSecurityDescriptor: Box::into_raw(Box::new(descriptor)) as *mut c_void,
            bInheritHandle: self.inherit_handle.into(),
        }));

        SecurityAttributes { ptr, _owner: self.owner, _group: self.group, _sacl: self.sacl, _dacl: self.dacl }
    }
}

/// Owns a `SECURITY_ATTRIBUTES` plus everything its embedded security descriptor points at
/// (owner/group SID buffers, SACL, DACL), so the whole thing stays valid for as long as this
/// value lives.
pub struct SecurityAttributes {
    // INVARIANT: `ptr` and `ptr->lpSecurityDescriptor` are both `Box`-allocated and freed once, on drop.
    ptr: *mut Security::SECURITY_ATTRIBUTES,

    _owner: Option<RawSid>,
    _group: Option<RawSid>,
    _sacl: Option<InheritableAcl>,
    _dacl: Option<InheritableAcl>,
}

impl SecurityAttributes {
    pub fn as_ptr(&self) -> *const Security::SECURITY_ATTRIBUTES {
        self.ptr.cast_const()
    }

    pub fn as_mut_ptr(&self) -> *mut Security::SECURITY_ATTRIBUTES {
        self.ptr
    }
}

// SAFETY: Owns its data outright; nothing else holds a reference into it.
unsafe impl Send for SecurityAttributes {}

impl Drop for SecurityAttributes {
    fn drop(&mut self) {
        // SAFETY: Per invariants, `self.ptr` is `Box`-allocated by `Box::into_raw` above.
        let attributes = unsafe { Box::from_raw(self.ptr) };

        // SAFETY: Per invariants, `lpSecurityDescriptor` is likewise `Box`-allocated.
        let _ = unsafe { Box::from_raw(attributes.lpSecurityDescriptor as *mut Security::SECURITY_DESCRIPTOR) };
    }
}

/// Builds the DACL + self-relative security descriptor that the launcher's child process
/// inherits into every kernel object it must later reopen (spec §4.7): `GENERIC_ALL` for
/// LocalSystem, Administrators, and the caller's Logon SID.
pub fn build_inheritable_security_descriptor(
    logon_sid: &crate::identity::sid::Sid,
) -> Result<SecurityAttributes> {
    use crate::identity::sid::WELL_KNOWN;
    use crate::security::acl::DaclBuilder;
    use windows::Win32::Foundation::GENERIC_ALL;

    let mut builder = DaclBuilder::new();
    builder
        .add_allowed_ace(WELL_KNOWN.local_system().clone(), GENERIC_ALL.0)
        .add_allowed_ace(WELL_KNOWN.builtin_administrators().clone(), GENERIC_ALL.0)
        .add_allowed_ace(logon_sid.clone(), GENERIC_ALL.0);

    let acl = builder.materialize()?.clone();

    Ok(SecurityAttributesInit {
        inherit_handle: true,
        dacl: Some(InheritableAcl { kind: InheritableAclKind::Protected, acl }),
        ..Default::default()
    }
    .init())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn security_attributes_with_inherit_handle() {
        SecurityAttributesInit { inherit_handle: true, ..Default::default() }.init();
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn inheritable_security_descriptor_grants_logon_sid() {
        let logon_sid = crate::identity::sid::Sid::from_well_known(windows::Win32::Security::WinWorldSid, None).unwrap();
        build_inheritable_security_descriptor(&logon_sid).unwrap();
    }
}
