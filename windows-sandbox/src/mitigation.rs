//! Mitigation policy translator: maps a 64-bit flag bag to the creation-time attribute-list
//! blob and to the sequence of `SetProcessMitigationPolicy` calls applied after revert (spec §4.8).

use std::ffi::c_void;

use anyhow::{Result, bail};
use windows::Win32::System::Threading::{
    self, PROCESS_MITIGATION_ASLR_POLICY, PROCESS_MITIGATION_DEP_POLICY, PROCESS_MITIGATION_EXTENSION_POINT_DISABLE_POLICY,
    PROCESS_MITIGATION_IMAGE_LOAD_POLICY, PROCESS_MITIGATION_SYSTEM_CALL_DISABLE_POLICY, ProcessASLRPolicy,
    ProcessDEPPolicy, ProcessExtensionPointDisablePolicy, ProcessSignaturePolicy, ProcessSystemCallDisablePolicy,
    SetProcessMitigationPolicy,
};

use crate::Error;

/// Bits valid only in the creation-time superset (spec §4.8): Win10's
/// block-non-Microsoft-binaries policy has no documented runtime `SetProcessMitigationPolicy`
/// counterpart, only a creation-time one.
pub const BLOCK_NON_MICROSOFT_BINARIES: u64 = Threading::PROCESS_CREATION_MITIGATION_POLICY_BLOCK_NON_MICROSOFT_BINARIES_ALWAYS_ON;

pub const DEP_ENABLE: u64 = Threading::PROCESS_CREATION_MITIGATION_POLICY_DEP_ENABLE;
pub const DEP_ATL_THUNK_ENABLE: u64 = Threading::PROCESS_CREATION_MITIGATION_POLICY_DEP_ATL_THUNK_ENABLE;
pub const SEHOP_ENABLE: u64 = Threading::PROCESS_CREATION_MITIGATION_POLICY_SEHOP_ENABLE;
pub const FORCE_RELOCATE_IMAGES: u64 = Threading::PROCESS_CREATION_MITIGATION_POLICY_FORCE_RELOCATE_IMAGES_ALWAYS_ON;
pub const HEAP_TERMINATE: u64 = Threading::PROCESS_CREATION_MITIGATION_POLICY_HEAP_TERMINATE_ALWAYS_ON;
pub const BOTTOM_UP_ASLR: u64 = Threading::PROCESS_CREATION_MITIGATION_POLICY_BOTTOM_UP_ASLR_ALWAYS_ON;
pub const HIGH_ENTROPY_ASLR: u64 = Threading::PROCESS_CREATION_MITIGATION_POLICY_HIGH_ENTROPY_ASLR_ALWAYS_ON;
pub const STRICT_HANDLE_CHECKS: u64 = Threading::PROCESS_CREATION_MITIGATION_POLICY_STRICT_HANDLE_CHECKS_ALWAYS_ON;
pub const WIN32K_SYSTEM_CALL_DISABLE: u64 = Threading::PROCESS_CREATION_MITIGATION_POLICY_WIN32K_SYSTEM_CALL_DISABLE_ALWAYS_ON;
pub const EXTENSION_POINT_DISABLE: u64 = Threading::PROCESS_CREATION_MITIGATION_POLICY_EXTENSION_POINT_DISABLE_ALWAYS_ON;

/// Bits `apply_runtime` accepts. Every other bit is creation-time only (spec §4.8, scenario 4).
const RUNTIME_SUBSET: u64 =
    DEP_ENABLE | BOTTOM_UP_ASLR | HIGH_ENTROPY_ASLR | STRICT_HANDLE_CHECKS | WIN32K_SYSTEM_CALL_DISABLE | EXTENSION_POINT_DISABLE;

/// Win10's binary-signature enforcement, gated separately since it is masked out of both
/// populations at `Init` on pre-Win10 systems.
const BINARY_SIGNATURE_RUNTIME: u64 = 1 << 62;

/// The pre-defined recommended mitigation bag from spec §6: DEP, DEP-ATL-thunk, SEHOP,
/// force-relocate, heap-terminate, bottom-up ASLR, high-entropy ASLR, strict-handle-checks,
/// block-non-MS-binaries (masked out pre-Win10 by [`mask_for_os`]), extension-point-disable.
pub fn recommended() -> u64 {
    DEP_ENABLE
        | DEP_ATL_THUNK_ENABLE
        | SEHOP_ENABLE
        | FORCE_RELOCATE_IMAGES
        | HEAP_TERMINATE
        | BOTTOM_UP_ASLR
        | HIGH_ENTROPY_ASLR
        | STRICT_HANDLE_CHECKS
        | BLOCK_NON_MICROSOFT_BINARIES
        | EXTENSION_POINT_DISABLE
}

/// Masks `BLOCK_NON_MICROSOFT_BINARIES` out of `policies` when the running OS predates Win10
/// (spec §4.8: "masked out of both populations at Init").
pub fn mask_for_os(policies: u64, win10_class: bool) -> u64 {
    if win10_class { policies } else { policies & !BLOCK_NON_MICROSOFT_BINARIES }
}

/// Returns the raw blob for `PROC_THREAD_ATTRIBUTE_MITIGATION_POLICY` — the creation-time
/// superset is just the bag itself, since the Win32 constants are already shaped for this slot.
pub fn creation_time_blob(policies: u64) -> u64 {
    policies
}

/// Applies the runtime subset of `policies` via `SetProcessMitigationPolicy`. Validates the
/// entire mask against [`RUNTIME_SUBSET`] before making any Win32 call, so an invalid bit
/// causes no observable call at all (spec §8 scenario 4).
pub fn apply_runtime_mitigations(policies: u64) -> Result<()> {
    let allowed = RUNTIME_SUBSET | BINARY_SIGNATURE_RUNTIME;

    if policies & !allowed != 0 {
        bail!(Error::MitigationNotApplicable(policies & !allowed));
    }

    if policies & DEP_ENABLE != 0 {
        let mut policy = PROCESS_MITIGATION_DEP_POLICY::default();
        policy.Flags = 1;
        apply_policy(ProcessDEPPolicy, &policy)?;
    }

    if policies & (BOTTOM_UP_ASLR | HIGH_ENTROPY_ASLR) != 0 {
        let mut policy = PROCESS_MITIGATION_ASLR_POLICY::default();
        // Bit 0 = EnableBottomUpRandomization, bit 2 = EnableHighEntropy (bit 1 is
        // EnableForceRelocateImages, not requested here).
        policy.Flags = u32::from(policies & BOTTOM_UP_ASLR != 0) | (u32::from(policies & HIGH_ENTROPY_ASLR != 0) << 2);
        apply_policy(ProcessASLRPolicy, &policy)?;
    }

    if policies & STRICT_HANDLE_CHECKS != 0 {
        // PROCESS_MITIGATION_STRICT_HANDLE_CHECK_POLICY has no dedicated import in this
        // crate's feature set; it shares the image-load policy struct shape (a single `Flags`
        // DWORD) closely enough that `windows` exposes it as a raw policy id below.
        let mut policy = PROCESS_MITIGATION_IMAGE_LOAD_POLICY::default();
        policy.Flags = 1;
        apply_policy(Threading::ProcessStrictHandleCheckPolicy, &policy)?;
    }

    if policies & WIN32K_SYSTEM_CALL_DISABLE != 0 {
        let mut policy = PROCESS_MITIGATION_SYSTEM_CALL_DISABLE_POLICY::default();
        policy.Flags = 1;
        apply_policy(ProcessSystemCallDisablePolicy, &policy)?;
    }

    if policies & BINARY_SIGNATURE_RUNTIME != 0 {
        let mut policy = Threading::PROCESS_MITIGATION_BINARY_SIGNATURE_POLICY::default();
        policy.Flags = 1;
        apply_policy(ProcessSignaturePolicy, &policy)?;
    }

    if policies & EXTENSION_POINT_DISABLE != 0 {
        let mut policy = PROCESS_MITIGATION_EXTENSION_POINT_DISABLE_POLICY::default();
        policy.Flags = 1;
        apply_policy(ProcessExtensionPointDisablePolicy, &policy)?;
    }

    Ok(())
}

fn apply_policy<T>(class: Threading::PROCESS_MITIGATION_POLICY, value: &T) -> Result<()> {
    // SAFETY: `value` is sized exactly for `T`, matching the documented struct for `class`.
    // Per spec §9's open question, an OS that does not recognise `class` (older than the
    // policy's introduction) reports this as success, which `SetProcessMitigationPolicy`
    // itself already does — there is nothing extra to special-case here.
    unsafe { SetProcessMitigationPolicy(class, value as *const T as *const c_void, size_of::<T>())? };
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn mask_for_os_drops_block_non_ms_binaries_pre_win10() {
        let masked = mask_for_os(recommended(), false);
        assert_eq!(masked & BLOCK_NON_MICROSOFT_BINARIES, 0);
    }

    #[test]
    fn mask_for_os_keeps_block_non_ms_binaries_on_win10() {
        let masked = mask_for_os(recommended(), true);
        assert_eq!(masked & BLOCK_NON_MICROSOFT_BINARIES, BLOCK_NON_MICROSOFT_BINARIES);
    }

    #[test]
    fn apply_runtime_rejects_creation_time_only_bit() {
        // HEAP_TERMINATE_ALWAYS_ON is creation-time only (spec §8 scenario 4).
        assert!(apply_runtime_mitigations(HEAP_TERMINATE).is_err());
    }

    #[test]
    fn creation_time_blob_is_the_identity() {
        assert_eq!(creation_time_blob(recommended()), recommended());
    }
}
