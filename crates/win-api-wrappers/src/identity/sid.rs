//! A value-type [`Sid`], plus the `RawSid` bridge used whenever a `PSID` must cross into a
//! Win32 call.
//!
//! # Implementation
//!
//! Relevant links:
//! - <https://learn.microsoft.com/en-us/windows/win32/secauthz/sids>
//! - <https://learn.microsoft.com/en-us/windows/win32/api/securitybaseapi/nf-securitybaseapi-createwellknownsid>

use std::alloc::Layout;
use std::fmt::{self, Debug};
use std::hash::Hash;
use std::ptr;
use std::sync::OnceLock;

use anyhow::{Result, bail};
use uuid::Uuid;
use windows::Win32::Foundation::{E_POINTER, HLOCAL, LocalFree};
use windows::Win32::Security::Authorization::{ConvertSidToStringSidW, ConvertStringSidToSidW};
use windows::Win32::Security::{
    CreateWellKnownSid, GetLengthSid, GetSidSubAuthority, IsValidSid, PSID, SID, SID_AND_ATTRIBUTES,
    SID_IDENTIFIER_AUTHORITY, WELL_KNOWN_SID_TYPE,
};
use windows::core::{PCWSTR, PWSTR};

use crate::Error;
use crate::utils::SafeWindowsString;

/// `SECURITY_RESOURCE_MANAGER_AUTHORITY` — not exposed as a named constant by the `windows`
/// crate at this version, so it is reproduced here verbatim from `winnt.h`.
const SECURITY_RESOURCE_MANAGER_AUTHORITY: SID_IDENTIFIER_AUTHORITY = SID_IDENTIFIER_AUTHORITY { Value: [0, 0, 0, 0, 0, 9] };

/// An immutable Windows security identifier, held as plain value fields rather than an
/// opaque pointer: there is no allocation to free, so copy/move follow ordinary Rust semantics.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sid {
    pub revision: u8,
    pub identifier_authority: SID_IDENTIFIER_AUTHORITY,
    pub sub_authority: Vec<u32>,
}

impl Hash for Sid {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.revision.hash(state);
        self.identifier_authority.Value.hash(state);
        self.sub_authority.hash(state);
    }
}

impl Default for Sid {
    fn default() -> Self {
        Self {
            revision: 1,
            identifier_authority: SID_IDENTIFIER_AUTHORITY::default(),
            sub_authority: Vec::new(),
        }
    }
}

impl Sid {
    /// Builds a SID from an authority and up to 8 sub-authorities. Trailing zero
    /// sub-authorities are trimmed; a resulting zero-length sub-authority list fails.
    pub fn from_parts(authority: SID_IDENTIFIER_AUTHORITY, sub_authority: &[u32]) -> Result<Self> {
        let mut sub_authority = sub_authority.to_vec();

        while sub_authority.last() == Some(&0) {
            sub_authority.pop();
        }

        if sub_authority.is_empty() {
            bail!(Error::InvalidSid("zero-length sub-authority list"));
        }

        if sub_authority.len() > 8 {
            bail!(Error::InvalidSid("too many sub-authorities"));
        }

        Ok(Self { revision: 1, identifier_authority: authority, sub_authority })
    }

    /// Generates a fresh UUID and reinterprets its 128 bits as four 32-bit sub-authorities
    /// under the resource-manager authority. Used to mint a per-launch SID unique enough to
    /// plug the SetThreadDesktop hole (see the launcher's desktop-patching step).
    pub fn init_custom() -> Result<Self> {
        let uuid = Uuid::new_v4();
        let (d1, d2, d3, d4) = uuid.as_fields();
        let d4_hi = u32::from_be_bytes([d4[0], d4[1], d4[2], d4[3]]);
        let d4_lo = u32::from_be_bytes([d4[4], d4[5], d4[6], d4[7]]);

        Self::from_parts(SECURITY_RESOURCE_MANAGER_AUTHORITY, &[d1, u32::from(d2) << 16 | u32::from(d3), d4_hi, d4_lo])
    }

    pub fn from_well_known(sid_type: WELL_KNOWN_SID_TYPE, domain_sid: Option<&Self>) -> Result<Self> {
        let mut out_size = 0u32;

        let domain_sid = domain_sid.map(RawSid::try_from).transpose()?;
        let domain_sid_ptr = domain_sid.as_ref().map(RawSid::as_psid).unwrap_or_default();

        // SAFETY: Null output buffer with out_size=0 is the documented way to probe the
        // required size; the call is expected to fail with ERROR_INSUFFICIENT_BUFFER.
        let _ = unsafe { CreateWellKnownSid(sid_type, domain_sid_ptr, PSID(ptr::null_mut()), &mut out_size) };

        let mut buf: Vec<u8> = vec![0; out_size as usize];

        // SAFETY: `buf` is sized exactly to the `out_size` just probed for the same arguments.
        unsafe { CreateWellKnownSid(sid_type, domain_sid_ptr, PSID(buf.as_mut_ptr().cast()), &mut out_size) }?;

        buf.truncate(out_size as usize);

        // SAFETY: We just populated `buf` with a SID structure of the probed size.
        Ok(Self::from(unsafe { &*buf.as_ptr().cast::<SID>() }))
    }

    pub fn is_valid(&self) -> Result<bool> {
        Ok(RawSid::try_from(self)?.is_valid())
    }
}

impl fmt::Display for Sid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        RawSid::try_from(self).map_err(|_| fmt::Error)?.fmt(f)
    }
}

/// An owned, correctly-sized byte buffer shaped like a Win32 `SID`, used to obtain a `PSID`
/// for the duration of a single call. Dropped immediately afterward.
pub struct RawSid {
    pub buf: Vec<u8>,
}

impl RawSid {
    pub fn len(&self) -> usize {
        // SAFETY: `self.buf` is a well-formed SID buffer per the `TryFrom<&Sid>` constructor.
        unsafe { GetLengthSid(self.as_psid()) as usize }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_raw(&self) -> &SID {
        // SAFETY: `self.buf` was constructed to hold a valid, correctly-aligned SID.
        unsafe { &*self.buf.as_ptr().cast::<SID>() }
    }

    pub fn as_psid(&self) -> PSID {
        PSID(self.as_raw() as *const _ as *mut _)
    }

    pub fn is_valid(&self) -> bool {
        // SAFETY: The pointer is non-null: it points into our own buffer.
        unsafe { IsValidSid(self.as_psid()) }.as_bool()
    }
}

impl fmt::Display for RawSid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut raw_string_sid = PWSTR::null();

        // SAFETY: `self` is a valid SID buffer; the returned pointer must be freed with LocalFree.
        unsafe { ConvertSidToStringSidW(self.as_psid(), &mut raw_string_sid) }.map_err(|_| fmt::Error)?;

        let res = (|| {
            f.write_str(&raw_string_sid.to_string_safe().map_err(|_| fmt::Error)?)?;
            Ok(())
        })();

        // SAFETY: `raw_string_sid` was allocated by the call above and is freed exactly once here.
        unsafe { LocalFree(HLOCAL(raw_string_sid.0.cast())) };

        res
    }
}

impl TryFrom<&str> for Sid {
    type Error = anyhow::Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let value = crate::utils::WideString::from(value);
        let mut sid_ptr = PSID::default();

        // SAFETY: `value` is valid and nul-terminated; `sid_ptr` is freed with `LocalFree` below.
        unsafe { ConvertStringSidToSidW(value.as_pcwstr(), &mut sid_ptr) }?;

        // SAFETY: A successful call above guarantees `sid_ptr` is non-null and valid.
        let sid = Self::from(unsafe { sid_ptr.0.cast::<SID>().as_ref().ok_or(Error::NullPointer("SID"))? });

        // SAFETY: `sid_ptr` was allocated by `ConvertStringSidToSidW` and is freed exactly once here.
        unsafe { LocalFree(HLOCAL(sid_ptr.0)) };

        Ok(sid)
    }
}

impl TryFrom<&Sid> for RawSid {
    type Error = anyhow::Error;

    fn try_from(value: &Sid) -> Result<Self> {
        let mut buf = vec![
            0u8;
            Layout::new::<SID>()
                .extend(Layout::array::<u32>(value.sub_authority.len().saturating_sub(1))?)?
                .0
                .pad_to_align()
                .size()
        ];

        let sid = buf.as_mut_ptr().cast::<SID>();

        // SAFETY: `buf` was sized above to exactly fit a SID header plus `sub_authority.len()`
        // trailing `u32`s; these field writes stay within that allocation.
        unsafe {
            ptr::addr_of_mut!((*sid).IdentifierAuthority).write(value.identifier_authority);
            ptr::addr_of_mut!((*sid).Revision).write(value.revision);
            ptr::addr_of_mut!((*sid).SubAuthorityCount).write(value.sub_authority.len().try_into()?);
        }

        for (i, v) in value.sub_authority.iter().enumerate() {
            // SAFETY: `SubAuthority` is a VLA field; `i` is in range per the allocation above.
            // `write_unaligned` is required since the backing byte buffer only guarantees
            // alignment 1 while `u32` needs alignment 4.
            unsafe { (ptr::addr_of_mut!((*sid).SubAuthority) as *mut u32).add(i).write_unaligned(*v) };
        }

        Ok(Self { buf })
    }
}

impl TryFrom<PSID> for Sid {
    type Error = anyhow::Error;

    fn try_from(value: PSID) -> std::result::Result<Self, Self::Error> {
        let value = value.0.cast::<SID>();

        // SAFETY: We assume the pointer actually points to a valid SID, as documented on the
        // Win32 APIs that hand out a `PSID` to us.
        match unsafe { value.as_ref() } {
            Some(x) => Ok(Self::from(x)),
            None => bail!(Error::from_hresult(E_POINTER)),
        }
    }
}

impl From<&SID> for Sid {
    fn from(sid: &SID) -> Self {
        let mut sub_authority = Vec::with_capacity(u32::from(sid.SubAuthorityCount) as usize);

        for i in 0..u32::from(sid.SubAuthorityCount) {
            // SAFETY: `i` is in range of `SubAuthorityCount`; `GetSidSubAuthority` does not
            // mutate through the `*mut` cast it requires.
            let ptr = unsafe { GetSidSubAuthority(PSID(sid as *const _ as *mut _), i) };

            // SAFETY: `ptr` is valid since `i` is in range.
            unsafe { sub_authority.push(ptr.read()) };
        }

        Self { revision: sid.Revision, identifier_authority: sid.IdentifierAuthority, sub_authority }
    }
}

pub struct SidAndAttributes {
    pub sid: Sid,
    pub attributes: u32,
}

/// Owning bridge from a `SidAndAttributes` to the Win32 `SID_AND_ATTRIBUTES` shape. Keeps
/// the backing `RawSid` alive for as long as the raw struct's `Sid` pointer is used.
pub struct RawSidAndAttributes {
    _sid: RawSid,
    raw: SID_AND_ATTRIBUTES,
}

impl RawSidAndAttributes {
    pub fn as_raw(&self) -> &SID_AND_ATTRIBUTES {
        &self.raw
    }
}

impl TryFrom<&SidAndAttributes> for RawSidAndAttributes {
    type Error = anyhow::Error;

    fn try_from(value: &SidAndAttributes) -> Result<Self> {
        let raw_sid = RawSid::try_from(&value.sid)?;
        let raw_sid_ptr = raw_sid.as_psid();

        Ok(Self { _sid: raw_sid, raw: SID_AND_ATTRIBUTES { Sid: raw_sid_ptr, Attributes: value.attributes } })
    }
}

impl TryFrom<&SID_AND_ATTRIBUTES> for SidAndAttributes {
    type Error = anyhow::Error;

    fn try_from(value: &SID_AND_ATTRIBUTES) -> Result<Self> {
        Ok(Self { sid: Sid::try_from(value.Sid)?, attributes: value.Attributes })
    }
}

/// Process-wide table of well-known SIDs: initialised on first access, immutable afterward,
/// never freed. Avoids re-querying `CreateWellKnownSid` for SIDs used repeatedly by the launcher.
pub struct WellKnownSids {
    everyone: OnceLock<Sid>,
    builtin_users: OnceLock<Sid>,
    builtin_administrators: OnceLock<Sid>,
    local_system: OnceLock<Sid>,
    restricted_code: OnceLock<Sid>,
    low_label: OnceLock<Sid>,
}

impl WellKnownSids {
    const fn new() -> Self {
        Self {
            everyone: OnceLock::new(),
            builtin_users: OnceLock::new(),
            builtin_administrators: OnceLock::new(),
            local_system: OnceLock::new(),
            restricted_code: OnceLock::new(),
            low_label: OnceLock::new(),
        }
    }

    fn get_or_init(cell: &OnceLock<Sid>, ty: WELL_KNOWN_SID_TYPE) -> &Sid {
        cell.get_or_init(|| Sid::from_well_known(ty, None).expect("well-known SID construction cannot fail"))
    }

    pub fn everyone(&self) -> &Sid {
        Self::get_or_init(&self.everyone, windows::Win32::Security::WinWorldSid)
    }

    pub fn builtin_users(&self) -> &Sid {
        Self::get_or_init(&self.builtin_users, windows::Win32::Security::WinBuiltinUsersSid)
    }

    pub fn builtin_administrators(&self) -> &Sid {
        Self::get_or_init(&self.builtin_administrators, windows::Win32::Security::WinBuiltinAdministratorsSid)
    }

    pub fn local_system(&self) -> &Sid {
        Self::get_or_init(&self.local_system, windows::Win32::Security::WinLocalSystemSid)
    }

    pub fn restricted_code(&self) -> &Sid {
        Self::get_or_init(&self.restricted_code, windows::Win32::Security::WinRestrictedCodeSid)
    }

    pub fn low_integrity_label(&self) -> &Sid {
        Self::get_or_init(&self.low_label, windows::Win32::Security::WinLowLabelSid)
    }
}

pub static WELL_KNOWN: WellKnownSids = WellKnownSids::new();
