use std::ffi::OsStr;
use std::os::windows::ffi::OsStrExt;
use std::str::FromStr;

use anyhow::bail;
use windows::Win32::Foundation::{E_POINTER, UNICODE_STRING};
use windows::core::{PCWSTR, PWSTR};

use crate::Error;

pub trait SafeWindowsString {
    fn to_string_safe(&self) -> anyhow::Result<String>;
}

macro_rules! impl_safe_win_string {
    ($t:ty) => {
        impl SafeWindowsString for $t {
            fn to_string_safe(&self) -> anyhow::Result<String> {
                if self.is_null() {
                    bail!(Error::from_hresult(E_POINTER))
                } else {
                    // SAFETY: pointer is non-null, as required by `to_string()`'s safety contract.
                    // The caller of `SafeWindowsString` upholds the rest (valid, nul-terminated).
                    unsafe { Ok(self.to_string()?) }
                }
            }
        }
    };
}

impl_safe_win_string!(PWSTR);
impl_safe_win_string!(PCWSTR);

/// Nul-terminated wide-string buffer, ready to be handed to a Win32 call as `PCWSTR`/`PWSTR`.
/// Wraps `widestring::U16CString` rather than a raw `Vec<u16>`, per the teacher's `str.rs`.
#[derive(Default, Debug, Clone)]
pub struct WideString(pub Option<widestring::U16CString>);

impl WideString {
    pub fn as_pcwstr(&self) -> PCWSTR {
        self.0.as_ref().map(|x| PCWSTR::from_raw(x.as_ptr())).unwrap_or_else(PCWSTR::null)
    }

    pub fn as_pwstr(&mut self) -> PWSTR {
        self.0.as_mut().map(|x| PWSTR::from_raw(x.as_mut_ptr())).unwrap_or_else(PWSTR::null)
    }

    pub fn as_unicode_string(&self) -> anyhow::Result<UNICODE_STRING> {
        Ok(UNICODE_STRING {
            Length: self.0.as_ref().map(|x| size_of_val(x.as_slice())).unwrap_or(0).try_into()?,
            MaximumLength: self.0.as_ref().map(|x| size_of_val(x.as_slice_with_nul())).unwrap_or(0).try_into()?,
            Buffer: PWSTR(self.as_pcwstr().0.cast_mut()),
        })
    }
}

impl<T: ?Sized + AsRef<OsStr>> From<&T> for WideString {
    fn from(value: &T) -> Self {
        let buf = value.as_ref().encode_wide().collect::<Vec<_>>();
        Self(Some(widestring::U16CString::from_vec_truncate(buf)))
    }
}

impl FromStr for WideString {
    type Err = core::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let buf = s.encode_utf16().collect::<Vec<_>>();
        Ok(Self(Some(widestring::U16CString::from_vec_truncate(buf))))
    }
}

impl From<String> for WideString {
    fn from(value: String) -> Self {
        Self::from(&value)
    }
}

/// Returns the slice up to (not including) the first nul terminator.
pub fn nul_slice_wide_str(buf: &[u16]) -> &[u16] {
    buf.iter().position(|&c| c == 0).map_or(buf, |pos| &buf[..pos])
}

/// A checked `size_of::<T>()` cast to `u32`, for the `u32`-sized-buffer Win32 APIs.
pub(crate) const fn u32size_of<T>() -> u32 {
    // All structures handed to Win32 size APIs fit in a u32 in practice; a value that
    // did not would itself be rejected by the OS, so truncation here cannot be silent.
    size_of::<T>() as u32
}

/// Reads `len` elements starting at `ptr`, as returned by a Win32 size-probed allocation.
///
/// # Safety
///
/// `ptr` must be valid for reads of `len` contiguous, initialized `T` values.
pub(crate) unsafe fn slice_from_ptr<'a, T>(ptr: *const T, len: usize) -> &'a [T] {
    // SAFETY: forwarded to the caller's contract.
    unsafe { std::slice::from_raw_parts(ptr, len) }
}
