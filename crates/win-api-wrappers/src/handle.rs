use std::fmt::Debug;

use anyhow::Result;
use windows::Win32::Foundation::{CloseHandle, DUPLICATE_SAME_ACCESS, DuplicateHandle, HANDLE};
use windows::Win32::System::Threading::GetCurrentProcess;

/// RAII wrapper over a kernel `HANDLE`.
///
/// An owned handle is closed with `CloseHandle` on drop; a borrowed handle (a pseudohandle,
/// or a handle whose lifetime is tracked elsewhere) is never closed.
#[derive(Debug)]
pub struct Handle {
    raw: HANDLE,
    owned: bool,
}

// SAFETY: A `HANDLE` is, by definition, thread safe.
unsafe impl Send for Handle {}

// SAFETY: A `HANDLE` is simply an integer, no dereferencing is done.
unsafe impl Sync for Handle {}

impl Handle {
    /// Wraps `handle`, taking ownership: it will be closed with `CloseHandle` on drop.
    ///
    /// # Safety
    ///
    /// `handle` must be a valid, closable kernel handle not already owned elsewhere.
    pub unsafe fn new_owned(handle: HANDLE) -> Result<Self> {
        if handle.is_invalid() {
            anyhow::bail!(crate::Error::NullPointer("HANDLE"));
        }

        Ok(Self { raw: handle, owned: true })
    }

    /// Wraps `handle` without taking ownership. Never closed by this wrapper.
    ///
    /// # Safety
    ///
    /// `handle` must remain valid for the lifetime of the returned `Handle`.
    pub unsafe fn new_borrowed(handle: HANDLE) -> Result<Self> {
        if handle.is_invalid() {
            anyhow::bail!(crate::Error::NullPointer("HANDLE"));
        }

        Ok(Self { raw: handle, owned: false })
    }

    pub fn raw(&self) -> HANDLE {
        self.raw
    }

    pub fn raw_as_ref(&self) -> &HANDLE {
        &self.raw
    }

    /// Stops this wrapper from closing the handle on drop. The caller becomes responsible
    /// for its lifetime (e.g. because it was just handed off across a process boundary).
    pub fn leak(&mut self) {
        self.owned = false;
    }

    pub fn try_clone(&self) -> Result<Self> {
        // SAFETY: No preconditions. Always a valid pseudohandle.
        let current_process = unsafe { GetCurrentProcess() };
        let mut duplicated = HANDLE::default();

        // SAFETY: `current_process` is a valid pseudohandle. The duplicated handle is owned
        // by the returned wrapper and closed on its drop.
        unsafe {
            DuplicateHandle(
                current_process,
                self.raw,
                current_process,
                &mut duplicated,
                0,
                false,
                DUPLICATE_SAME_ACCESS,
            )?;
        }

        // SAFETY: `duplicated` was just returned by a successful `DuplicateHandle` call.
        unsafe { Self::new_owned(duplicated) }
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        if self.owned {
            // SAFETY: Per invariants, when `owned` is true the handle is valid and not a pseudohandle.
            let _ = unsafe { CloseHandle(self.raw) };
        }
    }
}

pub trait HandleWrapper {
    fn handle(&self) -> &Handle;
}
