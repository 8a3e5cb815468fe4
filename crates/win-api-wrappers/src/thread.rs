//! Thread handle wrapper plus the `PROC_THREAD_ATTRIBUTE_LIST` builder used to assemble the
//! process-creation attribute list (spec §4.10: handle-inherit list + mitigation policy blob).

use std::ffi::c_void;
use std::fmt::Debug;

use anyhow::{Result, bail};
use windows::Win32::Foundation::HANDLE;
use windows::Win32::Security::TOKEN_ACCESS_MASK;
use windows::Win32::System::Threading::{
    DeleteProcThreadAttributeList, GetCurrentThread, InitializeProcThreadAttributeList, LPPROC_THREAD_ATTRIBUTE_LIST,
    OpenThreadToken, PROC_THREAD_ATTRIBUTE_HANDLE_LIST, PROC_THREAD_ATTRIBUTE_MITIGATION_POLICY, ResumeThread,
    SetThreadToken, SuspendThread, THREAD_ACCESS_RIGHTS, UpdateProcThreadAttribute,
};

use crate::Error;
use crate::handle::{Handle, HandleWrapper};
use crate::process::Process;
use crate::token::Token;

#[derive(Debug)]
pub struct Thread {
    pub handle: Handle,
}

impl From<Handle> for Thread {
    fn from(handle: Handle) -> Self {
        Self { handle }
    }
}

impl Thread {
    pub fn current() -> Self {
        // SAFETY: No preconditions. Returns a pseudohandle, thus not owning it.
        let handle = unsafe { GetCurrentThread() };
        let handle = Handle::new_borrowed(handle).expect("always valid");

        Self::from(handle)
    }

    pub fn suspend(&self) -> Result<()> {
        // SAFETY: No preconditions.
        if unsafe { SuspendThread(self.handle.raw()) } == u32::MAX {
            bail!(Error::last_error())
        } else {
            Ok(())
        }
    }

    pub fn resume(&self) -> Result<()> {
        // SAFETY: No preconditions.
        if unsafe { ResumeThread(self.handle.raw()) } == u32::MAX {
            bail!(Error::last_error())
        } else {
            Ok(())
        }
    }

    pub fn token(&self, desired_access: TOKEN_ACCESS_MASK, open_as_self: bool) -> Result<Token> {
        let mut handle = HANDLE::default();

        // SAFETY: Returned handle is owned by the caller and closed in its RAII wrapper.
        unsafe { OpenThreadToken(self.handle.raw(), desired_access, open_as_self, &mut handle) }?;

        // SAFETY: `handle` was just returned by a successful `OpenThreadToken` call.
        let handle = unsafe { Handle::new_owned(handle)? };

        Ok(Token::from(handle))
    }

    /// Installs `token` as this thread's impersonation token (`SetThreadToken`), or clears
    /// it when `token` is `None`. Used for the launcher→child hand-off in spec §4.10: the
    /// child's main thread impersonates until it calls `RevertToSelf` in its bootstrap.
    pub fn set_token(&self, token: Option<&Token>) -> Result<()> {
        // SAFETY: `self.handle` names a live thread; `token`, if present, is a live impersonation token.
        unsafe { SetThreadToken(Some(&self.handle.raw()), token.map(|t| t.handle.raw())) }?;
        Ok(())
    }
}

impl HandleWrapper for Thread {
    fn handle(&self) -> &Handle {
        &self.handle
    }
}

pub struct ThreadAttributeList(Vec<u8>);

impl ThreadAttributeList {
    pub fn with_count(count: u32) -> Result<ThreadAttributeList> {
        // InitializeProcThreadAttributeList's output has a variable size: call once with a
        // zero-size buffer to probe it, then again with a correctly sized allocation.
        let mut required_size = 0;

        // SAFETY: No preconditions; this call is expected to fail with ERROR_INSUFFICIENT_BUFFER.
        let res = unsafe { InitializeProcThreadAttributeList(None, count, None, &mut required_size) };

        let Err(err) = res else {
            bail!("first call to InitializeProcThreadAttributeList did not fail")
        };

        // SAFETY: FFI call with no outstanding precondition.
        if unsafe { windows::Win32::Foundation::GetLastError() } != windows::Win32::Foundation::ERROR_INSUFFICIENT_BUFFER {
            return Err(anyhow::Error::new(err).context(
                "first call to InitializeProcThreadAttributeList did not fail with ERROR_INSUFFICIENT_BUFFER",
            ));
        }

        let mut allocated_length = required_size;
        let mut buf = vec![0; allocated_length];

        // SAFETY: `lpAttributeList` points to a buffer of `allocated_length`, matching `required_size`.
        unsafe {
            InitializeProcThreadAttributeList(
                Some(LPPROC_THREAD_ATTRIBUTE_LIST(buf.as_mut_ptr().cast())),
                count,
                None,
                &mut allocated_length,
            )?;
        };

        debug_assert_eq!(allocated_length, required_size);

        Ok(ThreadAttributeList(buf))
    }

    pub fn raw(&mut self) -> LPPROC_THREAD_ATTRIBUTE_LIST {
        LPPROC_THREAD_ATTRIBUTE_LIST(self.0.as_mut_ptr().cast())
    }

    pub fn update(&mut self, attribute: &ThreadAttributeType<'_>) -> Result<()> {
        // SAFETY: The list was initialized with `InitializeProcThreadAttributeList` in
        // `with_count`. `attribute`'s value must outlive this `ThreadAttributeList`, which
        // callers uphold by keeping the attribute's source data alive past process creation.
        unsafe {
            Ok(UpdateProcThreadAttribute(
                self.raw(),
                0,
                attribute.attribute() as usize,
                Some(attribute.value()),
                attribute.size(),
                None,
                None,
            )?)
        }
    }
}

impl Drop for ThreadAttributeList {
    fn drop(&mut self) {
        // SAFETY: The list was initialized with `InitializeProcThreadAttributeList` in `with_count`.
        unsafe { DeleteProcThreadAttributeList(self.raw()) };
    }
}

pub enum ThreadAttributeType<'a> {
    ParentProcess(&'a Process),
    HandleList(&'a [HANDLE]),
    MitigationPolicy(&'a u64),
}

impl ThreadAttributeType<'_> {
    pub fn attribute(&self) -> u32 {
        match self {
            ThreadAttributeType::ParentProcess(_) => windows::Win32::System::Threading::PROC_THREAD_ATTRIBUTE_PARENT_PROCESS,
            ThreadAttributeType::HandleList(_) => PROC_THREAD_ATTRIBUTE_HANDLE_LIST,
            ThreadAttributeType::MitigationPolicy(_) => PROC_THREAD_ATTRIBUTE_MITIGATION_POLICY,
        }
    }

    pub fn value(&self) -> *const c_void {
        match self {
            ThreadAttributeType::ParentProcess(p) => p.handle.raw_as_ref() as *const _ as *const c_void,
            ThreadAttributeType::HandleList(h) => h.as_ptr().cast(),
            ThreadAttributeType::MitigationPolicy(bits) => (*bits as *const u64).cast(),
        }
    }

    pub fn size(&self) -> usize {
        match self {
            ThreadAttributeType::ParentProcess(_) => size_of::<HANDLE>(),
            ThreadAttributeType::HandleList(h) => size_of::<HANDLE>() * h.len(),
            ThreadAttributeType::MitigationPolicy(_) => size_of::<u64>(),
        }
    }
}
