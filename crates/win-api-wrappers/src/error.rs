use std::string::{FromUtf16Error, FromUtf8Error};

use thiserror::Error;
use windows::Win32::Foundation::WIN32_ERROR;
use windows::core::HRESULT;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error(transparent)]
    Win32(#[from] windows::core::Error),
    #[error("null pointer: {0}")]
    NullPointer(&'static str),
    #[error("invalid SID: {0}")]
    InvalidSid(&'static str),
}

impl Error {
    pub fn code(&self) -> i32 {
        match self {
            Error::Win32(err) => err.code().0,
            Error::NullPointer(_) | Error::InvalidSid(_) => windows::Win32::Foundation::E_POINTER.0,
        }
    }

    pub fn last_error() -> Self {
        Self::Win32(windows::core::Error::from_win32())
    }

    pub fn from_hresult(hresult: HRESULT) -> Self {
        Self::Win32(windows::core::Error::from_hresult(hresult))
    }

    pub fn from_win32(win32_error: WIN32_ERROR) -> Self {
        Self::from_hresult(HRESULT::from_win32(win32_error.0))
    }
}

impl From<HRESULT> for Error {
    fn from(err: HRESULT) -> Self {
        Self::from_hresult(err)
    }
}

impl From<FromUtf8Error> for Error {
    fn from(err: FromUtf8Error) -> Self {
        Self::Win32(windows::core::Error::from(err))
    }
}

impl From<FromUtf16Error> for Error {
    fn from(err: FromUtf16Error) -> Self {
        Self::Win32(windows::core::Error::from(err))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Win32(windows::core::Error::from(err))
    }
}
