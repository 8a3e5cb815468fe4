use thiserror::Error;

/// Conditions the OS has no error code for, plus a transparent wrapper for everything the
/// underlying Win32 calls already report (spec §11).
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Win32(#[from] windows::core::Error),

    #[error("--job value missing or not a valid hexadecimal handle")]
    MissingJobArgument,

    #[error("handle passed on argv does not name a job object")]
    InvalidJobHandle,

    #[error("mitigation bit {0:#x} cannot be applied at this stage")]
    MitigationNotApplicable(u64),
}
