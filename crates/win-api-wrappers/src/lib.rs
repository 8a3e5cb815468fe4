#[macro_use]
extern crate tracing;

#[cfg(target_os = "windows")]
#[path = ""]
mod lib_win {
    mod error;
    pub use error::Error;

    pub mod handle;
    pub mod identity;
    pub mod job;
    pub mod process;
    pub mod security;
    pub mod thread;
    pub mod token;
    pub mod utils;
    pub mod winstation;

    pub use windows as raw;
}

#[cfg(target_os = "windows")]
pub use lib_win::*;
