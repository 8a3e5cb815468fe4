//! Process-launch sandboxing core: a [`launcher::Launcher`] that confines a freshly created
//! child behind a restricted token, a private desktop, and a capped job object, plus the
//! [`sandboxee`] bootstrap that completes the lockdown from inside the child.

#[macro_use]
extern crate tracing;

#[cfg(target_os = "windows")]
#[path = ""]
mod lib_win {
    mod error;
    pub mod launcher;
    pub mod mitigation;
    pub mod sandboxee;
    pub mod sid_attrs;

    pub use error::Error;
    pub use win_api_wrappers as wrappers;

    /// Embedder-facing launch flags (spec §6).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub enum InitFlags {
        #[default]
        Normal,
        /// The new desktop is created on the caller's existing window station instead of a
        /// freshly created one.
        NoSeparateWindowStation,
    }

    /// Hooks the launching process implements (spec §6, §9 "virtual hooks").
    pub trait LauncherHooks {
        /// Runs after the suspended child is fully configured but before `ResumeThread`.
        fn pre_resume(&mut self, _child: &wrappers::process::Process) -> anyhow::Result<()> {
            Ok(())
        }
    }

    /// No-op hook set for embedders that don't need a `PreResume` callback.
    impl LauncherHooks for () {}

    /// Hooks the sandboxed child implements (spec §6, §9 "virtual hooks").
    pub trait SandboxeeHooks {
        /// Runs while the child still impersonates the launcher's impersonation token.
        fn on_priv_init(&mut self) -> anyhow::Result<()> {
            Ok(())
        }

        /// Runs once the child has reverted, dropped to Low integrity, and joined the job.
        /// Untrusted payload execution begins here.
        fn on_init(&mut self) -> anyhow::Result<()> {
            Ok(())
        }

        /// Runs at teardown, regardless of how `on_init` completed.
        fn on_fini(&mut self) -> anyhow::Result<()> {
            Ok(())
        }

        /// The mitigation policy bag applied once the child has reverted (spec §4.9's deferred
        /// half, vs. the creation-time half baked into the attribute list by the `Launcher`).
        fn get_deferred_mitigation_policies(&self) -> u64 {
            crate::mitigation::recommended()
        }
    }
}

#[cfg(target_os = "windows")]
pub use lib_win::*;
