mod artifact;
mod fs_utils;
mod layout;
mod state;
mod swaps;

pub use artifact::PackageInstaller;
pub use layout::AppsLayout;
pub use state::{InstallStateStore, JsonSettingsStore, SettingsStore};
pub use swaps::{
    promote_staged, promote_staged_async, recover_leftovers, DeferredSwapScheduler,
    RecoveryReport, SwapError, SwapReport,
};
