mod coordinator;
mod error;
mod host;
mod orchestrator;

pub use coordinator::{UpgradeCoordinator, UpgradeOutcome};
pub use error::{BlockingError, UpgradeError};
pub use host::{NoopViewHost, ViewHost};
pub use orchestrator::{AppStatus, InstalledAppHandle, Orchestrator};

#[cfg(test)]
mod tests;
