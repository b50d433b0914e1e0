use semver::Version;

/// The shell side that hosts app views.
///
/// Whether an app is loaded is tracked by the install state store, so the
/// host only needs to hear about upgrades staged behind a running view.
pub trait ViewHost: Send + Sync {
    fn notify_upgraded(&self, name: &str, version: &Version);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopViewHost;

impl ViewHost for NoopViewHost {
    fn notify_upgraded(&self, _name: &str, _version: &Version) {}
}
