use std::fs;
use std::io::{Cursor, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use appdock_core::{HostConfig, InstallStage, RetryConfig, Settings, TimeoutConfig};
use appdock_installer::{AppsLayout, JsonSettingsStore, SettingsStore};
use appdock_registry::HttpSource;
use semver::Version;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};
use zip::write::SimpleFileOptions;

use super::*;

#[derive(Default)]
struct RecordingHost {
    upgraded: Mutex<Vec<(String, Version)>>,
}

impl RecordingHost {
    fn upgraded(&self) -> Vec<(String, Version)> {
        self.upgraded.lock().expect("lock").clone()
    }
}

impl ViewHost for RecordingHost {
    fn notify_upgraded(&self, name: &str, version: &Version) {
        self.upgraded
            .lock()
            .expect("lock")
            .push((name.to_string(), version.clone()));
    }
}

struct Harness {
    server: MockServer,
    root: TempDir,
    host: Arc<RecordingHost>,
}

impl Harness {
    async fn new() -> Self {
        Self {
            server: MockServer::start().await,
            root: TempDir::new().expect("must create temp dir"),
            host: Arc::new(RecordingHost::default()),
        }
    }

    fn layout(&self) -> AppsLayout {
        AppsLayout::new(self.root.path())
    }

    fn config(&self) -> HostConfig {
        HostConfig {
            base_url: format!("{}/apps", self.server.uri()),
            timeouts: TimeoutConfig {
                manifest_secs: 2,
                download_secs: 5,
            },
            retry: RetryConfig {
                download_attempts: 3,
                archive_attempts: 2,
                backoff_millis: 1,
            },
            ..HostConfig::default()
        }
    }

    fn settings_store(&self) -> JsonSettingsStore {
        JsonSettingsStore::new(self.layout().settings_path())
    }

    async fn seed_settings(&self, settings: &Settings) {
        self.settings_store()
            .save(settings)
            .await
            .expect("must seed settings");
    }

    async fn saved_settings(&self) -> Settings {
        self.settings_store()
            .load()
            .await
            .expect("must load saved settings")
    }

    async fn start(&self) -> Orchestrator {
        Orchestrator::start(
            self.config(),
            self.root.path(),
            Arc::new(HttpSource::new(self.config().timeouts).expect("must build http source")),
            Arc::new(self.settings_store()),
            self.host.clone(),
        )
        .await
    }

    async fn serve_manifest(&self, body: &str) {
        Mock::given(method("GET"))
            .and(path("/apps/versions.json"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&self.server)
            .await;
    }

    async fn serve_archive(&self, name: &str, version: &str, marker: &str, expected: u64) {
        Mock::given(method("GET"))
            .and(path(format!("/apps/{name}.{version}.zip")))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(package(marker)))
            .expect(expected)
            .mount(&self.server)
            .await;
    }
}

fn version(raw: &str) -> Version {
    Version::parse(raw).expect("version must parse")
}

fn package(marker: &str) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    writer
        .start_file("index.html", SimpleFileOptions::default())
        .expect("must start zip entry");
    writer
        .write_all(marker.as_bytes())
        .expect("must write zip entry");
    writer
        .start_file("js/app.js", SimpleFileOptions::default())
        .expect("must start zip entry");
    writer
        .write_all(format!("// {marker}").as_bytes())
        .expect("must write zip entry");
    writer.finish().expect("must finish zip").into_inner()
}

fn write_live(layout: &AppsLayout, name: &str, marker: &str) {
    let live = layout.live_dir(name);
    fs::create_dir_all(&live).expect("must create live dir");
    fs::write(live.join("index.html"), marker).expect("must write live file");
}

fn marker(dir: &Path) -> String {
    fs::read_to_string(dir.join("index.html")).expect("must read index.html")
}

fn installed(name: &str, raw: &str, loaded: bool) -> Settings {
    let mut settings = Settings::default();
    settings.apps.insert(name.to_string(), version(raw));
    if loaded {
        settings.loaded_apps.push(name.to_string());
    }
    settings
}

#[tokio::test]
async fn first_load_installs_manifest_version_into_live_dir() {
    let harness = Harness::new().await;
    harness.serve_manifest(r#"{"core": "2.0.0"}"#).await;
    harness.serve_archive("core", "2.0.0", "core 2", 1).await;
    let orchestrator = harness.start().await;

    let handle = orchestrator
        .load_or_upgrade("core")
        .await
        .expect("first load must succeed");

    let layout = harness.layout();
    assert_eq!(handle.version, version("2.0.0"));
    assert_eq!(handle.path, layout.live_dir("core"));
    assert_eq!(handle.pending, None);
    assert_eq!(marker(&handle.path), "core 2");
    assert!(!layout.staging_dir("core", &version("2.0.0")).exists());
    assert!(!layout.archive_path("core").exists());

    let saved = harness.saved_settings().await;
    assert_eq!(saved.apps.get("core"), Some(&version("2.0.0")));
    assert_eq!(saved.loaded_apps, vec!["core"]);
    assert!(harness.host.upgraded().is_empty());
}

#[tokio::test]
async fn unloaded_app_is_upgraded_in_place_before_load() {
    let harness = Harness::new().await;
    harness.serve_manifest(r#"{"core": "2.0.0"}"#).await;
    harness.serve_archive("core", "2.0.0", "core 2", 1).await;
    harness.seed_settings(&installed("core", "1.0.0", false)).await;
    write_live(&harness.layout(), "core", "core 1");
    let orchestrator = harness.start().await;

    let outcome = orchestrator
        .coordinator()
        .check_and_upgrade("core")
        .await
        .expect("upgrade must succeed");
    assert_eq!(
        outcome,
        UpgradeOutcome::Promoted {
            previous: Some(version("1.0.0")),
            version: version("2.0.0"),
        }
    );

    let handle = orchestrator
        .load_or_upgrade("core")
        .await
        .expect("load must succeed");
    assert_eq!(handle.version, version("2.0.0"));
    assert_eq!(marker(&handle.path), "core 2");
    assert!(!harness.layout().trash_dir("core").exists());
}

#[tokio::test]
async fn loaded_app_upgrade_is_staged_until_shutdown() {
    let harness = Harness::new().await;
    harness.serve_manifest(r#"{"core": "2.0.0"}"#).await;
    harness.serve_archive("core", "2.0.0", "core 2", 1).await;
    harness.seed_settings(&installed("core", "1.0.0", true)).await;
    let layout = harness.layout();
    write_live(&layout, "core", "core 1");
    let orchestrator = harness.start().await;

    let handle = orchestrator
        .load_or_upgrade("core")
        .await
        .expect("load must succeed");

    assert_eq!(handle.version, version("1.0.0"));
    assert_eq!(handle.pending, Some(version("2.0.0")));
    assert_eq!(marker(&layout.live_dir("core")), "core 1");
    let staged = layout.staging_dir("core", &version("2.0.0"));
    assert_eq!(marker(&staged), "core 2");
    assert_eq!(
        harness.host.upgraded(),
        vec![("core".to_string(), version("2.0.0"))]
    );
    assert_eq!(
        orchestrator.store().installed_version("core").await,
        Some(version("1.0.0"))
    );

    let report = orchestrator.shutdown().await;

    assert_eq!(report.applied.len(), 1);
    assert!(report.failed.is_empty());
    assert_eq!(marker(&layout.live_dir("core")), "core 2");
    assert!(!staged.exists());
    let saved = harness.saved_settings().await;
    assert_eq!(saved.apps.get("core"), Some(&version("2.0.0")));
}

#[tokio::test]
async fn concurrent_loads_of_one_app_share_a_single_download() {
    let harness = Harness::new().await;
    harness.serve_manifest(r#"{"core": "2.0.0"}"#).await;
    Mock::given(method("GET"))
        .and(path("/apps/core.2.0.0.zip"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(package("core 2"))
                .set_delay(Duration::from_millis(200)),
        )
        .expect(1)
        .mount(&harness.server)
        .await;
    let orchestrator = harness.start().await;

    let (first, second) = tokio::join!(
        orchestrator.load_or_upgrade("core"),
        orchestrator.load_or_upgrade("core")
    );

    let first = first.expect("first load must succeed");
    let second = second.expect("second load must succeed");
    assert_eq!(first.version, version("2.0.0"));
    assert_eq!(second.version, version("2.0.0"));
    assert_eq!(marker(&first.path), "core 2");
    assert_eq!(orchestrator.coordinator().in_flight_len(), 0);
}

#[tokio::test]
async fn repeated_check_without_manifest_change_downloads_once() {
    let harness = Harness::new().await;
    harness.serve_manifest(r#"{"core": "2.0.0"}"#).await;
    harness.serve_archive("core", "2.0.0", "core 2", 1).await;
    harness.seed_settings(&installed("core", "1.0.0", true)).await;
    write_live(&harness.layout(), "core", "core 1");
    let orchestrator = harness.start().await;
    let coordinator = orchestrator.coordinator();

    let first = coordinator
        .check_and_upgrade("core")
        .await
        .expect("must stage");
    let second = coordinator
        .check_and_upgrade("core")
        .await
        .expect("must be a no-op");

    assert_eq!(
        first,
        UpgradeOutcome::Staged {
            installed: version("1.0.0"),
            version: version("2.0.0"),
        }
    );
    assert_eq!(
        second,
        UpgradeOutcome::AlreadyStaged {
            installed: version("1.0.0"),
            version: version("2.0.0"),
        }
    );
}

#[tokio::test]
async fn up_to_date_app_is_left_alone() {
    let harness = Harness::new().await;
    harness.serve_manifest(r#"{"core": "1.0.0"}"#).await;
    harness.serve_archive("core", "1.0.0", "unused", 0).await;
    harness.seed_settings(&installed("core", "1.0.0", false)).await;
    write_live(&harness.layout(), "core", "core 1");
    let orchestrator = harness.start().await;

    let outcome = orchestrator
        .coordinator()
        .check_and_upgrade("core")
        .await
        .expect("check must succeed");
    assert_eq!(
        outcome,
        UpgradeOutcome::UpToDate {
            version: version("1.0.0")
        }
    );
}

#[tokio::test]
async fn missing_manifest_blocks_first_install() {
    let harness = Harness::new().await;
    Mock::given(method("GET"))
        .and(path("/apps/versions.json"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&harness.server)
        .await;
    let orchestrator = harness.start().await;

    let err = orchestrator
        .load_or_upgrade("core")
        .await
        .expect_err("nothing to fall back on");
    assert!(matches!(err, BlockingError::ManifestUnavailable { .. }));
    assert!(orchestrator.store().get("core").await.is_none());
}

#[tokio::test]
async fn missing_manifest_keeps_installed_version() {
    let harness = Harness::new().await;
    Mock::given(method("GET"))
        .and(path("/apps/versions.json"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>maintenance</html>"))
        .mount(&harness.server)
        .await;
    harness.seed_settings(&installed("core", "1.0.0", false)).await;
    write_live(&harness.layout(), "core", "core 1");
    let orchestrator = harness.start().await;

    let outcome = orchestrator
        .coordinator()
        .check_and_upgrade("core")
        .await
        .expect("installed app must not block");
    assert_eq!(
        outcome,
        UpgradeOutcome::ManifestUnavailable {
            installed: version("1.0.0")
        }
    );
    let handle = orchestrator
        .load_or_upgrade("core")
        .await
        .expect("load must fall back");
    assert_eq!(handle.version, version("1.0.0"));
}

#[tokio::test]
async fn app_missing_from_manifest_is_unknown() {
    let harness = Harness::new().await;
    harness.serve_manifest(r#"{"core": "2.0.0"}"#).await;
    let orchestrator = harness.start().await;

    let err = orchestrator
        .load_or_upgrade("crm")
        .await
        .expect_err("crm has no version");
    assert!(matches!(err, BlockingError::UnknownApp(name) if name == "crm"));
}

#[tokio::test]
async fn invalid_names_are_rejected() {
    let harness = Harness::new().await;
    let orchestrator = harness.start().await;

    let err = orchestrator
        .load_or_upgrade("../core")
        .await
        .expect_err("must reject");
    assert!(matches!(err, BlockingError::InvalidName(_)));
    assert!(matches!(
        orchestrator.remove("a/b").await,
        Err(UpgradeError::InvalidName(_))
    ));
}

#[tokio::test]
async fn first_install_retries_transient_download_failure() {
    let harness = Harness::new().await;
    harness.serve_manifest(r#"{"core": "2.0.0"}"#).await;
    Mock::given(method("GET"))
        .and(path("/apps/core.2.0.0.zip"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .expect(1)
        .mount(&harness.server)
        .await;
    harness.serve_archive("core", "2.0.0", "core 2", 1).await;
    let orchestrator = harness.start().await;

    let handle = orchestrator
        .load_or_upgrade("core")
        .await
        .expect("retry must succeed");
    assert_eq!(marker(&handle.path), "core 2");
}

#[tokio::test]
async fn repeated_corruption_surfaces_archive_error() {
    let harness = Harness::new().await;
    harness.serve_manifest(r#"{"core": "2.0.0"}"#).await;
    Mock::given(method("GET"))
        .and(path("/apps/core.2.0.0.zip"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"PK\x03\x04 truncated".to_vec()))
        .expect(2)
        .mount(&harness.server)
        .await;
    let orchestrator = harness.start().await;

    let err = orchestrator
        .load_or_upgrade("core")
        .await
        .expect_err("corruption must surface");
    match err {
        BlockingError::InstallFailed { source, .. } => {
            assert_eq!(source.stage(), InstallStage::Archive)
        }
        other => panic!("unexpected error: {other}"),
    }

    let layout = harness.layout();
    assert!(!layout.archive_path("core").exists());
    assert!(!layout.staging_dir("core", &version("2.0.0")).exists());
    assert!(!layout.live_dir("core").exists());
    assert!(orchestrator.store().get("core").await.is_none());
}

#[tokio::test]
async fn background_failure_keeps_running_version() {
    let harness = Harness::new().await;
    harness.serve_manifest(r#"{"core": "2.0.0"}"#).await;
    Mock::given(method("GET"))
        .and(path("/apps/core.2.0.0.zip"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&harness.server)
        .await;
    harness.seed_settings(&installed("core", "1.0.0", true)).await;
    write_live(&harness.layout(), "core", "core 1");
    let orchestrator = harness.start().await;

    let handle = orchestrator
        .load_or_upgrade("core")
        .await
        .expect("running app must stay usable");

    assert_eq!(handle.version, version("1.0.0"));
    assert_eq!(handle.pending, None);
    assert_eq!(marker(&handle.path), "core 1");
    assert!(!harness.layout().staging_dir("core", &version("2.0.0")).exists());
    assert!(harness.host.upgraded().is_empty());
}

#[tokio::test]
async fn unloading_promotes_pending_swap_without_second_download() {
    let harness = Harness::new().await;
    harness.serve_manifest(r#"{"core": "2.0.0"}"#).await;
    harness.serve_archive("core", "2.0.0", "core 2", 1).await;
    harness.seed_settings(&installed("core", "1.0.0", true)).await;
    let layout = harness.layout();
    write_live(&layout, "core", "core 1");
    let orchestrator = harness.start().await;

    orchestrator
        .load_or_upgrade("core")
        .await
        .expect("load must stage upgrade");
    orchestrator.unload("core").await.expect("must unload");

    let outcome = orchestrator
        .coordinator()
        .check_and_upgrade("core")
        .await
        .expect("must promote staged package");
    assert_eq!(
        outcome,
        UpgradeOutcome::Promoted {
            previous: Some(version("1.0.0")),
            version: version("2.0.0"),
        }
    );
    assert_eq!(marker(&layout.live_dir("core")), "core 2");
    assert!(!layout.staging_dir("core", &version("2.0.0")).exists());

    let report = orchestrator.shutdown().await;
    assert!(report.applied.is_empty());
}

#[tokio::test]
async fn refresh_picks_up_new_manifest_for_loaded_apps() {
    let harness = Harness::new().await;
    Mock::given(method("GET"))
        .and(path("/apps/versions.json"))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"core": "1.0.0"}"#))
        .up_to_n_times(1)
        .mount(&harness.server)
        .await;
    harness.serve_manifest(r#"{"core": "1.1.0"}"#).await;
    harness.serve_archive("core", "1.1.0", "core 1.1", 1).await;
    harness.seed_settings(&installed("core", "1.0.0", true)).await;
    write_live(&harness.layout(), "core", "core 1");
    let orchestrator = harness.start().await;

    let handle = orchestrator
        .load_or_upgrade("core")
        .await
        .expect("load must succeed");
    assert_eq!(handle.pending, None);

    let results = orchestrator.refresh_installed_apps().await;
    assert_eq!(results.len(), 1);
    let (name, outcome) = &results[0];
    assert_eq!(name, "core");
    assert_eq!(
        outcome.as_ref().expect("refresh must succeed"),
        &UpgradeOutcome::Staged {
            installed: version("1.0.0"),
            version: version("1.1.0"),
        }
    );
}

#[tokio::test]
async fn start_promotes_leftover_staged_package() {
    let harness = Harness::new().await;
    let layout = harness.layout();
    harness.seed_settings(&installed("core", "1.0.0", true)).await;
    write_live(&layout, "core", "core 1");
    let staged = layout.staging_dir("core", &version("2.0.0"));
    fs::create_dir_all(&staged).expect("must create staged dir");
    fs::write(staged.join("index.html"), "core 2").expect("must write staged file");
    fs::write(layout.archive_path("core"), b"partial").expect("must write archive");

    let orchestrator = harness.start().await;

    assert_eq!(
        orchestrator.store().installed_version("core").await,
        Some(version("2.0.0"))
    );
    assert_eq!(marker(&layout.live_dir("core")), "core 2");
    assert!(!staged.exists());
    assert!(!layout.archive_path("core").exists());
    assert_eq!(
        harness.saved_settings().await.apps.get("core"),
        Some(&version("2.0.0"))
    );
}

#[tokio::test]
async fn corrupt_settings_file_falls_back_to_defaults() {
    let harness = Harness::new().await;
    fs::write(harness.layout().settings_path(), "{broken").expect("must write settings");
    let orchestrator = harness.start().await;

    assert_eq!(orchestrator.store().snapshot().await, Settings::default());
    assert_eq!(orchestrator.session_apps().await, vec!["core"]);
}

#[tokio::test]
async fn session_apps_fall_back_to_current_then_default() {
    let harness = Harness::new().await;
    let mut settings = Settings::default();
    settings.current = Some("crm".to_string());
    harness.seed_settings(&settings).await;
    let orchestrator = harness.start().await;
    assert_eq!(orchestrator.session_apps().await, vec!["crm"]);

    orchestrator.store().mark_loaded("sales").await.expect("must persist");
    orchestrator.store().mark_loaded("core").await.expect("must persist");
    assert_eq!(orchestrator.session_apps().await, vec!["sales", "core"]);
}

#[tokio::test]
async fn restore_session_loads_every_app_concurrently() {
    let harness = Harness::new().await;
    harness
        .serve_manifest(r#"{"core": "1.0.0", "crm": "3.2.0"}"#)
        .await;
    harness.serve_archive("core", "1.0.0", "core 1", 1).await;
    harness.serve_archive("crm", "3.2.0", "crm 3.2", 1).await;
    let mut settings = Settings::default();
    settings.loaded_apps = vec!["core".to_string(), "crm".to_string()];
    harness.seed_settings(&settings).await;
    let orchestrator = harness.start().await;

    let restored = orchestrator.restore_session().await;

    assert_eq!(restored.len(), 2);
    for (name, result) in restored {
        let handle = result.expect("restore must succeed");
        assert_eq!(handle.name, name);
        assert!(handle.path.join("index.html").is_file());
    }
}

#[tokio::test]
async fn remove_deletes_packages_and_forgets_app() {
    let harness = Harness::new().await;
    harness.serve_manifest(r#"{"core": "2.0.0", "crm": "1.0.0"}"#).await;
    harness.serve_archive("core", "2.0.0", "core 2", 1).await;
    let mut settings = installed("core", "1.0.0", true);
    settings.current = Some("core".to_string());
    settings.apps.insert("crm".to_string(), version("1.0.0"));
    harness.seed_settings(&settings).await;
    let layout = harness.layout();
    write_live(&layout, "core", "core 1");
    write_live(&layout, "crm", "crm 1");
    let orchestrator = harness.start().await;
    orchestrator
        .load_or_upgrade("core")
        .await
        .expect("load must stage upgrade");

    orchestrator.remove("core").await.expect("must remove");

    assert!(!layout.live_dir("core").exists());
    assert!(!layout.staging_dir("core", &version("2.0.0")).exists());
    assert!(orchestrator.store().get("core").await.is_none());
    let saved = harness.saved_settings().await;
    assert_eq!(saved.current, None);
    assert!(saved.loaded_apps.is_empty());
    assert_eq!(saved.apps.keys().collect::<Vec<_>>(), vec!["crm"]);

    let statuses = orchestrator.status().await;
    assert_eq!(
        statuses,
        vec![AppStatus {
            name: "crm".to_string(),
            installed: Some(version("1.0.0")),
            available: Some(version("1.0.0")),
            pending: None,
            loaded: false,
            current: false,
        }]
    );
    assert!(orchestrator.shutdown().await.applied.is_empty());
}

#[tokio::test]
async fn activate_sets_current_app() {
    let harness = Harness::new().await;
    let orchestrator = harness.start().await;

    orchestrator.activate("crm").await.expect("must activate");
    assert_eq!(orchestrator.store().current().await.as_deref(), Some("crm"));
    assert_eq!(
        harness.saved_settings().await.current.as_deref(),
        Some("crm")
    );
}
