//! Update checking.
//!
//! `UpdateChecker` is a thin seam over an `UpdateBackend`: it triggers checks,
//! tracks the transient `UpdateState` and republishes every backend event 1:1
//! on the notification bus. `GithubReleaseBackend` is the default backend; it
//! asks the GitHub releases API for the latest tag and can download the
//! matching installer.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bus::NotificationBus;
use crate::events::Notification;

pub const DEFAULT_REPOSITORY: &str = "ever-co/ever-teams";
const UPDATE_TTL: Duration = Duration::from_secs(60 * 60);
const UPDATE_CACHE_FILE: &str = "update.json";
const NO_UPDATE_ENV: &str = "DESKTOP_HOST_NO_UPDATE_CHECK";

/// What is known about a release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateInfo {
    /// Version of the running build.
    pub current: String,
    /// Latest published version.
    pub version: String,
    pub release_name: Option<String>,
    pub download_url: Option<String>,
}

impl UpdateInfo {
    pub fn to_json(&self) -> Value {
        json!({
            "currentVersion": self.current,
            "version": self.version,
            "releaseName": self.release_name,
            "downloadUrl": self.download_url,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateState {
    Idle,
    CheckingForUpdate,
    Available(UpdateInfo),
    Downloading(u8),
    Downloaded(UpdateInfo),
    NotAvailable,
    Error(String),
    Cancelled,
}

/// Events raised by an update backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdaterEvent {
    Available(UpdateInfo),
    NotAvailable(UpdateInfo),
    Error(String),
    Progress(u8),
    Downloaded(UpdateInfo),
    Cancelled(UpdateInfo),
}

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("no update has been downloaded")]
    NothingDownloaded,
    #[error("failed to launch installer {path}: {source}")]
    Install {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Where backends report to. Updates the checker state and republishes the
/// event on the bus.
#[derive(Clone)]
pub struct UpdateEvents {
    state: Arc<Mutex<UpdateState>>,
    bus: NotificationBus,
}

impl UpdateEvents {
    pub fn emit(&self, event: UpdaterEvent) {
        let (state, notification) = match event {
            UpdaterEvent::Available(info) => (
                UpdateState::Available(info.clone()),
                Notification::UpdateAvailable(info),
            ),
            UpdaterEvent::NotAvailable(info) => {
                (UpdateState::NotAvailable, Notification::UpdateNotAvailable(info))
            }
            UpdaterEvent::Error(message) => (
                UpdateState::Error(message.clone()),
                Notification::UpdateError(message),
            ),
            UpdaterEvent::Progress(percent) => (
                UpdateState::Downloading(percent),
                Notification::UpdateProgress(percent),
            ),
            UpdaterEvent::Downloaded(info) => (
                UpdateState::Downloaded(info.clone()),
                Notification::UpdateDownloaded(info),
            ),
            UpdaterEvent::Cancelled(info) => {
                (UpdateState::Cancelled, Notification::UpdateCancelled(info))
            }
        };
        *lock(&self.state) = state;
        self.bus.notify(&notification);
    }
}

/// A platform update mechanism.
pub trait UpdateBackend: Send + Sync + 'static {
    /// Starts a check. Must eventually emit exactly one of available,
    /// not-available or error. After available, an automatic download ends
    /// with downloaded, cancelled or error, so one check may publish
    /// `updateAvailable` followed by `updateError`.
    fn check(&self, events: UpdateEvents);
    /// Stops a running download.
    fn cancel(&self);
    /// Installs the downloaded update. Not validated against the current state.
    fn quit_and_install(&self) -> Result<(), UpdateError>;
}

#[derive(Clone)]
pub struct UpdateChecker {
    backend: Arc<dyn UpdateBackend>,
    events: UpdateEvents,
}

impl UpdateChecker {
    pub fn new(backend: impl UpdateBackend, bus: NotificationBus) -> Self {
        Self {
            backend: Arc::new(backend),
            events: UpdateEvents {
                state: Arc::new(Mutex::new(UpdateState::Idle)),
                bus,
            },
        }
    }

    pub fn state(&self) -> UpdateState {
        lock(&self.events.state).clone()
    }

    pub fn check_update(&self) {
        *lock(&self.events.state) = UpdateState::CheckingForUpdate;
        self.backend.check(self.events.clone());
    }

    pub fn cancel_download(&self) {
        self.backend.cancel();
    }

    pub fn install_update(&self) -> Result<(), UpdateError> {
        self.backend.quit_and_install()
    }

    /// Checks now and then every `period` until `shutdown` turns true.
    pub fn spawn_periodic(
        &self,
        period: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let checker = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => checker.check_update(),
                    _ = shutdown.wait_for(|stop| *stop) => break,
                }
            }
            debug!("periodic update checks stopped");
        })
    }
}

#[derive(Debug, Deserialize)]
struct ReleaseResponse {
    tag_name: String,
    name: Option<String>,
    #[serde(default)]
    assets: Vec<ReleaseAsset>,
}

#[derive(Debug, Deserialize)]
struct ReleaseAsset {
    name: String,
    browser_download_url: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct UpdateCache {
    checked_at: u64,
    latest: String,
    #[serde(default)]
    release_name: Option<String>,
    #[serde(default)]
    download_url: Option<String>,
}

/// Looks for new releases on GitHub and downloads the platform installer.
pub struct GithubReleaseBackend {
    inner: Arc<GithubInner>,
}

struct GithubInner {
    url: String,
    current: String,
    auto_download: bool,
    cache_path: Option<PathBuf>,
    cancel: AtomicBool,
    downloaded: Mutex<Option<PathBuf>>,
}

impl GithubReleaseBackend {
    pub fn new(repository: &str, auto_download: bool) -> Self {
        Self {
            inner: Arc::new(GithubInner {
                url: format!("https://api.github.com/repos/{}/releases/latest", repository),
                current: env!("CARGO_PKG_VERSION").to_string(),
                auto_download,
                cache_path: cache_path(),
                cancel: AtomicBool::new(false),
                downloaded: Mutex::new(None),
            }),
        }
    }
}

impl UpdateBackend for GithubReleaseBackend {
    fn check(&self, events: UpdateEvents) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let info = match inner.resolve_latest().await {
                Ok(info) => info,
                Err(message) => {
                    warn!(error = %message, "update check failed");
                    events.emit(UpdaterEvent::Error(message));
                    return;
                }
            };
            if !is_newer(&info.version, &info.current) {
                debug!(current = %info.current, latest = %info.version, "no update available");
                events.emit(UpdaterEvent::NotAvailable(info));
                return;
            }
            info!(current = %info.current, latest = %info.version, "update available");
            events.emit(UpdaterEvent::Available(info.clone()));
            if inner.auto_download && info.download_url.is_some() {
                inner.download(info, &events).await;
            }
        });
    }

    fn cancel(&self) {
        self.inner.cancel.store(true, Ordering::SeqCst);
    }

    fn quit_and_install(&self) -> Result<(), UpdateError> {
        let path = lock(&self.inner.downloaded)
            .clone()
            .ok_or(UpdateError::NothingDownloaded)?;
        info!(path = %path.display(), "launching installer");
        launch_installer(&path).map_err(|source| UpdateError::Install { path, source })
    }
}

impl GithubInner {
    async fn resolve_latest(&self) -> Result<UpdateInfo, String> {
        let unchanged = UpdateInfo {
            current: self.current.clone(),
            version: self.current.clone(),
            release_name: None,
            download_url: None,
        };
        if update_check_disabled() {
            return Ok(unchanged);
        }
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        let cached = self.cache_path.as_deref().and_then(read_cache);
        let fresh = cached
            .as_ref()
            .map(|cache| now.saturating_sub(cache.checked_at) < UPDATE_TTL.as_secs())
            .unwrap_or(false);
        let latest = if fresh {
            cached
        } else {
            match self.fetch_latest().await {
                Ok(release) => {
                    let cache = UpdateCache {
                        checked_at: now,
                        latest: release.tag_name.clone(),
                        download_url: select_asset(&release.assets),
                        release_name: release.name,
                    };
                    if let Some(path) = self.cache_path.as_deref() {
                        write_cache(path, &cache);
                    }
                    Some(cache)
                }
                Err(err) => {
                    debug!(error = %err, "release lookup failed, using cached result");
                    Some(cached.ok_or_else(|| err.to_string())?)
                }
            }
        };
        let Some(latest) = latest else {
            return Ok(unchanged);
        };
        let version = normalize_version(&latest.latest)
            .ok_or_else(|| format!("unrecognised release tag {:?}", latest.latest))?;
        Ok(UpdateInfo {
            current: self.current.clone(),
            version,
            release_name: latest.release_name,
            download_url: latest.download_url,
        })
    }

    async fn fetch_latest(&self) -> reqwest::Result<ReleaseResponse> {
        let client = reqwest::Client::builder()
            .user_agent(format!("desktop-host/{}", self.current))
            .timeout(Duration::from_secs(10))
            .build()?;
        client
            .get(&self.url)
            .header("Accept", "application/vnd.github+json")
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
    }

    async fn download(&self, info: UpdateInfo, events: &UpdateEvents) {
        let Some(url) = info.download_url.clone() else {
            return;
        };
        self.cancel.store(false, Ordering::SeqCst);
        let target = download_dir().join(file_name_from_url(&url));
        match self.download_to(&url, &target, events).await {
            Ok(true) => {
                info!(path = %target.display(), "update downloaded");
                *lock(&self.downloaded) = Some(target);
                events.emit(UpdaterEvent::Downloaded(info));
            }
            Ok(false) => {
                info!("update download cancelled");
                let _ = tokio::fs::remove_file(&target).await;
                events.emit(UpdaterEvent::Cancelled(info));
            }
            Err(err) => {
                warn!(error = %err, "update download failed");
                let _ = tokio::fs::remove_file(&target).await;
                events.emit(UpdaterEvent::Error(err));
            }
        }
    }

    // Returns Ok(false) when cancelled part way.
    async fn download_to(
        &self,
        url: &str,
        target: &Path,
        events: &UpdateEvents,
    ) -> Result<bool, String> {
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| err.to_string())?;
        }
        let mut response = reqwest::Client::new()
            .get(url)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|err| err.to_string())?;
        let total = response.content_length();
        let mut file = tokio::fs::File::create(target)
            .await
            .map_err(|err| err.to_string())?;
        let mut received: u64 = 0;
        let mut last_percent = None;
        while let Some(chunk) = response.chunk().await.map_err(|err| err.to_string())? {
            if self.cancel.load(Ordering::SeqCst) {
                return Ok(false);
            }
            file.write_all(&chunk).await.map_err(|err| err.to_string())?;
            received += chunk.len() as u64;
            if let Some(percent) = total.map(|total| progress_percent(received, total)) {
                if last_percent != Some(percent) {
                    last_percent = Some(percent);
                    events.emit(UpdaterEvent::Progress(percent));
                }
            }
        }
        file.flush().await.map_err(|err| err.to_string())?;
        Ok(true)
    }
}

fn progress_percent(received: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    (received.saturating_mul(100) / total).min(100) as u8
}

fn update_check_disabled() -> bool {
    env::var(NO_UPDATE_ENV)
        .ok()
        .map(|value| matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

fn cache_dir() -> Option<PathBuf> {
    if let Ok(path) = env::var("XDG_CACHE_HOME") {
        return Some(PathBuf::from(path));
    }
    if cfg!(windows) {
        return env::var("LOCALAPPDATA").ok().map(PathBuf::from);
    }
    env::var("HOME")
        .ok()
        .map(|home| PathBuf::from(home).join(".cache"))
}

fn cache_path() -> Option<PathBuf> {
    cache_dir().map(|dir| dir.join("desktop-host").join(UPDATE_CACHE_FILE))
}

fn download_dir() -> PathBuf {
    cache_dir()
        .unwrap_or_else(env::temp_dir)
        .join("desktop-host")
        .join("pending")
}

fn read_cache(path: &Path) -> Option<UpdateCache> {
    let data = fs::read_to_string(path).ok()?;
    serde_json::from_str(&data).ok()
}

fn write_cache(path: &Path, cache: &UpdateCache) {
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    if let Ok(serialized) = serde_json::to_string(cache) {
        let _ = fs::write(path, serialized);
    }
}

fn file_name_from_url(url: &str) -> String {
    url.rsplit('/')
        .next()
        .filter(|name| !name.is_empty())
        .unwrap_or("update")
        .to_string()
}

// Picks the installer for the running platform.
fn select_asset(assets: &[ReleaseAsset]) -> Option<String> {
    let suffixes: &[&str] = if cfg!(windows) {
        &[".exe", ".msi"]
    } else if cfg!(target_os = "macos") {
        &[".dmg", ".pkg"]
    } else {
        &[".AppImage", ".deb"]
    };
    suffixes.iter().find_map(|suffix| {
        assets
            .iter()
            .find(|asset| asset.name.ends_with(suffix))
            .map(|asset| asset.browser_download_url.clone())
    })
}

fn launch_installer(path: &Path) -> std::io::Result<()> {
    #[cfg(target_os = "macos")]
    {
        std::process::Command::new("open").arg(path).spawn()?;
    }
    #[cfg(all(unix, not(target_os = "macos")))]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o755))?;
        std::process::Command::new(path).spawn()?;
    }
    #[cfg(windows)]
    {
        std::process::Command::new(path).spawn()?;
    }
    Ok(())
}

fn normalize_version(raw: &str) -> Option<String> {
    let trimmed = raw.trim().trim_start_matches('v');
    let no_build = trimmed.split('+').next().unwrap_or(trimmed);
    let no_pre = no_build.split('-').next().unwrap_or(no_build);
    if no_pre.is_empty() {
        None
    } else {
        Some(no_pre.to_string())
    }
}

fn version_tuple(raw: &str) -> Option<(u64, u64, u64)> {
    let normalized = normalize_version(raw)?;
    let mut parts = normalized.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    let patch = parts.next().map(str::parse).transpose().ok()?.unwrap_or(0);
    Some((major, minor, patch))
}

fn is_newer(latest: &str, current: &str) -> bool {
    match (version_tuple(latest), version_tuple(current)) {
        (Some(latest), Some(current)) => latest > current,
        _ => false,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Topic;

    struct ScriptedBackend {
        events: Vec<UpdaterEvent>,
        installs: Arc<Mutex<u32>>,
    }

    impl UpdateBackend for ScriptedBackend {
        fn check(&self, events: UpdateEvents) {
            for event in &self.events {
                events.emit(event.clone());
            }
        }

        fn cancel(&self) {}

        fn quit_and_install(&self) -> Result<(), UpdateError> {
            *self.installs.lock().unwrap() += 1;
            Ok(())
        }
    }

    fn info(version: &str) -> UpdateInfo {
        UpdateInfo {
            current: "0.3.0".into(),
            version: version.into(),
            release_name: None,
            download_url: Some("https://example.com/app.AppImage".into()),
        }
    }

    #[test]
    fn forwards_backend_events_one_to_one() {
        let bus = NotificationBus::new();
        let (_sub, mut rx) = bus.subscribe_channel(&Topic::ALL);
        let backend = ScriptedBackend {
            events: vec![
                UpdaterEvent::Available(info("0.4.0")),
                UpdaterEvent::Progress(50),
                UpdaterEvent::Progress(100),
                UpdaterEvent::Downloaded(info("0.4.0")),
            ],
            installs: Arc::new(Mutex::new(0)),
        };
        let installs = backend.installs.clone();
        let checker = UpdateChecker::new(backend, bus);
        assert_eq!(checker.state(), UpdateState::Idle);
        checker.check_update();

        let mut names = Vec::new();
        while let Ok(event) = rx.try_recv() {
            names.push(event.wire_name());
        }
        assert_eq!(
            names,
            vec!["updateAvailable", "updateProgress", "updateProgress", "updateDownloaded"]
        );
        assert_eq!(checker.state(), UpdateState::Downloaded(info("0.4.0")));
        checker.install_update().unwrap();
        assert_eq!(*installs.lock().unwrap(), 1);
    }

    #[test]
    fn error_and_cancel_update_state() {
        let bus = NotificationBus::new();
        let checker = UpdateChecker::new(
            ScriptedBackend {
                events: vec![UpdaterEvent::Error("offline".into())],
                installs: Arc::new(Mutex::new(0)),
            },
            bus.clone(),
        );
        checker.check_update();
        assert_eq!(checker.state(), UpdateState::Error("offline".into()));

        let events = checker.events.clone();
        events.emit(UpdaterEvent::Cancelled(info("0.4.0")));
        assert_eq!(checker.state(), UpdateState::Cancelled);
    }

    #[test]
    fn download_failure_follows_available() {
        let bus = NotificationBus::new();
        let (_sub, mut rx) = bus.subscribe_channel(&Topic::ALL);
        let checker = UpdateChecker::new(
            ScriptedBackend {
                events: vec![
                    UpdaterEvent::Available(info("0.4.0")),
                    UpdaterEvent::Progress(10),
                    UpdaterEvent::Error("connection reset".into()),
                ],
                installs: Arc::new(Mutex::new(0)),
            },
            bus,
        );
        checker.check_update();

        let mut names = Vec::new();
        while let Ok(event) = rx.try_recv() {
            names.push(event.wire_name());
        }
        assert_eq!(names, vec!["updateAvailable", "updateProgress", "updateError"]);
        assert_eq!(checker.state(), UpdateState::Error("connection reset".into()));
    }

    #[test]
    fn normalize_version_strips_prefixes() {
        assert_eq!(normalize_version("v1.2.3"), Some("1.2.3".to_string()));
        assert_eq!(normalize_version("1.2.3-beta.1"), Some("1.2.3".to_string()));
        assert_eq!(normalize_version("1.2.3+build"), Some("1.2.3".to_string()));
    }

    #[test]
    fn version_comparison() {
        assert_eq!(version_tuple("v10.4.1"), Some((10, 4, 1)));
        assert_eq!(version_tuple("0.2"), Some((0, 2, 0)));
        assert!(is_newer("v0.4.0", "0.3.9"));
        assert!(!is_newer("0.3.0", "0.3.0"));
        assert!(!is_newer("nightly", "0.3.0"));
    }

    #[test]
    fn picks_platform_asset() {
        let assets = vec![
            ReleaseAsset {
                name: "app.exe".into(),
                browser_download_url: "https://example.com/app.exe".into(),
            },
            ReleaseAsset {
                name: "app.dmg".into(),
                browser_download_url: "https://example.com/app.dmg".into(),
            },
            ReleaseAsset {
                name: "app.AppImage".into(),
                browser_download_url: "https://example.com/app.AppImage".into(),
            },
        ];
        let picked = select_asset(&assets).unwrap();
        if cfg!(windows) {
            assert!(picked.ends_with(".exe"));
        } else if cfg!(target_os = "macos") {
            assert!(picked.ends_with(".dmg"));
        } else {
            assert!(picked.ends_with(".AppImage"));
        }
        assert_eq!(file_name_from_url(&picked), picked.rsplit('/').next().unwrap());
    }

    #[test]
    fn progress_is_clamped() {
        assert_eq!(progress_percent(50, 200), 25);
        assert_eq!(progress_percent(300, 200), 100);
        assert_eq!(progress_percent(0, 0), 100);
    }
}
