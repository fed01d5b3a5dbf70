//! Persisted key/value store holding the `config` document.
//!
//! Writes are deep merges: records merge key by key, every other value
//! (scalars, arrays, null) replaces what was there. Storage failures never
//! reach callers; an unreadable or corrupt file is treated as an empty store
//! so that `apply_defaults_on_first_run` can write a clean document.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{debug, error, info, warn};

use crate::config::{
    default_document, pid_key, validate, GeneralConfig, MissingFields, PersistedConfig,
    ServerConfig,
};

/// Key the settings document is stored under.
pub const CONFIG_KEY: &str = "config";
const CONFIG_FILE: &str = "config.json";
const APP_DIR: &str = "desktop-host";

/// Where the raw document lives.
pub trait Storage: Send + Sync {
    /// Returns `None` when nothing has been stored yet.
    fn load(&self) -> io::Result<Option<String>>;
    fn save(&self, contents: &str) -> io::Result<()>;
    fn location(&self) -> Option<PathBuf> {
        None
    }
}

impl<T: Storage + ?Sized> Storage for Arc<T> {
    fn load(&self) -> io::Result<Option<String>> {
        (**self).load()
    }

    fn save(&self, contents: &str) -> io::Result<()> {
        (**self).save(contents)
    }

    fn location(&self) -> Option<PathBuf> {
        (**self).location()
    }
}

/// JSON file on disk, replaced atomically on every write.
#[derive(Debug, Clone)]
pub struct FileStorage {
    path: PathBuf,
}

impl FileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `config.json` inside `dir`.
    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join(CONFIG_FILE))
    }

    /// Per-user configuration directory for this application.
    pub fn default_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(APP_DIR))
    }
}

impl Storage for FileStorage {
    fn load(&self) -> io::Result<Option<String>> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => Ok(Some(contents)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn save(&self, contents: &str) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, contents)?;
        fs::rename(&tmp, &self.path)
    }

    fn location(&self) -> Option<PathBuf> {
        Some(self.path.clone())
    }
}

/// Volatile storage, used by tests and `--ephemeral` runs.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    contents: Mutex<Option<String>>,
}

impl MemoryStorage {
    pub fn contents(&self) -> Option<String> {
        lock(&self.contents).clone()
    }
}

impl Storage for MemoryStorage {
    fn load(&self) -> io::Result<Option<String>> {
        Ok(self.contents())
    }

    fn save(&self, contents: &str) -> io::Result<()> {
        *lock(&self.contents) = Some(contents.to_string());
        Ok(())
    }
}

/// The settings store shared by the supervisor and the orchestrator.
///
/// Only the supervisor writes the `<service>Pid` keys; everything else in
/// `config` belongs to the orchestrator. The store does not enforce this.
pub struct ConfigStore {
    storage: Box<dyn Storage>,
    document: Mutex<Map<String, Value>>,
}

impl ConfigStore {
    /// Opens the store, treating unreadable or corrupt contents as empty.
    pub fn open(storage: impl Storage + 'static) -> Self {
        let document = match storage.load() {
            Ok(Some(raw)) => match serde_json::from_str::<Value>(&raw) {
                Ok(Value::Object(map)) => map,
                Ok(_) => {
                    warn!(location = ?storage.location(), "stored settings are not a JSON object; starting empty");
                    Map::new()
                }
                Err(err) => {
                    warn!(location = ?storage.location(), error = %err, "stored settings are corrupt; starting empty");
                    Map::new()
                }
            },
            Ok(None) => {
                debug!(location = ?storage.location(), "no stored settings yet");
                Map::new()
            }
            Err(err) => {
                warn!(location = ?storage.location(), error = %err, "failed to read stored settings; starting empty");
                Map::new()
            }
        };
        Self {
            storage: Box::new(storage),
            document: Mutex::new(document),
        }
    }

    pub fn location(&self) -> Option<PathBuf> {
        self.storage.location()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        lock(&self.document).get(key).cloned()
    }

    pub fn get_or(&self, key: &str, default: Value) -> Value {
        self.get(key).unwrap_or(default)
    }

    /// Deep-merges `partial` into the value stored under `key`.
    pub fn set(&self, key: &str, partial: Value) {
        self.mutate(|document| {
            let slot = document.entry(key.to_string()).or_insert(Value::Null);
            deep_merge(slot, partial);
        });
    }

    /// Deep-merges `partial` into the `config` document.
    pub fn update_config(&self, partial: Value) {
        self.set(CONFIG_KEY, partial);
    }

    /// The raw `config` document, or an empty object.
    pub fn config_document(&self) -> Value {
        self.get_or(CONFIG_KEY, json!({}))
    }

    pub fn config(&self) -> PersistedConfig {
        PersistedConfig {
            server: self.server(),
            general: self.general(),
        }
    }

    pub fn server(&self) -> ServerConfig {
        self.section("server")
    }

    pub fn general(&self) -> GeneralConfig {
        self.section("general")
    }

    pub fn validate(&self) -> Result<(), MissingFields> {
        validate(&self.config_document())
    }

    /// Brings the stored document up to date with the current defaults.
    ///
    /// Persisted values win over defaults; fields unknown to the stored
    /// document get their default. If the result is still invalid the pure
    /// default document is written instead.
    pub fn apply_defaults_on_first_run(&self) -> PersistedConfig {
        let mut merged = default_document();
        match self.get(CONFIG_KEY) {
            Some(persisted @ Value::Object(_)) => deep_merge(&mut merged, persisted),
            Some(other) => warn!(found = %other, "ignoring non-object settings document"),
            None => info!("no settings stored, writing defaults"),
        }
        let document = match validate(&merged) {
            Ok(()) => merged,
            Err(err) => {
                error!(error = %err, "stored settings are unusable, resetting to defaults");
                default_document()
            }
        };
        self.mutate(|root| {
            root.insert(CONFIG_KEY.to_string(), document);
        });
        self.config()
    }

    /// Saves edited server settings, marking first-run setup as done on the
    /// first save that validates.
    pub fn save_server_config(&self, partial: Value) -> Result<(), MissingFields> {
        let mut candidate = self.config_document();
        deep_merge(&mut candidate, json!({ "server": partial }));
        validate(&candidate)?;
        if !self.general().setup_completed {
            info!("server settings saved for the first time, setup completed");
            deep_merge(&mut candidate, json!({ "general": { "setup": true } }));
        }
        self.mutate(|root| {
            root.insert(CONFIG_KEY.to_string(), candidate);
        });
        Ok(())
    }

    /// Replaces the `server` section with defaults, keeping recorded pids.
    pub fn set_default_server_config(&self) {
        let mut defaults = default_document();
        let mut server = defaults["server"].take();
        if let Value::Object(section) = &mut server {
            for (service, pid) in self.server().process_handles.iter() {
                section.insert(pid_key(service), json!(pid));
            }
        }
        self.mutate(|root| {
            let config = root
                .entry(CONFIG_KEY.to_string())
                .or_insert_with(|| json!({}));
            if !config.is_object() {
                *config = json!({});
            }
            config["server"] = server;
        });
    }

    /// Pid recorded for `service`, if any.
    pub fn pid(&self, service: &str) -> Option<u32> {
        self.server().process_handles.get(service)
    }

    pub fn set_pid(&self, service: &str, pid: u32) {
        let mut server = Map::new();
        server.insert(pid_key(service), json!(pid));
        self.update_config(json!({ "server": server }));
    }

    pub fn clear_pid(&self, service: &str) {
        let key = pid_key(service);
        self.mutate(|root| {
            if let Some(Value::Object(server)) = root
                .get_mut(CONFIG_KEY)
                .and_then(|config| config.get_mut("server"))
            {
                server.remove(&key);
            }
        });
    }

    // A malformed field falls back to its default; the rest of the section
    // is kept.
    fn section<T: Serialize + DeserializeOwned + Default>(&self, name: &str) -> T {
        let Some(value) = self.config_document().get(name).cloned() else {
            return T::default();
        };
        match serde_json::from_value(value.clone()) {
            Ok(section) => section,
            Err(err) => {
                warn!(section = name, error = %err, "settings section is malformed");
                salvage(name, value)
            }
        }
    }

    fn mutate<F>(&self, apply: F)
    where
        F: FnOnce(&mut Map<String, Value>),
    {
        let mut document = lock(&self.document);
        apply(&mut document);
        let serialized = match serde_json::to_string_pretty(&*document) {
            Ok(serialized) => serialized,
            Err(err) => {
                error!(error = %err, "failed to serialize settings");
                return;
            }
        };
        if let Err(err) = self.storage.save(&serialized) {
            error!(location = ?self.storage.location(), error = %err, "failed to persist settings");
        }
    }
}

// Rebuilds a section from its defaults, taking over each stored field that
// deserializes on its own.
fn salvage<T: Serialize + DeserializeOwned + Default>(name: &str, value: Value) -> T {
    let Value::Object(fields) = value else {
        return T::default();
    };
    let mut accepted = match serde_json::to_value(T::default()) {
        Ok(defaults @ Value::Object(_)) => defaults,
        _ => return T::default(),
    };
    for (key, field) in fields {
        let mut candidate = accepted.clone();
        if let Value::Object(map) = &mut candidate {
            map.insert(key.clone(), field);
        }
        if serde_json::from_value::<T>(candidate.clone()).is_ok() {
            accepted = candidate;
        } else {
            warn!(section = name, field = %key, "ignoring invalid setting");
        }
    }
    serde_json::from_value(accepted).unwrap_or_default()
}

/// Recursively merges `patch` into `target`.
///
/// Objects are merged key by key; any other patch value replaces the target.
pub fn deep_merge(target: &mut Value, patch: Value) {
    match (target, patch) {
        (Value::Object(existing), Value::Object(incoming)) => {
            for (key, value) in incoming {
                match existing.get_mut(&key) {
                    Some(slot) => deep_merge(slot, value),
                    None => {
                        existing.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_PORT;

    fn stored(contents: &str) -> MemoryStorage {
        let storage = MemoryStorage::default();
        storage.save(contents).unwrap();
        storage
    }

    fn memory_store() -> (ConfigStore, Arc<MemoryStorage>) {
        let storage = Arc::new(MemoryStorage::default());
        (ConfigStore::open(storage.clone()), storage)
    }

    #[test]
    fn fresh_install_gets_default_port() {
        let (store, storage) = memory_store();
        store.apply_defaults_on_first_run();
        let config = store.get(CONFIG_KEY).unwrap();
        assert_eq!(config["server"]["PORT"], json!(3002));
        assert_eq!(store.server().port, DEFAULT_PORT);
        let persisted: Value = serde_json::from_str(&storage.contents().unwrap()).unwrap();
        assert_eq!(persisted[CONFIG_KEY]["server"]["PORT"], json!(3002));
    }

    #[test]
    fn general_settings_merge_instead_of_replace() {
        let (store, _) = memory_store();
        store.update_config(json!({ "general": { "lang": "bg" } }));
        store.update_config(json!({ "general": { "autoUpdate": false } }));
        let config = store.config_document();
        assert_eq!(config["general"]["lang"], json!("bg"));
        assert_eq!(config["general"]["autoUpdate"], json!(false));
    }

    #[test]
    fn repeated_set_is_idempotent() {
        let (store, _) = memory_store();
        store.apply_defaults_on_first_run();
        let patch = json!({ "server": { "PORT": 4000, "DESKTOP_WEB_SERVER_HOSTNAME": "localhost" },
                            "general": { "theme": "dark" } });
        store.update_config(patch.clone());
        let once = store.config_document();
        store.update_config(patch);
        assert_eq!(store.config_document(), once);
    }

    #[test]
    fn arrays_and_scalars_replace_wholesale() {
        let mut target = json!({ "list": [1, 2, 3], "nested": { "a": 1, "b": 2 }, "flag": { "x": 1 } });
        deep_merge(&mut target, json!({ "list": [9], "nested": { "b": 3 }, "flag": false }));
        assert_eq!(target, json!({ "list": [9], "nested": { "a": 1, "b": 3 }, "flag": false }));
    }

    #[test]
    fn persisted_values_win_over_defaults() {
        let storage = stored(
            r#"{"config":{"server":{"PORT":5000,"GAUZY_API_SERVER_URL":"https://api.local"},"general":{"lang":"fr"}}}"#,
        );
        let store = ConfigStore::open(storage);
        let config = store.apply_defaults_on_first_run();
        assert_eq!(config.server.port, 5000);
        assert_eq!(config.server.upstream_api_url, "https://api.local");
        assert_eq!(config.server.bind_hostname, "0.0.0.0");
        assert_eq!(config.general.language, "fr");
        assert!(config.general.auto_update);
    }

    #[test]
    fn invalid_settings_fall_back_to_defaults() {
        let storage = stored(
            r#"{"config":{"server":{"PORT":null,"GAUZY_API_SERVER_URL":""},"general":{"lang":"de"}}}"#,
        );
        let store = ConfigStore::open(storage);
        store.apply_defaults_on_first_run();
        assert!(store.validate().is_ok());
        assert_eq!(store.config_document(), default_document());
    }

    #[test]
    fn corrupt_storage_behaves_as_empty() {
        let store = ConfigStore::open(stored("{ not json"));
        assert!(store.get(CONFIG_KEY).is_none());
        assert_eq!(store.get_or("missing", json!(1)), json!(1));
        store.apply_defaults_on_first_run();
        assert_eq!(store.server().port, 3002);
    }

    #[test]
    fn pid_round_trip() {
        let (store, _) = memory_store();
        store.apply_defaults_on_first_run();
        assert_eq!(store.pid("webServer"), None);
        store.set_pid("webServer", 1234);
        assert_eq!(store.pid("webServer"), Some(1234));
        assert_eq!(store.server().process_handles.get("webServer"), Some(1234));
        store.clear_pid("webServer");
        assert_eq!(store.pid("webServer"), None);
        assert!(store.config_document()["server"].get("webServerPid").is_none());
    }

    #[test]
    fn first_server_save_completes_setup() {
        let (store, _) = memory_store();
        store.apply_defaults_on_first_run();
        assert!(!store.general().setup_completed);
        let err = store
            .save_server_config(json!({ "PORT": null }))
            .unwrap_err();
        assert_eq!(err.fields, vec!["server.PORT".to_string()]);
        assert!(!store.general().setup_completed);
        assert_eq!(store.server().port, 3002);

        store.save_server_config(json!({ "PORT": 3100 })).unwrap();
        assert!(store.general().setup_completed);
        assert_eq!(store.server().port, 3100);
    }

    #[test]
    fn default_server_config_keeps_pids() {
        let (store, _) = memory_store();
        store.apply_defaults_on_first_run();
        store.update_config(json!({ "server": { "PORT": 9999 }, "general": { "lang": "bg" } }));
        store.set_pid("webServer", 77);
        store.set_default_server_config();
        assert_eq!(store.server().port, 3002);
        assert_eq!(store.pid("webServer"), Some(77));
        assert_eq!(store.general().language, "bg");
    }

    #[test]
    fn bad_port_keeps_other_server_settings() {
        let (store, _) = memory_store();
        store.apply_defaults_on_first_run();
        store.update_config(json!({
            "server": { "PORT": 70000, "GAUZY_API_SERVER_URL": "https://api.mine.local" }
        }));
        store.set_pid("webServer", 42);
        let err = store.validate().unwrap_err();
        assert_eq!(err.invalid, vec!["server.PORT".to_string()]);
        let server = store.server();
        assert_eq!(server.port, DEFAULT_PORT);
        assert_eq!(server.upstream_api_url, "https://api.mine.local");
        assert_eq!(store.pid("webServer"), Some(42));
    }

    #[test]
    fn invalid_port_is_not_saved() {
        let (store, _) = memory_store();
        store.apply_defaults_on_first_run();
        let err = store
            .save_server_config(json!({ "PORT": "abc" }))
            .unwrap_err();
        assert_eq!(err.invalid, vec!["server.PORT".to_string()]);
        assert!(!store.general().setup_completed);
        assert_eq!(store.config_document()["server"]["PORT"], json!(3002));
    }

    #[test]
    fn default_dir_is_per_application() {
        if let Some(dir) = FileStorage::default_dir() {
            assert!(dir.ends_with("desktop-host"));
        }
    }

    #[test]
    fn file_storage_round_trip() {
        let dir = std::env::temp_dir().join(format!("desktop-host-store-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);

        let store = ConfigStore::open(FileStorage::in_dir(&dir));
        store.apply_defaults_on_first_run();
        store.update_config(json!({ "general": { "lang": "bg" } }));

        let reopened = ConfigStore::open(FileStorage::in_dir(&dir));
        assert_eq!(reopened.general().language, "bg");
        assert_eq!(reopened.location(), Some(dir.join("config.json")));

        fs::write(dir.join("config.json"), "garbage").unwrap();
        let healed = ConfigStore::open(FileStorage::in_dir(&dir));
        healed.apply_defaults_on_first_run();
        assert_eq!(healed.general().language, "en");

        let _ = fs::remove_dir_all(&dir);
    }
}
