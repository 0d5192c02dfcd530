//! Configuration persistence.  The control loop only ever sees the typed
//! [`Config`]; dotted-path addressing (`"sensor_hub.max_readings"`) exists
//! here, at the file boundary, for operator edits.

use anyhow::{anyhow, bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use toml::{Table, Value};
use tracing::{info, warn};

use crate::config::{self, Config};

/// Load/save of the whole configuration document.
pub trait ConfigStore: Send + Sync {
    fn load(&self) -> Result<Config>;
    fn save(&self, config: &Config) -> Result<()>;
}

// ---------------------------------------------------------------------------
// TOML file
// ---------------------------------------------------------------------------

pub struct TomlFileStore {
    path: PathBuf,
}

impl TomlFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigStore for TomlFileStore {
    /// A missing file is created with the defaults.
    fn load(&self) -> Result<Config> {
        if !self.path.exists() {
            warn!(path = %self.path.display(), "config file missing, writing defaults");
            let config = Config::default();
            self.save(&config)?;
            return Ok(config);
        }
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read config file '{}'", self.path.display()))?;
        config::from_toml_str(&contents)
            .with_context(|| format!("invalid config file '{}'", self.path.display()))
    }

    /// Written to a sibling temp file and renamed over the original so a
    /// crash never leaves a half-written config.
    fn save(&self, config: &Config) -> Result<()> {
        let text = toml::to_string_pretty(config).context("failed to serialise config")?;
        let tmp = self.path.with_extension("toml.tmp");
        fs::write(&tmp, text)
            .with_context(|| format!("failed to write '{}'", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to replace '{}'", self.path.display()))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Dotted paths
// ---------------------------------------------------------------------------

fn split_path(path: &str) -> Result<Vec<&str>> {
    let keys: Vec<&str> = path.split('.').collect();
    if keys.iter().any(|k| k.is_empty()) {
        bail!("invalid config path '{path}'");
    }
    Ok(keys)
}

pub fn get_path<'a>(doc: &'a Table, path: &str) -> Option<&'a Value> {
    let keys = split_path(path).ok()?;
    let (last, parents) = keys.split_last()?;
    let mut table = doc;
    for key in parents {
        table = table.get(*key)?.as_table()?;
    }
    table.get(*last)
}

/// Walk to the table holding the final key, creating intermediate tables.
fn parent_mut<'a>(doc: &'a mut Table, keys: &[&str], path: &str) -> Result<&'a mut Table> {
    let mut table = doc;
    for key in keys {
        table = table
            .entry(key.to_string())
            .or_insert_with(|| Value::Table(Table::new()))
            .as_table_mut()
            .ok_or_else(|| anyhow!("'{key}' in '{path}' is not a table"))?;
    }
    Ok(table)
}

pub fn set_path(doc: &mut Table, path: &str, value: Value) -> Result<()> {
    let keys = split_path(path)?;
    let Some((last, parents)) = keys.split_last() else {
        bail!("empty config path");
    };
    parent_mut(doc, parents, path)?.insert(last.to_string(), value);
    Ok(())
}

/// Push onto the array at `path`, creating it if absent.  Values already
/// present are not duplicated.
pub fn append_path(doc: &mut Table, path: &str, value: Value) -> Result<()> {
    let keys = split_path(path)?;
    let Some((last, parents)) = keys.split_last() else {
        bail!("empty config path");
    };
    let array = parent_mut(doc, parents, path)?
        .entry(last.to_string())
        .or_insert_with(|| Value::Array(Vec::new()))
        .as_array_mut()
        .ok_or_else(|| anyhow!("'{path}' is not an array"))?;
    if !array.contains(&value) {
        array.push(value);
    }
    Ok(())
}

pub fn remove_path(doc: &mut Table, path: &str) -> Result<Option<Value>> {
    let keys = split_path(path)?;
    let Some((last, parents)) = keys.split_last() else {
        bail!("empty config path");
    };
    let mut table = doc;
    for key in parents {
        match table.get_mut(*key).and_then(Value::as_table_mut) {
            Some(t) => table = t,
            None => return Ok(None),
        }
    }
    Ok(table.remove(*last))
}

/// Apply `f` to the value at `path`; the path must already exist.
pub fn edit_path(doc: &mut Table, path: &str, f: impl FnOnce(&mut Value)) -> Result<()> {
    let keys = split_path(path)?;
    let Some((last, parents)) = keys.split_last() else {
        bail!("empty config path");
    };
    let mut table = doc;
    for key in parents {
        table = table
            .get_mut(*key)
            .and_then(Value::as_table_mut)
            .ok_or_else(|| anyhow!("no config value at '{path}'"))?;
    }
    match table.get_mut(*last) {
        Some(Value::Table(_)) => bail!("'{path}' is a table, not a value"),
        Some(v) => {
            f(v);
            Ok(())
        }
        None => bail!("no config value at '{path}'"),
    }
}

fn to_document(config: &Config) -> Result<Table> {
    match Value::try_from(config).context("failed to render config")? {
        Value::Table(doc) => Ok(doc),
        _ => bail!("config did not render as a table"),
    }
}

fn from_document(doc: Table) -> Result<Config> {
    Value::Table(doc)
        .try_into()
        .context("edited config does not match the expected shape")
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Cached typed configuration backed by a store.  Every change is validated
/// and persisted before it becomes visible.
pub struct Settings {
    store: Box<dyn ConfigStore>,
    cached: RwLock<Config>,
}

impl Settings {
    pub fn load(store: Box<dyn ConfigStore>) -> Result<Self> {
        let config = store.load()?;
        Ok(Self {
            store,
            cached: RwLock::new(config),
        })
    }

    pub fn snapshot(&self) -> Config {
        self.cached
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Re-read the store, replacing the cache.
    pub fn reload(&self) -> Result<Config> {
        let config = self.store.load()?;
        *self.cached.write().unwrap_or_else(PoisonError::into_inner) = config.clone();
        info!("config reloaded");
        Ok(config)
    }

    /// Mutate a copy of the config; it is validated, saved and only then
    /// swapped in.  Any error leaves the cache untouched.
    pub fn update<R>(&self, f: impl FnOnce(&mut Config) -> Result<R>) -> Result<R> {
        let mut guard = self.cached.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = guard.clone();
        let out = f(&mut next)?;
        next.validate()?;
        self.store.save(&next)?;
        *guard = next;
        Ok(out)
    }

    /// Edit the config as a TOML document.
    pub fn update_document(&self, f: impl FnOnce(&mut Table) -> Result<()>) -> Result<()> {
        self.update(|cfg| {
            let mut doc = to_document(cfg)?;
            f(&mut doc)?;
            *cfg = from_document(doc)?;
            Ok(())
        })
    }

    pub fn get_path(&self, path: &str) -> Option<Value> {
        let doc = to_document(&self.snapshot()).ok()?;
        get_path(&doc, path).cloned()
    }

    pub fn set_path(&self, path: &str, value: Value) -> Result<()> {
        self.update_document(|doc| set_path(doc, path, value))?;
        info!(path, "config value set");
        Ok(())
    }

    pub fn append_path(&self, path: &str, value: Value) -> Result<()> {
        self.update_document(|doc| append_path(doc, path, value))
    }

    pub fn remove_path(&self, path: &str) -> Result<()> {
        self.update_document(|doc| remove_path(doc, path).map(|_| ()))
    }

    pub fn edit_path(&self, path: &str, f: impl FnOnce(&mut Value)) -> Result<()> {
        self.update_document(|doc| edit_path(doc, path, f))
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::tests::valid_config;
    use std::sync::Mutex;

    /// Store keeping the document in memory.
    pub(crate) struct MemoryStore {
        config: Mutex<Config>,
        pub(crate) saves: Mutex<usize>,
    }

    impl MemoryStore {
        pub(crate) fn new(config: Config) -> Self {
            Self {
                config: Mutex::new(config),
                saves: Mutex::new(0),
            }
        }
    }

    impl ConfigStore for MemoryStore {
        fn load(&self) -> Result<Config> {
            Ok(self.config.lock().unwrap().clone())
        }

        fn save(&self, config: &Config) -> Result<()> {
            *self.config.lock().unwrap() = config.clone();
            *self.saves.lock().unwrap() += 1;
            Ok(())
        }
    }

    fn temp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "growbox-hub-{}-{name}",
            std::process::id()
        ));
        fs::create_dir_all(&dir).unwrap();
        dir.join("growbox.toml")
    }

    fn doc(text: &str) -> Table {
        text.parse::<Table>().unwrap()
    }

    // -- Dotted paths -------------------------------------------------------

    #[test]
    fn get_nested_value() {
        let d = doc("[sensor_hub]\nmax_readings = 4\n");
        assert_eq!(
            get_path(&d, "sensor_hub.max_readings"),
            Some(&Value::Integer(4))
        );
        assert_eq!(get_path(&d, "sensor_hub.missing"), None);
        assert_eq!(get_path(&d, "sensor_hub.max_readings.deeper"), None);
    }

    #[test]
    fn set_creates_intermediate_tables() {
        let mut d = Table::new();
        set_path(&mut d, "plants.basil.pump_id", Value::from("pump_1")).unwrap();
        assert_eq!(
            get_path(&d, "plants.basil.pump_id"),
            Some(&Value::from("pump_1"))
        );
    }

    #[test]
    fn set_through_a_scalar_fails() {
        let mut d = doc("interval = 5\n");
        assert!(set_path(&mut d, "interval.ms", Value::Integer(1)).is_err());
        assert!(set_path(&mut d, "a..b", Value::Integer(1)).is_err());
    }

    #[test]
    fn append_skips_duplicates() {
        let mut d = Table::new();
        append_path(&mut d, "sensor_hub.subscribed_topics", Value::from("sensor/dht")).unwrap();
        append_path(&mut d, "sensor_hub.subscribed_topics", Value::from("sensor/dht")).unwrap();
        let arr = get_path(&d, "sensor_hub.subscribed_topics")
            .and_then(Value::as_array)
            .unwrap();
        assert_eq!(arr.len(), 1);
    }

    #[test]
    fn remove_returns_old_value() {
        let mut d = doc("[event]\nmax_watering_time_secs = 90\n");
        assert_eq!(
            remove_path(&mut d, "event.max_watering_time_secs").unwrap(),
            Some(Value::Integer(90))
        );
        assert_eq!(remove_path(&mut d, "event.nothing").unwrap(), None);
        assert_eq!(remove_path(&mut d, "nowhere.nothing").unwrap(), None);
    }

    #[test]
    fn edit_modifies_in_place() {
        let mut d = doc("[sensor_hub]\nmax_readings = 4\n");
        edit_path(&mut d, "sensor_hub.max_readings", |v| {
            *v = Value::Integer(v.as_integer().unwrap() * 2)
        })
        .unwrap();
        assert_eq!(
            get_path(&d, "sensor_hub.max_readings"),
            Some(&Value::Integer(8))
        );
        assert!(edit_path(&mut d, "sensor_hub", |_| {}).is_err());
        assert!(edit_path(&mut d, "sensor_hub.nothing", |_| {}).is_err());
    }

    // -- Settings -----------------------------------------------------------

    #[test]
    fn update_persists_valid_changes() {
        let settings = Settings::load(Box::new(MemoryStore::new(valid_config()))).unwrap();
        settings
            .update(|cfg| {
                cfg.sensor_hub.max_readings = 3;
                Ok(())
            })
            .unwrap();
        assert_eq!(settings.snapshot().sensor_hub.max_readings, 3);
        assert_eq!(settings.reload().unwrap().sensor_hub.max_readings, 3);
    }

    #[test]
    fn invalid_update_leaves_cache_untouched() {
        let settings = Settings::load(Box::new(MemoryStore::new(valid_config()))).unwrap();
        let err = settings
            .update(|cfg| {
                cfg.plants.get_mut("basil").unwrap().start_threshold = 90.0;
                Ok(())
            })
            .unwrap_err();
        assert!(format!("{err:#}").contains("must be greater than start_threshold"));
        assert_eq!(settings.snapshot(), valid_config());
        assert_eq!(settings.reload().unwrap(), valid_config());
    }

    #[test]
    fn set_path_goes_through_typed_validation() {
        let settings = Settings::load(Box::new(MemoryStore::new(valid_config()))).unwrap();
        settings
            .set_path("plants.basil.stop_threshold", Value::Float(80.0))
            .unwrap();
        assert_eq!(settings.snapshot().plants["basil"].stop_threshold, 80.0);
        assert_eq!(
            settings.get_path("plants.basil.stop_threshold"),
            Some(Value::Float(80.0))
        );

        assert!(settings
            .set_path("sensor_hub.max_readings", Value::from("many"))
            .is_err());
        assert!(settings
            .set_path("plants.basil.stop_threshold", Value::Float(10.0))
            .is_err());
        assert_eq!(settings.snapshot().plants["basil"].stop_threshold, 80.0);
    }

    #[test]
    fn append_and_remove_paths() {
        let settings = Settings::load(Box::new(MemoryStore::new(valid_config()))).unwrap();
        settings
            .append_path("sensor_hub.subscribed_topics", Value::from("sensor/dht"))
            .unwrap();
        assert_eq!(
            settings.snapshot().sensor_hub.subscribed_topics,
            vec!["sensor/dht".to_string()]
        );
        settings
            .remove_path("event.moisture_check_interval_secs")
            .unwrap();
        settings.remove_path("plants.basil").unwrap();
        assert!(settings.snapshot().plants.is_empty());

        settings
            .edit_path("water_nutrient.total_water_ml", |v| {
                *v = Value::Float(v.as_float().unwrap() / 2.0)
            })
            .unwrap();
        assert_eq!(settings.snapshot().water_nutrient.total_water_ml, 4000.0);
    }

    // -- TomlFileStore ------------------------------------------------------

    #[test]
    fn missing_file_is_created_with_defaults() {
        let path = temp_path("missing");
        let _ = fs::remove_file(&path);
        let store = TomlFileStore::new(&path);

        let config = store.load().unwrap();
        assert_eq!(config, Config::default());
        assert!(path.exists());
        assert_eq!(store.load().unwrap(), Config::default());
    }

    #[test]
    fn file_round_trip() {
        let path = temp_path("round-trip");
        let store = TomlFileStore::new(&path);
        store.save(&valid_config()).unwrap();
        assert_eq!(store.load().unwrap(), valid_config());
    }

    #[test]
    fn invalid_file_is_rejected_with_path() {
        let path = temp_path("invalid");
        fs::write(&path, "[sensor_hub]\nmax_readings = 0\n").unwrap();
        let err = TomlFileStore::new(&path).load().unwrap_err();
        let msg = format!("{err:#}");
        assert!(msg.contains("invalid config file"), "got: {msg}");
        assert!(msg.contains("max_readings must be at least 1"), "got: {msg}");
    }
}
