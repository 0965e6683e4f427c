//! Runtime-adjustable configuration persisted to the module's TOML file.
//!
//! Console `set` commands update a value here and save the file, so the
//! change survives a restart. Writes go to a temporary file first and are
//! renamed into place.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to render config file: {0}")]
    Render(#[from] toml::ser::Error),
}

/// A TOML table that can be read, mutated, and written back atomically.
#[derive(Debug)]
pub struct RuntimeConfig {
    path: PathBuf,
    table: Mutex<toml::Table>,
}

impl RuntimeConfig {
    /// Load the file at `path`. A missing file yields an empty table so a
    /// fresh deployment can still persist console changes.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let table = match std::fs::read_to_string(&path) {
            Ok(text) => text.parse::<toml::Table>()?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => toml::Table::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            table: Mutex::new(table),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get_str(&self, key: &str) -> Option<String> {
        self.table
            .lock()
            .get(key)
            .and_then(|v| v.as_str().map(ToOwned::to_owned))
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.table.lock().get(key).and_then(toml::Value::as_integer)
    }

    pub fn set(&self, key: &str, value: impl Into<toml::Value>) {
        self.table.lock().insert(key.to_string(), value.into());
    }

    /// Serialize the table and rename it into place.
    pub async fn save(&self) -> Result<(), ConfigError> {
        let rendered = toml::to_string_pretty(&self.table.lock().clone())?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, rendered).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}
