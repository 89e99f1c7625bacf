//! "Last cipher used" per file.
//!
//! The registry only asks for a name; where it is kept is up to the
//! implementation.

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::warn;

use crate::error::{DatError, Result};
use crate::util::atomic::write_atomic;

pub trait CipherMemory: Send + Sync {
    fn get(&self, file: &Path) -> Option<String>;
    fn record(&self, file: &Path, cipher: &str) -> Result<()>;
}

fn memory_key(file: &Path) -> String {
    let abs = std::path::absolute(file).unwrap_or_else(|_| file.to_path_buf());
    let key = abs.to_string_lossy();
    if cfg!(windows) {
        key.to_lowercase()
    } else {
        key.into_owned()
    }
}

/// Process-lifetime memory.
#[derive(Default)]
pub struct SessionMemory {
    entries: Mutex<HashMap<String, String>>,
}

impl SessionMemory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CipherMemory for SessionMemory {
    fn get(&self, file: &Path) -> Option<String> {
        self.entries.lock().get(&memory_key(file)).cloned()
    }

    fn record(&self, file: &Path, cipher: &str) -> Result<()> {
        self.entries
            .lock()
            .insert(memory_key(file), cipher.to_string());
        Ok(())
    }
}

/// CBOR-backed memory, rewritten atomically on every change.
pub struct FileMemory {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl FileMemory {
    /// A missing file starts empty; an unreadable one is discarded with a
    /// warning since it only holds hints.
    pub fn open(path: &Path) -> Result<Self> {
        let entries = match File::open(path) {
            Ok(f) => match ciborium::de::from_reader::<BTreeMap<String, String>, _>(f) {
                Ok(map) => map,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "discarding unreadable cipher memory");
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path: path.to_path_buf(),
            entries: Mutex::new(entries),
        })
    }
}

impl CipherMemory for FileMemory {
    fn get(&self, file: &Path) -> Option<String> {
        self.entries.lock().get(&memory_key(file)).cloned()
    }

    fn record(&self, file: &Path, cipher: &str) -> Result<()> {
        let mut entries = self.entries.lock();
        if entries.get(&memory_key(file)).map(String::as_str) == Some(cipher) {
            return Ok(());
        }
        entries.insert(memory_key(file), cipher.to_string());
        let mut buf = Vec::new();
        ciborium::ser::into_writer(&*entries, &mut buf)
            .map_err(|e| DatError::Runtime(format!("cipher memory encode: {e}")))?;
        write_atomic(&self.path, &buf)
    }
}
