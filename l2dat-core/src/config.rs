use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{DatError, Result};

/// Process settings, read once at startup.
///
/// ```toml
/// descriptors = "descriptors.toml"
/// ciphers = "ciphers.toml"
/// chronicle = "Interlude"
/// cipher = "Source"
/// worker_threads = 4
/// cipher_memory = "ciphers.cbor"
/// ```
///
/// Relative paths are taken relative to the settings file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub descriptors: PathBuf,
    pub ciphers: PathBuf,
    /// Chronicle used when the caller names none.
    pub chronicle: Option<String>,
    /// Cipher choice used when the caller names none.
    pub cipher: Option<String>,
    /// 0 lets the pool size itself.
    pub worker_threads: usize,
    /// Where detected ciphers are remembered between runs. In-memory only
    /// when unset.
    pub cipher_memory: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            descriptors: PathBuf::from("config/descriptors.toml"),
            ciphers: PathBuf::from("config/ciphers.toml"),
            chronicle: None,
            cipher: None,
            worker_threads: 0,
            cipher_memory: None,
        }
    }
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self> {
        let src = std::fs::read_to_string(path)
            .map_err(|e| DatError::config(path.display().to_string(), e.to_string()))?;
        let mut settings = Self::from_toml(&src, &path.display().to_string())?;
        if let Some(base) = path.parent() {
            settings.rebase(base);
        }
        Ok(settings)
    }

    pub fn from_toml(src: &str, source_name: &str) -> Result<Self> {
        toml::from_str(src).map_err(|e| DatError::config(source_name, e.to_string()))
    }

    fn rebase(&mut self, base: &Path) {
        let fix = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        fix(&mut self.descriptors);
        fix(&mut self.ciphers);
        if let Some(m) = self.cipher_memory.as_mut() {
            fix(m);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_key_is_optional() {
        let s = Settings::from_toml("", "empty").unwrap();
        assert_eq!(s.descriptors, PathBuf::from("config/descriptors.toml"));
        assert_eq!(s.worker_threads, 0);
        assert!(s.cipher_memory.is_none());
    }

    #[test]
    fn unknown_key_is_a_config_error() {
        let err = Settings::from_toml("workers = 3", "l2dat.toml").unwrap_err();
        assert!(matches!(err, DatError::ConfigLoad { .. }));
    }

    #[test]
    fn paths_are_relative_to_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("l2dat.toml");
        std::fs::write(
            &file,
            "descriptors = \"defs/descriptors.toml\"\nciphers = \"/etc/l2dat/ciphers.toml\"\ncipher_memory = \"memory.cbor\"\nchronicle = \"Interlude\"\n",
        )
        .unwrap();
        let s = Settings::load(&file).unwrap();
        assert_eq!(s.descriptors, dir.path().join("defs/descriptors.toml"));
        assert_eq!(s.ciphers, PathBuf::from("/etc/l2dat/ciphers.toml"));
        assert_eq!(s.cipher_memory, Some(dir.path().join("memory.cbor")));
        assert_eq!(s.chronicle.as_deref(), Some("Interlude"));
    }
}
