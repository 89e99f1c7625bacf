//! Ciphers and their registry.
//!
//! An encrypted DAT is a 28-byte header (the UTF-16LE identity of the cipher
//! that wrote it) followed by the transformed payload. Definitions:
//!
//! ```toml
//! [[cipher]]
//! name = "111"
//! header = "Lineage2Ver111"
//! kind = "xor"
//! key = 0xAC
//!
//! [[cipher]]
//! name = "900"
//! header = "Lineage2Ver900"
//! kind = "sealed"
//! key = "<64 hex chars>"
//! compress = true
//! ```

pub mod aead;
pub mod memory;
pub mod xor;

use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{DatError, Result};
use memory::CipherMemory;

/// Length of the identity header in bytes.
pub const HEADER_LEN: usize = 28;
/// Length of the identity in UTF-16 units.
pub const IDENTITY_LEN: usize = HEADER_LEN / 2;

/// Cipher name meaning "whatever the file already uses".
pub const SOURCE_CIPHER: &str = "Source";

/// What a transform may bind its output to.
#[derive(Debug, Clone, Copy)]
pub struct CipherScope<'a> {
    pub header: &'a str,
    /// Lower-cased final path component.
    pub file_name: &'a str,
}

/// Body transform of one cipher kind.
pub trait ByteTransform: Send + Sync + fmt::Debug {
    fn decrypt(&self, scope: &CipherScope<'_>, body: &[u8]) -> Result<Vec<u8>>;
    fn encrypt(&self, scope: &CipherScope<'_>, plain: &[u8]) -> Result<Vec<u8>>;
}

pub fn encode_header(identity: &str) -> Vec<u8> {
    identity
        .encode_utf16()
        .flat_map(|u| u.to_le_bytes())
        .collect()
}

/// Identity stored in the first [`HEADER_LEN`] bytes of `raw`.
pub fn read_header(raw: &[u8]) -> Result<String> {
    if raw.len() < HEADER_LEN {
        return Err(DatError::MalformedBinary {
            offset: Some(raw.len()),
            message: format!("file too short for a header ({} bytes)", raw.len()),
        });
    }
    let units: Vec<u16> = raw[..HEADER_LEN]
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    String::from_utf16(&units).map_err(|_| DatError::binary(0, "header is not UTF-16"))
}

fn scope_file_name(file_name: &str) -> String {
    Path::new(file_name)
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_else(|| file_name.to_lowercase())
}

/// A named cipher with its header identity.
#[derive(Debug)]
pub struct DatCrypter {
    name: String,
    header: String,
    transform: Box<dyn ByteTransform>,
}

impl DatCrypter {
    pub fn new(name: impl Into<String>, header: impl Into<String>, transform: Box<dyn ByteTransform>) -> Self {
        Self {
            name: name.into(),
            header: header.into(),
            transform,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn header(&self) -> &str {
        &self.header
    }

    /// Header followed by the encrypted payload.
    pub fn encrypt_file(&self, file_name: &str, plain: &[u8]) -> Result<Vec<u8>> {
        let lower = scope_file_name(file_name);
        let scope = CipherScope {
            header: &self.header,
            file_name: &lower,
        };
        let body = self.transform.encrypt(&scope, plain)?;
        let mut out = encode_header(&self.header);
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Payload of a whole file written by this cipher.
    pub fn decrypt_file(&self, file_name: &str, raw: &[u8]) -> Result<Vec<u8>> {
        let identity = read_header(raw)?;
        if identity != self.header {
            return Err(DatError::binary(
                0,
                format!(
                    "header `{identity}` does not belong to cipher {} (`{}`)",
                    self.name, self.header
                ),
            ));
        }
        let lower = scope_file_name(file_name);
        let scope = CipherScope {
            header: &self.header,
            file_name: &lower,
        };
        self.transform.decrypt(&scope, &raw[HEADER_LEN..])
    }
}

/// The cipher the caller asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CipherChoice {
    /// Use the cipher the file already carries.
    Source,
    Named(String),
}

impl CipherChoice {
    /// `"Source"`, `"."` and the empty string all select [`CipherChoice::Source`].
    pub fn parse(choice: &str) -> Self {
        if is_source_choice(choice) {
            CipherChoice::Source
        } else {
            CipherChoice::Named(choice.trim().to_string())
        }
    }
}

impl fmt::Display for CipherChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CipherChoice::Source => f.write_str(SOURCE_CIPHER),
            CipherChoice::Named(n) => f.write_str(n),
        }
    }
}

pub fn is_source_choice(choice: &str) -> bool {
    let c = choice.trim();
    c.is_empty() || c == "." || c.eq_ignore_ascii_case(SOURCE_CIPHER)
}

#[derive(Deserialize)]
struct RawRoot {
    #[serde(default, rename = "cipher")]
    ciphers: Vec<toml::Value>,
}

#[derive(Deserialize)]
struct RawCipher {
    name: String,
    header: String,
    #[serde(flatten)]
    kind: CipherKind,
}

#[derive(Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum CipherKind {
    Xor {
        key: u8,
    },
    XorPosition {
        seed: u8,
    },
    XorFilename,
    Sealed {
        key: String,
        #[serde(default)]
        compress: bool,
    },
}

fn build_crypter(raw: RawCipher) -> std::result::Result<DatCrypter, String> {
    if raw.name.trim().is_empty() || is_source_choice(&raw.name) {
        return Err(format!("reserved cipher name `{}`", raw.name));
    }
    if raw.header.encode_utf16().count() != IDENTITY_LEN {
        return Err(format!(
            "header `{}` must be {IDENTITY_LEN} characters",
            raw.header
        ));
    }
    let transform: Box<dyn ByteTransform> = match raw.kind {
        CipherKind::Xor { key } => Box::new(xor::XorConst { key }),
        CipherKind::XorPosition { seed } => Box::new(xor::XorPosition { seed }),
        CipherKind::XorFilename => Box::new(xor::XorFileName),
        CipherKind::Sealed { key, compress } => {
            let bytes = hex::decode(key.trim()).map_err(|e| format!("sealed key is not hex: {e}"))?;
            let key: [u8; 32] = bytes
                .try_into()
                .map_err(|b: Vec<u8>| format!("sealed key must be 32 bytes, got {}", b.len()))?;
            Box::new(aead::Sealed::new(key, compress))
        }
    };
    Ok(DatCrypter::new(raw.name, raw.header, transform))
}

#[derive(Debug, Default)]
pub struct CipherRegistry {
    ciphers: Vec<Arc<DatCrypter>>,
}

impl CipherRegistry {
    pub fn parse(path: &Path) -> Result<Self> {
        let src = std::fs::read_to_string(path)
            .map_err(|e| DatError::config(path.display().to_string(), e.to_string()))?;
        Self::parse_str(&src, &path.display().to_string())
    }

    pub fn parse_str(src: &str, source_name: &str) -> Result<Self> {
        let root: RawRoot =
            toml::from_str(src).map_err(|e| DatError::config(source_name, e.to_string()))?;

        let mut reg = Self::default();
        for (idx, value) in root.ciphers.into_iter().enumerate() {
            let crypter = match value
                .try_into::<RawCipher>()
                .map_err(|e| e.to_string())
                .and_then(build_crypter)
            {
                Ok(c) => c,
                Err(msg) => {
                    warn!(source = source_name, index = idx, "skipping malformed cipher: {msg}");
                    continue;
                }
            };
            if let Err(msg) = reg.insert(crypter) {
                warn!(source = source_name, index = idx, "skipping cipher: {msg}");
            }
        }
        debug!(source = source_name, ciphers = reg.ciphers.len(), "ciphers loaded");
        Ok(reg)
    }

    /// Adds a cipher whose name and header are both unused.
    pub fn insert(&mut self, crypter: DatCrypter) -> std::result::Result<(), String> {
        if self.get_encrypt_key(&crypter.name).is_some() {
            return Err(format!("duplicate cipher name `{}`", crypter.name));
        }
        if self.by_header(&crypter.header).is_some() {
            return Err(format!(
                "header `{}` of cipher {} is already taken",
                crypter.header, crypter.name
            ));
        }
        self.ciphers.push(Arc::new(crypter));
        Ok(())
    }

    pub fn get_encrypt_key(&self, name: &str) -> Option<Arc<DatCrypter>> {
        let name = name.trim();
        self.ciphers
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
            .cloned()
    }

    /// Every cipher by name, in declaration order.
    pub fn get_encrypt_keys(&self) -> impl Iterator<Item = (&str, &Arc<DatCrypter>)> {
        self.ciphers.iter().map(|c| (c.name.as_str(), c))
    }

    pub fn by_header(&self, identity: &str) -> Option<Arc<DatCrypter>> {
        self.ciphers.iter().find(|c| c.header == identity).cloned()
    }

    /// Cipher that wrote `raw`, judged by its header.
    pub fn detect(&self, raw: &[u8], file_name: &str) -> Result<Arc<DatCrypter>> {
        let identity = read_header(raw)?;
        self.by_header(&identity)
            .ok_or_else(|| DatError::CipherNotFound {
                cipher: identity,
                file: file_name.to_string(),
            })
    }

    /// Name of the cipher last seen on `file`: the memory first, then the
    /// header of the file on disk. An unknown on-disk identity is returned
    /// as-is so resolution can report it.
    pub fn last_dat_crypter(&self, memory: &dyn CipherMemory, file: &Path) -> Option<String> {
        if let Some(name) = memory.get(file) {
            return Some(name);
        }
        let mut head = Vec::with_capacity(HEADER_LEN);
        File::open(file)
            .ok()?
            .take(HEADER_LEN as u64)
            .read_to_end(&mut head)
            .ok()?;
        let identity = read_header(&head).ok()?;
        Some(match self.by_header(&identity) {
            Some(c) => c.name.clone(),
            None => identity,
        })
    }

    /// Cipher to write `file` with. `Source` never falls back to another
    /// cipher: with nothing recorded it is [`DatError::CipherNotFound`].
    pub fn resolve(
        &self,
        choice: &CipherChoice,
        memory: &dyn CipherMemory,
        file: &Path,
    ) -> Result<Arc<DatCrypter>> {
        let name = match choice {
            CipherChoice::Named(n) => n.clone(),
            CipherChoice::Source => match self.last_dat_crypter(memory, file) {
                Some(n) => n,
                None => SOURCE_CIPHER.to_string(),
            },
        };
        self.get_encrypt_key(&name)
            .ok_or_else(|| DatError::CipherNotFound {
                cipher: name,
                file: file.display().to_string(),
            })
    }
}
