//! File operations, both as plain functions and as runnable [`Action`]s.

pub mod batch;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::chronicle::DescriptorRegistry;
use crate::chronicle::descriptor::Descriptor;
use crate::codec::DatCodec;
use crate::config::Settings;
use crate::crypto::memory::{CipherMemory, FileMemory, SessionMemory};
use crate::crypto::{CipherChoice, CipherRegistry, DatCrypter};
use crate::error::{DatError, Result};
use crate::task::{Action, Document, TaskContext};
use crate::util::atomic::write_atomic;

pub use batch::{BatchReport, MassPack, MassRecrypt, MassUnpack};

/// Registries shared by every operation of the process.
#[derive(Clone)]
pub struct Registries {
    pub descriptors: Arc<DescriptorRegistry>,
    pub ciphers: Arc<CipherRegistry>,
    pub memory: Arc<dyn CipherMemory>,
}

impl Registries {
    pub fn new(
        descriptors: DescriptorRegistry,
        ciphers: CipherRegistry,
        memory: Arc<dyn CipherMemory>,
    ) -> Self {
        Self {
            descriptors: Arc::new(descriptors),
            ciphers: Arc::new(ciphers),
            memory,
        }
    }

    /// Loads both definition files named by `settings`. Either being
    /// unreadable is fatal.
    pub fn load(settings: &Settings) -> Result<Self> {
        let descriptors = DescriptorRegistry::parse(&settings.descriptors)?;
        let ciphers = CipherRegistry::parse(&settings.ciphers)?;
        let memory: Arc<dyn CipherMemory> = match &settings.cipher_memory {
            Some(path) => Arc::new(FileMemory::open(path)?),
            None => Arc::new(SessionMemory::new()),
        };
        Ok(Self::new(descriptors, ciphers, memory))
    }

    pub fn descriptor_for(&self, chronicle: &str, file: &Path) -> Result<Arc<Descriptor>> {
        self.descriptors.require_chronicle(chronicle)?;
        let name = file_name(file);
        self.descriptors
            .find_descriptor_for_file(chronicle, &name)
            .ok_or_else(|| DatError::DescriptorNotFound {
                chronicle: chronicle.to_string(),
                file: name,
            })
    }

    /// Cipher to write `file` with. No choice at all means the chronicle's
    /// default cipher, or the file's own when the chronicle has none.
    pub fn cipher_for_write(
        &self,
        choice: Option<&CipherChoice>,
        chronicle: Option<&str>,
        file: &Path,
    ) -> Result<Arc<DatCrypter>> {
        let default;
        let choice = match choice {
            Some(c) => c,
            None => {
                default = chronicle
                    .and_then(|c| self.descriptors.chronicle(c))
                    .and_then(|c| c.default_cipher.as_deref())
                    .map(CipherChoice::parse)
                    .unwrap_or(CipherChoice::Source);
                &default
            }
        };
        self.ciphers.resolve(choice, self.memory.as_ref(), file)
    }

    /// Cipher to read `raw` with: a named one must match the header,
    /// otherwise the header decides.
    pub fn cipher_for_read(
        &self,
        choice: Option<&CipherChoice>,
        raw: &[u8],
        file: &Path,
    ) -> Result<Arc<DatCrypter>> {
        match choice {
            Some(CipherChoice::Named(name)) => {
                self.ciphers
                    .get_encrypt_key(name)
                    .ok_or_else(|| DatError::CipherNotFound {
                        cipher: name.clone(),
                        file: file.display().to_string(),
                    })
            }
            Some(CipherChoice::Source) | None => {
                self.ciphers.detect(raw, &file.display().to_string())
            }
        }
    }
}

/// Base name used for descriptor matching and cipher scoping.
pub fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

// a lost hint is logged, never fatal
fn remember(reg: &Registries, path: &Path, cipher: &str) {
    if let Err(e) = reg.memory.record(path, cipher) {
        warn!(file = %path.display(), error = %e, "cannot record cipher");
    }
}

/// A decoded DAT file.
#[derive(Debug, Clone)]
pub struct Opened {
    pub text: String,
    pub cipher: String,
    pub records: usize,
}

/// Decrypts and decodes `path`, remembering the cipher that opened it.
pub fn open_dat(
    reg: &Registries,
    chronicle: &str,
    choice: Option<&CipherChoice>,
    path: &Path,
    ctx: &mut TaskContext,
    weight: f64,
) -> Result<Opened> {
    let descriptor = reg.descriptor_for(chronicle, path)?;
    let raw = std::fs::read(path)?;
    ctx.add_progress(weight * 0.1, 100.0);

    let cipher = reg.cipher_for_read(choice, &raw, path)?;
    let payload = cipher.decrypt_file(&file_name(path), &raw)?;
    ctx.add_progress(weight * 0.1, 100.0);

    let codec = DatCodec::new(&descriptor);
    let records = codec.decode(&payload, ctx, weight * 0.7)?;
    let text = codec.render(&records);
    ctx.add_progress(weight * 0.1, 100.0);

    remember(reg, path, cipher.name());
    debug!(file = %path.display(), cipher = cipher.name(), records = records.len(), "opened");
    Ok(Opened {
        text,
        cipher: cipher.name().to_string(),
        records: records.len(),
    })
}

/// Atomically writes decoded text.
pub fn save_txt(path: &Path, text: &str) -> Result<()> {
    write_atomic(path, text.as_bytes())
}

/// Encodes `text`, encrypts it and atomically replaces `path`. Returns the
/// cipher used. Nothing is written once the task is cancelled.
pub fn save_dat(
    reg: &Registries,
    chronicle: &str,
    choice: Option<&CipherChoice>,
    path: &Path,
    text: &str,
    ctx: &mut TaskContext,
    weight: f64,
) -> Result<String> {
    let descriptor = reg.descriptor_for(chronicle, path)?;
    let cipher = reg.cipher_for_write(choice, Some(chronicle), path)?;

    let codec = DatCodec::new(&descriptor);
    let records = codec.parse_text(text, ctx, weight * 0.6)?;
    let payload = codec.encode(&records)?;
    let raw = cipher.encrypt_file(&file_name(path), &payload)?;
    ctx.add_progress(weight * 0.2, 100.0);

    ctx.checkpoint()?;
    write_atomic(path, &raw)?;
    remember(reg, path, cipher.name());
    ctx.add_progress(weight * 0.2, 100.0);
    debug!(file = %path.display(), cipher = cipher.name(), records = records.len(), "saved");
    Ok(cipher.name().to_string())
}

/// Opens one DAT and hands its text to the presentation layer.
pub struct OpenDat {
    pub registries: Registries,
    pub chronicle: String,
    pub cipher: Option<CipherChoice>,
    pub path: PathBuf,
}

impl Action for OpenDat {
    fn name(&self) -> String {
        format!("open {}", self.path.display())
    }

    fn run(&self, ctx: &mut TaskContext) -> Result<()> {
        let opened = open_dat(
            &self.registries,
            &self.chronicle,
            self.cipher.as_ref(),
            &self.path,
            ctx,
            100.0,
        )?;
        ctx.log(format!(
            "Opened {} ({} records, cipher {})",
            self.path.display(),
            opened.records,
            opened.cipher
        ));
        ctx.document(Document {
            path: self.path.clone(),
            cipher: opened.cipher,
            text: opened.text,
        });
        Ok(())
    }
}

pub struct SaveTxt {
    pub path: PathBuf,
    pub text: String,
}

impl Action for SaveTxt {
    fn name(&self) -> String {
        format!("save {}", self.path.display())
    }

    fn run(&self, ctx: &mut TaskContext) -> Result<()> {
        ctx.checkpoint()?;
        save_txt(&self.path, &self.text)?;
        ctx.log(format!("Saved {}", self.path.display()));
        Ok(())
    }
}

pub struct SaveDat {
    pub registries: Registries,
    pub chronicle: String,
    pub cipher: Option<CipherChoice>,
    pub path: PathBuf,
    pub text: String,
}

impl Action for SaveDat {
    fn name(&self) -> String {
        format!("save {}", self.path.display())
    }

    fn run(&self, ctx: &mut TaskContext) -> Result<()> {
        let cipher = save_dat(
            &self.registries,
            &self.chronicle,
            self.cipher.as_ref(),
            &self.path,
            &self.text,
            ctx,
            100.0,
        )?;
        ctx.log(format!("Saved {} with cipher {cipher}", self.path.display()));
        Ok(())
    }
}
