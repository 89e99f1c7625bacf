use std::path::{Path, PathBuf};
use std::sync::Arc;

use l2dat_core::actions::file_name;
use l2dat_core::error::{DatError, Result};
use l2dat_core::validate::{LatestValidation, ValidationRequest, ValidationScheduler};
use l2dat_core::{MassPack, MassRecrypt, MassUnpack, OpenDat, SaveDat, SaveTxt, ValidationResult};

use super::Session;

fn open_document(session: &Session, file: &Path) -> Result<String> {
    let docs = session.run_task(Box::new(OpenDat {
        registries: session.registries.clone(),
        chronicle: session.chronicle()?.to_string(),
        cipher: session.cipher.clone(),
        path: file.to_path_buf(),
    }))?;
    docs.into_iter()
        .next()
        .map(|doc| doc.text)
        .ok_or_else(|| DatError::Runtime(format!("{}: no document produced", file.display())))
}

pub fn handle_chronicles(session: &Session) -> Result<()> {
    let registry = &session.registries.descriptors;
    for name in registry.chronicle_names() {
        let Some(chronicle) = registry.chronicle(name) else {
            continue;
        };
        match &chronicle.default_cipher {
            Some(cipher) => println!("{name} (default cipher {cipher})"),
            None => println!("{name}"),
        }
        for d in chronicle.descriptors() {
            println!("  {:<16} {:>3} fields  {}", d.name, d.fields.len(), d.patterns.join(", "));
        }
    }
    Ok(())
}

pub fn handle_ciphers(session: &Session) -> Result<()> {
    for (name, crypter) in session.registries.ciphers.get_encrypt_keys() {
        println!("{name:<12} {}", crypter.header());
    }
    Ok(())
}

pub fn handle_open(session: &Session, file: PathBuf, out: Option<PathBuf>) -> Result<()> {
    let text = open_document(session, &file)?;
    match out {
        Some(out) => session
            .run_task(Box::new(SaveTxt { path: out, text }))
            .map(|_| ()),
        None => {
            print!("{text}");
            Ok(())
        }
    }
}

pub fn handle_save_txt(session: &Session, file: PathBuf, out: Option<PathBuf>) -> Result<()> {
    let text = open_document(session, &file)?;
    let path = out.unwrap_or_else(|| file.with_extension("txt"));
    session.run_task(Box::new(SaveTxt { path, text }))?;
    Ok(())
}

pub fn handle_save_dat(session: &Session, text: PathBuf, out: Option<PathBuf>) -> Result<()> {
    let body = std::fs::read_to_string(&text)?;
    let path = out.unwrap_or_else(|| text.with_extension("dat"));
    session.run_task(Box::new(SaveDat {
        registries: session.registries.clone(),
        chronicle: session.chronicle()?.to_string(),
        cipher: session.cipher.clone(),
        path,
        text: body,
    }))?;
    Ok(())
}

pub fn handle_validate(session: &Session, text: PathBuf, dry_run: bool) -> Result<()> {
    let body: Arc<str> = std::fs::read_to_string(&text)?.into();
    let target = text.with_extension("dat");
    let chronicle = session.chronicle()?;
    let descriptor = session.registries.descriptor_for(chronicle, &target)?;

    let result = match resolve_cipher(session, chronicle, &target, dry_run) {
        Err(e) => ValidationResult::from_error(&e),
        Ok(cipher) => {
            let (scheduler, results) = ValidationScheduler::new(session.runner.validation_pool());
            scheduler.submit(ValidationRequest {
                file: file_name(&target),
                descriptor,
                cipher,
                text: body,
                dry_run,
            });
            let mut latest = LatestValidation::new();
            let (seq, result) = results
                .recv()
                .map_err(|_| DatError::Runtime("validation worker stopped".into()))?;
            latest.apply(seq, result);
            latest.result().cloned().unwrap_or_else(ValidationResult::ok)
        }
    };

    match result.format_message() {
        None => {
            eprintln!("validate: OK");
            Ok(())
        }
        Some(message) => {
            println!("{message}");
            Err(DatError::Runtime(format!("{} is not valid", text.display())))
        }
    }
}

fn resolve_cipher(
    session: &Session,
    chronicle: &str,
    target: &Path,
    dry_run: bool,
) -> Result<Option<Arc<l2dat_core::DatCrypter>>> {
    if dry_run {
        return Ok(None);
    }
    session
        .registries
        .cipher_for_write(session.cipher.as_ref(), Some(chronicle), target)
        .map(Some)
}

pub fn handle_unpack(session: &Session, dir: PathBuf) -> Result<()> {
    session.run_task(Box::new(MassUnpack {
        registries: session.registries.clone(),
        chronicle: session.chronicle()?.to_string(),
        cipher: session.cipher.clone(),
        dir,
    }))?;
    Ok(())
}

pub fn handle_pack(session: &Session, dir: PathBuf) -> Result<()> {
    session.run_task(Box::new(MassPack {
        registries: session.registries.clone(),
        chronicle: session.chronicle()?.to_string(),
        cipher: session.cipher.clone(),
        dir,
    }))?;
    Ok(())
}

pub fn handle_recrypt(session: &Session, dir: PathBuf) -> Result<()> {
    session.run_task(Box::new(MassRecrypt {
        registries: session.registries.clone(),
        cipher: session.cipher.clone(),
        dir,
    }))?;
    Ok(())
}
