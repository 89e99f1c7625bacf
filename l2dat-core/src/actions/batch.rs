//! Whole-directory conversions.
//!
//! A batch visits the files of one directory (not recursing) whose extension
//! matches, converts each, and logs and skips files that fail. Only an
//! unreadable directory or cancellation ends a batch early.

use std::path::{Path, PathBuf};

use tracing::{debug, info};
use walkdir::WalkDir;

use super::{Registries, file_name, open_dat, remember, save_dat, save_txt};
use crate::crypto::CipherChoice;
use crate::error::{DatError, Result};
use crate::task::{Action, TaskContext};
use crate::util::atomic::write_atomic;

const SCAN_WEIGHT: f64 = 10.0;
const CONVERT_WEIGHT: f64 = 90.0;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub converted: usize,
    pub failed: usize,
}

/// Files directly in `dir` with extension `ext` (any case), sorted by name.
pub fn list_files(dir: &Path, ext: &str) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
    {
        let entry = entry.map_err(|e| {
            DatError::Io(
                e.into_io_error()
                    .unwrap_or_else(|| std::io::Error::other("directory walk failed")),
            )
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let matches = entry
            .path()
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case(ext));
        if matches {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

fn run_batch(
    ctx: &mut TaskContext,
    dir: &Path,
    ext: &str,
    mut convert: impl FnMut(&Path, &mut TaskContext, f64) -> Result<()>,
) -> Result<BatchReport> {
    let files = list_files(dir, ext)?;
    ctx.add_progress(SCAN_WEIGHT, 100.0);
    info!(dir = %dir.display(), files = files.len(), "batch started");

    let mut report = BatchReport::default();
    let share = if files.is_empty() {
        0.0
    } else {
        CONVERT_WEIGHT / files.len() as f64
    };
    for (i, file) in files.iter().enumerate() {
        ctx.checkpoint()?;
        match convert(file, ctx, share) {
            Ok(()) => report.converted += 1,
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => {
                report.failed += 1;
                debug!(file = %file.display(), "conversion failed");
                ctx.log(format!("{}: {e}", file_name(file)));
            }
        }
        ctx.set_progress(SCAN_WEIGHT + share * (i + 1) as f64);
    }
    Ok(report)
}

/// Every `.dat` in `dir` to a `.txt` beside it.
pub fn unpack_dir(
    reg: &Registries,
    chronicle: &str,
    choice: Option<&CipherChoice>,
    dir: &Path,
    ctx: &mut TaskContext,
) -> Result<BatchReport> {
    reg.descriptors.require_chronicle(chronicle)?;
    run_batch(ctx, dir, "dat", |path, ctx, weight| {
        let opened = open_dat(reg, chronicle, choice, path, ctx, weight)?;
        ctx.checkpoint()?;
        save_txt(&path.with_extension("txt"), &opened.text)
    })
}

/// Every `.txt` in `dir` to a `.dat` beside it.
pub fn pack_dir(
    reg: &Registries,
    chronicle: &str,
    choice: Option<&CipherChoice>,
    dir: &Path,
    ctx: &mut TaskContext,
) -> Result<BatchReport> {
    reg.descriptors.require_chronicle(chronicle)?;
    run_batch(ctx, dir, "txt", |path, ctx, weight| {
        let text = std::fs::read_to_string(path)?;
        save_dat(reg, chronicle, choice, &path.with_extension("dat"), &text, ctx, weight)?;
        Ok(())
    })
}

/// Re-encrypts every `.dat` in `dir` in place.
pub fn recrypt_dir(
    reg: &Registries,
    choice: Option<&CipherChoice>,
    dir: &Path,
    ctx: &mut TaskContext,
) -> Result<BatchReport> {
    run_batch(ctx, dir, "dat", |path, ctx, weight| {
        let name = file_name(path);
        let raw = std::fs::read(path)?;
        let source = reg.ciphers.detect(&raw, &name)?;
        let target = reg.cipher_for_write(choice, None, path)?;
        let payload = source.decrypt_file(&name, &raw)?;
        ctx.add_progress(weight * 0.5, 100.0);

        let out = target.encrypt_file(&name, &payload)?;
        ctx.checkpoint()?;
        write_atomic(path, &out)?;
        remember(reg, path, target.name());
        ctx.add_progress(weight * 0.5, 100.0);
        Ok(())
    })
}

fn log_report(ctx: &TaskContext, verb: &str, dir: &Path, report: BatchReport) {
    ctx.log(format!(
        "{verb} {} files in {} ({} failed)",
        report.converted,
        dir.display(),
        report.failed
    ));
}

pub struct MassUnpack {
    pub registries: Registries,
    pub chronicle: String,
    pub cipher: Option<CipherChoice>,
    pub dir: PathBuf,
}

impl Action for MassUnpack {
    fn name(&self) -> String {
        format!("unpack {}", self.dir.display())
    }

    fn run(&self, ctx: &mut TaskContext) -> Result<()> {
        let report = unpack_dir(
            &self.registries,
            &self.chronicle,
            self.cipher.as_ref(),
            &self.dir,
            ctx,
        )?;
        log_report(ctx, "Unpacked", &self.dir, report);
        Ok(())
    }
}

pub struct MassPack {
    pub registries: Registries,
    pub chronicle: String,
    pub cipher: Option<CipherChoice>,
    pub dir: PathBuf,
}

impl Action for MassPack {
    fn name(&self) -> String {
        format!("pack {}", self.dir.display())
    }

    fn run(&self, ctx: &mut TaskContext) -> Result<()> {
        let report = pack_dir(
            &self.registries,
            &self.chronicle,
            self.cipher.as_ref(),
            &self.dir,
            ctx,
        )?;
        log_report(ctx, "Packed", &self.dir, report);
        Ok(())
    }
}

pub struct MassRecrypt {
    pub registries: Registries,
    pub cipher: Option<CipherChoice>,
    pub dir: PathBuf,
}

impl Action for MassRecrypt {
    fn name(&self) -> String {
        format!("recrypt {}", self.dir.display())
    }

    fn run(&self, ctx: &mut TaskContext) -> Result<()> {
        let report = recrypt_dir(&self.registries, self.cipher.as_ref(), &self.dir, ctx)?;
        log_report(ctx, "Recrypted", &self.dir, report);
        Ok(())
    }
}
