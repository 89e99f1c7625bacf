//! Chronicles and the descriptors they bind to DAT file names.
//!
//! Definitions come from one TOML document loaded at startup:
//!
//! ```toml
//! [[chronicle]]
//! name = "Interlude"
//! extends = "C4"            # optional, must be declared earlier
//!                           # (inherits descriptors and default_cipher)
//! default_cipher = "413"    # optional
//!
//! [[chronicle.descriptor]]
//! name = "npcgrp"
//! files = ["*Grp.dat"]
//!
//! [[chronicle.descriptor.field]]
//! name = "id"
//! type = "u32"
//! ```
//!
//! A definition that cannot be read as TOML fails the whole load. A single
//! malformed chronicle or descriptor is skipped with a warning.

pub mod descriptor;

use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{DatError, Result};
use descriptor::{MatchKind, build_descriptor};

pub use descriptor::{CountType, Descriptor, FieldSpec, FieldType, ScalarType};

#[derive(Debug, Clone)]
pub struct Chronicle {
    pub name: String,
    pub default_cipher: Option<String>,
    descriptors: Vec<Arc<Descriptor>>,
}

impl Chronicle {
    pub fn descriptors(&self) -> &[Arc<Descriptor>] {
        &self.descriptors
    }
}

#[derive(Deserialize)]
struct RawRoot {
    #[serde(default, rename = "chronicle")]
    chronicles: Vec<toml::Value>,
}

#[derive(Deserialize)]
struct RawChronicle {
    name: String,
    extends: Option<String>,
    default_cipher: Option<String>,
    #[serde(default, rename = "descriptor")]
    descriptors: Vec<toml::Value>,
}

#[derive(Debug, Default)]
pub struct DescriptorRegistry {
    chronicles: Vec<Chronicle>,
}

impl DescriptorRegistry {
    pub fn parse(path: &Path) -> Result<Self> {
        let src = std::fs::read_to_string(path)
            .map_err(|e| DatError::config(path.display().to_string(), e.to_string()))?;
        Self::parse_str(&src, &path.display().to_string())
    }

    pub fn parse_str(src: &str, source_name: &str) -> Result<Self> {
        let root: RawRoot =
            toml::from_str(src).map_err(|e| DatError::config(source_name, e.to_string()))?;

        let mut chronicles: Vec<Chronicle> = Vec::with_capacity(root.chronicles.len());
        for (idx, value) in root.chronicles.into_iter().enumerate() {
            let raw = match value.try_into::<RawChronicle>() {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(source = source_name, index = idx, error = %e, "skipping malformed chronicle");
                    continue;
                }
            };
            if chronicles.iter().any(|c| c.name.eq_ignore_ascii_case(&raw.name)) {
                warn!(chronicle = %raw.name, "skipping duplicate chronicle");
                continue;
            }

            let (mut descriptors, inherited_cipher) = match &raw.extends {
                Some(parent) => match chronicles
                    .iter()
                    .find(|c| c.name.eq_ignore_ascii_case(parent))
                {
                    Some(p) => (p.descriptors.clone(), p.default_cipher.clone()),
                    None => {
                        warn!(chronicle = %raw.name, extends = %parent, "skipping chronicle with unknown parent");
                        continue;
                    }
                },
                None => (Vec::new(), None),
            };

            for value in raw.descriptors {
                match build_descriptor(value) {
                    Ok(d) => {
                        let d = Arc::new(d);
                        // a redefinition by name replaces the inherited one in place
                        match descriptors
                            .iter_mut()
                            .find(|e| e.name.eq_ignore_ascii_case(&d.name))
                        {
                            Some(slot) => *slot = d,
                            None => descriptors.push(d),
                        }
                    }
                    Err(msg) => {
                        warn!(chronicle = %raw.name, "skipping malformed descriptor: {msg}");
                    }
                }
            }

            debug!(chronicle = %raw.name, descriptors = descriptors.len(), "chronicle loaded");
            chronicles.push(Chronicle {
                name: raw.name,
                default_cipher: raw.default_cipher.or(inherited_cipher),
                descriptors,
            });
        }

        Ok(Self { chronicles })
    }

    /// Chronicle names in declaration order.
    pub fn chronicle_names(&self) -> impl Iterator<Item = &str> {
        self.chronicles.iter().map(|c| c.name.as_str())
    }

    pub fn chronicle(&self, name: &str) -> Option<&Chronicle> {
        self.chronicles
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Like [`chronicle`](Self::chronicle) but reports an unknown name.
    pub fn require_chronicle(&self, name: &str) -> Result<&Chronicle> {
        self.chronicle(name)
            .ok_or_else(|| DatError::ChronicleNotFound(name.to_string()))
    }

    /// The descriptor bound to `file_name` under `chronicle`, if any.
    ///
    /// Only the final path component is matched. A `.txt` name is looked up
    /// as the `.dat` it was unpacked from. An exact pattern beats a glob;
    /// between globs the first declared wins.
    pub fn find_descriptor_for_file(
        &self,
        chronicle: &str,
        file_name: &str,
    ) -> Option<Arc<Descriptor>> {
        let chronicle = self.chronicle(chronicle)?;
        let lower = descriptor_file_name(file_name);

        let mut best: Option<(MatchKind, &Arc<Descriptor>)> = None;
        let mut ambiguous = false;
        for d in &chronicle.descriptors {
            let Some(kind) = d.match_kind(&lower) else {
                continue;
            };
            match best {
                None => best = Some((kind, d)),
                Some((held, _)) if kind < held => {
                    best = Some((kind, d));
                    ambiguous = false;
                }
                Some((held, _)) if kind == held => ambiguous = true,
                Some(_) => {}
            }
        }
        let (_, found) = best?;
        if ambiguous {
            warn!(
                chronicle = %chronicle.name,
                file = file_name,
                descriptor = %found.name,
                "several descriptors match; using the first declared"
            );
        }
        Some(Arc::clone(found))
    }
}

fn descriptor_file_name(file_name: &str) -> String {
    let base = Path::new(file_name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| file_name.to_string());
    let lower = base.to_lowercase();
    match lower.strip_suffix(".txt") {
        Some(stem) => format!("{stem}.dat"),
        None => lower,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEFS: &str = r#"
        [[chronicle]]
        name = "C4"
        default_cipher = "413"

        [[chronicle.descriptor]]
        name = "grp"
        files = ["*Grp.dat"]
        [[chronicle.descriptor.field]]
        name = "id"
        type = "u32"

        [[chronicle.descriptor]]
        name = "broken"
        files = ["broken.dat"]
        [[chronicle.descriptor.field]]
        name = "id"
        type = "nonsense"

        [[chronicle]]
        name = "Interlude"
        extends = "C4"

        [[chronicle.descriptor]]
        name = "npcgrp"
        files = ["NpcGrp.dat"]
        [[chronicle.descriptor.field]]
        name = "npc_id"
        type = "u32"
        [[chronicle.descriptor.field]]
        name = "name"
        type = "ascf"

        [[chronicle]]
        name = "Orphan"
        extends = "Nowhere"
    "#;

    #[test]
    fn chronicle_order_is_declaration_order() {
        let reg = DescriptorRegistry::parse_str(DEFS, "test").unwrap();
        let names: Vec<_> = reg.chronicle_names().collect();
        assert_eq!(names, ["C4", "Interlude"]);
    }

    #[test]
    fn malformed_descriptor_is_skipped() {
        let reg = DescriptorRegistry::parse_str(DEFS, "test").unwrap();
        assert!(reg.find_descriptor_for_file("C4", "broken.dat").is_none());
        assert_eq!(reg.chronicle("C4").unwrap().descriptors().len(), 1);
    }

    #[test]
    fn exact_pattern_beats_inherited_glob() {
        let reg = DescriptorRegistry::parse_str(DEFS, "test").unwrap();
        let d = reg
            .find_descriptor_for_file("Interlude", "NpcGrp.dat")
            .unwrap();
        assert_eq!(d.name, "npcgrp");
        let d = reg
            .find_descriptor_for_file("Interlude", "ItemGrp.dat")
            .unwrap();
        assert_eq!(d.name, "grp");
    }

    #[test]
    fn text_names_resolve_to_their_dat() {
        let reg = DescriptorRegistry::parse_str(DEFS, "test").unwrap();
        let d = reg
            .find_descriptor_for_file("interlude", "/tmp/out/npcgrp.txt")
            .unwrap();
        assert_eq!(d.name, "npcgrp");
    }

    #[test]
    fn unmatched_file_is_none() {
        let reg = DescriptorRegistry::parse_str(DEFS, "test").unwrap();
        assert!(reg.find_descriptor_for_file("C4", "L2.ini").is_none());
        assert!(reg.find_descriptor_for_file("Gracia", "NpcGrp.dat").is_none());
    }

    #[test]
    fn default_cipher_is_inherited() {
        let reg = DescriptorRegistry::parse_str(DEFS, "test").unwrap();
        let interlude = reg.chronicle("interlude").unwrap();
        assert_eq!(interlude.default_cipher.as_deref(), Some("413"));
    }

    #[test]
    fn unreadable_source_is_fatal() {
        let err = DescriptorRegistry::parse_str("[[chronicle]\nname=", "broken.toml").unwrap_err();
        assert!(matches!(err, DatError::ConfigLoad { .. }));
    }
}
