use std::collections::HashSet;
use std::fmt;

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use serde::Deserialize;

/// Leaf value types. New client versions add types here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ScalarType {
    U8,
    U16,
    U32,
    I32,
    I64,
    F32,
    F64,
    /// Compact-length game string (Latin-1 or UTF-16).
    Ascf,
    /// u32 unit count + UTF-16LE.
    Utf16,
    /// Fixed-size raw bytes.
    Hex(usize),
}

impl ScalarType {
    /// Accepts `u8`..`f64`, `ascf`, `utf16` and `hex:<size>`.
    pub fn from_name(name: &str) -> Result<Self, String> {
        let lower = name.trim().to_ascii_lowercase();
        let ty = match lower.as_str() {
            "u8" | "uchar" => ScalarType::U8,
            "u16" | "ushort" => ScalarType::U16,
            "u32" | "uint" => ScalarType::U32,
            "i32" | "int" => ScalarType::I32,
            "i64" | "long" => ScalarType::I64,
            "f32" | "float" => ScalarType::F32,
            "f64" | "double" => ScalarType::F64,
            "ascf" => ScalarType::Ascf,
            "utf16" | "unicode" => ScalarType::Utf16,
            other => match other.strip_prefix("hex:") {
                Some(size) => {
                    let size: usize = size
                        .parse()
                        .map_err(|_| format!("invalid hex size in `{name}`"))?;
                    if size == 0 {
                        return Err(format!("hex size must be positive in `{name}`"));
                    }
                    ScalarType::Hex(size)
                }
                None => return Err(format!("unknown field type `{name}`")),
            },
        };
        Ok(ty)
    }
}

impl fmt::Display for ScalarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalarType::U8 => f.write_str("u8"),
            ScalarType::U16 => f.write_str("u16"),
            ScalarType::U32 => f.write_str("u32"),
            ScalarType::I32 => f.write_str("i32"),
            ScalarType::I64 => f.write_str("i64"),
            ScalarType::F32 => f.write_str("f32"),
            ScalarType::F64 => f.write_str("f64"),
            ScalarType::Ascf => f.write_str("ascf"),
            ScalarType::Utf16 => f.write_str("utf16"),
            ScalarType::Hex(n) => write!(f, "hex:{n}"),
        }
    }
}

/// Binary encoding of a list length or of the record count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CountType {
    U8,
    U16,
    #[default]
    U32,
    Compact,
}

impl CountType {
    pub fn from_name(name: &str) -> Result<Self, String> {
        match name.trim().to_ascii_lowercase().as_str() {
            "u8" => Ok(CountType::U8),
            "u16" => Ok(CountType::U16),
            "u32" => Ok(CountType::U32),
            "compact" => Ok(CountType::Compact),
            _ => Err(format!("unknown count type `{name}`")),
        }
    }

    /// Largest element count the encoding can carry.
    pub fn max(self) -> usize {
        match self {
            CountType::U8 => u8::MAX as usize,
            CountType::U16 => u16::MAX as usize,
            CountType::U32 => u32::MAX as usize,
            CountType::Compact => i32::MAX as usize,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldType {
    Scalar(ScalarType),
    /// Rendered `[a b c]`.
    List { of: ScalarType, count: CountType },
    /// Rendered `{a b c}`.
    Struct(Vec<ScalarType>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: String,
    pub ty: FieldType,
}

/// Schema for one DAT file type.
#[derive(Debug, Clone)]
pub struct Descriptor {
    pub name: String,
    pub patterns: Vec<String>,
    pub count: CountType,
    pub fields: Vec<FieldSpec>,
    exact: Vec<String>,
    globs: GlobSet,
}

/// How a file name matched a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum MatchKind {
    Exact,
    Glob,
}

impl Descriptor {
    pub(crate) fn match_kind(&self, lower_name: &str) -> Option<MatchKind> {
        if self.exact.iter().any(|e| e == lower_name) {
            Some(MatchKind::Exact)
        } else if self.globs.is_match(lower_name) {
            Some(MatchKind::Glob)
        } else {
            None
        }
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }
}

#[derive(Deserialize)]
struct RawField {
    name: String,
    #[serde(rename = "type")]
    ty: String,
    size: Option<usize>,
    of: Option<String>,
    count: Option<String>,
    members: Option<Vec<String>>,
}

#[derive(Deserialize)]
struct RawDescriptor {
    name: String,
    files: Vec<String>,
    count: Option<String>,
    #[serde(default, rename = "field")]
    fields: Vec<RawField>,
}

fn is_glob(pattern: &str) -> bool {
    pattern.contains(['*', '?', '[', '{'])
}

fn field_type(raw: &RawField) -> Result<FieldType, String> {
    let lower = raw.ty.trim().to_ascii_lowercase();
    match lower.as_str() {
        "list" => {
            let of = raw
                .of
                .as_deref()
                .ok_or_else(|| format!("list field `{}` needs `of`", raw.name))?;
            let of = element_type(of, raw.size)?;
            let count = match raw.count.as_deref() {
                Some(c) => CountType::from_name(c)?,
                None => CountType::U32,
            };
            Ok(FieldType::List { of, count })
        }
        "struct" => {
            let members = raw
                .members
                .as_ref()
                .filter(|m| !m.is_empty())
                .ok_or_else(|| format!("struct field `{}` needs `members`", raw.name))?;
            let members = members
                .iter()
                .map(|m| ScalarType::from_name(m))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(FieldType::Struct(members))
        }
        "hex" => {
            let size = raw
                .size
                .filter(|s| *s > 0)
                .ok_or_else(|| format!("hex field `{}` needs a positive `size`", raw.name))?;
            Ok(FieldType::Scalar(ScalarType::Hex(size)))
        }
        _ => Ok(FieldType::Scalar(ScalarType::from_name(&raw.ty)?)),
    }
}

fn element_type(name: &str, size: Option<usize>) -> Result<ScalarType, String> {
    if name.trim().eq_ignore_ascii_case("hex") {
        let size = size
            .filter(|s| *s > 0)
            .ok_or_else(|| "hex list elements need a positive `size`".to_string())?;
        return Ok(ScalarType::Hex(size));
    }
    ScalarType::from_name(name)
}

/// Build one descriptor from its TOML table. The error string explains
/// why the definition is skipped.
pub(crate) fn build_descriptor(value: toml::Value) -> Result<Descriptor, String> {
    let raw = value
        .try_into::<RawDescriptor>()
        .map_err(|e| e.to_string())?;
    if raw.fields.is_empty() {
        return Err(format!("descriptor `{}` has no fields", raw.name));
    }
    if raw.files.is_empty() {
        return Err(format!("descriptor `{}` has no file patterns", raw.name));
    }

    let mut seen = HashSet::new();
    let mut fields = Vec::with_capacity(raw.fields.len());
    for rf in &raw.fields {
        if rf.name.is_empty() || rf.name.contains(|c: char| c == '=' || c.is_whitespace()) {
            return Err(format!("invalid field name `{}`", rf.name));
        }
        if !seen.insert(rf.name.clone()) {
            return Err(format!("duplicate field `{}`", rf.name));
        }
        fields.push(FieldSpec {
            name: rf.name.clone(),
            ty: field_type(rf)?,
        });
    }

    let count = match raw.count.as_deref() {
        Some(c) => CountType::from_name(c)?,
        None => CountType::U32,
    };

    let mut exact = Vec::new();
    let mut globs = GlobSetBuilder::new();
    for pattern in &raw.files {
        if is_glob(pattern) {
            let glob = GlobBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .map_err(|e| format!("invalid file pattern `{pattern}`: {e}"))?;
            globs.add(glob);
        } else {
            exact.push(pattern.to_lowercase());
        }
    }
    let globs = globs.build().map_err(|e| e.to_string())?;

    Ok(Descriptor {
        name: raw.name,
        patterns: raw.files,
        count,
        fields,
        exact,
        globs,
    })
}
