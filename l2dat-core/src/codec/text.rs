//! Token text form of decoded records.
//!
//! ```text
//! id=1
//! name=Elpy\sPet
//! levels=[1 2 3]
//! color={255 0 0 255}
//!
//! id=2
//! ...
//! ```
//!
//! Only space, tab, CR and LF separate tokens. Errors carry the 1-based
//! line and character offset of the token they concern.

use std::fmt::Write as _;

use super::{FieldValue, Record, Value};
use crate::chronicle::{CountType, Descriptor, FieldType, ScalarType};
use crate::error::{DatError, Result};
use crate::task::TaskContext;

pub(crate) fn is_separator(c: char) -> bool {
    matches!(c, ' ' | '\t' | '\n' | '\r')
}

pub fn escape(s: &str) -> String {
    if s.is_empty() {
        return "\\e".to_string();
    }
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            ' ' => out.push_str("\\s"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '[' | ']' | '{' | '}' => {
                out.push('\\');
                out.push(c);
            }
            _ => out.push(c),
        }
    }
    out
}

pub fn unescape(raw: &str) -> std::result::Result<String, String> {
    if raw == "\\e" {
        return Ok(String::new());
    }
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('s') => out.push(' '),
            Some('t') => out.push('\t'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some(b @ ('[' | ']' | '{' | '}')) => out.push(b),
            Some(other) => return Err(format!("unknown escape `\\{other}`")),
            None => return Err("dangling `\\` at end of value".to_string()),
        }
    }
    Ok(out)
}

fn render_scalar(out: &mut String, v: &Value) {
    // writing to a String cannot fail
    let _ = match v {
        Value::Unsigned(n) => write!(out, "{n}"),
        Value::Signed(n) => write!(out, "{n}"),
        Value::F32(f) => write!(out, "{f}"),
        Value::F64(f) => write!(out, "{f}"),
        Value::Text(s) => {
            out.push_str(&escape(s));
            Ok(())
        }
        Value::Bytes(b) => {
            out.push_str(&hex::encode(b));
            Ok(())
        }
        Value::List(items) | Value::Struct(items) => {
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(' ');
                }
                render_scalar(out, item);
            }
            Ok(())
        }
    };
}

/// One `name=value` line per field, a blank line between records.
pub fn render(descriptor: &Descriptor, records: &[Record]) -> String {
    let mut out = String::new();
    for (i, record) in records.iter().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        for (spec, field) in descriptor.fields.iter().zip(&record.fields) {
            out.push_str(&spec.name);
            out.push('=');
            match &field.value {
                Value::List(_) => {
                    out.push('[');
                    render_scalar(&mut out, &field.value);
                    out.push(']');
                }
                Value::Struct(_) => {
                    out.push('{');
                    render_scalar(&mut out, &field.value);
                    out.push('}');
                }
                v => render_scalar(&mut out, v),
            }
            out.push('\n');
        }
    }
    out
}

/// Position in the text being parsed.
#[derive(Debug, Clone, Copy)]
struct Mark {
    byte: usize,
    /// 1-based character offset.
    offset: usize,
    line: usize,
}

impl Mark {
    fn error(self, message: impl Into<String>) -> DatError {
        DatError::MalformedText {
            line: self.line,
            offset: self.offset,
            message: message.into(),
        }
    }
}

fn truncated(message: impl Into<String>) -> DatError {
    DatError::MalformedText {
        line: 0,
        offset: 0,
        message: message.into(),
    }
}

struct Scanner<'a> {
    text: &'a str,
    byte: usize,
    chars: usize,
    line: usize,
}

impl<'a> Scanner<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            text,
            byte: 0,
            chars: 0,
            line: 1,
        }
    }

    fn mark(&self) -> Mark {
        Mark {
            byte: self.byte,
            offset: self.chars + 1,
            line: self.line,
        }
    }

    fn peek(&self) -> Option<char> {
        self.text[self.byte..].chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.byte += c.len_utf8();
        self.chars += 1;
        if c == '\n' {
            self.line += 1;
        }
        Some(c)
    }

    fn skip_separators(&mut self) {
        while self.peek().is_some_and(is_separator) {
            self.bump();
        }
    }

    fn at_end(&self) -> bool {
        self.byte >= self.text.len()
    }

    /// Run of non-separator characters.
    fn word(&mut self) -> &'a str {
        let start = self.byte;
        while self.peek().is_some_and(|c| !is_separator(c)) {
            self.bump();
        }
        &self.text[start..self.byte]
    }
}

/// Raw shape of one `name=value` token.
enum RawValue<'a> {
    Scalar(&'a str),
    List(Vec<&'a str>),
    Struct(Vec<&'a str>),
}

struct Token<'a> {
    at: Mark,
    name: &'a str,
    value: RawValue<'a>,
}

fn next_token<'a>(sc: &mut Scanner<'a>) -> Result<Option<Token<'a>>> {
    sc.skip_separators();
    if sc.at_end() {
        return Ok(None);
    }
    let at = sc.mark();
    let start = sc.byte;
    while sc.peek().is_some_and(|c| c != '=' && !is_separator(c)) {
        sc.bump();
    }
    let name = &sc.text[start..sc.byte];
    if sc.peek() != Some('=') {
        return Err(at.error(format!("expected `name=value`, found `{name}`")));
    }
    if name.is_empty() {
        return Err(at.error("missing field name before `=`"));
    }
    sc.bump();

    let value = match sc.peek() {
        Some(open @ ('[' | '{')) => {
            sc.bump();
            let close = if open == '[' { ']' } else { '}' };
            let items = bracket_items(sc, at, close)?;
            if open == '[' {
                RawValue::List(items)
            } else {
                RawValue::Struct(items)
            }
        }
        _ => RawValue::Scalar(sc.word()),
    };
    if sc.peek().is_some_and(|c| !is_separator(c)) {
        return Err(at.error(format!("unexpected `{}` after value of `{name}`", sc.word())));
    }
    Ok(Some(Token { at, name, value }))
}

/// Items up to the closing bracket; brackets inside items must be escaped.
fn bracket_items<'a>(sc: &mut Scanner<'a>, at: Mark, close: char) -> Result<Vec<&'a str>> {
    let mut items = Vec::new();
    loop {
        sc.skip_separators();
        let start = sc.byte;
        let mut escaped = false;
        loop {
            let Some(c) = sc.peek() else {
                return Err(truncated(format!("unterminated `{close}` at end of text")));
            };
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == close || is_separator(c) {
                break;
            } else if matches!(c, '[' | ']' | '{' | '}') {
                return Err(at.error(format!("unexpected `{c}` inside brackets")));
            }
            sc.bump();
        }
        if sc.byte > start {
            items.push(&sc.text[start..sc.byte]);
        }
        if sc.peek() == Some(close) {
            sc.bump();
            return Ok(items);
        }
    }
}

fn parse_scalar(ty: ScalarType, raw: &str) -> std::result::Result<Value, String> {
    if raw.is_empty() {
        return Err("missing value".to_string());
    }
    let unsigned = |max: u64| -> std::result::Result<Value, String> {
        match raw.parse::<u64>() {
            Ok(n) if n <= max => Ok(Value::Unsigned(n)),
            _ => Err(format!("`{raw}` is not a {ty}")),
        }
    };
    match ty {
        ScalarType::U8 => unsigned(u8::MAX as u64),
        ScalarType::U16 => unsigned(u16::MAX as u64),
        ScalarType::U32 => unsigned(u32::MAX as u64),
        ScalarType::I32 => raw
            .parse::<i32>()
            .map(|n| Value::Signed(n as i64))
            .map_err(|_| format!("`{raw}` is not a {ty}")),
        ScalarType::I64 => raw
            .parse::<i64>()
            .map(Value::Signed)
            .map_err(|_| format!("`{raw}` is not a {ty}")),
        ScalarType::F32 => raw
            .parse::<f32>()
            .map(Value::F32)
            .map_err(|_| format!("`{raw}` is not a {ty}")),
        ScalarType::F64 => raw
            .parse::<f64>()
            .map(Value::F64)
            .map_err(|_| format!("`{raw}` is not a {ty}")),
        ScalarType::Ascf => {
            let s = unescape(raw)?;
            if s.encode_utf16().count() >= (1 << 30) {
                return Err("string too long".to_string());
            }
            Ok(Value::Text(s))
        }
        ScalarType::Utf16 => Ok(Value::Text(unescape(raw)?)),
        ScalarType::Hex(size) => {
            let bytes = hex::decode(raw).map_err(|e| format!("`{raw}` is not hex: {e}"))?;
            if bytes.len() != size {
                return Err(format!("expected {size} bytes of hex, found {}", bytes.len()));
            }
            Ok(Value::Bytes(bytes))
        }
    }
}

fn parse_items(ty: ScalarType, items: &[&str]) -> std::result::Result<Vec<Value>, String> {
    items
        .iter()
        .enumerate()
        .map(|(i, raw)| parse_scalar(ty, raw).map_err(|e| format!("item {}: {e}", i + 1)))
        .collect()
}

fn typed_value(ty: &FieldType, raw: RawValue<'_>) -> std::result::Result<Value, String> {
    match (ty, raw) {
        (FieldType::Scalar(t), RawValue::Scalar(s)) => parse_scalar(*t, s),
        (FieldType::List { of, count }, RawValue::List(items)) => {
            if items.len() > count.max() {
                return Err(format!(
                    "{} items do not fit a {} count",
                    items.len(),
                    count_name(*count)
                ));
            }
            Ok(Value::List(parse_items(*of, &items)?))
        }
        (FieldType::Struct(members), RawValue::Struct(items)) => {
            if items.len() != members.len() {
                return Err(format!(
                    "expected {} members, found {}",
                    members.len(),
                    items.len()
                ));
            }
            let values = members
                .iter()
                .zip(&items)
                .enumerate()
                .map(|(i, (t, raw))| {
                    parse_scalar(*t, raw).map_err(|e| format!("member {}: {e}", i + 1))
                })
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(Value::Struct(values))
        }
        (FieldType::List { .. }, _) => Err("expected a list `[...]`".to_string()),
        (FieldType::Struct(_), _) => Err("expected a structure `{...}`".to_string()),
        (FieldType::Scalar(t), _) => Err(format!("expected a single {t} value")),
    }
}

fn count_name(c: CountType) -> &'static str {
    match c {
        CountType::U8 => "u8",
        CountType::U16 => "u16",
        CountType::U32 => "u32",
        CountType::Compact => "compact",
    }
}

/// Parses records back from text, strictly in field declaration order.
/// Polls cancellation per record and spreads `weight` over the text length.
pub fn parse(
    descriptor: &Descriptor,
    text: &str,
    ctx: &mut TaskContext,
    weight: f64,
) -> Result<Vec<Record>> {
    let mut sc = Scanner::new(text);
    let mut records = Vec::new();
    let total = text.len().max(1) as f64;
    let mut reported = 0usize;
    let mut first_at: Option<Mark> = None;

    let mut fields: Vec<FieldValue> = Vec::with_capacity(descriptor.fields.len());
    loop {
        if fields.is_empty() {
            ctx.checkpoint()?;
        }
        let Some(token) = next_token(&mut sc)? else {
            break;
        };
        let spec = &descriptor.fields[fields.len()];
        if token.name != spec.name {
            return Err(token.at.error(format!(
                "expected field `{}`, found `{}`",
                spec.name, token.name
            )));
        }
        let value = typed_value(&spec.ty, token.value)
            .map_err(|e| token.at.error(format!("field `{}`: {e}", spec.name)))?;
        if fields.is_empty() {
            first_at = Some(token.at);
        }
        fields.push(FieldValue {
            value,
            offset: token.at.byte,
        });

        if fields.len() == descriptor.fields.len() {
            if records.len() >= descriptor.count.max() {
                let at = first_at.unwrap_or(token.at);
                return Err(at.error(format!(
                    "record count does not fit a {} count",
                    count_name(descriptor.count)
                )));
            }
            records.push(Record {
                fields: std::mem::take(&mut fields),
            });
            ctx.add_progress(weight * (sc.byte - reported) as f64 / total, 100.0);
            reported = sc.byte;
        }
    }

    if let Some(missing) = descriptor.fields.get(fields.len()).filter(|_| !fields.is_empty()) {
        return Err(truncated(format!(
            "unexpected end of text: record {} is missing field `{}`",
            records.len() + 1,
            missing.name
        )));
    }
    Ok(records)
}

/// Byte offset into `text` as a 1-based (line, character offset) pair.
pub fn position_of(text: &str, byte: usize) -> (usize, usize) {
    let mut line = 1;
    let mut offset = 1;
    for (i, c) in text.char_indices() {
        if i >= byte {
            break;
        }
        offset += 1;
        if c == '\n' {
            line += 1;
        }
    }
    (line, offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chronicle::descriptor::build_descriptor;

    fn descriptor() -> Descriptor {
        build_descriptor(
            toml::from_str::<toml::Value>(
                r#"
                name = "npcgrp"
                files = ["NpcGrp.dat"]
                [[field]]
                name = "id"
                type = "u32"
                [[field]]
                name = "name"
                type = "ascf"
                [[field]]
                name = "skills"
                type = "list"
                of = "u16"
                count = "u8"
                [[field]]
                name = "color"
                type = "struct"
                members = ["u8", "u8", "u8"]
                "#,
            )
            .unwrap(),
        )
        .unwrap()
    }

    fn parse_str(text: &str) -> Result<Vec<Record>> {
        parse(&descriptor(), text, &mut TaskContext::detached(), 100.0)
    }

    fn text_error(text: &str) -> (usize, usize, String) {
        match parse_str(text).unwrap_err() {
            DatError::MalformedText {
                line,
                offset,
                message,
            } => (line, offset, message),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn escapes_survive_render_and_parse() {
        let s = "a b\\c\t[x]{y}\r\n";
        assert_eq!(escape(s), "a\\sb\\\\c\\t\\[x\\]\\{y\\}\\r\\n");
        assert_eq!(unescape(&escape(s)).unwrap(), s);
        assert_eq!(escape(""), "\\e");
        assert_eq!(unescape("\\e").unwrap(), "");
        assert!(unescape("bad\\q").is_err());
    }

    #[test]
    fn parses_two_records() {
        let text = "id=1\nname=Gremlin\nskills=[4416 4417]\ncolor={255 0 16}\n\n\
                    id=2\nname=\\e\nskills=[]\ncolor={0 0 0}\n";
        let records = parse_str(text).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].fields[1].value, Value::Text("Gremlin".into()));
        assert_eq!(
            records[0].fields[2].value,
            Value::List(vec![Value::Unsigned(4416), Value::Unsigned(4417)])
        );
        assert_eq!(records[1].fields[1].value, Value::Text(String::new()));
        assert_eq!(records[1].fields[0].offset, text.find("id=2").unwrap());
    }

    #[test]
    fn layout_whitespace_is_insignificant() {
        let a = parse_str("id=1 name=x skills=[1] color={1 2 3}").unwrap();
        let b = parse_str("\n\n  id=1\r\n\tname=x   \nskills=[ 1 ]\ncolor={1 2 3}\n\n\n").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn bad_value_points_at_its_token() {
        let text = "id=1\nname=x\nskills=[1 70000]\ncolor={1 2 3}\n";
        let (line, offset, message) = text_error(text);
        assert_eq!(line, 3);
        assert_eq!(offset, text.find("skills").unwrap() + 1);
        assert!(message.contains("item 2"), "{message}");
    }

    #[test]
    fn reordered_field_is_rejected() {
        let (line, offset, message) = text_error("id=1\nskills=[1]\nname=x\ncolor={1 2 3}\n");
        assert_eq!((line, offset), (2, 6));
        assert!(message.contains("expected field `name`"));
    }

    #[test]
    fn offsets_count_characters_not_bytes() {
        let text = "id=1\nname=Грация\nskills=[1]\ncolor={1 2}\n";
        let (line, offset, _) = text_error(text);
        assert_eq!(line, 4);
        assert_eq!(offset, text[..text.find("color").unwrap()].chars().count() + 1);
    }

    #[test]
    fn missing_trailing_fields_have_no_position() {
        let (line, offset, message) = text_error("id=1\nname=x\n");
        assert_eq!((line, offset), (0, 0));
        assert!(message.contains("missing field `skills`"));
    }

    #[test]
    fn unterminated_list_has_no_position() {
        let (line, offset, _) = text_error("id=1\nname=x\nskills=[1 2");
        assert_eq!((line, offset), (0, 0));
    }

    #[test]
    fn nested_bracket_is_rejected() {
        let (line, _, message) = text_error("id=1\nname=x\nskills=[1 [2]]\ncolor={1 2 3}\n");
        assert_eq!(line, 3);
        assert!(message.contains("inside brackets"));
    }

    #[test]
    fn value_must_end_at_separator() {
        let (line, offset, _) = text_error("id=1\nname=x\nskills=[1]x\ncolor={1 2 3}\n");
        assert_eq!((line, offset), (3, 13));
    }

    #[test]
    fn list_count_limit_is_enforced() {
        let items = vec!["1"; 256].join(" ");
        let text = format!("id=1\nname=x\nskills=[{items}]\ncolor={{1 2 3}}\n");
        let (line, _, message) = text_error(&text);
        assert_eq!(line, 3);
        assert!(message.contains("do not fit a u8 count"));
    }

    #[test]
    fn render_matches_documented_layout() {
        let d = descriptor();
        let text = "id=7\nname=Elpy\\sPet\nskills=[1 2]\ncolor={1 2 3}\n\nid=8\nname=\\e\nskills=[]\ncolor={0 0 0}\n";
        let records = parse_str(text).unwrap();
        assert_eq!(render(&d, &records), text);
    }

    #[test]
    fn position_of_maps_bytes_to_lines() {
        let text = "ab\nçd\nef";
        assert_eq!(position_of(text, 0), (1, 1));
        assert_eq!(position_of(text, 3), (2, 4));
        assert_eq!(position_of(text, text.find('e').unwrap()), (3, 7));
    }

    #[test]
    fn cancelled_parse_stops() {
        let mut ctx = TaskContext::detached();
        ctx.cancel_token().cancel();
        let err = parse(&descriptor(), "id=1", &mut ctx, 100.0).unwrap_err();
        assert!(err.is_cancelled());
    }
}
