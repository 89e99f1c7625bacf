//! Descriptor-driven conversion between DAT payloads, records and text.

pub mod binary;
pub mod text;

use crate::chronicle::{CountType, Descriptor, FieldType, ScalarType};
use crate::error::{DatError, Result};
use crate::task::TaskContext;
use binary::{Cursor, Writer};

/// A decoded field value. Lists and structures hold scalars only.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Unsigned(u64),
    Signed(i64),
    F32(f32),
    F64(f64),
    Text(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Struct(Vec<Value>),
}

#[derive(Debug, Clone)]
pub struct FieldValue {
    pub value: Value,
    /// Payload byte offset after decoding, text byte offset after parsing.
    pub offset: usize,
}

/// One entry of a DAT file. Equality ignores offsets.
#[derive(Debug, Clone, Default)]
pub struct Record {
    pub fields: Vec<FieldValue>,
}

impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        self.fields.len() == other.fields.len()
            && self
                .fields
                .iter()
                .zip(&other.fields)
                .all(|(a, b)| a.value == b.value)
    }
}

impl Record {
    pub fn from_values(values: impl IntoIterator<Item = Value>) -> Self {
        Self {
            fields: values
                .into_iter()
                .map(|value| FieldValue { value, offset: 0 })
                .collect(),
        }
    }
}

/// Codec bound to one descriptor.
#[derive(Debug, Clone, Copy)]
pub struct DatCodec<'d> {
    descriptor: &'d Descriptor,
}

impl<'d> DatCodec<'d> {
    pub fn new(descriptor: &'d Descriptor) -> Self {
        Self { descriptor }
    }

    pub fn descriptor(&self) -> &'d Descriptor {
        self.descriptor
    }

    /// Plain payload to records. Fails on short data, oversized length
    /// markers and bytes left after the last record.
    pub fn decode(&self, payload: &[u8], ctx: &mut TaskContext, weight: f64) -> Result<Vec<Record>> {
        let mut cur = Cursor::new(payload);
        let count = read_count(&mut cur, self.descriptor.count)?;
        // every record takes at least one byte
        if count > cur.remaining() {
            return Err(DatError::binary(
                0,
                format!("record count {count} exceeds the {} remaining bytes", cur.remaining()),
            ));
        }

        let step = if count == 0 { 0.0 } else { weight / count as f64 };
        let mut records = Vec::with_capacity(count);
        for _ in 0..count {
            ctx.checkpoint()?;
            let mut fields = Vec::with_capacity(self.descriptor.fields.len());
            for spec in &self.descriptor.fields {
                let offset = cur.position();
                let value = read_field(&mut cur, &spec.ty)?;
                fields.push(FieldValue { value, offset });
            }
            records.push(Record { fields });
            ctx.add_progress(step, 100.0);
        }

        if !cur.is_empty() {
            return Err(DatError::binary(
                cur.position(),
                format!("{} trailing bytes after record {count}", cur.remaining()),
            ));
        }
        Ok(records)
    }

    /// Records to a plain payload.
    pub fn encode(&self, records: &[Record]) -> Result<Vec<u8>> {
        let mut w = Writer::new();
        write_count(&mut w, self.descriptor.count, records.len())?;
        for (n, record) in records.iter().enumerate() {
            if record.fields.len() != self.descriptor.fields.len() {
                return Err(encode_error(
                    n,
                    "*",
                    format!(
                        "has {} fields, descriptor `{}` declares {}",
                        record.fields.len(),
                        self.descriptor.name,
                        self.descriptor.fields.len()
                    ),
                ));
            }
            for (spec, field) in self.descriptor.fields.iter().zip(&record.fields) {
                write_field(&mut w, &spec.ty, &field.value)
                    .map_err(|msg| encode_error(n, &spec.name, msg))?;
            }
        }
        Ok(w.into_bytes())
    }

    pub fn render(&self, records: &[Record]) -> String {
        text::render(self.descriptor, records)
    }

    pub fn parse_text(&self, text: &str, ctx: &mut TaskContext, weight: f64) -> Result<Vec<Record>> {
        text::parse(self.descriptor, text, ctx, weight)
    }
}

fn encode_error(record: usize, field: &str, msg: impl std::fmt::Display) -> DatError {
    DatError::MalformedBinary {
        offset: None,
        message: format!("record {} field `{field}`: {msg}", record + 1),
    }
}

fn read_count(cur: &mut Cursor<'_>, ty: CountType) -> Result<usize> {
    let start = cur.position();
    let n = match ty {
        CountType::U8 => cur.read_u8()? as usize,
        CountType::U16 => cur.read_u16()? as usize,
        CountType::U32 => cur.read_u32()? as usize,
        CountType::Compact => {
            let n = cur.read_compact()?;
            usize::try_from(n).map_err(|_| DatError::binary(start, format!("negative count {n}")))?
        }
    };
    Ok(n)
}

fn write_count(w: &mut Writer, ty: CountType, n: usize) -> Result<()> {
    if n > ty.max() {
        return Err(DatError::MalformedBinary {
            offset: None,
            message: format!("{n} elements exceed the {ty:?} count limit"),
        });
    }
    match ty {
        CountType::U8 => w.write_u8(n as u8),
        CountType::U16 => w.write_u16(n as u16),
        CountType::U32 => w.write_u32(n as u32),
        CountType::Compact => w.write_compact(n as i32),
    }
    Ok(())
}

fn read_scalar(cur: &mut Cursor<'_>, ty: ScalarType) -> Result<Value> {
    Ok(match ty {
        ScalarType::U8 => Value::Unsigned(cur.read_u8()? as u64),
        ScalarType::U16 => Value::Unsigned(cur.read_u16()? as u64),
        ScalarType::U32 => Value::Unsigned(cur.read_u32()? as u64),
        ScalarType::I32 => Value::Signed(cur.read_i32()? as i64),
        ScalarType::I64 => Value::Signed(cur.read_i64()?),
        ScalarType::F32 => Value::F32(cur.read_f32()?),
        ScalarType::F64 => Value::F64(cur.read_f64()?),
        ScalarType::Ascf => Value::Text(cur.read_ascf()?),
        ScalarType::Utf16 => Value::Text(cur.read_utf16()?),
        ScalarType::Hex(n) => Value::Bytes(cur.read_bytes(n)?.to_vec()),
    })
}

fn read_field(cur: &mut Cursor<'_>, ty: &FieldType) -> Result<Value> {
    match ty {
        FieldType::Scalar(t) => read_scalar(cur, *t),
        FieldType::List { of, count } => {
            let start = cur.position();
            let n = read_count(cur, *count)?;
            if n > cur.remaining() {
                return Err(DatError::binary(
                    start,
                    format!("list length {n} exceeds the {} remaining bytes", cur.remaining()),
                ));
            }
            let items = (0..n)
                .map(|_| read_scalar(cur, *of))
                .collect::<Result<Vec<_>>>()?;
            Ok(Value::List(items))
        }
        FieldType::Struct(members) => {
            let items = members
                .iter()
                .map(|t| read_scalar(cur, *t))
                .collect::<Result<Vec<_>>>()?;
            Ok(Value::Struct(items))
        }
    }
}

fn write_scalar(w: &mut Writer, ty: ScalarType, v: &Value) -> std::result::Result<(), String> {
    let out_of_range = |v: &dyn std::fmt::Debug| format!("{v:?} does not fit {ty}");
    match (ty, v) {
        (ScalarType::U8, Value::Unsigned(n)) => {
            w.write_u8(u8::try_from(*n).map_err(|_| out_of_range(n))?)
        }
        (ScalarType::U16, Value::Unsigned(n)) => {
            w.write_u16(u16::try_from(*n).map_err(|_| out_of_range(n))?)
        }
        (ScalarType::U32, Value::Unsigned(n)) => {
            w.write_u32(u32::try_from(*n).map_err(|_| out_of_range(n))?)
        }
        (ScalarType::I32, Value::Signed(n)) => {
            w.write_i32(i32::try_from(*n).map_err(|_| out_of_range(n))?)
        }
        (ScalarType::I64, Value::Signed(n)) => w.write_i64(*n),
        (ScalarType::F32, Value::F32(f)) => w.write_f32(*f),
        (ScalarType::F64, Value::F64(f)) => w.write_f64(*f),
        (ScalarType::Ascf, Value::Text(s)) => w.write_ascf(s).map_err(|e| e.to_string())?,
        (ScalarType::Utf16, Value::Text(s)) => w.write_utf16(s).map_err(|e| e.to_string())?,
        (ScalarType::Hex(size), Value::Bytes(b)) => {
            if b.len() != size {
                return Err(format!("expected {size} bytes, found {}", b.len()));
            }
            w.write_bytes(b)
        }
        (ty, v) => return Err(format!("{v:?} is not a {ty} value")),
    }
    Ok(())
}

fn write_field(w: &mut Writer, ty: &FieldType, v: &Value) -> std::result::Result<(), String> {
    match (ty, v) {
        (FieldType::Scalar(t), v) => write_scalar(w, *t, v),
        (FieldType::List { of, count }, Value::List(items)) => {
            write_count(w, *count, items.len()).map_err(|e| e.to_string())?;
            items.iter().try_for_each(|item| write_scalar(w, *of, item))
        }
        (FieldType::Struct(members), Value::Struct(items)) => {
            if members.len() != items.len() {
                return Err(format!(
                    "expected {} members, found {}",
                    members.len(),
                    items.len()
                ));
            }
            members
                .iter()
                .zip(items)
                .try_for_each(|(t, item)| write_scalar(w, *t, item))
        }
        (FieldType::List { .. }, _) => Err("expected a list".to_string()),
        (FieldType::Struct(_), _) => Err("expected a structure".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chronicle::descriptor::build_descriptor;

    fn descriptor(count: &str) -> Descriptor {
        let src = format!(
            r#"
            name = "skillgrp"
            files = ["Skillgrp.dat"]
            count = "{count}"
            [[field]]
            name = "id"
            type = "u32"
            [[field]]
            name = "level"
            type = "u8"
            [[field]]
            name = "power"
            type = "f32"
            [[field]]
            name = "icon"
            type = "ascf"
            [[field]]
            name = "desc"
            type = "utf16"
            [[field]]
            name = "effects"
            type = "list"
            of = "i32"
            count = "compact"
            [[field]]
            name = "rgba"
            type = "struct"
            members = ["u8", "u8", "u8", "u8"]
            [[field]]
            name = "hash"
            type = "hex"
            size = 4
            "#
        );
        build_descriptor(toml::from_str::<toml::Value>(&src).unwrap()).unwrap()
    }

    fn sample() -> Vec<Record> {
        vec![
            Record::from_values([
                Value::Unsigned(3),
                Value::Unsigned(1),
                Value::F32(12.5),
                Value::Text("icon.skill0003".into()),
                Value::Text("Власть меча".into()),
                Value::List(vec![Value::Signed(-1), Value::Signed(70000)]),
                Value::Struct(vec![
                    Value::Unsigned(255),
                    Value::Unsigned(0),
                    Value::Unsigned(0),
                    Value::Unsigned(128),
                ]),
                Value::Bytes(vec![0xde, 0xad, 0xbe, 0xef]),
            ]),
            Record::from_values([
                Value::Unsigned(4),
                Value::Unsigned(2),
                Value::F32(0.1),
                Value::Text(String::new()),
                Value::Text("a b\tc".into()),
                Value::List(vec![]),
                Value::Struct(vec![Value::Unsigned(0); 4]),
                Value::Bytes(vec![0; 4]),
            ]),
        ]
    }

    #[test]
    fn records_survive_binary_and_text() {
        for count in ["u32", "compact"] {
            let d = descriptor(count);
            let codec = DatCodec::new(&d);
            let records = sample();
            let payload = codec.encode(&records).unwrap();
            let decoded = codec
                .decode(&payload, &mut TaskContext::detached(), 100.0)
                .unwrap();
            assert_eq!(decoded, records);

            let text = codec.render(&decoded);
            let parsed = codec
                .parse_text(&text, &mut TaskContext::detached(), 100.0)
                .unwrap();
            assert_eq!(parsed, records);
        }
    }

    #[test]
    fn decode_reports_field_offsets() {
        let d = descriptor("u32");
        let codec = DatCodec::new(&d);
        let payload = codec.encode(&sample()).unwrap();
        let decoded = codec
            .decode(&payload, &mut TaskContext::detached(), 100.0)
            .unwrap();
        assert_eq!(decoded[0].fields[0].offset, 4);
        assert_eq!(decoded[0].fields[1].offset, 8);
        assert_eq!(decoded[0].fields[2].offset, 9);
    }

    #[test]
    fn empty_payload_is_malformed() {
        let d = descriptor("u32");
        let err = DatCodec::new(&d)
            .decode(&[], &mut TaskContext::detached(), 100.0)
            .unwrap_err();
        assert!(matches!(err, DatError::MalformedBinary { offset: Some(0), .. }));
    }

    #[test]
    fn truncated_payload_fails_instead_of_truncating() {
        let d = descriptor("u32");
        let codec = DatCodec::new(&d);
        let payload = codec.encode(&sample()).unwrap();
        let err = codec
            .decode(&payload[..payload.len() - 2], &mut TaskContext::detached(), 100.0)
            .unwrap_err();
        assert!(matches!(err, DatError::MalformedBinary { .. }));
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let d = descriptor("u32");
        let codec = DatCodec::new(&d);
        let mut payload = codec.encode(&sample()).unwrap();
        payload.push(0);
        let err = codec
            .decode(&payload, &mut TaskContext::detached(), 100.0)
            .unwrap_err();
        assert!(err.to_string().contains("trailing"), "{err}");
    }

    #[test]
    fn oversized_count_is_rejected_before_allocating() {
        let d = descriptor("u32");
        let payload = [0xff, 0xff, 0xff, 0x7f, 1, 2, 3];
        let err = DatCodec::new(&d)
            .decode(&payload, &mut TaskContext::detached(), 100.0)
            .unwrap_err();
        assert!(err.to_string().contains("exceeds"), "{err}");
    }

    #[test]
    fn encode_rejects_wrong_shape() {
        let d = descriptor("u32");
        let mut records = sample();
        records[0].fields[1].value = Value::Unsigned(300);
        let err = DatCodec::new(&d).encode(&records).unwrap_err();
        assert!(err.to_string().contains("field `level`"), "{err}");
    }

    #[test]
    fn decode_progress_spreads_weight() {
        let d = descriptor("u32");
        let codec = DatCodec::new(&d);
        let payload = codec.encode(&sample()).unwrap();
        let mut ctx = TaskContext::detached();
        codec.decode(&payload, &mut ctx, 40.0).unwrap();
        assert_eq!(ctx.progress(), 40);
    }
}
