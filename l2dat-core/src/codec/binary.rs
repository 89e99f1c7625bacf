use crate::error::{DatError, Result};

/// Read cursor over a decrypted payload. All reads are little-endian.
#[derive(Clone)]
pub struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        self.ensure(n)?;
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_array::<1>()?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.read_array()?))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.read_array()?))
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.read_array()?))
    }

    pub fn read_f32(&mut self) -> Result<f32> {
        Ok(f32::from_le_bytes(self.read_array()?))
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        Ok(f64::from_le_bytes(self.read_array()?))
    }

    /// Unreal compact index: sign 0x80 and continuation 0x40 in the first
    /// byte, then 7-bit groups with continuation 0x80. At most 5 bytes.
    pub fn read_compact(&mut self) -> Result<i32> {
        let start = self.pos;
        let b0 = self.read_u8()?;
        let negative = b0 & 0x80 != 0;
        let mut value = (b0 & 0x3f) as i64;
        if b0 & 0x40 != 0 {
            let mut shift = 6;
            let mut done = false;
            for _ in 0..4 {
                let b = self.read_u8()?;
                value |= ((b & 0x7f) as i64) << shift;
                shift += 7;
                if b & 0x80 == 0 {
                    done = true;
                    break;
                }
            }
            if !done {
                return Err(DatError::binary(start, "compact index longer than 5 bytes"));
            }
        }
        let value = if negative { -value } else { value };
        i32::try_from(value).map_err(|_| DatError::binary(start, "compact index out of range"))
    }

    /// Length-prefixed game string. Positive length: Latin-1 bytes, negative:
    /// UTF-16LE units; both include a trailing NUL.
    pub fn read_ascf(&mut self) -> Result<String> {
        let start = self.pos;
        let len = self.read_compact()?;
        if len == 0 {
            return Ok(String::new());
        }
        let units = len.unsigned_abs() as usize;
        if len > 0 {
            let bytes = self.read_bytes(units)?;
            let (body, nul) = bytes.split_at(units - 1);
            if nul != [0] {
                return Err(DatError::binary(start, "ascf string is not NUL-terminated"));
            }
            Ok(body.iter().map(|&b| b as char).collect())
        } else {
            let need = units
                .checked_mul(2)
                .ok_or_else(|| DatError::binary(start, "ascf length overflow"))?;
            let bytes = self.read_bytes(need)?;
            let mut wide: Vec<u16> = bytes
                .chunks_exact(2)
                .map(|c| u16::from_le_bytes([c[0], c[1]]))
                .collect();
            if wide.pop() != Some(0) {
                return Err(DatError::binary(start, "ascf string is not NUL-terminated"));
            }
            String::from_utf16(&wide)
                .map_err(|e| DatError::binary(start, format!("ascf string is not UTF-16: {e}")))
        }
    }

    /// u32 unit count followed by UTF-16LE units.
    pub fn read_utf16(&mut self) -> Result<String> {
        let start = self.pos;
        let units = self.read_u32()? as usize;
        let need = units
            .checked_mul(2)
            .ok_or_else(|| DatError::binary(start, "utf16 length overflow"))?;
        let bytes = self.read_bytes(need)?;
        let wide: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        String::from_utf16(&wide)
            .map_err(|e| DatError::binary(start, format!("invalid UTF-16 string: {e}")))
    }

    fn ensure(&self, n: usize) -> Result<()> {
        if self.pos.checked_add(n).is_none_or(|end| end > self.data.len()) {
            return Err(DatError::binary(
                self.pos,
                format!(
                    "unexpected end of data (need {n} bytes, have {})",
                    self.remaining()
                ),
            ));
        }
        Ok(())
    }
}

/// Writer that builds a payload buffer. All writes are little-endian.
#[derive(Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn write_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_f32(&mut self, v: f32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_f64(&mut self, v: f64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_compact(&mut self, v: i32) {
        let mut rest = v.unsigned_abs();
        let mut b0 = (rest & 0x3f) as u8;
        if v < 0 {
            b0 |= 0x80;
        }
        rest >>= 6;
        if rest > 0 {
            b0 |= 0x40;
        }
        self.buf.push(b0);
        while rest > 0 {
            let mut b = (rest & 0x7f) as u8;
            rest >>= 7;
            if rest > 0 {
                b |= 0x80;
            }
            self.buf.push(b);
        }
    }

    /// Latin-1 when every char fits a byte, UTF-16 otherwise.
    pub fn write_ascf(&mut self, s: &str) -> Result<()> {
        if s.is_empty() {
            self.write_compact(0);
            return Ok(());
        }
        if s.chars().all(|c| (c as u32) < 0x100) {
            let len = s.chars().count() + 1;
            self.write_compact(compact_len(len)?);
            self.buf.extend(s.chars().map(|c| c as u8));
            self.buf.push(0);
        } else {
            let wide: Vec<u16> = s.encode_utf16().collect();
            self.write_compact(-compact_len(wide.len() + 1)?);
            for unit in wide {
                self.write_u16(unit);
            }
            self.write_u16(0);
        }
        Ok(())
    }

    pub fn write_utf16(&mut self, s: &str) -> Result<()> {
        let wide: Vec<u16> = s.encode_utf16().collect();
        let units = u32::try_from(wide.len()).map_err(|_| {
            DatError::binary(self.buf.len(), "utf16 string too long for a u32 length")
        })?;
        self.write_u32(units);
        for unit in wide {
            self.write_u16(unit);
        }
        Ok(())
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

fn compact_len(len: usize) -> Result<i32> {
    i32::try_from(len)
        .ok()
        .filter(|v| *v < (1 << 30))
        .ok_or_else(|| DatError::binary(0, "string too long for a compact length"))
}
