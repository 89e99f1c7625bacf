use super::{ByteTransform, CipherScope};
use crate::error::Result;

/// Every byte XOR one key byte.
#[derive(Debug)]
pub struct XorConst {
    pub key: u8,
}

impl ByteTransform for XorConst {
    fn decrypt(&self, _scope: &CipherScope<'_>, body: &[u8]) -> Result<Vec<u8>> {
        Ok(body.iter().map(|b| b ^ self.key).collect())
    }

    fn encrypt(&self, scope: &CipherScope<'_>, plain: &[u8]) -> Result<Vec<u8>> {
        self.decrypt(scope, plain)
    }
}

/// Byte `i` XOR (`seed` XOR `i mod 256`).
#[derive(Debug)]
pub struct XorPosition {
    pub seed: u8,
}

impl ByteTransform for XorPosition {
    fn decrypt(&self, _scope: &CipherScope<'_>, body: &[u8]) -> Result<Vec<u8>> {
        Ok(body
            .iter()
            .enumerate()
            .map(|(i, b)| b ^ (self.seed ^ i as u8))
            .collect())
    }

    fn encrypt(&self, scope: &CipherScope<'_>, plain: &[u8]) -> Result<Vec<u8>> {
        self.decrypt(scope, plain)
    }
}

/// Key byte derived from the lower-cased file name.
#[derive(Debug)]
pub struct XorFileName;

impl XorFileName {
    pub fn key_for(file_name: &str) -> u8 {
        file_name
            .to_lowercase()
            .bytes()
            .fold(0u32, |acc, b| acc.wrapping_add(b as u32)) as u8
    }
}

impl ByteTransform for XorFileName {
    fn decrypt(&self, scope: &CipherScope<'_>, body: &[u8]) -> Result<Vec<u8>> {
        let key = Self::key_for(scope.file_name);
        Ok(body.iter().map(|b| b ^ key).collect())
    }

    fn encrypt(&self, scope: &CipherScope<'_>, plain: &[u8]) -> Result<Vec<u8>> {
        self.decrypt(scope, plain)
    }
}
