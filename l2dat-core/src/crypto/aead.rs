use chacha20poly1305::{
    Key, XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit, Payload},
};

use super::{ByteTransform, CipherScope};
use crate::error::{DatError, Result};

pub const NONCE_LEN: usize = 24;
pub const TAG_LEN: usize = 16;

const ZSTD_LEVEL: i32 = 3;

/// XChaCha20-Poly1305 body: `nonce || ciphertext+tag`, optionally zstd
/// compressed before sealing. The associated data binds the body to its
/// header identity and file name.
pub struct Sealed {
    key: [u8; 32],
    compress: bool,
}

impl std::fmt::Debug for Sealed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sealed")
            .field("compress", &self.compress)
            .finish_non_exhaustive()
    }
}

impl Sealed {
    pub fn new(key: [u8; 32], compress: bool) -> Self {
        Self { key, compress }
    }

    fn aead(&self) -> XChaCha20Poly1305 {
        XChaCha20Poly1305::new(Key::from_slice(&self.key))
    }
}

fn associated_data(scope: &CipherScope<'_>) -> Vec<u8> {
    let mut ad = Vec::with_capacity(scope.header.len() + scope.file_name.len() + 1);
    ad.extend_from_slice(scope.header.as_bytes());
    ad.push(0);
    ad.extend_from_slice(scope.file_name.as_bytes());
    ad
}

impl ByteTransform for Sealed {
    fn decrypt(&self, scope: &CipherScope<'_>, body: &[u8]) -> Result<Vec<u8>> {
        if body.len() < NONCE_LEN + TAG_LEN {
            return Err(DatError::MalformedBinary {
                offset: None,
                message: format!("sealed body too short ({} bytes)", body.len()),
            });
        }
        let (nonce, ciphertext) = body.split_at(NONCE_LEN);
        let ad = associated_data(scope);
        let plain = self
            .aead()
            .decrypt(
                XNonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: &ad,
                },
            )
            .map_err(|_| DatError::Crypto(format!("cannot open {}: wrong key or corrupt data", scope.file_name)))?;
        if self.compress {
            zstd::stream::decode_all(&plain[..]).map_err(|e| DatError::Crypto(format!("zstd: {e}")))
        } else {
            Ok(plain)
        }
    }

    fn encrypt(&self, scope: &CipherScope<'_>, plain: &[u8]) -> Result<Vec<u8>> {
        let packed;
        let msg = if self.compress {
            packed = zstd::stream::encode_all(plain, ZSTD_LEVEL)
                .map_err(|e| DatError::Crypto(format!("zstd: {e}")))?;
            &packed[..]
        } else {
            plain
        };

        let mut nonce = [0u8; NONCE_LEN];
        getrandom::getrandom(&mut nonce).map_err(|e| DatError::Crypto(format!("nonce: {e}")))?;
        let ad = associated_data(scope);
        let sealed = self
            .aead()
            .encrypt(XNonce::from_slice(&nonce), Payload { msg, aad: &ad })
            .map_err(|_| DatError::Crypto("aead encrypt".into()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }
}
