//! RSA-KEM (ISO/IEC 18033-2) with KDF1-SHA256

use rsa::{
    BigUint, RsaPrivateKey, RsaPublicKey,
    hazmat::{rsa_decrypt_and_check, rsa_encrypt},
    pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey},
    pkcs8::{DecodePrivateKey, DecodePublicKey},
    rand_core::{OsRng, RngCore},
    traits::PublicKeyParts,
};
use sha2::{Digest, Sha256};

use super::{CryptoError, CryptoResult};

/// Length of the derived symmetric key
pub(crate) const KEY_LEN: usize = 32;

/// Parse a PEM private key, PKCS#8 first, then PKCS#1
pub fn parse_private_key_pem(pem: &str) -> CryptoResult<RsaPrivateKey> {
    RsaPrivateKey::from_pkcs8_pem(pem)
        .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))
}

/// Parse a PEM public key, SPKI first, then PKCS#1
pub fn parse_public_key_pem(pem: &str) -> CryptoResult<RsaPublicKey> {
    RsaPublicKey::from_public_key_pem(pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))
}

/// Encapsulated keys are framed in 8-byte words that must fit in one byte
pub(crate) fn check_key_size(key: &RsaPublicKey) -> CryptoResult<()> {
    let size = key.size();
    if size % 8 != 0 || size / 8 > u8::MAX as usize {
        return Err(CryptoError::InvalidKey(format!(
            "modulus of {} bytes cannot be framed",
            size
        )));
    }
    Ok(())
}

/// Produce a fresh key and its encapsulation under `key`
pub(crate) fn encapsulate(key: &RsaPublicKey) -> CryptoResult<([u8; KEY_LEN], Vec<u8>)> {
    let n = key.n();
    let k = key.size();
    let excess_bits = k * 8 - n.bits();

    let mut buf = vec![0u8; k];
    let z = loop {
        OsRng.fill_bytes(&mut buf);
        buf[0] &= 0xff >> excess_bits;
        let z = BigUint::from_bytes_be(&buf);
        if &z < n {
            break z;
        }
    };

    let c = rsa_encrypt(key, &z).map_err(|e| CryptoError::Kem(e.to_string()))?;
    Ok((kdf1(&i2osp(&z, k)?), i2osp(&c, k)?))
}

/// Recover the key from an encapsulation produced by `encapsulate`
pub(crate) fn decapsulate(key: &RsaPrivateKey, encapsulated: &[u8]) -> CryptoResult<[u8; KEY_LEN]> {
    let k = key.size();
    if encapsulated.len() != k {
        return Err(CryptoError::InvalidEnvelope(format!(
            "encapsulated key is {} bytes, expected {}",
            encapsulated.len(),
            k
        )));
    }

    let c = BigUint::from_bytes_be(encapsulated);
    if &c >= key.n() {
        return Err(CryptoError::Kem("ciphertext out of range".to_string()));
    }

    let z = rsa_decrypt_and_check(key, Some(&mut OsRng), &c)
        .map_err(|e| CryptoError::Kem(e.to_string()))?;
    Ok(kdf1(&i2osp(&z, k)?))
}

fn i2osp(x: &BigUint, len: usize) -> CryptoResult<Vec<u8>> {
    let bytes = x.to_bytes_be();
    if bytes.len() > len {
        return Err(CryptoError::Kem("integer too large".to_string()));
    }
    let mut out = vec![0u8; len - bytes.len()];
    out.extend_from_slice(&bytes);
    Ok(out)
}

fn kdf1(secret: &[u8]) -> [u8; KEY_LEN] {
    let mut hasher = Sha256::new();
    hasher.update(secret);
    hasher.update(0u32.to_be_bytes());
    hasher.finalize().into()
}
