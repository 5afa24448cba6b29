//! Envelope encoder and decoder

use std::{
    io::SeekFrom,
    path::{Path, PathBuf},
    sync::Arc,
};

use rsa::{
    RsaPrivateKey, RsaPublicKey,
    rand_core::{OsRng, RngCore},
    traits::PublicKeyParts,
};
use tempfile::NamedTempFile;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use super::{
    CryptoError, CryptoResult,
    gcm::{BLOCK_LEN, Gcm, tags_equal},
    kem::{check_key_size, decapsulate, encapsulate},
};

pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = BLOCK_LEN;

/// Ciphertext kept in memory before spilling to disk
pub const DEFAULT_SPILL_THRESHOLD: usize = 4096;

const HEADER_LEN: usize = 3;
const KEY_WORD: usize = 8;
const COPY_BUF_LEN: usize = 64 * 1024;

// ============================================================================
// Encoding
// ============================================================================

/// Encrypts byte streams for holders of the cluster private key
#[derive(Clone)]
pub struct StreamCipher {
    public_key: Arc<RsaPublicKey>,
    spill_threshold: usize,
    spill_dir: Option<PathBuf>,
}

impl StreamCipher {
    pub fn new(public_key: RsaPublicKey) -> CryptoResult<Self> {
        check_key_size(&public_key)?;
        Ok(Self {
            public_key: Arc::new(public_key),
            spill_threshold: DEFAULT_SPILL_THRESHOLD,
            spill_dir: None,
        })
    }

    pub fn with_spill_threshold(mut self, threshold: usize) -> Self {
        self.spill_threshold = threshold;
        self
    }

    /// Directory for spill files; the OS temp dir when unset
    pub fn with_spill_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.spill_dir = Some(dir.into());
        self
    }

    pub fn spill_threshold(&self) -> usize {
        self.spill_threshold
    }

    /// Start a new envelope with a fresh key and nonce
    pub fn begin(&self) -> CryptoResult<EnvelopeEncoder> {
        let (key, encapsulated) = encapsulate(&self.public_key)?;
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        Ok(EnvelopeEncoder {
            gcm: Gcm::new(&key, &nonce),
            encapsulated,
            nonce,
            head: Vec::new(),
            spill: None,
            spill_threshold: self.spill_threshold,
            spill_dir: self.spill_dir.clone(),
            plaintext_len: 0,
        })
    }

    /// Encrypt everything `reader` yields into `writer`, returning the plaintext length
    pub async fn encrypt<R, W>(&self, reader: &mut R, writer: &mut W) -> CryptoResult<u64>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut encoder = self.begin()?;
        let mut buf = vec![0u8; COPY_BUF_LEN];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            encoder.update(&buf[..n]).await?;
        }
        encoder.finish(writer).await
    }

    /// Encrypt an in-memory payload into a complete envelope
    pub async fn seal(&self, plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
        let mut out = Vec::with_capacity(plaintext.len() + 512);
        let mut reader = plaintext;
        self.encrypt(&mut reader, &mut out).await?;
        Ok(out)
    }
}

struct Spill {
    file: tokio::fs::File,
    temp: NamedTempFile,
}

/// One envelope being written
///
/// Dropping the encoder before `finish` removes its spill file.
pub struct EnvelopeEncoder {
    gcm: Gcm,
    encapsulated: Vec<u8>,
    nonce: [u8; NONCE_LEN],
    head: Vec<u8>,
    spill: Option<Spill>,
    spill_threshold: usize,
    spill_dir: Option<PathBuf>,
    plaintext_len: u64,
}

impl EnvelopeEncoder {
    pub async fn update(&mut self, chunk: &[u8]) -> CryptoResult<()> {
        if chunk.is_empty() {
            return Ok(());
        }
        self.plaintext_len += chunk.len() as u64;

        let mut data = chunk.to_vec();
        self.gcm.encrypt_in_place(&mut data);

        let room = self.spill_threshold.saturating_sub(self.head.len());
        let (in_memory, overflow) = data.split_at(room.min(data.len()));
        self.head.extend_from_slice(in_memory);

        if !overflow.is_empty() {
            let spill = self.spill_file()?;
            spill.file.write_all(overflow).await?;
        }
        Ok(())
    }

    /// Path of the spill file, once ciphertext went past the threshold
    pub fn spill_path(&self) -> Option<&Path> {
        self.spill.as_ref().map(|s| s.temp.path())
    }

    /// Write header, head and spilled ciphertext to `writer`
    pub async fn finish<W>(mut self, writer: &mut W) -> CryptoResult<u64>
    where
        W: AsyncWrite + Unpin,
    {
        let tag = self.gcm.finalize();

        let mut prefix =
            Vec::with_capacity(HEADER_LEN + self.encapsulated.len() + NONCE_LEN + TAG_LEN);
        prefix.push((self.encapsulated.len() / KEY_WORD) as u8);
        prefix.push(NONCE_LEN as u8);
        prefix.push(TAG_LEN as u8);
        prefix.extend_from_slice(&self.encapsulated);
        prefix.extend_from_slice(&self.nonce);
        prefix.extend_from_slice(&tag);

        writer.write_all(&prefix).await?;
        writer.write_all(&self.head).await?;

        if let Some(mut spill) = self.spill.take() {
            spill.file.flush().await?;
            spill.file.seek(SeekFrom::Start(0)).await?;
            let replayed = tokio::io::copy(&mut spill.file, writer).await?;
            debug!(
                "Replayed {} spilled bytes from {}",
                replayed,
                spill.temp.path().display()
            );
            drop(spill.file);
            spill.temp.close()?;
        }

        writer.flush().await?;
        Ok(self.plaintext_len)
    }

    fn spill_file(&mut self) -> CryptoResult<&mut Spill> {
        if self.spill.is_none() {
            let temp = match &self.spill_dir {
                Some(dir) => NamedTempFile::new_in(dir)?,
                None => NamedTempFile::new()?,
            };
            let file = tokio::fs::File::from_std(temp.reopen()?);
            debug!("Spilling envelope ciphertext to {}", temp.path().display());
            self.spill = Some(Spill { file, temp });
        }
        self.spill
            .as_mut()
            .ok_or_else(|| CryptoError::InvalidEnvelope("spill file unavailable".to_string()))
    }
}

// ============================================================================
// Decoding
// ============================================================================

/// Decrypts envelopes produced by `StreamCipher`
#[derive(Clone)]
pub struct StreamDecipher {
    private_key: Arc<RsaPrivateKey>,
}

impl StreamDecipher {
    pub fn new(private_key: RsaPrivateKey) -> CryptoResult<Self> {
        check_key_size(&private_key.to_public_key())?;
        Ok(Self {
            private_key: Arc::new(private_key),
        })
    }

    pub fn begin(&self) -> EnvelopeDecoder {
        EnvelopeDecoder {
            private_key: self.private_key.clone(),
            state: DecodeState::Header(Vec::new()),
        }
    }

    /// Decrypt an envelope from `reader` into `writer`, returning the plaintext length
    ///
    /// Plaintext reaches `writer` before the tag is checked; the error at the
    /// end is what tells the consumer to discard it.
    pub async fn decrypt<R, W>(&self, reader: &mut R, writer: &mut W) -> CryptoResult<u64>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut decoder = self.begin();
        let mut buf = vec![0u8; COPY_BUF_LEN];
        let mut total = 0u64;
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            let plain = decoder.update(&buf[..n])?;
            total += plain.len() as u64;
            writer.write_all(&plain).await?;
        }
        decoder.finish()?;
        writer.flush().await?;
        Ok(total)
    }

    /// Decrypt a complete in-memory envelope
    pub async fn open(&self, envelope: &[u8]) -> CryptoResult<Vec<u8>> {
        let mut out = Vec::with_capacity(envelope.len());
        let mut reader = envelope;
        self.decrypt(&mut reader, &mut out).await?;
        Ok(out)
    }
}

enum DecodeState {
    Header(Vec<u8>),
    Body { gcm: Gcm, tag: [u8; TAG_LEN] },
}

/// Push-based envelope decoder
pub struct EnvelopeDecoder {
    private_key: Arc<RsaPrivateKey>,
    state: DecodeState,
}

impl EnvelopeDecoder {
    /// Feed envelope bytes, returning whatever plaintext they complete
    pub fn update(&mut self, chunk: &[u8]) -> CryptoResult<Vec<u8>> {
        match &mut self.state {
            DecodeState::Body { gcm, .. } => {
                let mut data = chunk.to_vec();
                gcm.decrypt_in_place(&mut data);
                Ok(data)
            }
            DecodeState::Header(buffered) => {
                buffered.extend_from_slice(chunk);
                let Some(fields_end) = header_end(buffered)? else {
                    return Ok(Vec::new());
                };

                let key_len = buffered[0] as usize * KEY_WORD;
                let encapsulated = &buffered[HEADER_LEN..HEADER_LEN + key_len];
                let nonce_start = HEADER_LEN + key_len;
                let mut nonce = [0u8; NONCE_LEN];
                nonce.copy_from_slice(&buffered[nonce_start..nonce_start + NONCE_LEN]);
                let mut tag = [0u8; TAG_LEN];
                tag.copy_from_slice(&buffered[nonce_start + NONCE_LEN..fields_end]);

                let key = decapsulate(&self.private_key, encapsulated)?;
                let mut gcm = Gcm::new(&key, &nonce);

                let mut rest = buffered[fields_end..].to_vec();
                gcm.decrypt_in_place(&mut rest);
                self.state = DecodeState::Body { gcm, tag };
                Ok(rest)
            }
        }
    }

    /// Whether the header has been fully received
    pub fn header_complete(&self) -> bool {
        matches!(self.state, DecodeState::Body { .. })
    }

    /// Verify the authentication tag once all bytes were fed
    pub fn finish(self) -> CryptoResult<()> {
        match self.state {
            DecodeState::Header(_) => Err(CryptoError::Truncated),
            DecodeState::Body { gcm, tag } => {
                if tags_equal(&gcm.finalize(), &tag) {
                    Ok(())
                } else {
                    Err(CryptoError::AuthenticationFailed)
                }
            }
        }
    }
}

/// Offset where the variable-length fields end, once they are all buffered
fn header_end(buffered: &[u8]) -> CryptoResult<Option<usize>> {
    if buffered.len() < HEADER_LEN {
        return Ok(None);
    }
    let (key_words, nonce_len, tag_len) = (buffered[0], buffered[1], buffered[2]);
    if key_words == 0 || nonce_len as usize != NONCE_LEN || tag_len as usize != TAG_LEN {
        return Err(CryptoError::InvalidEnvelope(format!(
            "unsupported header [{}, {}, {}]",
            key_words, nonce_len, tag_len
        )));
    }

    let end = HEADER_LEN + key_words as usize * KEY_WORD + NONCE_LEN + TAG_LEN;
    Ok((buffered.len() >= end).then_some(end))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::kem::tests::test_keys;

    fn codec() -> (StreamCipher, StreamDecipher) {
        let (private, public) = test_keys();
        (
            StreamCipher::new(public).unwrap(),
            StreamDecipher::new(private).unwrap(),
        )
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 253) as u8).collect()
    }

    #[tokio::test]
    async fn test_round_trip_across_spill_threshold() {
        let (cipher, decipher) = codec();

        for len in [0usize, 10, 4095, 4096, 4097, 10_000_000] {
            let plaintext = payload(len);
            let envelope = cipher.seal(&plaintext).await.unwrap();
            assert_eq!(envelope.len(), HEADER_LEN + 256 + NONCE_LEN + TAG_LEN + len);

            let decrypted = decipher.open(&envelope).await.unwrap();
            assert_eq!(decrypted.len(), len);
            assert!(decrypted == plaintext, "round trip failed for {} bytes", len);
        }
    }

    #[tokio::test]
    async fn test_header_layout() {
        let (cipher, _) = codec();
        let envelope = cipher.seal(b"hello").await.unwrap();
        assert_eq!(&envelope[..3], &[32, 12, 16]);
    }

    #[tokio::test]
    async fn test_decoder_accepts_byte_at_a_time() {
        let (cipher, decipher) = codec();
        let plaintext = payload(300);
        let envelope = cipher.seal(&plaintext).await.unwrap();

        let mut decoder = decipher.begin();
        let mut out = Vec::new();
        for byte in &envelope {
            out.extend(decoder.update(std::slice::from_ref(byte)).unwrap());
        }
        assert!(decoder.header_complete());
        decoder.finish().unwrap();
        assert_eq!(out, plaintext);
    }

    #[tokio::test]
    async fn test_spill_file_removed_after_finish() {
        let dir = tempfile::tempdir().unwrap();
        let (cipher, decipher) = codec();
        let cipher = cipher.with_spill_threshold(64).with_spill_dir(dir.path());

        let mut encoder = cipher.begin().unwrap();
        encoder.update(&payload(1000)).await.unwrap();
        let spill_path = encoder.spill_path().unwrap().to_path_buf();
        assert!(spill_path.exists());

        let mut envelope = Vec::new();
        encoder.finish(&mut envelope).await.unwrap();
        assert!(!spill_path.exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);

        assert_eq!(decipher.open(&envelope).await.unwrap(), payload(1000));
    }

    #[tokio::test]
    async fn test_spill_file_removed_when_abandoned() {
        let dir = tempfile::tempdir().unwrap();
        let (cipher, _) = codec();
        let cipher = cipher.with_spill_threshold(16).with_spill_dir(dir.path());

        let mut encoder = cipher.begin().unwrap();
        encoder.update(&payload(100)).await.unwrap();
        assert!(encoder.spill_path().is_some());
        drop(encoder);

        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_no_spill_below_threshold() {
        let (cipher, _) = codec();
        let mut encoder = cipher.begin().unwrap();
        encoder.update(&payload(4096)).await.unwrap();
        assert!(encoder.spill_path().is_none());
        encoder.update(&[1]).await.unwrap();
        assert!(encoder.spill_path().is_some());
    }

    #[tokio::test]
    async fn test_tampered_ciphertext_fails_authentication() {
        let (cipher, decipher) = codec();
        let mut envelope = cipher.seal(&payload(5000)).await.unwrap();
        let last = envelope.len() - 1;
        envelope[last] ^= 0x01;

        let result = decipher.open(&envelope).await;
        assert!(matches!(result, Err(CryptoError::AuthenticationFailed)));
    }

    #[tokio::test]
    async fn test_truncated_body_fails_authentication() {
        let (cipher, decipher) = codec();
        let envelope = cipher.seal(&payload(100)).await.unwrap();

        let result = decipher.open(&envelope[..envelope.len() - 10]).await;
        assert!(matches!(result, Err(CryptoError::AuthenticationFailed)));
    }

    #[tokio::test]
    async fn test_truncated_header() {
        let (cipher, decipher) = codec();
        let envelope = cipher.seal(b"abc").await.unwrap();

        let result = decipher.open(&envelope[..100]).await;
        assert!(matches!(result, Err(CryptoError::Truncated)));
    }

    #[test]
    fn test_rejects_unknown_header() {
        let (_, decipher) = codec();
        let mut decoder = decipher.begin();
        let result = decoder.update(&[32, 24, 16]);
        assert!(matches!(result, Err(CryptoError::InvalidEnvelope(_))));
    }
}
