//! Content hashing

use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Lower-case hex SHA-256 of everything `reader` yields
pub async fn sha256_hex<R>(reader: &mut R) -> std::io::Result<String>
where
    R: AsyncRead + Unpin,
{
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 16 * 1024];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(const_hex::encode(hasher.finalize()))
}

pub fn sha256_hex_bytes(data: &[u8]) -> String {
    const_hex::encode(Sha256::digest(data))
}
