//! Cluster context
//!
//! Holds the node identity and the cluster key pair. Built once at startup and
//! handed to every component that signs, verifies, encrypts or decrypts.

use std::path::{Path, PathBuf};

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tandem_common::{
    TandemError, TandemResult,
    crypto::{StreamCipher, StreamDecipher, parse_private_key_pem, parse_public_key_pem},
};
use tracing::info;

/// Environment variables carrying PEM text; they win over key files
pub const PRIVATE_KEY_ENV: &str = "TANDEM_CLUSTER_PRIVATE_KEY";
pub const PUBLIC_KEY_ENV: &str = "TANDEM_CLUSTER_PUBLIC_KEY";

/// Lifetime of node tokens in seconds
pub const NODE_TOKEN_TTL_SECS: i64 = 3600;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NodeClaims {
    node_id: String,
    iat: i64,
    exp: i64,
}

pub struct ClusterContext {
    node_id: String,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    cipher: StreamCipher,
    decipher: StreamDecipher,
}

impl ClusterContext {
    /// Build a context with a fresh node id from PEM-encoded keys
    pub fn from_pem(private_pem: &str, public_pem: &str) -> TandemResult<Self> {
        let private_key = parse_private_key_pem(private_pem)?;
        let public_key = parse_public_key_pem(public_pem)?;
        if private_key.to_public_key() != public_key {
            return Err(TandemError::Config(
                "cluster public key does not match the private key".to_string(),
            ));
        }

        let encoding_key = EncodingKey::from_rsa_pem(private_pem.as_bytes())
            .map_err(|e| TandemError::Config(format!("invalid cluster private key: {}", e)))?;
        let decoding_key = DecodingKey::from_rsa_pem(public_pem.as_bytes())
            .map_err(|e| TandemError::Config(format!("invalid cluster public key: {}", e)))?;

        Ok(Self {
            node_id: uuid::Uuid::new_v4().to_string(),
            encoding_key,
            decoding_key,
            cipher: StreamCipher::new(public_key)?,
            decipher: StreamDecipher::new(private_key)?,
        })
    }

    /// Read keys from the environment, falling back to the given files
    pub fn load(private_path: &Path, public_path: &Path) -> TandemResult<Self> {
        let private_pem = read_pem(PRIVATE_KEY_ENV, private_path)?;
        let public_pem = read_pem(PUBLIC_KEY_ENV, public_path)?;
        let context = Self::from_pem(&private_pem, &public_pem)?;
        info!("Cluster keys loaded, node id {}", context.node_id);
        Ok(context)
    }

    pub fn with_node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = node_id.into();
        self
    }

    pub fn with_spill_threshold(mut self, threshold: usize) -> Self {
        self.cipher = self.cipher.with_spill_threshold(threshold);
        self
    }

    pub fn with_spill_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cipher = self.cipher.with_spill_dir(dir);
        self
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn cipher(&self) -> &StreamCipher {
        &self.cipher
    }

    pub fn decipher(&self) -> &StreamDecipher {
        &self.decipher
    }

    /// Sign `claims` with the cluster private key (RS256)
    pub fn sign<T: Serialize>(&self, claims: &T) -> TandemResult<String> {
        encode(&Header::new(Algorithm::RS256), claims, &self.encoding_key)
            .map_err(|e| TandemError::InvalidToken(format!("signing failed: {}", e)))
    }

    /// Verify a token signed by any holder of the cluster private key.
    /// The claims must carry an unexpired `exp`.
    pub fn verify<T: DeserializeOwned>(&self, token: &str) -> TandemResult<T> {
        decode::<T>(token, &self.decoding_key, &Validation::new(Algorithm::RS256))
            .map(|data| data.claims)
            .map_err(|e| TandemError::InvalidToken(e.to_string()))
    }

    /// Token asserting this node's identity
    pub fn node_token(&self) -> TandemResult<String> {
        let iat = chrono::Utc::now().timestamp();
        self.sign(&NodeClaims {
            node_id: self.node_id.clone(),
            iat,
            exp: iat + NODE_TOKEN_TTL_SECS,
        })
    }

    /// Check that `token` was issued for this node
    pub fn verify_node_token(&self, token: &str) -> TandemResult<()> {
        let claims: NodeClaims = self.verify(token)?;
        if claims.node_id != self.node_id {
            return Err(TandemError::InvalidToken(format!(
                "token issued for node {}, not {}",
                claims.node_id, self.node_id
            )));
        }
        Ok(())
    }
}

impl std::fmt::Debug for ClusterContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterContext")
            .field("node_id", &self.node_id)
            .finish_non_exhaustive()
    }
}

fn read_pem(env_var: &str, path: &Path) -> TandemResult<String> {
    if let Ok(pem) = std::env::var(env_var)
        && !pem.trim().is_empty()
    {
        return Ok(pem);
    }
    std::fs::read_to_string(path).map_err(|e| {
        TandemError::Config(format!(
            "cannot read cluster key {} (or set {}): {}",
            path.display(),
            env_var,
            e
        ))
    })
}
