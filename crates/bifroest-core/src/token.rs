//! Shared access token gating transport-level connections.
//!
//! The master proves knowledge of the token without sending it:
//! `proof = HMAC-SHA256(token, session_id || master_nonce)`.

use std::fmt;
use std::str::FromStr;

use ring::hmac;
use ring::rand::{SecureRandom, SystemRandom};

use crate::error::{ImpError, ImpResult};
use crate::ids::SessionId;

/// Length of a generated token in bytes.
pub const TOKEN_LEN: usize = 32;

/// A shared secret between master and imp.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken(Vec<u8>);

impl AccessToken {
    pub fn new(bytes: impl Into<Vec<u8>>) -> ImpResult<Self> {
        let bytes = bytes.into();
        if bytes.is_empty() {
            return Err(ImpError::InvalidParameters("empty access token".into()));
        }
        Ok(Self(bytes))
    }

    /// Generate a random token of [`TOKEN_LEN`] bytes.
    pub fn generate() -> ImpResult<Self> {
        let mut bytes = vec![0u8; TOKEN_LEN];
        SystemRandom::new()
            .fill(&mut bytes)
            .map_err(|_| ImpError::InvalidParameters("system random source failed".into()))?;
        Ok(Self(bytes))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    /// Compute the proof for one handshake.
    pub fn proof(&self, session_id: &SessionId, nonce: &[u8]) -> Vec<u8> {
        let key = hmac::Key::new(hmac::HMAC_SHA256, &self.0);
        let mut ctx = hmac::Context::with_key(&key);
        ctx.update(session_id.as_bytes());
        ctx.update(nonce);
        ctx.sign().as_ref().to_vec()
    }

    /// Check a proof in constant time.
    pub fn verify(&self, session_id: &SessionId, nonce: &[u8], proof: &[u8]) -> ImpResult<()> {
        let key = hmac::Key::new(hmac::HMAC_SHA256, &self.0);
        let mut data = Vec::with_capacity(16 + nonce.len());
        data.extend_from_slice(session_id.as_bytes());
        data.extend_from_slice(nonce);
        hmac::verify(&key, &data, proof)
            .map_err(|_| ImpError::AuthenticationFailed("invalid access token proof".into()))
    }
}

impl FromStr for AccessToken {
    type Err = ImpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s.trim())
            .map_err(|e| ImpError::Format(format!("access token is not hex: {e}")))?;
        Self::new(bytes)
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AccessToken(<{} bytes>)", self.0.len())
    }
}
