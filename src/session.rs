//! Bearer session tokens.
//!
//! A token is `<user_id>.<hex hmac-sha256(secret, user_id)>`. Verifying one
//! yields the [`Identity`] that every pipeline call receives; nothing
//! downstream looks up the current user on its own.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

use crate::error::ErrorKind;
use crate::models::Identity;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("missing bearer token")]
    Missing,
    #[error("malformed bearer token")]
    Malformed,
    #[error("invalid token signature")]
    InvalidSignature,
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Unauthorized
    }
}

/// Issues and verifies session tokens with a shared secret.
#[derive(Clone)]
pub struct SessionKeys {
    secret: Vec<u8>,
}

impl SessionKeys {
    pub fn new(secret: &str) -> Self {
        Self {
            secret: secret.as_bytes().to_vec(),
        }
    }

    fn mac(&self) -> HmacSha256 {
        HmacSha256::new_from_slice(&self.secret).expect("HMAC can take key of any size")
    }

    pub fn issue(&self, user_id: &str) -> Result<String, SessionError> {
        if user_id.trim().is_empty() {
            return Err(SessionError::Malformed);
        }
        let mut mac = self.mac();
        mac.update(user_id.as_bytes());
        Ok(format!(
            "{}.{}",
            user_id,
            hex::encode(mac.finalize().into_bytes())
        ))
    }

    pub fn verify(&self, token: &str) -> Result<Identity, SessionError> {
        let (user_id, signature) = token.rsplit_once('.').ok_or(SessionError::Malformed)?;
        if user_id.is_empty() {
            return Err(SessionError::Malformed);
        }
        let signature = hex::decode(signature).map_err(|_| SessionError::Malformed)?;

        let mut mac = self.mac();
        mac.update(user_id.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| SessionError::InvalidSignature)?;
        Ok(Identity::new(user_id))
    }

    /// Verify the value of an `Authorization` header.
    pub fn authenticate(&self, header: Option<&str>) -> Result<Identity, SessionError> {
        let header = header.ok_or(SessionError::Missing)?;
        let token = header
            .strip_prefix("Bearer ")
            .ok_or(SessionError::Malformed)?
            .trim();
        self.verify(token)
    }
}
