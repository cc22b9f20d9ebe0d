//! API key authentication.
//!
//! The service never compares presented keys directly. It keeps an
//! HMAC-SHA256 digest of the configured key (keyed by the account name) and
//! verifies the digest of each presented key in constant time.

use crate::error::{ServiceError, ServiceResult};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Validates account/key pairs.
#[derive(Clone)]
pub struct KeyValidator {
    account: String,
    digest: Vec<u8>,
}

impl KeyValidator {
    /// Creates a validator for one account.
    pub fn new(account: impl Into<String>, api_key: &str) -> ServiceResult<Self> {
        let account = account.into();
        let mut mac = Self::mac(&account)?;
        mac.update(api_key.as_bytes());
        let digest = mac.finalize().into_bytes().to_vec();
        Ok(Self { account, digest })
    }

    /// The account this validator guards.
    pub fn account(&self) -> &str {
        &self.account
    }

    /// Checks a presented key for `account`.
    pub fn validate(&self, account: &str, api_key: &str) -> ServiceResult<()> {
        if account != self.account {
            return Err(ServiceError::Forbidden(format!("account {account}")));
        }
        self.validate_key(api_key)
    }

    /// Checks a presented key for the guarded account.
    pub fn validate_key(&self, api_key: &str) -> ServiceResult<()> {
        let mut mac = Self::mac(&self.account)?;
        mac.update(api_key.as_bytes());
        mac.verify_slice(&self.digest)
            .map_err(|_| ServiceError::Unauthorized("invalid API key".into()))
    }

    fn mac(account: &str) -> ServiceResult<HmacSha256> {
        HmacSha256::new_from_slice(account.as_bytes())
            .map_err(|e| ServiceError::Internal(e.to_string()))
    }
}
