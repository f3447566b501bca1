//! Session tokens
//!
//! A token binds a user id to a nickname with HMAC-SHA256 over a
//! server secret, so a reconnecting client can keep its identity.
//!
//! Layout: `base64(mac) ++ "uid" ++ decimal(user_id)` where the MAC
//! input is `nickname ++ secret ++ decimal(user_id)`.
//!
//! Tokens carry no expiry: a token stays valid for as long as the
//! secret does.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::types::UserId;

type HmacSha256 = Hmac<Sha256>;

/// Separator between the MAC and the user id
const DELIMITER: &str = "uid";

/// Issues and validates session tokens
#[derive(Clone)]
pub struct TokenAuthority {
    secret: String,
}

impl TokenAuthority {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Issue a token for `user_id` under `nickname`
    pub fn issue(&self, user_id: UserId, nickname: &str) -> String {
        let mac = self.mac(user_id, nickname).finalize().into_bytes();
        format!("{}{}{}", BASE64.encode(mac), DELIMITER, user_id.0)
    }

    /// Validate `token` for `nickname`
    ///
    /// Returns the user id the token was issued for, or `None` if the
    /// token is malformed or does not match. The id must be written
    /// exactly as `issue` writes it, so each identity has one token.
    pub fn validate(&self, token: &str, nickname: &str) -> Option<UserId> {
        let pos = token.rfind(DELIMITER)?;
        let (encoded, rest) = token.split_at(pos);
        let digits = &rest[DELIMITER.len()..];
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let user_id = digits.parse::<u64>().ok().map(UserId)?;
        if user_id.is_system() || user_id.0.to_string() != digits {
            return None;
        }

        let claimed = BASE64.decode(encoded).ok()?;
        self.mac(user_id, nickname)
            .verify_slice(&claimed)
            .ok()
            .map(|()| user_id)
    }

    fn mac(&self, user_id: UserId, nickname: &str) -> HmacSha256 {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .unwrap_or_else(|_| unreachable!("HMAC takes keys of any size"));
        mac.update(nickname.as_bytes());
        mac.update(self.secret.as_bytes());
        mac.update(user_id.0.to_string().as_bytes());
        mac
    }
}

impl std::fmt::Debug for TokenAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenAuthority").finish_non_exhaustive()
    }
}
