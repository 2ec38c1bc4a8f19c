//! One-time bearer credentials for guest checkouts.
//!
//! A registration id is guessable, so an unauthenticated guest must present
//! a secret to authorize payment for their registration. Only a salted hash
//! is persisted; the plaintext crosses the wire exactly once.

use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// 128 bits of entropy.
const TOKEN_BYTES: usize = 16;
const SALT_BYTES: usize = 16;

/// Hard expiry window. No grace period, no renewal; an expired token means
/// the guest restarts registration.
pub fn token_ttl() -> Duration {
    Duration::hours(1)
}

pub struct IssuedCredential {
    pub plaintext: String,
    pub token_hash: String,
    pub expires_at: DateTime<Utc>,
}

pub fn issue(now: DateTime<Utc>) -> IssuedCredential {
    let mut token = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut token);
    let plaintext = hex::encode(token);

    let mut salt = [0u8; SALT_BYTES];
    OsRng.fill_bytes(&mut salt);

    let token_hash = format!("{}${}", hex::encode(salt), hex::encode(digest(&salt, &plaintext)));

    IssuedCredential {
        plaintext,
        token_hash,
        expires_at: now + token_ttl(),
    }
}

/// Constant-time comparison of a presented token against the stored
/// `salt$digest` hash, plus the expiry check. Both must pass.
pub fn verify(
    stored_hash: &str,
    expires_at: DateTime<Utc>,
    presented: &str,
    now: DateTime<Utc>,
) -> bool {
    if now >= expires_at {
        return false;
    }

    let Some((salt_hex, digest_hex)) = stored_hash.split_once('$') else {
        return false;
    };
    let (Ok(salt), Ok(expected)) = (hex::decode(salt_hex), hex::decode(digest_hex)) else {
        return false;
    };

    let mut mac = HmacSha256::new_from_slice(&salt).expect("HMAC can take key of any size");
    mac.update(presented.as_bytes());
    mac.verify_slice(&expected).is_ok()
}

fn digest(salt: &[u8], token: &str) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(salt).expect("HMAC can take key of any size");
    mac.update(token.as_bytes());
    mac.finalize().into_bytes().to_vec()
}
