//! Digest credentials.
//!
//! A digest credential is `user:password`. The server stores
//! `user:base64(sha1(user:password))` as the ACL id, which is what
//! [`digest_id`] produces.
use base64::{Engine as _, engine::general_purpose::STANDARD};
use ring::digest::{SHA1_FOR_LEGACY_USE_ONLY, digest};

use crate::error::{ZkError, ZkResult};

/// `Base64(SHA1(id_passwd))`
pub fn digest_encrypt(id_passwd: &str) -> String {
    let hash = digest(&SHA1_FOR_LEGACY_USE_ONLY, id_passwd.as_bytes());
    STANDARD.encode(hash.as_ref())
}

/// Turn a `user:password` credential into the `user:digest` ACL id.
pub fn digest_id(credential: &str) -> ZkResult<String> {
    let (user, _) = credential
        .split_once(':')
        .ok_or(ZkError::EncryptFailed)?;
    if user.is_empty() {
        return Err(ZkError::EncryptFailed);
    }
    Ok(format!("{user}:{}", digest_encrypt(credential)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_encrypt_known_value() {
        // sha1("super:secret") in base64
        assert_eq!(digest_encrypt("super:secret"), "lK75jTNcA+U9vtVEw5vB51mj/w4=");
    }

    #[test]
    fn test_digest_id() {
        let id = digest_id("super:secret").unwrap();
        assert_eq!(id, "super:lK75jTNcA+U9vtVEw5vB51mj/w4=");
        assert_eq!(digest_id("no-colon"), Err(ZkError::EncryptFailed));
        assert_eq!(digest_id(":pwd"), Err(ZkError::EncryptFailed));
    }
}
