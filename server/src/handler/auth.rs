use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// Deterministic credential digests and session tokens.
///
/// Everything here runs inside the replicated state machine, so no salt or
/// token may depend on randomness or the local clock.
#[derive(Clone)]
pub struct Authenticator {
    key: Vec<u8>,
}

impl Authenticator {
    pub fn new(signing_key: impl AsRef<[u8]>) -> Self {
        Self {
            key: signing_key.as_ref().to_vec(),
        }
    }

    pub fn password_digest(&self, username: &str, password: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(username.as_bytes());
        hasher.update([0u8]);
        hasher.update(password.as_bytes());
        const_hex::encode(hasher.finalize())
    }

    pub fn check_password(&self, username: &str, password: &str, digest: &str) -> bool {
        self.password_digest(username, password) == digest
    }

    /// Token bound to `user_id` under the node's signing key.
    pub fn issue_token(&self, user_id: &str) -> String {
        match self.mac(user_id) {
            Some(mac) => const_hex::encode(mac.finalize().into_bytes()),
            None => String::new(),
        }
    }

    pub fn verify_token(&self, user_id: &str, token: &str) -> bool {
        let Ok(expected) = const_hex::decode(token) else {
            return false;
        };
        self.mac(user_id)
            .map(|mac| mac.verify_slice(&expected).is_ok())
            .unwrap_or(false)
    }

    fn mac(&self, user_id: &str) -> Option<HmacSha256> {
        // HMAC accepts keys of any length, so this only fails on a broken build.
        let mut mac = HmacSha256::new_from_slice(&self.key).ok()?;
        mac.update(user_id.as_bytes());
        Some(mac)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_digest() {
        let auth = Authenticator::new("key");
        let digest = auth.password_digest("alice", "secret");
        assert_eq!(digest.len(), 64);
        assert!(auth.check_password("alice", "secret", &digest));
        assert!(!auth.check_password("alice", "wrong", &digest));
        // Same password, different user, different digest.
        assert_ne!(digest, auth.password_digest("bob", "secret"));
    }

    #[test]
    fn test_token_round_trip() {
        let auth = Authenticator::new("key");
        let token = auth.issue_token("user-1");
        assert!(auth.verify_token("user-1", &token));
        assert!(!auth.verify_token("user-2", &token));
        assert!(!auth.verify_token("user-1", "zz-not-hex"));
    }

    #[test]
    fn test_token_depends_on_key() {
        let token = Authenticator::new("key-a").issue_token("user-1");
        assert!(!Authenticator::new("key-b").verify_token("user-1", &token));
    }
}
