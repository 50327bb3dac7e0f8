use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::HashSet;

pub(crate) const SECRET_LENGTH: usize = 64;

/// Pending per-plugin secrets: issued before a plugin is spawned and
/// consumed by the matching registration.
#[derive(Default)]
pub(crate) struct SecretRegistry {
    pending: Mutex<HashSet<String>>,
}

impl SecretRegistry {
    /// Generate a fresh single-use token and record it as pending.
    pub fn issue(&self) -> String {
        let token: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(SECRET_LENGTH)
            .map(char::from)
            .collect();
        self.pending.lock().insert(token.clone());
        token
    }

    /// Consume a token presented by a registering plugin. Returns whether
    /// the token was pending.
    pub fn take(&self, token: &str) -> bool {
        self.pending.lock().remove(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_tokens_have_contract_shape() {
        let registry = SecretRegistry::default();
        let token = registry.issue();
        assert_eq!(token.len(), SECRET_LENGTH);
        assert!(token.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn tokens_are_single_use() {
        let registry = SecretRegistry::default();
        let token = registry.issue();
        assert!(registry.take(&token));
        assert!(!registry.take(&token));
    }

    #[test]
    fn unknown_tokens_do_not_match() {
        let registry = SecretRegistry::default();
        registry.issue();
        assert!(!registry.take("not-a-token"));
    }
}
