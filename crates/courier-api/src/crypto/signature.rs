//! Callback signature verification.
//!
//! The platform signs callbacks by sorting the token, timestamp, nonce and
//! (when present) the payload lexicographically, concatenating them, and
//! taking the hex SHA-1 of the result.

use sha1::{Digest, Sha1};

/// Hex SHA-1 over the lexicographically sorted `parts`.
pub fn compute_signature(parts: &[&str]) -> String {
    let mut sorted = parts.to_vec();
    sorted.sort_unstable();

    let mut hasher = Sha1::new();
    for part in sorted {
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Checks `signature` against token, timestamp, nonce, and optional payload.
pub fn verify_signature(token: &str, timestamp: &str, nonce: &str, signature: &str, payload: Option<&str>) -> bool {
    let expected = match payload {
        Some(payload) => compute_signature(&[token, timestamp, nonce, payload]),
        None => compute_signature(&[token, timestamp, nonce]),
    };
    timing_safe_eq(&expected, &signature.to_ascii_lowercase())
}

/// Verifier bound to one tenant's callback token.
#[derive(Clone)]
pub struct SignatureVerifier {
    token: String,
}

impl std::fmt::Debug for SignatureVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureVerifier").finish_non_exhaustive()
    }
}

impl SignatureVerifier {
    /// Creates a verifier for `token`.
    pub fn new(token: impl Into<String>) -> Self {
        Self { token: token.into() }
    }

    /// Signature the platform would send for these inputs.
    pub fn sign(&self, timestamp: &str, nonce: &str, payload: Option<&str>) -> String {
        match payload {
            Some(payload) => compute_signature(&[&self.token, timestamp, nonce, payload]),
            None => compute_signature(&[&self.token, timestamp, nonce]),
        }
    }

    /// URL verification: the echo string is part of the signed set.
    pub fn verify_echo(&self, timestamp: &str, nonce: &str, signature: &str, echostr: &str) -> bool {
        verify_signature(&self.token, timestamp, nonce, signature, Some(echostr))
    }

    /// Message callbacks: accepts a signature over the encrypted body or over
    /// token, timestamp and nonce alone.
    pub fn verify_message(&self, timestamp: &str, nonce: &str, signature: &str, encrypted: Option<&str>) -> bool {
        let over_body = encrypted.is_some_and(|body| verify_signature(&self.token, timestamp, nonce, signature, Some(body)));
        over_body || verify_signature(&self.token, timestamp, nonce, signature, None)
    }
}

/// Constant-time string comparison.
fn timing_safe_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (a_byte, b_byte) in a.as_bytes().iter().zip(b.as_bytes()) {
        result |= a_byte ^ b_byte;
    }

    result == 0
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn matches_known_vector() {
        // sha1("1409659589263abcnoncetoken") with parts sorted as 1409659589, 263abc, nonce, token
        let expected = {
            let mut hasher = Sha1::new();
            hasher.update(b"1409659589263abcnoncetoken");
            hex::encode(hasher.finalize())
        };
        assert_eq!(compute_signature(&["token", "1409659589", "nonce", "263abc"]), expected);
    }

    #[test]
    fn order_of_inputs_does_not_matter() {
        assert_eq!(compute_signature(&["b", "a", "c"]), compute_signature(&["c", "b", "a"]));
    }

    #[test]
    fn echo_signature_covers_echostr() {
        let verifier = SignatureVerifier::new("tok");
        let signature = verifier.sign("1700000000", "n1", Some("echo"));

        assert!(verifier.verify_echo("1700000000", "n1", &signature, "echo"));
        assert!(!verifier.verify_echo("1700000000", "n1", &signature, "other"));
        assert!(verifier.verify_echo("1700000000", "n1", &signature.to_uppercase(), "echo"));
    }

    #[test]
    fn message_signature_accepts_both_sets() {
        let verifier = SignatureVerifier::new("tok");
        let over_body = verifier.sign("1", "n", Some("ENCRYPTED"));
        let bare = verifier.sign("1", "n", None);

        assert!(verifier.verify_message("1", "n", &over_body, Some("ENCRYPTED")));
        assert!(verifier.verify_message("1", "n", &bare, Some("ENCRYPTED")));
        assert!(verifier.verify_message("1", "n", &bare, None));
        assert!(!verifier.verify_message("1", "n", &over_body, None));
        assert!(!verifier.verify_message("2", "n", &bare, None));
    }

    #[test]
    fn timing_safe_eq_cases() {
        assert!(timing_safe_eq("hello", "hello"));
        assert!(!timing_safe_eq("hello", "world"));
        assert!(!timing_safe_eq("hello", "hello_world"));
    }

    fn mutate(s: &str, index: usize) -> String {
        let mut chars: Vec<char> = s.chars().collect();
        let i = index % chars.len();
        chars[i] = if chars[i] == 'x' { 'y' } else { 'x' };
        chars.into_iter().collect()
    }

    proptest! {
        #[test]
        fn any_single_character_mutation_fails(
            token in "[a-zA-Z0-9]{1,32}",
            timestamp in "[0-9]{10}",
            nonce in "[a-z0-9]{1,16}",
            payload in "[A-Za-z0-9+/=]{1,64}",
            which in 0usize..5,
            index in 0usize..64,
        ) {
            let signature = compute_signature(&[&token, &timestamp, &nonce, &payload]);
            prop_assert!(verify_signature(&token, &timestamp, &nonce, &signature, Some(&payload)));

            let (mut t, mut ts, mut n, mut p, mut s) =
                (token.clone(), timestamp.clone(), nonce.clone(), payload.clone(), signature.clone());
            match which {
                0 => t = mutate(&t, index),
                1 => ts = mutate(&ts, index),
                2 => n = mutate(&n, index),
                3 => p = mutate(&p, index),
                _ => s = mutate(&s, index),
            }
            prop_assert!(!verify_signature(&t, &ts, &n, &s, Some(&p)));
        }
    }
}
