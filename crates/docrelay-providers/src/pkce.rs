//! RFC 7636 proof key and CSRF state for one authorization attempt.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::Rng as _;
use sha2::{Digest, Sha256};

/// Random bytes behind the verifier (43 characters once encoded).
const VERIFIER_BYTES: usize = 32;
const STATE_BYTES: usize = 16;

/// Verifier, challenge and state of a single grant attempt.
///
/// A new value is created for every `begin_authorization`, so a redirect
/// from an earlier attempt never matches the current `state`.
#[derive(Debug, Clone)]
pub struct PkceFlow {
    /// High-entropy secret sent with the code exchange.
    pub verifier: String,
    /// Base64url SHA-256 of the verifier, sent with the authorization URL.
    pub challenge: String,
    /// Opaque value echoed back on the redirect.
    pub state: String,
}

impl PkceFlow {
    /// Creates a flow with a random verifier and state.
    pub fn new() -> Self {
        let verifier = random_token(VERIFIER_BYTES);
        let challenge = challenge_for(&verifier);
        Self {
            verifier,
            challenge,
            state: random_token(STATE_BYTES),
        }
    }

    /// Returns true if `state` came from this attempt.
    pub fn state_matches(&self, state: &str) -> bool {
        self.state == state
    }
}

impl Default for PkceFlow {
    fn default() -> Self {
        Self::new()
    }
}

fn random_token(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::rng().fill(bytes.as_mut_slice());
    URL_SAFE_NO_PAD.encode(bytes)
}

fn challenge_for(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verifier_length() {
        assert_eq!(PkceFlow::new().verifier.len(), 43);
    }

    #[test]
    fn challenge_matches_rfc_example() {
        // RFC 7636 appendix B
        let challenge = challenge_for("dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk");
        assert_eq!(challenge, "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM");
    }

    #[test]
    fn flows_are_random() {
        let a = PkceFlow::new();
        let b = PkceFlow::new();
        assert_ne!(a.verifier, b.verifier);
        assert_ne!(a.state, b.state);
        assert!(a.state_matches(&a.state.clone()));
        assert!(!a.state_matches(&b.state));
    }
}
