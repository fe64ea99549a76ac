/// PKCE (Proof Key for Code Exchange) values for the Kick sign-in
/// RFC 7636: https://tools.ietf.org/html/rfc7636
use crate::error::{AuthError, Result};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

/// Length of the generated code verifier
pub const CODE_VERIFIER_LEN: usize = 32;

/// Length of each base-36 half of the generated state
const STATE_HALF_LEN: usize = 12;

const BASE36: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Source of cryptographically secure random bytes
pub trait RandomSource: Send + Sync {
    /// Fill `dest` with random bytes
    fn fill_bytes(&self, dest: &mut [u8]) -> Result<()>;
}

/// Operating system CSPRNG
#[derive(Debug, Default, Clone, Copy)]
pub struct OsRandom;

impl RandomSource for OsRandom {
    fn fill_bytes(&self, dest: &mut [u8]) -> Result<()> {
        OsRng
            .try_fill_bytes(dest)
            .map_err(|e| AuthError::RandomUnavailable(e.to_string()))
    }
}

/// Generate a code verifier
///
/// 32 random bytes, each mapped onto the lowercase latin alphabet with
/// `byte % 26`. The provider accepts this shape; note it carries less entropy
/// than a verifier over the full unreserved character set.
pub fn generate_code_verifier(random: &dyn RandomSource) -> Result<String> {
    let mut bytes = [0u8; CODE_VERIFIER_LEN];
    random.fill_bytes(&mut bytes)?;

    Ok(bytes.iter().map(|b| char::from(b'a' + b % 26)).collect())
}

/// Derive the S256 code challenge for a verifier
pub fn generate_code_challenge(code_verifier: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(code_verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

/// Generate an opaque anti-CSRF state value
///
/// Two base-36 halves of 12 characters each.
pub fn generate_state(random: &dyn RandomSource) -> Result<String> {
    let mut bytes = [0u8; STATE_HALF_LEN * 2];
    random.fill_bytes(&mut bytes)?;

    let (first, second) = bytes.split_at(STATE_HALF_LEN);
    let mut state = String::with_capacity(bytes.len());
    for half in [first, second] {
        state.extend(half.iter().map(|b| char::from(BASE36[usize::from(*b) % 36])));
    }
    Ok(state)
}

/// PKCE challenge pair containing code verifier and code challenge
#[derive(Debug, Clone)]
pub struct Pkce {
    code_verifier: String,
    code_challenge: String,
}

impl Pkce {
    /// Generate a new PKCE challenge pair
    ///
    /// # Examples
    ///
    /// ```
    /// use kick_session::pkce::{OsRandom, Pkce};
    ///
    /// let pkce = Pkce::generate(&OsRandom).unwrap();
    /// assert_eq!(pkce.code_verifier().len(), 32);
    /// assert_eq!(Pkce::code_challenge_method(), "S256");
    /// ```
    pub fn generate(random: &dyn RandomSource) -> Result<Self> {
        let code_verifier = generate_code_verifier(random)?;
        let code_challenge = generate_code_challenge(&code_verifier);

        Ok(Self {
            code_verifier,
            code_challenge,
        })
    }

    /// Get the code verifier
    pub fn code_verifier(&self) -> &str {
        &self.code_verifier
    }

    /// Get the code challenge
    pub fn code_challenge(&self) -> &str {
        &self.code_challenge
    }

    /// Get the code challenge method (always S256)
    pub fn code_challenge_method() -> &'static str {
        "S256"
    }
}
