//! Branch passwords and the per-session verification cookie.
//!
//! A password is stored as `<salt>$<hex hmac_sha256(secret, salt, password)>`.
//! The cookie carries a token derived from the branch id and the current
//! seal, so changing or clearing the password invalidates old sessions.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::{PipelineError, PipelineResult};
use crate::model::Id;

const MAX_PASSWORD_LEN: usize = 256;
const COOKIE_PREFIX: &str = "branch_auth_";

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone)]
pub struct PasswordSealer {
    secret: String,
}

impl std::fmt::Debug for PasswordSealer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PasswordSealer").finish_non_exhaustive()
    }
}

/// Hex HMAC-SHA256 over `parts`, each length-prefixed so boundaries cannot shift
fn keyed_digest(secret: &str, parts: &[&str]) -> PipelineResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| PipelineError::Internal(anyhow::anyhow!("invalid password secret: {}", e)))?;
    for part in parts {
        mac.update(&(part.len() as u64).to_be_bytes());
        mac.update(part.as_bytes());
    }
    Ok(hex::encode(mac.finalize().into_bytes()))
}

fn digests_match(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

pub fn validate_password(password: &str) -> PipelineResult<()> {
    if password.is_empty() {
        return Err(PipelineError::validation("password cannot be empty"));
    }
    if password.len() > MAX_PASSWORD_LEN {
        return Err(PipelineError::validation(format!(
            "password exceeds {} bytes",
            MAX_PASSWORD_LEN
        )));
    }
    Ok(())
}

impl PasswordSealer {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    pub fn seal(&self, password: &str) -> PipelineResult<String> {
        let salt = crate::model::generate_dir_name();
        let digest = keyed_digest(&self.secret, &[&salt, password])?;
        Ok(format!("{}${}", salt, digest))
    }

    pub fn verify(&self, password: &str, seal: &str) -> bool {
        let Some((salt, expected)) = seal.split_once('$') else {
            return false;
        };
        keyed_digest(&self.secret, &[salt, password])
            .map_or(false, |digest| digests_match(&digest, expected))
    }

    pub fn session_token(&self, branch_id: Id, seal: &str) -> PipelineResult<String> {
        keyed_digest(&self.secret, &["session", &branch_id.to_string(), seal])
    }

    pub fn verify_session_token(&self, branch_id: Id, seal: &str, token: &str) -> bool {
        self.session_token(branch_id, seal)
            .map_or(false, |expected| digests_match(&expected, token))
    }
}

pub fn cookie_name(branch_id: Id) -> String {
    format!("{}{}", COOKIE_PREFIX, branch_id)
}

/// Value of cookie `name` in a `Cookie` request header
pub fn find_cookie<'a>(header: &'a str, name: &str) -> Option<&'a str> {
    header.split(';').find_map(|pair| {
        let (key, value) = pair.trim().split_once('=')?;
        (key == name).then_some(value)
    })
}
