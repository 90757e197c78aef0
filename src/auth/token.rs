use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use subtle::ConstantTimeEq;

use super::{AuthorizationContext, Authorizer};
use crate::error::GateError;

const MAX_CALLERS_FILE_SIZE: u64 = 64 * 1024; // 64 KiB

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct CallersFile {
    #[serde(default)]
    callers: BTreeMap<String, CallerConfig>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct CallerConfig {
    token: String,
    #[serde(default)]
    scopes: Vec<String>,
}

struct Caller {
    identity: String,
    token: SecretString,
    scopes: Vec<String>,
}

/// Bearer-token authorizer backed by a static caller table.
pub struct StaticTokenAuthorizer {
    callers: Vec<Caller>,
}

impl std::fmt::Debug for StaticTokenAuthorizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticTokenAuthorizer")
            .field("caller_count", &self.callers.len())
            .finish()
    }
}

impl FromStr for StaticTokenAuthorizer {
    type Err = GateError;

    fn from_str(content: &str) -> Result<Self, GateError> {
        let file: CallersFile =
            toml::from_str(content).map_err(|e| GateError::Settings(format!("callers: {e}")))?;

        let mut callers: Vec<Caller> = Vec::with_capacity(file.callers.len());
        for (identity, config) in file.callers {
            if config.token.len() < 16 {
                return Err(GateError::Settings(format!(
                    "callers: token for '{identity}' must be at least 16 characters"
                )));
            }
            if callers
                .iter()
                .any(|c| c.token.expose_secret() == config.token)
            {
                return Err(GateError::Settings(format!(
                    "callers: token for '{identity}' is shared with another caller"
                )));
            }
            callers.push(Caller {
                identity,
                token: SecretString::from(config.token),
                scopes: config.scopes,
            });
        }

        Ok(Self { callers })
    }
}

impl StaticTokenAuthorizer {
    /// Load the caller table from a TOML file. Checks file size before reading.
    pub fn load(path: &Path) -> Result<Self, GateError> {
        let metadata = std::fs::metadata(path)
            .map_err(|e| GateError::Settings(format!("cannot read {}: {e}", path.display())))?;

        if metadata.len() > MAX_CALLERS_FILE_SIZE {
            return Err(GateError::Settings(format!(
                "callers file exceeds {MAX_CALLERS_FILE_SIZE} byte limit"
            )));
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| GateError::Settings(format!("cannot read {}: {e}", path.display())))?;

        content.parse()
    }
}

impl Authorizer for StaticTokenAuthorizer {
    fn authorize(&self, credential: &SecretString) -> Result<AuthorizationContext, GateError> {
        let presented = credential.expose_secret().as_bytes();
        // Compare against every entry so timing does not reveal which one matched.
        let mut matched = None;
        for caller in &self.callers {
            if bool::from(caller.token.expose_secret().as_bytes().ct_eq(presented)) {
                matched = Some(caller);
            }
        }

        matched
            .map(|c| AuthorizationContext::new(c.identity.clone(), c.scopes.iter().cloned()))
            .ok_or(GateError::Unauthenticated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CALLERS: &str = r#"
[callers.alice]
token = "alice-0123456789abcdef"
scopes = ["file:read", "system:read"]

[callers.bob]
token = "bob-0123456789abcdef"
"#;

    fn secret(s: &str) -> SecretString {
        SecretString::from(s.to_owned())
    }

    #[test]
    fn known_token_resolves_caller() {
        let authorizer = StaticTokenAuthorizer::from_str(CALLERS).unwrap();
        let ctx = authorizer.authorize(&secret("alice-0123456789abcdef")).unwrap();
        assert_eq!(ctx.caller, "alice");
        assert!(ctx.scopes.contains("system:read"));

        let ctx = authorizer.authorize(&secret("bob-0123456789abcdef")).unwrap();
        assert_eq!(ctx.caller, "bob");
        assert!(ctx.scopes.is_empty());
    }

    #[test]
    fn unknown_token_rejected() {
        let authorizer = StaticTokenAuthorizer::from_str(CALLERS).unwrap();
        let err = authorizer.authorize(&secret("mallory-0123456789")).unwrap_err();
        assert!(matches!(err, GateError::Unauthenticated));
        let err = authorizer.authorize(&secret("")).unwrap_err();
        assert!(matches!(err, GateError::Unauthenticated));
    }

    #[test]
    fn short_token_rejected() {
        let err = StaticTokenAuthorizer::from_str("[callers.eve]\ntoken = \"abc\"\n").unwrap_err();
        assert!(matches!(err, GateError::Settings(_)));
    }

    #[test]
    fn shared_token_rejected() {
        let content = r#"
[callers.a]
token = "same-token-0123456789"

[callers.b]
token = "same-token-0123456789"
"#;
        assert!(StaticTokenAuthorizer::from_str(content).is_err());
    }

    #[test]
    fn debug_output_hides_tokens() {
        let authorizer = StaticTokenAuthorizer::from_str(CALLERS).unwrap();
        let rendered = format!("{authorizer:?}");
        assert!(!rendered.contains("0123456789abcdef"));
    }
}
