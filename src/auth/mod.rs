pub mod token;

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::Serialize;

use crate::error::GateError;
use crate::template::CommandTemplate;

pub use token::StaticTokenAuthorizer;

/// Who is asking, with what scopes. Produced once per request by an
/// [`Authorizer`]; read-only inside the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthorizationContext {
    pub caller: String,
    pub scopes: BTreeSet<String>,
    pub requested_at: DateTime<Utc>,
}

impl AuthorizationContext {
    pub fn new<S: Into<String>>(caller: impl Into<String>, scopes: impl IntoIterator<Item = S>) -> Self {
        Self {
            caller: caller.into(),
            scopes: scopes.into_iter().map(Into::into).collect(),
            requested_at: Utc::now(),
        }
    }
}

/// Extension point for identity providers: turns a caller credential into
/// granted scopes.
pub trait Authorizer: Send + Sync {
    fn authorize(&self, credential: &SecretString) -> Result<AuthorizationContext, GateError>;
}

/// Proof that a caller holds every scope a template requires.
///
/// Construction is locked to this module (private `Seal`, private `new`).
/// No `Clone`: the command builder consumes it, so one grant yields one
/// command line.
#[derive(Debug)]
pub struct ScopeGrant {
    pub(crate) template: String,
    pub(crate) caller: String,
    _seal: Seal,
}

#[derive(Debug)]
struct Seal;

impl ScopeGrant {
    fn new(template: &str, caller: &str) -> Self {
        Self {
            template: template.to_owned(),
            caller: caller.to_owned(),
            _seal: Seal,
        }
    }
}

/// Check `template.required_scopes ⊆ context.scopes`.
pub fn check_scopes(
    template: &CommandTemplate,
    context: &AuthorizationContext,
) -> Result<ScopeGrant, GateError> {
    let missing: Vec<String> = template
        .required_scopes
        .difference(&context.scopes)
        .cloned()
        .collect();

    if !missing.is_empty() {
        return Err(GateError::Authorization {
            caller: context.caller.clone(),
            missing,
        });
    }

    Ok(ScopeGrant::new(&template.name, &context.caller))
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;
    use crate::template::Registry;

    const CATALOG: &str = r#"
[templates.show_processes]
command = "ps aux"

[templates.show_processes.permissions]
required_scopes = ["system:read"]

[templates.check_port]
command = "nc -z {host} {port}"

[templates.check_port.parameters.host]
type = "string"

[templates.check_port.parameters.port]
type = "integer"

[templates.check_port.permissions]
required_scopes = ["network:read", "network:probe"]

[templates.system_uptime]
command = "uptime"
"#;

    #[test]
    fn all_scopes_present_grants() {
        let registry = Registry::from_str(CATALOG).unwrap();
        let template = registry.lookup("show_processes").unwrap();
        let ctx = AuthorizationContext::new("alice", ["system:read", "file:read"]);
        let grant = check_scopes(&template, &ctx).unwrap();
        assert_eq!(grant.template, "show_processes");
        assert_eq!(grant.caller, "alice");
    }

    #[test]
    fn missing_scope_denied() {
        let registry = Registry::from_str(CATALOG).unwrap();
        let template = registry.lookup("show_processes").unwrap();
        let ctx = AuthorizationContext::new("bob", ["file:read"]);
        match check_scopes(&template, &ctx) {
            Err(GateError::Authorization { caller, missing }) => {
                assert_eq!(caller, "bob");
                assert_eq!(missing, vec!["system:read"]);
            }
            other => panic!("expected authorization error, got {other:?}"),
        }
    }

    #[test]
    fn every_missing_scope_reported() {
        let registry = Registry::from_str(CATALOG).unwrap();
        let template = registry.lookup("check_port").unwrap();
        let ctx = AuthorizationContext::new("carol", ["network:read"]);
        let err = check_scopes(&template, &ctx).unwrap_err();
        assert!(matches!(err, GateError::Authorization { missing, .. } if missing == vec!["network:probe"]));
    }

    #[test]
    fn template_without_scopes_open_to_all() {
        let registry = Registry::from_str(CATALOG).unwrap();
        let template = registry.lookup("system_uptime").unwrap();
        let ctx = AuthorizationContext::new("dave", Vec::<String>::new());
        assert!(check_scopes(&template, &ctx).is_ok());
    }
}
