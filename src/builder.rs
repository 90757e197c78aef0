//! Argument-vector construction. Each pattern token becomes exactly one
//! argument; values are never joined into a shell string.

use crate::auth::ScopeGrant;
use crate::error::GateError;
use crate::template::CommandTemplate;
use crate::template::pattern::Segment;
use crate::validate::ResolvedParams;

/// A program plus its literal arguments, ready for direct `execve`.
///
/// Only [`build`] creates one: the private `Seal` blocks struct literals and
/// there is no public constructor, `Clone`, or `Default`.
#[derive(Debug, PartialEq, Eq)]
pub struct CommandLine {
    program: String,
    args: Vec<String>,
    _seal: Seal,
}

#[derive(Debug, PartialEq, Eq)]
struct Seal;

impl CommandLine {
    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Program followed by arguments.
    pub fn argv(&self) -> Vec<&str> {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect()
    }
}

/// Substitute resolved parameters into the template's pattern.
///
/// Consumes the caller's [`ScopeGrant`] for this template. A token that
/// references an optional parameter with no value is dropped whole.
pub fn build(
    template: &CommandTemplate,
    params: &ResolvedParams,
    grant: ScopeGrant,
) -> Result<CommandLine, GateError> {
    if grant.template != template.name {
        return Err(GateError::Internal(format!(
            "scope grant for '{}' (caller '{}') presented for template '{}'",
            grant.template, grant.caller, template.name
        )));
    }

    let mut args = Vec::with_capacity(template.pattern.arguments().len());
    'tokens: for token in template.pattern.arguments() {
        let mut arg = String::new();
        for segment in token.segments() {
            match segment {
                Segment::Literal(text) => arg.push_str(text),
                Segment::Placeholder(name) => match params.get(name) {
                    Some(value) => arg.push_str(&value.to_string()),
                    None if template.parameters.get(name).is_some_and(|p| !p.required) => {
                        continue 'tokens;
                    }
                    None => {
                        return Err(GateError::Internal(format!(
                            "no resolved value for required parameter '{name}'"
                        )));
                    }
                },
            }
        }
        args.push(arg);
    }

    Ok(CommandLine {
        program: template.program().to_owned(),
        args,
        _seal: Seal,
    })
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use serde_json::{Map, Value, json};

    use super::*;
    use crate::auth::{AuthorizationContext, check_scopes};
    use crate::template::Registry;
    use crate::validate::validate;

    const CATALOG: &str = r#"
[templates.grep_logs]
command = "grep -n --max-count={limit} {pattern} {file}"

[templates.grep_logs.parameters.pattern]
type = "string"
max_length = 200

[templates.grep_logs.parameters.file]
type = "path"
allowed_paths = ["/var/log"]

[templates.grep_logs.parameters.limit]
type = "integer"
required = false
min_value = 1

[templates.system_uptime]
command = "uptime"
"#;

    fn build_for(name: &str, params: Value) -> Result<CommandLine, GateError> {
        let registry = Registry::from_str(CATALOG).unwrap();
        let template = registry.lookup(name).unwrap();
        let submitted: Map<String, Value> = serde_json::from_value(params).unwrap();
        let resolved = validate(&template, &submitted).unwrap();
        let grant = check_scopes(&template, &AuthorizationContext::new("t", ["any"])).unwrap();
        build(&template, &resolved, grant)
    }

    #[test]
    fn substitutes_each_placeholder_into_its_own_argument() {
        let line = build_for(
            "grep_logs",
            json!({"pattern": "error", "file": "/var/log/syslog", "limit": 5}),
        )
        .unwrap();
        assert_eq!(
            line.argv(),
            vec!["grep", "-n", "--max-count=5", "error", "/var/log/syslog"]
        );
    }

    #[test]
    fn hostile_value_stays_one_opaque_argument() {
        let line = build_for(
            "grep_logs",
            json!({"pattern": "x; rm -rf / && echo $(id) `whoami` > /tmp/p", "file": "/var/log/syslog"}),
        )
        .unwrap();
        assert_eq!(line.program(), "grep");
        assert_eq!(line.args().len(), 3);
        assert_eq!(line.args()[1], "x; rm -rf / && echo $(id) `whoami` > /tmp/p");
    }

    #[test]
    fn value_with_spaces_is_not_split() {
        let line = build_for(
            "grep_logs",
            json!({"pattern": "out of memory", "file": "/var/log/kern.log"}),
        )
        .unwrap();
        assert_eq!(line.args()[1], "out of memory");
    }

    #[test]
    fn absent_optional_drops_its_token() {
        let line = build_for(
            "grep_logs",
            json!({"pattern": "warn", "file": "/var/log/syslog"}),
        )
        .unwrap();
        assert_eq!(line.argv(), vec!["grep", "-n", "warn", "/var/log/syslog"]);
    }

    #[test]
    fn literal_only_template() {
        let line = build_for("system_uptime", json!({})).unwrap();
        assert_eq!(line.argv(), vec!["uptime"]);
    }

    #[test]
    fn grant_for_other_template_refused() {
        let registry = Registry::from_str(CATALOG).unwrap();
        let uptime = registry.lookup("system_uptime").unwrap();
        let grep = registry.lookup("grep_logs").unwrap();
        let grant = check_scopes(&uptime, &AuthorizationContext::new("t", ["any"])).unwrap();
        let err = build(&grep, &ResolvedParams::default(), grant).unwrap_err();
        assert!(matches!(err, GateError::Internal(_)));
    }
}
