mod file;
pub(crate) mod pattern;

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use regex::Regex;
use serde::Serialize;
use tracing::info;

use crate::error::GateError;
use crate::validate::{self, ParamValue};
use file::{KindValue, ParameterConfig, TemplateConfig, TemplateFile};
use pattern::CommandPattern;

const MAX_TEMPLATE_FILE_SIZE: u64 = 256 * 1024; // 256 KiB
const DEFAULT_TIMEOUT_SECS: u64 = 300;
const MAX_TIMEOUT_SECS: u64 = 3600;
const DEFAULT_CATEGORY: &str = "general";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    String,
    Path,
    Integer,
    Float,
    Boolean,
    Enum,
}

/// Type-specific constraints. The variant is the parameter's type.
#[derive(Debug, Clone)]
pub enum Constraints {
    String {
        pattern: Option<Regex>,
        min_length: Option<usize>,
        max_length: Option<usize>,
    },
    Path {
        allowed: Vec<PathBuf>,
        forbidden: Vec<PathBuf>,
    },
    Integer {
        min: Option<i64>,
        max: Option<i64>,
    },
    Float {
        min: Option<f64>,
        max: Option<f64>,
    },
    Boolean,
    Enum {
        allowed: Vec<String>,
    },
}

#[derive(Debug, Clone)]
pub struct ParameterSpec {
    pub name: String,
    pub required: bool,
    pub default: Option<ParamValue>,
    pub description: Option<String>,
    pub constraints: Constraints,
    /// Value is replaced in audit snapshots.
    pub sensitive: bool,
    /// Admit values that start with `-` and would read as an option.
    pub allow_option_like: bool,
}

impl ParameterSpec {
    pub fn kind(&self) -> ParamKind {
        match self.constraints {
            Constraints::String { .. } => ParamKind::String,
            Constraints::Path { .. } => ParamKind::Path,
            Constraints::Integer { .. } => ParamKind::Integer,
            Constraints::Float { .. } => ParamKind::Float,
            Constraints::Boolean => ParamKind::Boolean,
            Constraints::Enum { .. } => ParamKind::Enum,
        }
    }
}

/// A named command pattern with its parameter schema and execution policy.
/// Immutable once loaded.
#[derive(Debug)]
pub struct CommandTemplate {
    pub name: String,
    pub description: Option<String>,
    pub category: String,
    pub(crate) pattern: CommandPattern,
    pub parameters: BTreeMap<String, ParameterSpec>,
    pub required_scopes: BTreeSet<String>,
    pub timeout: Duration,
    pub allow_network: bool,
    pub allow_file_write: bool,
}

impl CommandTemplate {
    pub fn program(&self) -> &str {
        self.pattern.program()
    }

    /// Path prefixes a write-enabled template may touch.
    pub fn writable_paths(&self) -> Vec<PathBuf> {
        if !self.allow_file_write {
            return Vec::new();
        }
        self.parameters
            .values()
            .filter_map(|p| match &p.constraints {
                Constraints::Path { allowed, .. } => Some(allowed.iter().cloned()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    pub fn summary(&self) -> TemplateSummary {
        TemplateSummary {
            name: self.name.clone(),
            description: self.description.clone(),
            category: self.category.clone(),
            required_scopes: self.required_scopes.iter().cloned().collect(),
            timeout_secs: self.timeout.as_secs(),
            allow_network: self.allow_network,
            allow_file_write: self.allow_file_write,
            parameters: self
                .parameters
                .values()
                .map(|p| ParameterSummary {
                    name: p.name.clone(),
                    kind: p.kind(),
                    required: p.required,
                    description: p.description.clone(),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TemplateSummary {
    pub name: String,
    pub description: Option<String>,
    pub category: String,
    pub required_scopes: Vec<String>,
    pub timeout_secs: u64,
    pub allow_network: bool,
    pub allow_file_write: bool,
    pub parameters: Vec<ParameterSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParameterSummary {
    pub name: String,
    pub kind: ParamKind,
    pub required: bool,
    pub description: Option<String>,
}

/// One immutable version of the template catalog.
pub struct Registry {
    version: u64,
    templates: BTreeMap<String, Arc<CommandTemplate>>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("version", &self.version)
            .field("template_count", &self.templates.len())
            .finish()
    }
}

impl FromStr for Registry {
    type Err = GateError;

    /// Parse and compile a template catalog from a TOML string.
    fn from_str(content: &str) -> Result<Self, GateError> {
        let file: TemplateFile =
            toml::from_str(content).map_err(|e| GateError::TemplateConfig(e.to_string()))?;

        let templates = file
            .templates
            .into_iter()
            .map(|(name, config)| {
                compile_template(name.clone(), config).map(|t| (name, Arc::new(t)))
            })
            .collect::<Result<BTreeMap<_, _>, _>>()?;

        Ok(Self {
            version: 0,
            templates,
        })
    }
}

impl Registry {
    /// Load a catalog from a TOML file. Checks file size before reading.
    pub fn load(path: &Path) -> Result<Self, GateError> {
        let metadata = std::fs::metadata(path).map_err(|e| {
            GateError::TemplateConfig(format!("cannot read {}: {e}", path.display()))
        })?;

        if metadata.len() > MAX_TEMPLATE_FILE_SIZE {
            return Err(GateError::TemplateConfig(format!(
                "template file exceeds {MAX_TEMPLATE_FILE_SIZE} byte limit"
            )));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            GateError::TemplateConfig(format!("cannot read {}: {e}", path.display()))
        })?;

        content.parse()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    pub fn lookup(&self, name: &str) -> Result<Arc<CommandTemplate>, GateError> {
        self.templates
            .get(name)
            .cloned()
            .ok_or_else(|| GateError::TemplateNotFound(name.to_owned()))
    }

    /// Summaries in name order, optionally restricted to one category.
    pub fn list(&self, category: Option<&str>) -> Vec<TemplateSummary> {
        self.templates
            .values()
            .filter(|t| category.is_none_or(|c| t.category == c))
            .map(|t| t.summary())
            .collect()
    }
}

/// Holder of the current registry snapshot. Readers take an `Arc` and keep
/// using it; a reload swaps in a whole new snapshot.
pub struct TemplateCatalog {
    current: RwLock<Arc<Registry>>,
    next_version: AtomicU64,
}

impl TemplateCatalog {
    pub fn new(mut registry: Registry) -> Self {
        registry.version = 1;
        Self {
            current: RwLock::new(Arc::new(registry)),
            next_version: AtomicU64::new(2),
        }
    }

    pub fn snapshot(&self) -> Arc<Registry> {
        Arc::clone(&self.current.read().unwrap_or_else(|e| e.into_inner()))
    }

    /// Install a new registry and return its version.
    pub fn replace(&self, mut registry: Registry) -> u64 {
        let version = self.next_version.fetch_add(1, Ordering::Relaxed);
        registry.version = version;
        let count = registry.len();
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(registry);
        info!(version, templates = count, "template registry swapped");
        version
    }

    /// Load `path` and swap it in. The current snapshot stays in place on error.
    pub fn reload(&self, path: &Path) -> Result<u64, GateError> {
        let registry = Registry::load(path)?;
        Ok(self.replace(registry))
    }
}

fn compile_template(name: String, config: TemplateConfig) -> Result<CommandTemplate, GateError> {
    let fail = |reason: String| GateError::TemplateConfig(format!("template '{name}': {reason}"));

    if !pattern::is_identifier(&name) {
        return Err(fail("name must be an identifier".to_owned()));
    }

    let command_pattern = CommandPattern::parse(&config.command).map_err(fail)?;

    let placeholders = command_pattern.placeholders();
    if let Some(missing) = placeholders
        .iter()
        .find(|p| !config.parameters.contains_key(**p))
    {
        return Err(fail(format!("placeholder '{{{missing}}}' has no parameter definition")));
    }
    if let Some(unused) = config
        .parameters
        .keys()
        .find(|k| !placeholders.contains(k.as_str()))
    {
        return Err(fail(format!("parameter '{unused}' is not used by the command")));
    }

    let parameters = config
        .parameters
        .into_iter()
        .map(|(pname, pconfig)| {
            compile_parameter(pname.clone(), pconfig)
                .map(|spec| (pname, spec))
                .map_err(&fail)
        })
        .collect::<Result<BTreeMap<_, _>, _>>()?;

    let timeout_secs = config.timeout.unwrap_or(DEFAULT_TIMEOUT_SECS);
    if timeout_secs == 0 || timeout_secs > MAX_TIMEOUT_SECS {
        return Err(fail(format!(
            "timeout must be between 1 and {MAX_TIMEOUT_SECS} seconds"
        )));
    }

    if let Some(scope) = config
        .permissions
        .required_scopes
        .iter()
        .find(|s| s.trim().is_empty())
    {
        return Err(fail(format!("invalid scope '{scope}'")));
    }

    Ok(CommandTemplate {
        description: config.description,
        category: config
            .category
            .unwrap_or_else(|| DEFAULT_CATEGORY.to_owned()),
        pattern: command_pattern,
        parameters,
        required_scopes: config.permissions.required_scopes.into_iter().collect(),
        timeout: Duration::from_secs(timeout_secs),
        allow_network: config.allow_network,
        allow_file_write: config.allow_file_write,
        name,
    })
}

fn compile_parameter(name: String, config: ParameterConfig) -> Result<ParameterSpec, String> {
    let reject_field = |field: &str, present: bool| {
        if present {
            Err(format!(
                "parameter '{name}': '{field}' does not apply to type {:?}",
                config.kind
            ))
        } else {
            Ok(())
        }
    };

    let is_string = config.kind == KindValue::String;
    let is_numeric = matches!(config.kind, KindValue::Integer | KindValue::Float);
    reject_field("pattern", !is_string && config.pattern.is_some())?;
    reject_field("min_length", !is_string && config.min_length.is_some())?;
    reject_field("max_length", !is_string && config.max_length.is_some())?;
    reject_field("min_value", !is_numeric && config.min_value.is_some())?;
    reject_field("max_value", !is_numeric && config.max_value.is_some())?;
    reject_field(
        "allowed_values",
        config.kind != KindValue::Enum && config.allowed_values.is_some(),
    )?;
    reject_field(
        "allowed_paths",
        config.kind != KindValue::Path && config.allowed_paths.is_some(),
    )?;
    reject_field(
        "forbidden_paths",
        config.kind != KindValue::Path && config.forbidden_paths.is_some(),
    )?;

    let constraints = match config.kind {
        KindValue::String => {
            if let (Some(min), Some(max)) = (config.min_length, config.max_length)
                && min > max
            {
                return Err(format!(
                    "parameter '{name}': min_length {min} exceeds max_length {max}"
                ));
            }
            let pattern = config
                .pattern
                .as_deref()
                .map(|p| {
                    regex::RegexBuilder::new(&format!("^(?:{p})$"))
                        .size_limit(1 << 20)
                        .nest_limit(50)
                        .build()
                        .map_err(|e| format!("parameter '{name}': invalid pattern: {e}"))
                })
                .transpose()?;
            Constraints::String {
                pattern,
                min_length: config.min_length,
                max_length: config.max_length,
            }
        }
        KindValue::Path => {
            let allowed = prefixes(&name, "allowed_paths", config.allowed_paths)?;
            if allowed.is_empty() {
                return Err(format!(
                    "parameter '{name}': path parameters need at least one allowed_paths entry"
                ));
            }
            let forbidden = prefixes(&name, "forbidden_paths", config.forbidden_paths)?;
            Constraints::Path { allowed, forbidden }
        }
        KindValue::Integer => {
            let bound = |field: &str, v: Option<&toml::Value>| match v {
                None => Ok(None),
                Some(toml::Value::Integer(i)) => Ok(Some(*i)),
                Some(other) => Err(format!(
                    "parameter '{name}': {field} must be an integer, got {other}"
                )),
            };
            let min = bound("min_value", config.min_value.as_ref())?;
            let max = bound("max_value", config.max_value.as_ref())?;
            if let (Some(min), Some(max)) = (min, max)
                && min > max
            {
                return Err(format!(
                    "parameter '{name}': min_value {min} exceeds max_value {max}"
                ));
            }
            Constraints::Integer { min, max }
        }
        KindValue::Float => {
            let bound = |field: &str, v: Option<&toml::Value>| match v {
                None => Ok(None),
                Some(toml::Value::Integer(i)) => Ok(Some(*i as f64)),
                Some(toml::Value::Float(f)) if f.is_finite() => Ok(Some(*f)),
                Some(other) => Err(format!(
                    "parameter '{name}': {field} must be a number, got {other}"
                )),
            };
            let min = bound("min_value", config.min_value.as_ref())?;
            let max = bound("max_value", config.max_value.as_ref())?;
            if let (Some(min), Some(max)) = (min, max)
                && min > max
            {
                return Err(format!(
                    "parameter '{name}': min_value {min} exceeds max_value {max}"
                ));
            }
            Constraints::Float { min, max }
        }
        KindValue::Boolean => Constraints::Boolean,
        KindValue::Enum => {
            let allowed = config
                .allowed_values
                .unwrap_or_default()
                .iter()
                .map(|v| match v {
                    toml::Value::String(s) => Ok(s.clone()),
                    toml::Value::Integer(_) | toml::Value::Float(_) | toml::Value::Boolean(_) => {
                        Ok(v.to_string())
                    }
                    other => Err(format!(
                        "parameter '{name}': unsupported enum value {other}"
                    )),
                })
                .collect::<Result<Vec<_>, _>>()?;
            if allowed.is_empty() {
                return Err(format!(
                    "parameter '{name}': enum parameters need allowed_values"
                ));
            }
            Constraints::Enum { allowed }
        }
    };

    if config.required && config.default.is_some() {
        return Err(format!(
            "parameter '{name}': a required parameter cannot have a default"
        ));
    }

    let mut spec = ParameterSpec {
        name,
        required: config.required,
        default: None,
        description: config.description,
        constraints,
        sensitive: config.sensitive,
        allow_option_like: config.allow_option_like,
    };

    if let Some(default) = config.default {
        let json = serde_json::to_value(&default)
            .map_err(|e| format!("parameter '{}': unusable default: {e}", spec.name))?;
        let value = validate::check_value(&spec, &json)
            .map_err(|e| format!("parameter '{}': default rejected: {e}", spec.name))?;
        spec.default = Some(value);
    }

    Ok(spec)
}

fn prefixes(name: &str, field: &str, raw: Option<Vec<String>>) -> Result<Vec<PathBuf>, String> {
    raw.unwrap_or_default()
        .iter()
        .map(|p| {
            validate::normalize_path(p)
                .map_err(|reason| format!("parameter '{name}': {field} entry '{p}' {reason}"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) const CATALOG: &str = r#"
[templates.list_files]
command = "ls -la {path}"
description = "List directory contents"
category = "filesystem"
timeout = 30

[templates.list_files.parameters.path]
type = "path"
allowed_paths = ["/home", "/tmp", "/var/log"]
forbidden_paths = ["/etc", "/root"]

[templates.list_files.permissions]
required_scopes = ["file:read"]

[templates.ping_host]
command = "ping -c {count} {hostname}"
category = "network"
allow_network = true

[templates.ping_host.parameters.hostname]
type = "string"
pattern = "[a-zA-Z0-9.-]+"
max_length = 253

[templates.ping_host.parameters.count]
type = "integer"
required = false
default = 4
min_value = 1
max_value = 10

[templates.ping_host.permissions]
required_scopes = ["network:read"]

[templates.system_uptime]
command = "uptime"
category = "system"
"#;

    fn error_of(catalog: &str) -> String {
        match Registry::from_str(catalog) {
            Err(GateError::TemplateConfig(reason)) => reason,
            other => panic!("expected TemplateConfig error, got {other:?}"),
        }
    }

    #[test]
    fn parse_catalog() {
        let registry = Registry::from_str(CATALOG).expect("catalog should parse");
        assert_eq!(registry.len(), 3);

        let ping = registry.lookup("ping_host").unwrap();
        assert_eq!(ping.program(), "ping");
        assert_eq!(ping.timeout, Duration::from_secs(DEFAULT_TIMEOUT_SECS));
        assert!(ping.allow_network);
        assert!(!ping.allow_file_write);
        let count = &ping.parameters["count"];
        assert_eq!(count.kind(), ParamKind::Integer);
        assert!(matches!(count.default, Some(ParamValue::Int(4))));

        let uptime = registry.lookup("system_uptime").unwrap();
        assert!(uptime.required_scopes.is_empty());
    }

    #[test]
    fn lookup_unknown_template() {
        let registry = Registry::from_str(CATALOG).unwrap();
        let err = registry.lookup("format_disk").unwrap_err();
        assert!(matches!(err, GateError::TemplateNotFound(name) if name == "format_disk"));
    }

    #[test]
    fn list_filters_by_category() {
        let registry = Registry::from_str(CATALOG).unwrap();
        let all: Vec<_> = registry.list(None).into_iter().map(|s| s.name).collect();
        assert_eq!(all, vec!["list_files", "ping_host", "system_uptime"]);

        let network = registry.list(Some("network"));
        assert_eq!(network.len(), 1);
        assert_eq!(network[0].name, "ping_host");
        assert_eq!(network[0].required_scopes, vec!["network:read"]);
    }

    #[test]
    fn empty_catalog_is_valid() {
        let registry = Registry::from_str("").unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn duplicate_template_rejected() {
        let catalog = r#"
[templates.uptime]
command = "uptime"

[templates.uptime]
command = "uptime -p"
"#;
        error_of(catalog);
    }

    #[test]
    fn placeholder_without_parameter_rejected() {
        let reason = error_of(
            r#"
[templates.cat]
command = "cat {file}"
"#,
        );
        assert!(reason.contains("{file}"), "{reason}");
    }

    #[test]
    fn unused_parameter_rejected() {
        let reason = error_of(
            r#"
[templates.uptime]
command = "uptime"

[templates.uptime.parameters.pretty]
type = "boolean"
"#,
        );
        assert!(reason.contains("not used"), "{reason}");
    }

    #[test]
    fn contradictory_bounds_rejected() {
        let reason = error_of(
            r#"
[templates.ping]
command = "ping -c {count} localhost"

[templates.ping.parameters.count]
type = "integer"
min_value = 10
max_value = 1
"#,
        );
        assert!(reason.contains("exceeds"), "{reason}");
    }

    #[test]
    fn default_violating_pattern_rejected() {
        let reason = error_of(
            r#"
[templates.greet]
command = "echo {name}"

[templates.greet.parameters.name]
type = "string"
required = false
pattern = "[a-z]+"
default = "BOB"
"#,
        );
        assert!(reason.contains("default rejected"), "{reason}");
    }

    #[test]
    fn enum_default_outside_set_rejected() {
        error_of(
            r#"
[templates.ps]
command = "ps {format}"

[templates.ps.parameters.format]
type = "enum"
required = false
allowed_values = ["aux", "ef"]
default = "xyz"
"#,
        );
    }

    #[test]
    fn required_with_default_rejected() {
        let reason = error_of(
            r#"
[templates.ping]
command = "ping -c {count} localhost"

[templates.ping.parameters.count]
type = "integer"
default = 3
"#,
        );
        assert!(reason.contains("required"), "{reason}");
    }

    #[test]
    fn shell_metacharacters_in_command_rejected() {
        error_of(
            r#"
[templates.bad]
command = "ls {path} | wc -l"

[templates.bad.parameters.path]
type = "path"
allowed_paths = ["/tmp"]
"#,
        );
    }

    #[test]
    fn constraint_on_wrong_type_rejected() {
        let reason = error_of(
            r#"
[templates.ping]
command = "ping -c {count} localhost"

[templates.ping.parameters.count]
type = "integer"
pattern = "[0-9]+"
"#,
        );
        assert!(reason.contains("does not apply"), "{reason}");
    }

    #[test]
    fn path_without_allowed_prefixes_rejected() {
        error_of(
            r#"
[templates.cat]
command = "cat {file}"

[templates.cat.parameters.file]
type = "path"
forbidden_paths = ["/etc"]
"#,
        );
    }

    #[test]
    fn unknown_field_rejected() {
        error_of(
            r#"
[templates.uptime]
command = "uptime"
shell = true
"#,
        );
    }

    #[test]
    fn invalid_timeout_rejected() {
        error_of(
            r#"
[templates.uptime]
command = "uptime"
timeout = 0
"#,
        );
    }

    #[test]
    fn invalid_regex_rejected() {
        error_of(
            r#"
[templates.greet]
command = "echo {name}"

[templates.greet.parameters.name]
type = "string"
pattern = "[unclosed"
"#,
        );
    }

    #[test]
    fn catalog_swap_keeps_old_snapshot_alive() {
        let catalog = TemplateCatalog::new(Registry::from_str(CATALOG).unwrap());
        let before = catalog.snapshot();
        assert_eq!(before.version(), 1);

        let version = catalog.replace(Registry::from_str("").unwrap());
        assert_eq!(version, 2);

        let after = catalog.snapshot();
        assert!(after.is_empty());
        // A reader holding the old snapshot still sees every template.
        assert!(before.lookup("ping_host").is_ok());
    }

    #[test]
    fn reload_failure_keeps_current_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("templates.toml");
        std::fs::write(&path, "[templates.x]\ncommand = \"rm {a}\"\n").unwrap();

        let catalog = TemplateCatalog::new(Registry::from_str(CATALOG).unwrap());
        assert!(catalog.reload(&path).is_err());
        assert_eq!(catalog.snapshot().version(), 1);

        std::fs::write(&path, CATALOG).unwrap();
        assert_eq!(catalog.reload(&path).unwrap(), 2);
    }

    #[test]
    fn oversized_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("templates.toml");
        let padding = "#".repeat(MAX_TEMPLATE_FILE_SIZE as usize + 1);
        std::fs::write(&path, padding).unwrap();
        assert!(matches!(
            Registry::load(&path),
            Err(GateError::TemplateConfig(_))
        ));
    }
}
