//! TOML deserialization structs. Private, map 1:1 to the template file schema.

use std::collections::BTreeMap;

use serde::Deserialize;

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub(super) struct TemplateFile {
    #[serde(default)]
    pub(super) templates: BTreeMap<String, TemplateConfig>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub(super) struct TemplateConfig {
    pub(super) command: String,
    pub(super) description: Option<String>,
    pub(super) category: Option<String>,
    #[serde(default)]
    pub(super) parameters: BTreeMap<String, ParameterConfig>,
    #[serde(default)]
    pub(super) permissions: PermissionsConfig,
    pub(super) timeout: Option<u64>,
    #[serde(default)]
    pub(super) allow_network: bool,
    #[serde(default)]
    pub(super) allow_file_write: bool,
}

#[derive(Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub(super) struct PermissionsConfig {
    #[serde(default)]
    pub(super) required_scopes: Vec<String>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub(super) struct ParameterConfig {
    #[serde(rename = "type")]
    pub(super) kind: KindValue,
    #[serde(default = "default_required")]
    pub(super) required: bool,
    pub(super) default: Option<toml::Value>,
    pub(super) description: Option<String>,
    #[serde(default)]
    pub(super) sensitive: bool,
    #[serde(default)]
    pub(super) allow_option_like: bool,

    pub(super) pattern: Option<String>,
    pub(super) min_length: Option<usize>,
    pub(super) max_length: Option<usize>,
    pub(super) min_value: Option<toml::Value>,
    pub(super) max_value: Option<toml::Value>,
    pub(super) allowed_values: Option<Vec<toml::Value>>,
    pub(super) allowed_paths: Option<Vec<String>>,
    pub(super) forbidden_paths: Option<Vec<String>>,
}

fn default_required() -> bool {
    true
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub(super) enum KindValue {
    String,
    Path,
    #[serde(alias = "int")]
    Integer,
    Float,
    #[serde(alias = "bool")]
    Boolean,
    Enum,
}
