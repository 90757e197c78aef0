//! Operator console command grammar. Lines are split with shell-style
//! quoting rules (only for tokenizing the console input; nothing here is
//! ever passed to a shell).

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::audit::{AuditFilter, AuditOutcome};
use crate::job::JobId;

pub const HELP: &str = "\
commands:
  templates [category]               list available templates
  submit <template> [key=value ...]  submit a job
  job <id>                           show a job
  cancel <id>                        cancel a job
  audit [job=..] [caller=..] [template=..] [outcome=..]
        [since=..] [until=..] [limit=..]
                                     query the audit log
  reload                             reload the template catalog
  help                               show this help
  quit                               exit";

#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    Templates { category: Option<String> },
    Submit {
        template: String,
        params: Map<String, Value>,
    },
    Job(JobId),
    Cancel(JobId),
    Audit(AuditFilter),
    Reload,
    Help,
    Quit,
}

impl FromStr for ConsoleCommand {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, String> {
        let words = shell_words::split(line).map_err(|e| format!("cannot parse input: {e}"))?;
        let Some((command, rest)) = words.split_first() else {
            return Err("empty command".to_owned());
        };

        match (command.as_str(), rest) {
            ("templates" | "list", []) => Ok(Self::Templates { category: None }),
            ("templates" | "list", [category]) => Ok(Self::Templates {
                category: Some(category.clone()),
            }),
            ("submit" | "run", [template, pairs @ ..]) => Ok(Self::Submit {
                template: template.clone(),
                params: parse_params(pairs)?,
            }),
            ("job" | "status", [id]) => parse_job_id(id).map(Self::Job),
            ("cancel", [id]) => parse_job_id(id).map(Self::Cancel),
            ("audit", pairs) => parse_filter(pairs).map(Self::Audit),
            ("reload", []) => Ok(Self::Reload),
            ("help" | "?", []) => Ok(Self::Help),
            ("quit" | "exit", []) => Ok(Self::Quit),
            (
                "templates" | "list" | "submit" | "run" | "job" | "status" | "cancel" | "reload"
                | "help" | "?" | "quit" | "exit",
                _,
            ) => Err(format!("wrong arguments for '{command}' (try 'help')")),
            _ => Err(format!("unknown command '{command}' (try 'help')")),
        }
    }
}

fn split_pair(pair: &str) -> Result<(&str, &str), String> {
    match pair.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key, value)),
        _ => Err(format!("expected key=value, got '{pair}'")),
    }
}

/// `key=value` pairs as JSON strings; the validator coerces them to the
/// declared types.
fn parse_params(pairs: &[String]) -> Result<Map<String, Value>, String> {
    let mut params = Map::new();
    for pair in pairs {
        let (key, value) = split_pair(pair)?;
        if params
            .insert(key.to_owned(), Value::String(value.to_owned()))
            .is_some()
        {
            return Err(format!("parameter '{key}' given twice"));
        }
    }
    Ok(params)
}

fn parse_job_id(raw: &str) -> Result<JobId, String> {
    raw.parse().map_err(|_| format!("'{raw}' is not a job id"))
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| format!("'{raw}' is not an RFC 3339 timestamp: {e}"))
}

fn parse_filter(pairs: &[String]) -> Result<AuditFilter, String> {
    let mut filter = AuditFilter::default();
    for pair in pairs {
        match split_pair(pair)? {
            ("job", v) => filter.job_id = Some(parse_job_id(v)?),
            ("caller", v) => filter.caller = Some(v.to_owned()),
            ("template", v) => filter.template = Some(v.to_owned()),
            ("outcome", v) => {
                let outcome: AuditOutcome = serde_json::from_value(Value::String(v.to_owned()))
                    .map_err(|_| format!("unknown outcome '{v}'"))?;
                filter.outcome = Some(outcome);
            }
            ("since", v) => filter.since = Some(parse_time(v)?),
            ("until", v) => filter.until = Some(parse_time(v)?),
            ("limit", v) => {
                let limit = v
                    .parse()
                    .map_err(|_| format!("limit must be a number, got '{v}'"))?;
                filter.limit = Some(limit);
            }
            (key, _) => return Err(format!("unknown audit filter '{key}'")),
        }
    }
    Ok(filter)
}
