//! Command patterns: whitespace-separated tokens made of literal text and
//! `{name}` placeholders. A token always becomes exactly one argument, however
//! many placeholders it holds.

use std::collections::BTreeSet;
use std::path::Path;

/// Characters with shell meaning. Never legal in literal text, so a template
/// cannot smuggle shell syntax in even if it is later handed to one.
const SHELL_METACHARACTERS: &[char] = &[
    ';', '&', '|', '`', '$', '(', ')', '<', '>', '\\', '\'', '"', '*', '?', '~', '!', '#',
];

const PRIVILEGE_ESCALATION: &[&str] = &["sudo", "su", "doas", "pkexec", "runuser"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Segment {
    Literal(String),
    Placeholder(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PatternToken {
    segments: Vec<Segment>,
}

impl PatternToken {
    pub(crate) fn segments(&self) -> &[Segment] {
        &self.segments
    }

    fn as_literal(&self) -> Option<&str> {
        match self.segments.as_slice() {
            [Segment::Literal(text)] => Some(text),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CommandPattern {
    tokens: Vec<PatternToken>,
}

impl CommandPattern {
    /// Parse and vet a command pattern. Errors are human-readable reasons.
    pub(crate) fn parse(command: &str) -> Result<Self, String> {
        let tokens = command
            .split_ascii_whitespace()
            .map(parse_token)
            .collect::<Result<Vec<_>, _>>()?;

        let program = tokens
            .first()
            .ok_or_else(|| "command must not be empty".to_owned())?
            .as_literal()
            .ok_or_else(|| "the program (first token) must be a literal".to_owned())?;

        let base = Path::new(program)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(program);
        if PRIVILEGE_ESCALATION.contains(&base) {
            return Err(format!("privilege escalation program '{base}' is not allowed"));
        }

        Ok(Self { tokens })
    }

    /// The literal program name.
    pub(crate) fn program(&self) -> &str {
        self.tokens
            .first()
            .and_then(PatternToken::as_literal)
            .unwrap_or_default()
    }

    /// Tokens after the program.
    pub(crate) fn arguments(&self) -> &[PatternToken] {
        self.tokens.get(1..).unwrap_or_default()
    }

    pub(crate) fn placeholders(&self) -> BTreeSet<&str> {
        self.tokens
            .iter()
            .flat_map(|t| t.segments.iter())
            .filter_map(|s| match s {
                Segment::Placeholder(name) => Some(name.as_str()),
                Segment::Literal(_) => None,
            })
            .collect()
    }
}

fn parse_token(token: &str) -> Result<PatternToken, String> {
    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut chars = token.chars();

    while let Some(c) = chars.next() {
        match c {
            '{' => {
                let mut name = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(n) => name.push(n),
                        None => return Err(format!("unclosed placeholder in token '{token}'")),
                    }
                }
                if !is_identifier(&name) {
                    return Err(format!("invalid placeholder name '{{{name}}}'"));
                }
                if !literal.is_empty() {
                    segments.push(Segment::Literal(check_literal(std::mem::take(&mut literal))?));
                }
                segments.push(Segment::Placeholder(name));
            }
            '}' => return Err(format!("unmatched '}}' in token '{token}'")),
            _ => literal.push(c),
        }
    }
    if !literal.is_empty() {
        segments.push(Segment::Literal(check_literal(literal)?));
    }

    Ok(PatternToken { segments })
}

fn check_literal(text: String) -> Result<String, String> {
    if let Some(c) = text
        .chars()
        .find(|c| SHELL_METACHARACTERS.contains(c) || c.is_control())
    {
        return Err(format!("shell metacharacter {c:?} in literal '{text}'"));
    }
    if text.contains("..") {
        return Err(format!("directory traversal in literal '{text}'"));
    }
    Ok(text)
}

pub(crate) fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn literal(s: &str) -> Segment {
        Segment::Literal(s.to_owned())
    }

    fn placeholder(s: &str) -> Segment {
        Segment::Placeholder(s.to_owned())
    }

    #[test]
    fn splits_literals_and_placeholders() {
        let pattern = CommandPattern::parse("ping -c {count} {hostname}").unwrap();
        assert_eq!(pattern.program(), "ping");
        let args: Vec<_> = pattern.arguments().iter().map(|t| t.segments().to_vec()).collect();
        assert_eq!(
            args,
            vec![
                vec![literal("-c")],
                vec![placeholder("count")],
                vec![placeholder("hostname")],
            ]
        );
        assert_eq!(
            pattern.placeholders().into_iter().collect::<Vec<_>>(),
            vec!["count", "hostname"]
        );
    }

    #[test]
    fn embedded_placeholder_stays_one_token() {
        let pattern = CommandPattern::parse("du --max-depth={depth} {path}").unwrap();
        assert_eq!(
            pattern.arguments()[0].segments(),
            &[literal("--max-depth="), placeholder("depth")]
        );
    }

    #[test]
    fn extra_whitespace_ignored() {
        let pattern = CommandPattern::parse("  uptime   -p ").unwrap();
        assert_eq!(pattern.program(), "uptime");
        assert_eq!(pattern.arguments().len(), 1);
    }

    #[test]
    fn empty_command_rejected() {
        assert!(CommandPattern::parse("   ").is_err());
    }

    #[test]
    fn placeholder_program_rejected() {
        let err = CommandPattern::parse("{tool} --version").unwrap_err();
        assert!(err.contains("program"));
    }

    #[test]
    fn shell_metacharacters_rejected() {
        for command in [
            "ls {path}; rm -rf /",
            "cat {file} | grep x",
            "echo $HOME",
            "echo `id`",
            "ls > out",
            "ls && id",
            "echo 'quoted'",
            "ls *",
        ] {
            assert!(CommandPattern::parse(command).is_err(), "accepted: {command}");
        }
    }

    #[test]
    fn traversal_in_literal_rejected() {
        assert!(CommandPattern::parse("cat ../secrets").is_err());
    }

    #[test]
    fn privilege_escalation_rejected() {
        assert!(CommandPattern::parse("sudo ls").is_err());
        assert!(CommandPattern::parse("/usr/bin/sudo ls").is_err());
        assert!(CommandPattern::parse("su root").is_err());
    }

    #[test]
    fn malformed_placeholders_rejected() {
        assert!(CommandPattern::parse("ls {path").is_err());
        assert!(CommandPattern::parse("ls path}").is_err());
        assert!(CommandPattern::parse("ls {}").is_err());
        assert!(CommandPattern::parse("ls {1path}").is_err());
        assert!(CommandPattern::parse("ls {pa-th}").is_err());
    }
}
