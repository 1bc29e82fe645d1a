//! Command templates for the external tools
//!
//! A template is a command line with `{name}` placeholders, tokenized once with
//! shell-like quoting rules. Placeholders are substituted per token, so a value
//! containing spaces stays a single argument and nothing is ever re-split.

use crate::config::CommandsConfig;
use std::ffi::{OsStr, OsString};
use std::fmt;
use thiserror::Error;

/// Placeholders accepted by the probe template
pub const PROBE_PLACEHOLDERS: &[&str] = &["input"];

/// Placeholders accepted by the transcode template
pub const TRANSCODE_PLACEHOLDERS: &[&str] = &[
    "input",
    "output",
    "volume",
    "audio_encoder",
    "audio_quality",
    "remove_subtitles",
];

/// Errors found while parsing a command template
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TemplateError {
    #[error("Command template is empty")]
    Empty,

    #[error("Unbalanced quote in command template: {0}")]
    UnbalancedQuote(String),

    #[error("Unclosed placeholder in command template: {0}")]
    UnclosedPlaceholder(String),

    #[error("Single '}}' in command template (use '}}}}' for a literal brace): {0}")]
    UnmatchedBrace(String),

    #[error("Unknown placeholder {{{name}}} in command template: {template}")]
    UnknownPlaceholder { name: String, template: String },
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Placeholder(String),
}

#[derive(Debug, Clone, PartialEq)]
struct Token {
    segments: Vec<Segment>,
}

impl Token {
    fn has_placeholder(&self) -> bool {
        self.segments
            .iter()
            .any(|s| matches!(s, Segment::Placeholder(_)))
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Quote {
    None,
    Single,
    Double,
}

/// A parsed command template
#[derive(Debug, Clone, PartialEq)]
pub struct CommandTemplate {
    source: String,
    tokens: Vec<Token>,
}

impl CommandTemplate {
    /// Parse `template`, accepting only the placeholders in `allowed`
    pub fn parse(template: &str, allowed: &[&str]) -> Result<Self, TemplateError> {
        let tokens = tokenize(template, allowed)?;
        if tokens.is_empty() {
            return Err(TemplateError::Empty);
        }
        Ok(Self {
            source: template.to_string(),
            tokens,
        })
    }

    /// The template text as configured
    pub fn source(&self) -> &str {
        &self.source
    }

    /// The program name, when the first token is a plain literal
    pub fn program(&self) -> Option<String> {
        let first = self.tokens.first()?;
        if first.has_placeholder() {
            return None;
        }
        let mut name = String::new();
        for segment in &first.segments {
            if let Segment::Literal(text) = segment {
                name.push_str(text);
            }
        }
        Some(name)
    }

    /// Substitute `values` into the template
    ///
    /// A placeholder without a value renders as nothing. A token that
    /// contains placeholders and renders to nothing is dropped.
    pub fn render(&self, values: &[(&str, &OsStr)]) -> CommandLine {
        let mut argv = Vec::with_capacity(self.tokens.len());
        for token in &self.tokens {
            let mut arg = OsString::new();
            for segment in &token.segments {
                match segment {
                    Segment::Literal(text) => arg.push(text),
                    Segment::Placeholder(name) => {
                        if let Some((_, value)) = values.iter().find(|(key, _)| key == name) {
                            arg.push(value);
                        }
                    }
                }
            }
            if arg.is_empty() && token.has_placeholder() {
                continue;
            }
            argv.push(arg);
        }
        CommandLine::from_argv(argv)
    }
}

fn tokenize(template: &str, allowed: &[&str]) -> Result<Vec<Token>, TemplateError> {
    let mut tokens = Vec::new();
    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut in_token = false;
    let mut quote = Quote::None;
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        match (quote, c) {
            (Quote::None, c) if c.is_whitespace() => {
                if in_token {
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    tokens.push(Token {
                        segments: std::mem::take(&mut segments),
                    });
                    in_token = false;
                }
                continue;
            }
            (Quote::None, '\'') => quote = Quote::Single,
            (Quote::None, '"') => quote = Quote::Double,
            (Quote::Single, '\'') | (Quote::Double, '"') => quote = Quote::None,
            (Quote::None, '\\') => literal.push(chars.next().unwrap_or('\\')),
            (Quote::Double, '\\') => match chars.peek() {
                Some(&next) if next == '"' || next == '\\' => {
                    literal.push(next);
                    chars.next();
                }
                _ => literal.push('\\'),
            },
            (_, '{') => {
                if chars.peek() == Some(&'{') {
                    chars.next();
                    literal.push('{');
                } else {
                    let mut name = String::new();
                    loop {
                        match chars.next() {
                            Some('}') => break,
                            Some(ch) => name.push(ch),
                            None => {
                                return Err(TemplateError::UnclosedPlaceholder(
                                    template.to_string(),
                                ))
                            }
                        }
                    }
                    if !allowed.contains(&name.as_str()) {
                        return Err(TemplateError::UnknownPlaceholder {
                            name,
                            template: template.to_string(),
                        });
                    }
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::Placeholder(name));
                }
            }
            (_, '}') => {
                if chars.peek() == Some(&'}') {
                    chars.next();
                    literal.push('}');
                } else {
                    return Err(TemplateError::UnmatchedBrace(template.to_string()));
                }
            }
            (_, c) => literal.push(c),
        }
        in_token = true;
    }

    if quote != Quote::None {
        return Err(TemplateError::UnbalancedQuote(template.to_string()));
    }
    if in_token {
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }
        tokens.push(Token { segments });
    }
    Ok(tokens)
}

/// A rendered command: program plus arguments, ready to spawn
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: OsString,
    pub args: Vec<OsString>,
}

impl CommandLine {
    /// Build from an argv vector; the first element is the program
    pub fn from_argv(argv: Vec<OsString>) -> Self {
        let mut argv = argv.into_iter();
        let program = argv.next().unwrap_or_default();
        Self {
            program,
            args: argv.collect(),
        }
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", display_arg(&self.program))?;
        for arg in &self.args {
            write!(f, " {}", display_arg(arg))?;
        }
        Ok(())
    }
}

// Single-quote arguments a shell would split or interpret
fn display_arg(arg: &OsStr) -> String {
    let text = arg.to_string_lossy();
    let plain = !text.is_empty()
        && text
            .chars()
            .all(|c| c.is_alphanumeric() || "-_./:=,+%@".contains(c));
    if plain {
        text.into_owned()
    } else {
        format!("'{}'", text.replace('\'', r"'\''"))
    }
}

/// The probe and transcode templates, parsed and checked once
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCommands {
    pub probe: CommandTemplate,
    pub transcode: CommandTemplate,
}

impl ToolCommands {
    pub fn from_config(cfg: &CommandsConfig) -> Result<Self, TemplateError> {
        Ok(Self {
            probe: CommandTemplate::parse(&cfg.probe, PROBE_PLACEHOLDERS)?,
            transcode: CommandTemplate::parse(&cfg.transcode, TRANSCODE_PLACEHOLDERS)?,
        })
    }
}
