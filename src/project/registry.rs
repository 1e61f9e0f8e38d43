//! Registry of supported run commands.
//!
//! The registry is immutable configuration passed into the loader and the
//! materializer. Each entry says which privacy tiers the command reads from
//! and writes to, which image it runs, the fixed arguments placed after the
//! image, and which backend failure it raises.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{BackendErrorKind, JobError};

/// Errors that can occur while building a command registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Invalid argument template `{template}` for {command}: {reason}")]
    InvalidTemplate {
        command: String,
        template: String,
        reason: String,
    },

    #[error("{command} uses {{input_path}} but declares no input privacy tier")]
    InputPathWithoutInputTier { command: String },

    #[error("Registry must declare at least one command")]
    Empty,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Classification governing which storage root a directory lives under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum PrivacyTier {
    /// Row-level data. Security level 3.
    High,
    /// Aggregated outputs. Security level 4.
    Medium,
}

impl PrivacyTier {
    pub fn as_str(self) -> &'static str {
        match self {
            PrivacyTier::High => "highly_sensitive",
            PrivacyTier::Medium => "moderately_sensitive",
        }
    }
}

impl fmt::Display for PrivacyTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PrivacyTier {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "high" | "highly_sensitive" | "3" => Ok(PrivacyTier::High),
            "medium" | "moderately_sensitive" | "4" => Ok(PrivacyTier::Medium),
            other => Err(JobError::UnsupportedPrivacyTier {
                tier: other.to_string(),
            }),
        }
    }
}

impl TryFrom<String> for PrivacyTier {
    type Error = JobError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PrivacyTier> for String {
    fn from(tier: PrivacyTier) -> Self {
        tier.as_str().to_string()
    }
}

/// Action-local fields an argument template may refer to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placeholder {
    OutputPath,
    InputPath,
    DatabaseUrl,
}

impl Placeholder {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "output_path" => Some(Placeholder::OutputPath),
            "input_path" => Some(Placeholder::InputPath),
            "database_url" => Some(Placeholder::DatabaseUrl),
            _ => None,
        }
    }
}

/// Values substituted into argument templates.
#[derive(Debug, Clone, Copy)]
pub struct PlaceholderValues<'a> {
    pub output_path: &'a str,
    pub input_path: Option<&'a str>,
    pub database_url: &'a str,
}

impl PlaceholderValues<'_> {
    fn get(&self, placeholder: Placeholder) -> &str {
        match placeholder {
            Placeholder::OutputPath => self.output_path,
            // Registry construction rejects {input_path} without an input tier.
            Placeholder::InputPath => self.input_path.unwrap_or_default(),
            Placeholder::DatabaseUrl => self.database_url,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Field(Placeholder),
}

/// A fixed argument with `{placeholder}` slots.
///
/// `{{` and `}}` stand for literal braces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgTemplate {
    segments: Vec<Segment>,
}

impl ArgTemplate {
    /// A template with no placeholders.
    pub fn literal(text: impl Into<String>) -> Self {
        Self {
            segments: vec![Segment::Literal(text.into())],
        }
    }

    /// Parses a template string.
    pub fn parse(template: &str) -> Result<Self, String> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = template.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    literal.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    literal.push('}');
                }
                '{' => {
                    let mut name = String::new();
                    loop {
                        match chars.next() {
                            Some('}') => break,
                            Some(ch) => name.push(ch),
                            None => return Err("unclosed `{`".to_string()),
                        }
                    }
                    let field = Placeholder::from_name(&name)
                        .ok_or_else(|| format!("unknown placeholder `{{{name}}}`"))?;
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::Field(field));
                }
                '}' => return Err("unmatched `}`".to_string()),
                c => literal.push(c),
            }
        }

        if !literal.is_empty() || segments.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Self { segments })
    }

    /// Whether the template refers to `placeholder`.
    pub fn uses(&self, placeholder: Placeholder) -> bool {
        self.segments
            .iter()
            .any(|s| matches!(s, Segment::Field(p) if *p == placeholder))
    }

    /// Substitutes action-local fields.
    pub fn render(&self, values: &PlaceholderValues<'_>) -> String {
        self.segments
            .iter()
            .map(|segment| match segment {
                Segment::Literal(text) => text.as_str(),
                Segment::Field(p) => values.get(*p),
            })
            .collect()
    }

    fn from_segments(segments: Vec<Segment>) -> Self {
        Self { segments }
    }
}

/// How one supported run command is executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunCommandSpec {
    pub image: String,
    pub input_tier: Option<PrivacyTier>,
    pub output_tier: PrivacyTier,
    pub args: Vec<ArgTemplate>,
    pub error: BackendErrorKind,
}

impl RunCommandSpec {
    /// Builds a spec from raw template strings, validating every template.
    pub fn new(
        command: &str,
        image: impl Into<String>,
        input_tier: Option<PrivacyTier>,
        output_tier: PrivacyTier,
        args: &[&str],
        error: BackendErrorKind,
    ) -> Result<Self, RegistryError> {
        let args = args
            .iter()
            .map(|template| {
                ArgTemplate::parse(template).map_err(|reason| RegistryError::InvalidTemplate {
                    command: command.to_string(),
                    template: template.to_string(),
                    reason,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let spec = Self {
            image: image.into(),
            input_tier,
            output_tier,
            args,
            error,
        };
        spec.check(command)?;
        Ok(spec)
    }

    fn check(&self, command: &str) -> Result<(), RegistryError> {
        if self.input_tier.is_none() && self.args.iter().any(|a| a.uses(Placeholder::InputPath)) {
            return Err(RegistryError::InputPathWithoutInputTier {
                command: command.to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct RawRunCommandSpec {
    image: String,
    #[serde(default)]
    input_tier: Option<PrivacyTier>,
    output_tier: PrivacyTier,
    #[serde(default)]
    args: Vec<String>,
    error: BackendErrorKind,
}

/// The set of run commands a project may use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRegistry {
    commands: BTreeMap<String, RunCommandSpec>,
}

impl CommandRegistry {
    /// Creates a registry from named specs.
    pub fn new(
        commands: impl IntoIterator<Item = (String, RunCommandSpec)>,
    ) -> Result<Self, RegistryError> {
        let commands: BTreeMap<_, _> = commands.into_iter().collect();
        if commands.is_empty() {
            return Err(RegistryError::Empty);
        }
        Ok(Self { commands })
    }

    /// The commands supported out of the box.
    pub fn builtin() -> Self {
        let mut commands = BTreeMap::new();
        commands.insert(
            "cohortextractor".to_string(),
            RunCommandSpec {
                image: "docker.pkg.github.com/opensafely/cohort-extractor/cohort-extractor"
                    .to_string(),
                input_tier: None,
                output_tier: PrivacyTier::High,
                args: vec![
                    ArgTemplate::literal("generate_cohort"),
                    ArgTemplate::from_segments(vec![
                        Segment::Literal("--database-url=".to_string()),
                        Segment::Field(Placeholder::DatabaseUrl),
                    ]),
                    ArgTemplate::literal("--output-dir=/workspace"),
                ],
                error: BackendErrorKind::CohortExtractor,
            },
        );
        commands.insert(
            "stata-mp".to_string(),
            RunCommandSpec {
                image: "docker.pkg.github.com/opensafely/stata-docker/stata-mp".to_string(),
                input_tier: Some(PrivacyTier::High),
                output_tier: PrivacyTier::Medium,
                args: Vec::new(),
                error: BackendErrorKind::Script,
            },
        );
        Self { commands }
    }

    /// Parses a registry from YAML: a mapping of command token to spec.
    ///
    /// ```yaml
    /// stata-mp:
    ///   image: docker.pkg.github.com/opensafely/stata-docker/stata-mp
    ///   input_tier: high
    ///   output_tier: medium
    ///   error: script
    /// ```
    pub fn from_yaml(source: &str) -> Result<Self, RegistryError> {
        let raw: BTreeMap<String, RawRunCommandSpec> = serde_yaml::from_str(source)?;
        let commands = raw
            .into_iter()
            .map(|(name, raw)| {
                let templates: Vec<&str> = raw.args.iter().map(String::as_str).collect();
                let spec = RunCommandSpec::new(
                    &name,
                    raw.image,
                    raw.input_tier,
                    raw.output_tier,
                    &templates,
                    raw.error,
                )?;
                Ok((name, spec))
            })
            .collect::<Result<Vec<_>, RegistryError>>()?;
        Self::new(commands)
    }

    /// Reads a registry from a YAML file.
    pub fn from_path(path: &Path) -> Result<Self, RegistryError> {
        let source = std::fs::read_to_string(path)?;
        Self::from_yaml(&source)
    }

    /// Looks up the spec for a run command token.
    pub fn get(&self, token: &str) -> Option<&RunCommandSpec> {
        self.commands.get(token)
    }

    pub fn contains(&self, token: &str) -> bool {
        self.commands.contains_key(token)
    }

    /// Supported command tokens, sorted.
    pub fn tokens(&self) -> impl Iterator<Item = &str> {
        self.commands.keys().map(String::as_str)
    }
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}
