//! Parsing of `run` command strings and the `${{ ... }}` variable syntax.
//!
//! A run command has the form `token[:version] arg...`. Arguments follow
//! POSIX shell quoting so that a quoted argument containing spaces stays one
//! argument. Variable references are normalized (internal whitespace removed)
//! before splitting, so `${{ needs.a.outputs.b }}` is a single argument and
//! compares equal to `${{needs.a.outputs.b}}`.

use std::sync::OnceLock;

use regex::Regex;

use crate::error::JobError;

/// Version used when a run command has no `:version` suffix.
pub const DEFAULT_VERSION: &str = "latest";

fn variable_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\{\{(.*?)\}\}").expect("variable pattern is valid"))
}

fn needs_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^needs\.([A-Za-z0-9_-]+)\.outputs\.([A-Za-z0-9_-]+)$")
            .expect("needs pattern is valid")
    })
}

/// A `${{ needs.<action_id>.outputs.<output_id> }}` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableRef {
    pub action_id: String,
    pub output_id: String,
}

impl VariableRef {
    /// Parses one raw `${{ ... }}` occurrence.
    pub fn parse(raw: &str) -> Result<Self, JobError> {
        let inner = raw
            .strip_prefix("${{")
            .and_then(|s| s.strip_suffix("}}"))
            .unwrap_or(raw);
        let compact: String = inner.chars().filter(|c| !c.is_whitespace()).collect();

        let caps = needs_regex().captures(&compact).ok_or_else(|| {
            JobError::InvalidVariableReference(format!(
                "Unsupported variable {raw}: expected ${{{{ needs.<action>.outputs.<output> }}}}"
            ))
        })?;

        Ok(Self {
            action_id: caps[1].to_string(),
            output_id: caps[2].to_string(),
        })
    }
}

/// Returns every raw `${{ ... }}` occurrence in `text`, braces included.
pub fn variables_in(text: &str) -> Vec<&str> {
    variable_regex()
        .find_iter(text)
        .map(|m| m.as_str())
        .collect()
}

/// Removes whitespace inside every `${{ ... }}` occurrence.
pub fn normalize_variables(text: &str) -> String {
    variable_regex()
        .replace_all(text, |caps: &regex::Captures<'_>| {
            let compact: String = caps[1].chars().filter(|c| !c.is_whitespace()).collect();
            format!("${{{{{compact}}}}}")
        })
        .into_owned()
}

/// A run command split into its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunCommand {
    pub token: String,
    pub version: String,
    pub args: Vec<String>,
}

impl RunCommand {
    /// Splits a `run` string into token, version and normalized arguments.
    pub fn parse(run: &str) -> Result<Self, JobError> {
        let normalized = normalize_variables(run);
        let mut parts = split_command_line(&normalized)?.into_iter();

        let head = parts.next().ok_or_else(|| JobError::UnsupportedRunCommand {
            command: String::new(),
        })?;

        let (token, version) = match head.split_once(':') {
            Some((_, version)) if version.is_empty() || version.contains(':') => {
                return Err(JobError::InvalidProjectFile(format!(
                    "Malformed image version in {head}"
                )))
            }
            Some((token, version)) => (token.to_string(), version.to_string()),
            None => (head, DEFAULT_VERSION.to_string()),
        };

        Ok(Self {
            token,
            version,
            args: parts.collect(),
        })
    }

    /// Key used to detect the same command appearing twice in a project.
    ///
    /// The version is not part of the signature.
    pub fn signature(&self) -> (String, Vec<String>) {
        (self.token.clone(), self.args.clone())
    }
}

/// Splits a command line into words using POSIX shell quoting rules.
///
/// Supports single quotes (literal), double quotes (with `\"`, `\\`, `\$`
/// and `` \` `` escapes) and backslash escapes outside quotes. No expansion
/// of any kind is performed.
pub fn split_command_line(line: &str) -> Result<Vec<String>, JobError> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = line.chars();

    let unterminated =
        |what: &str| JobError::InvalidProjectFile(format!("Unterminated {what} in `{line}`"));

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(ch) => current.push(ch),
                        None => return Err(unterminated("single quote")),
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(ch @ ('"' | '\\' | '$' | '`')) => current.push(ch),
                            Some('\n') => {}
                            Some(ch) => {
                                current.push('\\');
                                current.push(ch);
                            }
                            None => return Err(unterminated("double quote")),
                        },
                        Some(ch) => current.push(ch),
                        None => return Err(unterminated("double quote")),
                    }
                }
            }
            '\\' => {
                in_word = true;
                match chars.next() {
                    Some('\n') => {}
                    Some(ch) => current.push(ch),
                    None => return Err(unterminated("escape")),
                }
            }
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                in_word = true;
                current.push(c);
            }
        }
    }

    if in_word {
        words.push(current);
    }

    Ok(words)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_respects_quotes() {
        let words = split_command_line(r#"stata-mp "analysis/my model.do" 'a b' c\ d"#).unwrap();
        assert_eq!(words, vec!["stata-mp", "analysis/my model.do", "a b", "c d"]);
    }

    #[test]
    fn test_split_adjacent_quotes_join() {
        let words = split_command_line(r#"x "a"'b'c"#).unwrap();
        assert_eq!(words, vec!["x", "abc"]);
    }

    #[test]
    fn test_split_empty_quoted_word() {
        let words = split_command_line(r#"x "" y"#).unwrap();
        assert_eq!(words, vec!["x", "", "y"]);
    }

    #[test]
    fn test_split_unterminated_quote() {
        let err = split_command_line("x 'oops").unwrap_err();
        assert!(matches!(err, JobError::InvalidProjectFile(_)));
    }

    #[test]
    fn test_parse_with_version() {
        let cmd = RunCommand::parse("cohortextractor:foo generate_cohort").unwrap();
        assert_eq!(cmd.token, "cohortextractor");
        assert_eq!(cmd.version, "foo");
        assert_eq!(cmd.args, vec!["generate_cohort"]);
    }

    #[test]
    fn test_parse_rejects_malformed_version() {
        for run in ["stata-mp:1.0:x model.do", "stata-mp: model.do"] {
            let err = RunCommand::parse(run).unwrap_err();
            assert!(
                matches!(err, JobError::InvalidProjectFile(_)),
                "{run} should be rejected"
            );
        }
    }

    #[test]
    fn test_parse_defaults_to_latest() {
        let cmd = RunCommand::parse("stata-mp analysis/model.do").unwrap();
        assert_eq!(cmd.version, DEFAULT_VERSION);
    }

    #[test]
    fn test_parse_normalizes_variables() {
        let spaced = RunCommand::parse("stata-mp m.do ${{ needs.a.outputs.b }}").unwrap();
        let tight = RunCommand::parse("stata-mp m.do ${{needs.a.outputs.b}}").unwrap();
        assert_eq!(spaced.args, vec!["m.do", "${{needs.a.outputs.b}}"]);
        assert_eq!(spaced.signature(), tight.signature());
    }

    #[test]
    fn test_parse_empty_run() {
        let err = RunCommand::parse("   ").unwrap_err();
        assert!(matches!(err, JobError::UnsupportedRunCommand { .. }));
    }

    #[test]
    fn test_variable_ref_parse() {
        let var = VariableRef::parse("${{ needs.generate_cohorts.outputs.cohort }}").unwrap();
        assert_eq!(var.action_id, "generate_cohorts");
        assert_eq!(var.output_id, "cohort");
    }

    #[test]
    fn test_variable_ref_rejects_other_shapes() {
        for raw in [
            "${{ foo }}",
            "${{ needs.a.inputs.b }}",
            "${{ needs.a.outputs }}",
            "${{ needs.a.outputs.b.c }}",
        ] {
            assert!(
                matches!(
                    VariableRef::parse(raw),
                    Err(JobError::InvalidVariableReference(_))
                ),
                "{raw} should be rejected"
            );
        }
    }

    #[test]
    fn test_variables_in_finds_all() {
        let vars = variables_in("a ${{ x }} b ${{needs.a.outputs.b}}");
        assert_eq!(vars, vec!["${{ x }}", "${{needs.a.outputs.b}}"]);
    }
}
