//! Error types for job resolution and execution.
//!
//! Every failure that can be reported back to the job queue is a [`JobError`].
//! Each error belongs to an [`ErrorKind`], which fixes three things at
//! definition time:
//! - the status code reported to the queue
//! - whether the error message may be reported verbatim (`report_args`)
//! - the name used as the prefix of the reported message
//!
//! Messages of kinds that do not report their arguments are replaced by a
//! redacted placeholder before they leave the process; the full text is only
//! ever written to local logs.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Status code reserved for the "workspace not found" class of error.
pub const RESERVED_STATUS_CODE: i32 = -1;

/// Status code reported for failures no error kind recognises.
pub const UNCLASSIFIED_STATUS_CODE: i32 = 99;

/// Placeholder used in place of details that may contain sensitive data.
pub const REDACTED_DETAILS: &str = "[possibly-unsafe details redacted]";

/// Failure classes signalled by the sandboxed images themselves.
///
/// Each run command in the registry names one of these, and the execution
/// layer raises it when that command's container exits unsuccessfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendErrorKind {
    /// The cohort extraction image failed.
    CohortExtractor,
    /// A user analysis script failed.
    Script,
}

impl BackendErrorKind {
    /// The error kind reported for this backend failure.
    pub const fn error_kind(self) -> ErrorKind {
        match self {
            BackendErrorKind::CohortExtractor => ErrorKind::CohortExtractorError,
            BackendErrorKind::Script => ErrorKind::ScriptError,
        }
    }
}

/// Classification of every reportable error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    WorkspaceNotFound,
    InvalidProjectFile,
    UnsupportedRunCommand,
    DuplicateRunCommand,
    InvalidVariableReference,
    UnknownOperation,
    UndefinedDependency,
    CyclicDependency,
    DependencyNotFinished,
    UnsupportedPrivacyTier,
    MissingDatabaseConfiguration,
    UnsafeOutputPath,
    Filesystem,
    CohortExtractorError,
    ScriptError,
}

impl ErrorKind {
    /// All kinds, in status code order.
    pub const ALL: [ErrorKind; 15] = [
        ErrorKind::WorkspaceNotFound,
        ErrorKind::InvalidProjectFile,
        ErrorKind::UnsupportedRunCommand,
        ErrorKind::DuplicateRunCommand,
        ErrorKind::InvalidVariableReference,
        ErrorKind::UnknownOperation,
        ErrorKind::UndefinedDependency,
        ErrorKind::CyclicDependency,
        ErrorKind::DependencyNotFinished,
        ErrorKind::UnsupportedPrivacyTier,
        ErrorKind::MissingDatabaseConfiguration,
        ErrorKind::UnsafeOutputPath,
        ErrorKind::Filesystem,
        ErrorKind::CohortExtractorError,
        ErrorKind::ScriptError,
    ];

    /// Status code reported to the job queue.
    pub const fn status_code(self) -> i32 {
        match self {
            ErrorKind::WorkspaceNotFound => RESERVED_STATUS_CODE,
            ErrorKind::InvalidProjectFile => 2,
            ErrorKind::UnsupportedRunCommand => 3,
            ErrorKind::DuplicateRunCommand => 4,
            ErrorKind::InvalidVariableReference => 5,
            ErrorKind::UnknownOperation => 6,
            ErrorKind::UndefinedDependency => 7,
            ErrorKind::CyclicDependency => 8,
            ErrorKind::DependencyNotFinished => 9,
            ErrorKind::UnsupportedPrivacyTier => 10,
            ErrorKind::MissingDatabaseConfiguration => 11,
            ErrorKind::UnsafeOutputPath => 12,
            ErrorKind::Filesystem => 13,
            ErrorKind::CohortExtractorError => 14,
            ErrorKind::ScriptError => 15,
        }
    }

    /// Whether messages of this kind may be reported outside the process.
    ///
    /// Kinds whose messages embed output of the sandboxed images, or raw
    /// text from the project file that has not been shown to be safe, stay
    /// redacted.
    pub const fn report_args(self) -> bool {
        match self {
            ErrorKind::WorkspaceNotFound
            | ErrorKind::DuplicateRunCommand
            | ErrorKind::InvalidVariableReference
            | ErrorKind::UnknownOperation
            | ErrorKind::UndefinedDependency
            | ErrorKind::CyclicDependency
            | ErrorKind::DependencyNotFinished
            | ErrorKind::MissingDatabaseConfiguration
            | ErrorKind::UnsafeOutputPath => true,
            ErrorKind::InvalidProjectFile
            | ErrorKind::UnsupportedRunCommand
            | ErrorKind::UnsupportedPrivacyTier
            | ErrorKind::Filesystem
            | ErrorKind::CohortExtractorError
            | ErrorKind::ScriptError => false,
        }
    }

    /// Name used as the prefix of reported messages.
    pub const fn name(self) -> &'static str {
        match self {
            ErrorKind::WorkspaceNotFound => "WorkspaceNotFound",
            ErrorKind::InvalidProjectFile => "InvalidProjectFile",
            ErrorKind::UnsupportedRunCommand => "UnsupportedRunCommand",
            ErrorKind::DuplicateRunCommand => "DuplicateRunCommand",
            ErrorKind::InvalidVariableReference => "InvalidVariableReference",
            ErrorKind::UnknownOperation => "UnknownOperation",
            ErrorKind::UndefinedDependency => "UndefinedDependency",
            ErrorKind::CyclicDependency => "CyclicDependency",
            ErrorKind::DependencyNotFinished => "DependencyNotFinished",
            ErrorKind::UnsupportedPrivacyTier => "UnsupportedPrivacyTier",
            ErrorKind::MissingDatabaseConfiguration => "MissingDatabaseConfiguration",
            ErrorKind::UnsafeOutputPath => "UnsafeOutputPath",
            ErrorKind::Filesystem => "FilesystemError",
            ErrorKind::CohortExtractorError => "CohortExtractorError",
            ErrorKind::ScriptError => "ScriptError",
        }
    }

    const fn may_use_reserved_code(self) -> bool {
        matches!(self, ErrorKind::WorkspaceNotFound)
    }
}

// The reserved status code belongs to exactly one kind. Adding another kind
// with that code fails the build.
const _: () = {
    let mut i = 0;
    while i < ErrorKind::ALL.len() {
        let kind = ErrorKind::ALL[i];
        assert!(
            kind.status_code() != RESERVED_STATUS_CODE || kind.may_use_reserved_code(),
            "status code -1 is reserved"
        );
        assert!(
            kind.status_code() != UNCLASSIFIED_STATUS_CODE,
            "status code 99 is reserved for unclassified errors"
        );
        i += 1;
    }
};

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Errors raised while resolving or executing a job.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("No project.yaml found in workspace {}", path.display())]
    WorkspaceNotFound { path: PathBuf },

    #[error("Invalid project file: {0}")]
    InvalidProjectFile(String),

    #[error("{command} is not a supported run command")]
    UnsupportedRunCommand { command: String },

    #[error("`{command}` with arguments {args:?} appears more than once in the project")]
    DuplicateRunCommand { command: String, args: Vec<String> },

    #[error("{0}")]
    InvalidVariableReference(String),

    #[error("Operation {operation} is not defined in the project")]
    UnknownOperation { operation: String },

    #[error("Action {action_id} needs {dependency}, which is not defined in the project")]
    UndefinedDependency {
        action_id: String,
        dependency: String,
    },

    #[error("Circular dependency between actions: {}", cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    #[error("No output for {action_id} at {}", expected_path.display())]
    DependencyNotFinished {
        action_id: String,
        expected_path: PathBuf,
    },

    #[error("Unsupported privacy tier: {tier}")]
    UnsupportedPrivacyTier { tier: String },

    #[error("No database configured for {db}: {env_var} is not set")]
    MissingDatabaseConfiguration { db: String, env_var: String },

    #[error("Output {filename} escapes {}", base.display())]
    UnsafeOutputPath { base: PathBuf, filename: String },

    #[error("Filesystem error at {}: {source}", path.display())]
    Filesystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{kind:?} failure in container {container}: {detail}")]
    Backend {
        kind: BackendErrorKind,
        container: String,
        detail: String,
    },
}

impl JobError {
    /// The kind this error is classified as.
    pub fn kind(&self) -> ErrorKind {
        match self {
            JobError::WorkspaceNotFound { .. } => ErrorKind::WorkspaceNotFound,
            JobError::InvalidProjectFile(_) => ErrorKind::InvalidProjectFile,
            JobError::UnsupportedRunCommand { .. } => ErrorKind::UnsupportedRunCommand,
            JobError::DuplicateRunCommand { .. } => ErrorKind::DuplicateRunCommand,
            JobError::InvalidVariableReference(_) => ErrorKind::InvalidVariableReference,
            JobError::UnknownOperation { .. } => ErrorKind::UnknownOperation,
            JobError::UndefinedDependency { .. } => ErrorKind::UndefinedDependency,
            JobError::CyclicDependency { .. } => ErrorKind::CyclicDependency,
            JobError::DependencyNotFinished { .. } => ErrorKind::DependencyNotFinished,
            JobError::UnsupportedPrivacyTier { .. } => ErrorKind::UnsupportedPrivacyTier,
            JobError::MissingDatabaseConfiguration { .. } => {
                ErrorKind::MissingDatabaseConfiguration
            }
            JobError::UnsafeOutputPath { .. } => ErrorKind::UnsafeOutputPath,
            JobError::Filesystem { .. } => ErrorKind::Filesystem,
            JobError::Backend { kind, .. } => kind.error_kind(),
        }
    }

    /// Status code reported to the job queue.
    pub fn status_code(&self) -> i32 {
        self.kind().status_code()
    }

    /// Message safe to send to the job queue.
    pub fn safe_details(&self) -> String {
        let kind = self.kind();
        if kind.report_args() {
            format!("{}: {}", kind, self)
        } else {
            format!("{}: {}", kind, REDACTED_DETAILS)
        }
    }

    pub(crate) fn filesystem(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        JobError::Filesystem {
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redacts_unreported_kinds() {
        let err = JobError::Backend {
            kind: BackendErrorKind::Script,
            container: "c".to_string(),
            detail: "thing not to leak".to_string(),
        };
        assert_eq!(
            err.safe_details(),
            "ScriptError: [possibly-unsafe details redacted]"
        );
        // The full detail remains available for local logging.
        assert!(err.to_string().contains("thing not to leak"));
    }

    #[test]
    fn test_reports_safe_kinds_verbatim() {
        let err = JobError::DependencyNotFinished {
            action_id: "generate_cohorts".to_string(),
            expected_path: PathBuf::from("/tmp/out/input.csv"),
        };
        assert_eq!(
            err.safe_details(),
            "DependencyNotFinished: No output for generate_cohorts at /tmp/out/input.csv"
        );
    }

    #[test]
    fn test_reserved_code_is_unique() {
        let holders: Vec<ErrorKind> = ErrorKind::ALL
            .iter()
            .copied()
            .filter(|k| k.status_code() == RESERVED_STATUS_CODE)
            .collect();
        assert_eq!(holders, vec![ErrorKind::WorkspaceNotFound]);

        let err = JobError::WorkspaceNotFound {
            path: PathBuf::from("/workspace"),
        };
        assert_eq!(err.status_code(), -1);
    }

    #[test]
    fn test_status_codes_are_distinct() {
        let mut codes: Vec<i32> = ErrorKind::ALL.iter().map(|k| k.status_code()).collect();
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), ErrorKind::ALL.len());
    }

    #[test]
    fn test_backend_kind_maps_to_error_kind() {
        let err = JobError::Backend {
            kind: BackendErrorKind::CohortExtractor,
            container: "c".to_string(),
            detail: String::new(),
        };
        assert_eq!(err.kind(), ErrorKind::CohortExtractorError);
        assert_eq!(err.status_code(), 14);
    }
}
