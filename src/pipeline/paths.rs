//! Deterministic, privacy-tier-scoped storage locations.

use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::config::StorageRoots;
use crate::error::JobError;
use crate::project::PrivacyTier;

fn unsafe_chars() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^0-9a-z-]").expect("volume pattern is valid"))
}

fn hyphen_runs() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"--+").expect("hyphen pattern is valid"))
}

/// The values that key a job's storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceIdentity {
    pub repo: String,
    pub branch: String,
    pub db: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl WorkspaceIdentity {
    pub fn new(repo: impl Into<String>, branch: impl Into<String>, db: impl Into<String>) -> Self {
        Self {
            repo: repo.into(),
            branch: branch.into(),
            db: db.into(),
            owner: None,
            name: None,
        }
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Filesystem-safe directory name for this workspace.
    ///
    /// Fields are joined with `-` after replacing anything outside
    /// `[0-9a-z-]` with `-`; runs of hyphens collapse to one.
    pub fn volume_name(&self) -> String {
        let parts: Vec<String> = [
            Some(self.repo.as_str()),
            Some(self.branch.as_str()),
            Some(self.db.as_str()),
            self.owner.as_deref(),
            self.name.as_deref(),
        ]
        .into_iter()
        .flatten()
        .map(|field| unsafe_chars().replace_all(field, "-").into_owned())
        .collect();

        hyphen_runs().replace_all(&parts.join("-"), "-").into_owned()
    }
}

/// Maps a workspace and privacy tier to a directory under the tier's root.
#[derive(Debug, Clone)]
pub struct PathResolver {
    storage: StorageRoots,
}

impl PathResolver {
    pub fn new(storage: StorageRoots) -> Self {
        Self { storage }
    }

    pub fn storage(&self) -> &StorageRoots {
        &self.storage
    }

    /// Returns `<root for tier>/<volume name>`, creating it if missing.
    pub fn resolve_path(
        &self,
        identity: &WorkspaceIdentity,
        tier: PrivacyTier,
    ) -> Result<PathBuf, JobError> {
        let path = self.storage.root_for(tier).join(identity.volume_name());
        // create_dir_all tolerates a concurrent creator winning the race.
        std::fs::create_dir_all(&path).map_err(|e| JobError::filesystem(&path, e))?;
        Ok(path)
    }

    /// Same as [`resolve_path`](Self::resolve_path) for a tier given by name.
    pub fn resolve_named(
        &self,
        identity: &WorkspaceIdentity,
        tier: &str,
    ) -> Result<PathBuf, JobError> {
        self.resolve_path(identity, tier.parse()?)
    }
}

/// Docker-legal container name derived from an output directory.
///
/// Two jobs writing to the same directory get the same name, so docker
/// refuses to run the second while the first is alive.
pub fn container_name_for(path: &Path) -> String {
    let name: String = path
        .to_string_lossy()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    match name.strip_prefix('-') {
        Some(stripped) => stripped.to_string(),
        None => name,
    }
}

/// Joins `relative` onto `base`, refusing results outside `base`.
///
/// Normalization is lexical: `.` is dropped and `..` pops a component.
/// Symlinks are not followed.
pub fn safe_join(base: &Path, relative: &str) -> Result<PathBuf, JobError> {
    let escape = || JobError::UnsafeOutputPath {
        base: base.to_path_buf(),
        filename: relative.to_string(),
    };

    let mut joined = base.to_path_buf();
    let mut depth = 0usize;
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => {
                joined.push(part);
                depth += 1;
            }
            Component::CurDir => {}
            Component::ParentDir => {
                if depth == 0 {
                    return Err(escape());
                }
                joined.pop();
                depth -= 1;
            }
            Component::RootDir | Component::Prefix(_) => return Err(escape()),
        }
    }
    Ok(joined)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_volume_name_normalizes_fields() {
        let identity = WorkspaceIdentity::new("hiv-research", "feasibility-no", "full");
        assert_eq!(identity.volume_name(), "hiv-research-feasibility-no-full");

        let identity = WorkspaceIdentity::new("https://github.com/repo", "master", "full");
        assert_eq!(identity.volume_name(), "https-github-com-repo-master-full");
    }

    #[test]
    fn test_volume_name_with_owner_and_name() {
        let identity = WorkspaceIdentity::new("repo", "main", "slice")
            .with_owner("me")
            .with_name("my_study");
        assert_eq!(identity.volume_name(), "repo-main-slice-me-my-study");
    }

    #[test]
    fn test_volume_name_replaces_uppercase() {
        let identity = WorkspaceIdentity::new("Repo", "main", "full");
        assert_eq!(identity.volume_name(), "-epo-main-full");
    }

    #[test]
    fn test_container_name_strips_leading_hyphen() {
        assert_eq!(container_name_for(Path::new("/badname")), "badname");
        assert_eq!(
            container_name_for(Path::new("/tmp/storage/repo-master-full")),
            "tmp-storage-repo-master-full"
        );
    }

    #[test]
    fn test_container_name_is_docker_legal_and_stable() {
        let path = Path::new("/mnt/high privacy/ä_x.y");
        let first = container_name_for(path);
        assert_eq!(first, container_name_for(path));
        assert!(first
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-'));
        assert!(!first.starts_with('-'));
    }

    #[test]
    fn test_resolve_path_creates_directory() {
        let high = tempfile::tempdir().unwrap();
        let medium = tempfile::tempdir().unwrap();
        let resolver = PathResolver::new(StorageRoots::new(high.path(), medium.path()));
        let identity = WorkspaceIdentity::new("repo", "master", "full");

        let path = resolver.resolve_path(&identity, PrivacyTier::Medium).unwrap();
        assert_eq!(path, medium.path().join("repo-master-full"));
        assert!(path.is_dir());

        // Second call is a no-op.
        assert_eq!(
            resolver.resolve_path(&identity, PrivacyTier::Medium).unwrap(),
            path
        );
    }

    #[test]
    fn test_resolve_named_rejects_unknown_tier() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = PathResolver::new(StorageRoots::new(dir.path(), dir.path()));
        let identity = WorkspaceIdentity::new("repo", "master", "full");
        assert!(matches!(
            resolver.resolve_named(&identity, "public"),
            Err(JobError::UnsupportedPrivacyTier { .. })
        ));
        assert!(resolver.resolve_named(&identity, "highly_sensitive").is_ok());
    }

    #[test]
    fn test_safe_join() {
        let base = Path::new("/data/out");
        assert_eq!(
            safe_join(base, "input.csv").unwrap(),
            PathBuf::from("/data/out/input.csv")
        );
        assert_eq!(
            safe_join(base, "./a/../b.csv").unwrap(),
            PathBuf::from("/data/out/b.csv")
        );
        assert!(matches!(
            safe_join(base, "../secret.csv"),
            Err(JobError::UnsafeOutputPath { .. })
        ));
        assert!(safe_join(base, "/etc/passwd").is_err());
    }
}
