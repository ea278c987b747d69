// Artifact Postconditions
// Judge a stage by the artifacts it left behind, not only by exit codes

use crate::discovery::Discovery;
use crate::models::{Step, StepStatus};
use crate::stages::StageId;

use regex::Regex;
use std::fmt;
use std::path::PathBuf;

/// An artifact a stage is expected to produce
#[derive(Debug, Clone)]
pub enum Postcondition {
    /// Directory exists and has at least one entry
    NonEmptyDir(PathBuf),
    /// File exists and is not empty
    NonEmptyFile(PathBuf),
    /// At least one entry of `dir` matches `pattern`
    MatchingFiles { dir: PathBuf, pattern: Regex },
}

impl fmt::Display for Postcondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Postcondition::NonEmptyDir(dir) => write!(f, "files in {}", dir.display()),
            Postcondition::NonEmptyFile(path) => write!(f, "non-empty {}", path.display()),
            Postcondition::MatchingFiles { dir, pattern } => {
                write!(f, "files matching '{}' in {}", pattern, dir.display())
            }
        }
    }
}

/// Result of checking a postcondition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostconditionOutcome {
    pub satisfied: bool,
    /// Matching entries (1 for a single file)
    pub count: usize,
    pub description: String,
}

impl Postcondition {
    pub fn check(&self, discovery: &dyn Discovery) -> PostconditionOutcome {
        let count = match self {
            Postcondition::NonEmptyDir(dir) => discovery.entry_count(dir),
            Postcondition::NonEmptyFile(path) => match discovery.file_size(path) {
                Some(size) if size > 0 => 1,
                _ => 0,
            },
            Postcondition::MatchingFiles { dir, pattern } => discovery.list(dir, pattern).len(),
        };

        PostconditionOutcome {
            satisfied: count > 0,
            count,
            description: self.to_string(),
        }
    }
}

/// Turn a failed step into a success when the artifact it was run for
/// exists anyway.
///
/// Returns true when the status was overridden. A failed step whose artifact
/// is missing stays failed.
pub fn override_expected_failure(
    step: &mut Step,
    outcome: &PostconditionOutcome,
    note: &str,
) -> bool {
    if step.status != StepStatus::Failed || !outcome.satisfied {
        return false;
    }

    tracing::warn!(
        stage = %step.stage,
        step = %step.name,
        artifacts = outcome.count,
        "Command failed but produced the required artifacts, accepting"
    );
    step.status = StepStatus::Succeeded;
    step.add_note(note.to_string());
    true
}

/// A verification step recording whether an artifact exists.
///
/// Used where a command can exit zero without producing anything; a missing
/// artifact yields a failed step, which halts the run.
pub fn verify(stage: StageId, name: &str, outcome: &PostconditionOutcome) -> Step {
    if outcome.satisfied {
        Step::succeeded(stage, name).with_note(format!(
            "found {} ({})",
            outcome.description, outcome.count
        ))
    } else {
        tracing::error!(stage = %stage, step = name, missing = %outcome.description, "Expected artifact missing");
        Step::failed(stage, name).with_note(format!("missing {}", outcome.description))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::{FsDiscovery, MemoryDiscovery};
    use std::fs;
    use std::path::Path;

    #[test]
    fn test_non_empty_dir() {
        let dir = tempfile::tempdir().unwrap();
        let profiles = dir.path().join("profiles");
        let condition = Postcondition::NonEmptyDir(profiles.clone());

        assert!(!condition.check(&FsDiscovery).satisfied);

        fs::create_dir(&profiles).unwrap();
        assert!(!condition.check(&FsDiscovery).satisfied);

        fs::write(profiles.join("default_1.profraw"), "data").unwrap();
        let outcome = condition.check(&FsDiscovery);
        assert!(outcome.satisfied);
        assert_eq!(outcome.count, 1);
    }

    #[test]
    fn test_non_empty_file() {
        let discovery = MemoryDiscovery::new()
            .with_file("/tmp/empty.profdata", 0)
            .with_file("/tmp/clang.profdata", 4096);

        assert!(!Postcondition::NonEmptyFile("/tmp/empty.profdata".into())
            .check(&discovery)
            .satisfied);
        assert!(!Postcondition::NonEmptyFile("/tmp/missing".into())
            .check(&discovery)
            .satisfied);
        assert!(Postcondition::NonEmptyFile("/tmp/clang.profdata".into())
            .check(&discovery)
            .satisfied);
    }

    #[test]
    fn test_matching_files() {
        let discovery = MemoryDiscovery::new()
            .with_file("/tmp/bolt-profiles/prof.1", 10)
            .with_file("/tmp/bolt-profiles/prof.2", 10)
            .with_file("/tmp/bolt-profiles/readme", 10);
        let condition = Postcondition::MatchingFiles {
            dir: Path::new("/tmp/bolt-profiles").to_path_buf(),
            pattern: Regex::new(r"^prof\.").unwrap(),
        };

        let outcome = condition.check(&discovery);
        assert!(outcome.satisfied);
        assert_eq!(outcome.count, 2);
    }

    #[test]
    fn test_override_expected_failure_when_artifact_present() {
        let mut step = Step::failed(StageId::ProfileCollection, "Profile collection build");
        let outcome = PostconditionOutcome {
            satisfied: true,
            count: 12,
            description: "files in /tmp/profiles".to_string(),
        };

        assert!(override_expected_failure(&mut step, &outcome, "link failed (expected)"));
        assert_eq!(step.status, StepStatus::Succeeded);
        assert_eq!(step.note.as_deref(), Some("link failed (expected)"));
    }

    #[test]
    fn test_no_override_without_artifact() {
        let mut step = Step::failed(StageId::ProfileCollection, "Profile collection build");
        let outcome = PostconditionOutcome {
            satisfied: false,
            count: 0,
            description: "files in /tmp/profiles".to_string(),
        };

        assert!(!override_expected_failure(&mut step, &outcome, "ignored"));
        assert_eq!(step.status, StepStatus::Failed);
        assert!(step.note.is_none());
    }

    #[test]
    fn test_override_leaves_success_untouched() {
        let mut step = Step::succeeded(StageId::ProfileCollection, "Profile collection build");
        let outcome = PostconditionOutcome {
            satisfied: true,
            count: 1,
            description: String::new(),
        };

        assert!(!override_expected_failure(&mut step, &outcome, "ignored"));
        assert!(step.note.is_none());
    }

    #[test]
    fn test_verify_step() {
        let missing = PostconditionOutcome {
            satisfied: false,
            count: 0,
            description: "non-empty /tmp/clang.profdata".to_string(),
        };
        let step = verify(StageId::ProfileCollection, "Verify merged profile", &missing);

        assert_eq!(step.status, StepStatus::Failed);
        assert_eq!(step.note.as_deref(), Some("missing non-empty /tmp/clang.profdata"));

        let present = PostconditionOutcome {
            satisfied: true,
            ..missing
        };
        let step = verify(StageId::ProfileCollection, "Verify merged profile", &present);
        assert_eq!(step.status, StepStatus::Succeeded);
    }
}
