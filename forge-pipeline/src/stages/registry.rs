// Stage Registry
// The fixed stage order and the active subset used when resuming

use crate::error::{ServiceError, ServiceResult};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A named phase of the toolchain build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageId {
    CloneLlvm,
    BuildNinja,
    Stage1Build,
    ProfileCollection,
    Stage2Build,
    BoltOptimization,
    Package,
}

impl StageId {
    /// Every stage in pipeline order
    pub const ALL: [StageId; 7] = [
        StageId::CloneLlvm,
        StageId::BuildNinja,
        StageId::Stage1Build,
        StageId::ProfileCollection,
        StageId::Stage2Build,
        StageId::BoltOptimization,
        StageId::Package,
    ];

    pub fn name(self) -> &'static str {
        match self {
            StageId::CloneLlvm => "clone_llvm",
            StageId::BuildNinja => "build_ninja",
            StageId::Stage1Build => "stage1_build",
            StageId::ProfileCollection => "profile_collection",
            StageId::Stage2Build => "stage2_build",
            StageId::BoltOptimization => "bolt_optimization",
            StageId::Package => "package",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            StageId::CloneLlvm => "Clone the LLVM release branch",
            StageId::BuildNinja => "Build ninja with timing-based scheduling",
            StageId::Stage1Build => "Build instrumented clang",
            StageId::ProfileCollection => "Collect PGO profiles by building the database engine",
            StageId::Stage2Build => "Build the PGO-optimized clang with all targets",
            StageId::BoltOptimization => "Optimize the clang binary layout with BOLT (best effort)",
            StageId::Package => "Strip and archive the toolchain",
        }
    }

    /// Position in the pipeline, starting at zero
    pub fn ordinal(self) -> usize {
        self as usize
    }

    /// Whether failures inside this stage are downgraded instead of halting
    pub fn is_degradable(self) -> bool {
        matches!(self, StageId::BoltOptimization)
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.name())
    }
}

impl FromStr for StageId {
    type Err = ServiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StageId::ALL
            .into_iter()
            .find(|stage| stage.name() == s)
            .ok_or_else(|| ServiceError::InvalidStage {
                name: s.to_string(),
                valid: StageId::ALL.iter().map(|st| st.name().to_string()).collect(),
            })
    }
}

/// Holds the canonical stage order
#[derive(Debug, Clone)]
pub struct StageRegistry {
    stages: Vec<StageId>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self {
            stages: StageId::ALL.to_vec(),
        }
    }

    pub fn stages(&self) -> &[StageId] {
        &self.stages
    }

    pub fn first(&self) -> StageId {
        self.stages[0]
    }

    /// Stages from `start` through the end, in order.
    ///
    /// `None` selects the first stage. Stages before the start are excluded:
    /// their outputs are expected on disk from an earlier run.
    pub fn active_from(&self, start: Option<&str>) -> ServiceResult<Vec<StageId>> {
        let start = match start {
            Some(name) => name.parse::<StageId>()?,
            None => self.first(),
        };

        let position = self
            .stages
            .iter()
            .position(|stage| *stage == start)
            .ok_or_else(|| ServiceError::InvalidStage {
                name: start.name().to_string(),
                valid: self.stages.iter().map(|s| s.name().to_string()).collect(),
            })?;

        Ok(self.stages[position..].to_vec())
    }
}

impl Default for StageRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_start_is_first_stage() {
        let registry = StageRegistry::new();
        let active = registry.active_from(None).unwrap();

        assert_eq!(active, StageId::ALL.to_vec());
    }

    #[test]
    fn test_every_start_yields_suffix_in_order() {
        let registry = StageRegistry::new();

        for (index, stage) in StageId::ALL.iter().enumerate() {
            let active = registry.active_from(Some(stage.name())).unwrap();
            assert_eq!(active, StageId::ALL[index..].to_vec());
            assert_eq!(active[0], *stage);
        }
    }

    #[test]
    fn test_resume_from_stage2() {
        let registry = StageRegistry::new();
        let active = registry.active_from(Some("stage2_build")).unwrap();

        assert_eq!(
            active,
            vec![
                StageId::Stage2Build,
                StageId::BoltOptimization,
                StageId::Package
            ]
        );
    }

    #[test]
    fn test_unknown_stage_is_rejected() {
        let registry = StageRegistry::new();
        let err = registry.active_from(Some("stage3_build")).unwrap_err();

        match err {
            ServiceError::InvalidStage { name, valid } => {
                assert_eq!(name, "stage3_build");
                assert_eq!(valid.len(), StageId::ALL.len());
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_names_round_trip_and_ordinals() {
        for (index, stage) in StageId::ALL.iter().enumerate() {
            assert_eq!(stage.name().parse::<StageId>().unwrap(), *stage);
            assert_eq!(stage.ordinal(), index);
        }
        assert!(StageId::BoltOptimization.is_degradable());
        assert!(!StageId::Package.is_degradable());
    }
}
