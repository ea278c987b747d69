// Host Detection
// Supported build architectures and the host tools the stages rely on

use crate::error::{ServiceError, ServiceResult};
use crate::stages::StageId;

use std::path::{Path, PathBuf};

/// Architectures the toolchain can be built on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostArch {
    X86_64,
    Aarch64,
}

impl HostArch {
    /// Architecture of the running process
    pub fn detect() -> ServiceResult<Self> {
        Self::from_machine(std::env::consts::ARCH)
    }

    pub fn from_machine(machine: &str) -> ServiceResult<Self> {
        match machine {
            "x86_64" => Ok(HostArch::X86_64),
            "aarch64" => Ok(HostArch::Aarch64),
            other => Err(ServiceError::UnsupportedArchitecture(other.to_string())),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HostArch::X86_64 => "x86_64",
            HostArch::Aarch64 => "aarch64",
        }
    }

    /// CMake toolchain file of the database engine for this architecture
    pub fn toolchain_file(self, repo_path: &Path) -> PathBuf {
        repo_path
            .join("cmake")
            .join("linux")
            .join(format!("toolchain-{}.cmake", self.as_str()))
    }
}

/// Host executables the given stages invoke directly.
///
/// Binaries produced by the pipeline itself (custom ninja, stage 1 clang,
/// llvm-bolt) are not listed.
pub fn required_tools(stages: &[StageId], host_compiler_version: &str) -> Vec<String> {
    let mut tools: Vec<String> = Vec::new();
    let mut add = |tool: String| {
        if !tools.contains(&tool) {
            tools.push(tool);
        }
    };

    for stage in stages {
        match stage {
            StageId::CloneLlvm => add("git".to_string()),
            StageId::BuildNinja => {
                add("git".to_string());
                add("sed".to_string());
                add("cmake".to_string());
            }
            StageId::Stage1Build | StageId::Stage2Build => {
                add("cmake".to_string());
                add(format!("clang-{}", host_compiler_version));
                add(format!("clang++-{}", host_compiler_version));
                if *stage == StageId::Stage1Build {
                    add("cp".to_string());
                }
            }
            StageId::ProfileCollection => {
                add("git".to_string());
                add("cmake".to_string());
                add(format!("llvm-profdata-{}", host_compiler_version));
            }
            StageId::BoltOptimization => {
                add("cmake".to_string());
                add("mv".to_string());
            }
            StageId::Package => {
                add("find".to_string());
                add("file".to_string());
                add("grep".to_string());
                add("strip".to_string());
                add("tar".to_string());
                add("zstd".to_string());
            }
        }
    }

    tools
}

/// Fail on the first tool that `lookup` cannot resolve
pub fn check_tools<F>(tools: &[String], lookup: F) -> ServiceResult<()>
where
    F: Fn(&str) -> bool,
{
    match tools.iter().find(|tool| !lookup(tool)) {
        Some(missing) => Err(ServiceError::MissingTool(missing.clone())),
        None => Ok(()),
    }
}

/// Resolve tools against the `PATH`
pub fn check_tools_on_path(tools: &[String]) -> ServiceResult<()> {
    check_tools(tools, |tool| which::which(tool).is_ok())
}
