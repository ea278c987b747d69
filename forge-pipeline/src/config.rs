// Forge Configuration
// Tunables for the toolchain build and the scratch layout derived from them

use crate::error::ServiceResult;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// A cross-compilation target whose compiler-rt builtins ship with the
/// toolchain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrossTarget {
    pub triple: String,
    /// CMake system name (`Linux`, `FreeBSD`)
    pub system: String,
}

impl CrossTarget {
    fn new(triple: &str, system: &str) -> Self {
        Self {
            triple: triple.to_string(),
            system: system.to_string(),
        }
    }
}

/// Configuration for a toolchain build.
///
/// Every field has a default, so a YAML file only needs the keys it
/// overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ForgeConfig {
    /// Root for all scratch directories
    pub temp_dir: PathBuf,
    /// Checkout of the database engine used to collect profiles
    pub repo_path: PathBuf,
    /// Where the final archive is written
    pub output_dir: PathBuf,
    pub llvm_repo: String,
    pub llvm_branch: String,
    pub ninja_repo: String,
    pub ninja_tag: String,
    /// Version suffix of the host compiler (`clang-21`, `llvm-profdata-21`)
    pub host_compiler_version: String,
    /// Major version of the clang being built, used to find its binary
    pub clang_major: u32,
    /// LLVM projects for the final toolchain
    pub stage2_projects: Vec<String>,
    pub cross_builtin_targets: Vec<CrossTarget>,
    /// Wall-clock budget for BOLT profile collection
    pub bolt_profile_timeout_secs: u64,
    pub bolt_parallelism: u32,
    /// Retries for network operations (clones, submodules)
    pub clone_retries: u32,
    pub retry_delay_secs: u64,
    /// Lines of output kept per step
    pub output_tail_lines: usize,
    pub archive_name: String,
    /// Location of the saved `.ninja_log` inside the installed toolchain
    pub ninja_log_share_dir: String,
    /// Extra environment for every command
    pub env: HashMap<String, String>,
}

impl Default for ForgeConfig {
    fn default() -> Self {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));

        Self {
            temp_dir: PathBuf::from("/tmp"),
            repo_path: PathBuf::from("/ClickHouse"),
            output_dir: cwd.join("ci").join("tmp"),
            llvm_repo: "https://github.com/llvm/llvm-project.git".to_string(),
            llvm_branch: "release/21.x".to_string(),
            ninja_repo: "https://github.com/ninja-build/ninja.git".to_string(),
            ninja_tag: "v1.12.1".to_string(),
            host_compiler_version: "21".to_string(),
            clang_major: 21,
            stage2_projects: ["clang", "clang-tools-extra", "lld", "bolt", "polly"]
                .iter()
                .map(|p| p.to_string())
                .collect(),
            cross_builtin_targets: vec![
                CrossTarget::new("x86_64-unknown-linux-gnu", "Linux"),
                CrossTarget::new("aarch64-unknown-linux-gnu", "Linux"),
                CrossTarget::new("s390x-unknown-linux-gnu", "Linux"),
                CrossTarget::new("powerpc64le-unknown-linux-gnu", "Linux"),
                CrossTarget::new("riscv64-unknown-linux-gnu", "Linux"),
                CrossTarget::new("loongarch64-unknown-linux-gnu", "Linux"),
                CrossTarget::new("x86_64-pc-freebsd13", "FreeBSD"),
                CrossTarget::new("aarch64-unknown-freebsd13", "FreeBSD"),
                CrossTarget::new("powerpc64le-unknown-freebsd13", "FreeBSD"),
            ],
            bolt_profile_timeout_secs: 1200,
            bolt_parallelism: 4,
            clone_retries: 3,
            retry_delay_secs: 5,
            output_tail_lines: 200,
            archive_name: "clang-pgo-bolt.tar.zst".to_string(),
            ninja_log_share_dir: "share/clickhouse-build".to_string(),
            env: HashMap::new(),
        }
    }
}

impl ForgeConfig {
    /// Parse a YAML configuration
    pub fn from_yaml(content: &str) -> ServiceResult<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    /// Load configuration from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> ServiceResult<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn layout(&self) -> Layout {
        Layout::new(self)
    }

    pub fn bolt_profile_timeout(&self) -> Duration {
        Duration::from_secs(self.bolt_profile_timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    /// Host compiler binary with the configured version suffix
    pub fn host_tool(&self, tool: &str) -> String {
        format!("{}-{}", tool, self.host_compiler_version)
    }
}

/// Scratch and output paths.
///
/// Derived purely from the configuration so that a resumed run finds the
/// outputs of stages completed by an earlier run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    pub llvm_source: PathBuf,
    pub ninja_source: PathBuf,
    pub ninja_build: PathBuf,
    pub stage1_build: PathBuf,
    pub stage1_install: PathBuf,
    pub stage2_build: PathBuf,
    pub stage2_install: PathBuf,
    pub profile_build: PathBuf,
    pub bolt_build: PathBuf,
    pub profdata: PathBuf,
    pub bolt_profiles: PathBuf,
    pub bolt_fdata: PathBuf,
    pub saved_ninja_log: PathBuf,
    pub cross_sysroot: PathBuf,
    pub output_dir: PathBuf,
    pub archive: PathBuf,
}

impl Layout {
    pub fn new(config: &ForgeConfig) -> Self {
        let tmp = &config.temp_dir;
        Self {
            llvm_source: tmp.join("llvm-project"),
            ninja_source: tmp.join("ninja-src"),
            ninja_build: tmp.join("ninja-build"),
            stage1_build: tmp.join("toolchain-stage1"),
            stage1_install: tmp.join("toolchain-stage1-install"),
            stage2_build: tmp.join("toolchain-stage2"),
            stage2_install: tmp.join("toolchain-stage2-install"),
            profile_build: tmp.join("toolchain-ch-profile"),
            bolt_build: tmp.join("toolchain-ch-bolt"),
            profdata: tmp.join("clang.profdata"),
            bolt_profiles: tmp.join("bolt-profiles"),
            bolt_fdata: tmp.join("bolt.fdata"),
            saved_ninja_log: tmp.join("clickhouse-ninja-log"),
            cross_sysroot: tmp.join("cross-builtins-sysroot"),
            output_dir: config.output_dir.clone(),
            archive: config.output_dir.join(&config.archive_name),
        }
    }

    /// The patched ninja produced by `build_ninja`
    pub fn custom_ninja(&self) -> PathBuf {
        self.ninja_build.join("ninja")
    }

    /// Raw profiles written by the instrumented stage 1 compiler
    pub fn raw_profiles(&self) -> PathBuf {
        self.stage1_build.join("profiles")
    }

    pub fn stage2_bin(&self) -> PathBuf {
        self.stage2_install.join("bin")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_empty_yaml_is_default() {
        let config = ForgeConfig::from_yaml("").unwrap();
        assert_eq!(config.bolt_profile_timeout_secs, 1200);
        assert_eq!(config.clone_retries, 3);
        assert_eq!(config.cross_builtin_targets.len(), 9);
    }

    #[test]
    fn test_partial_yaml_overrides() {
        let yaml = r#"
temp_dir: /scratch
bolt_profile_timeout_secs: 60
env:
  CCACHE_DISABLE: "1"
"#;
        let config = ForgeConfig::from_yaml(yaml).unwrap();

        assert_eq!(config.temp_dir, PathBuf::from("/scratch"));
        assert_eq!(config.bolt_profile_timeout(), Duration::from_secs(60));
        assert_eq!(config.env.get("CCACHE_DISABLE").map(String::as_str), Some("1"));
        assert_eq!(config.llvm_branch, "release/21.x");
    }

    #[test]
    fn test_invalid_yaml_is_config_error() {
        let err = ForgeConfig::from_yaml("bolt_parallelism: [1, 2").unwrap_err();
        assert!(matches!(err, crate::error::ServiceError::Config(_)));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("forge.yaml");
        fs::write(&path, "clang_major: 20\n").unwrap();

        let config = ForgeConfig::from_file(&path).unwrap();
        assert_eq!(config.clang_major, 20);
    }

    #[test]
    fn test_layout_is_stable() {
        let config = ForgeConfig {
            temp_dir: PathBuf::from("/scratch"),
            output_dir: PathBuf::from("/out"),
            ..ForgeConfig::default()
        };

        let first = config.layout();
        let second = config.layout();

        assert_eq!(first, second);
        assert_eq!(first.stage1_build, PathBuf::from("/scratch/toolchain-stage1"));
        assert_eq!(first.raw_profiles(), PathBuf::from("/scratch/toolchain-stage1/profiles"));
        assert_eq!(first.custom_ninja(), PathBuf::from("/scratch/ninja-build/ninja"));
        assert_eq!(first.archive, PathBuf::from("/out/clang-pgo-bolt.tar.zst"));
    }

    #[test]
    fn test_host_tool_suffix() {
        let config = ForgeConfig::default();
        assert_eq!(config.host_tool("llvm-profdata"), "llvm-profdata-21");
    }
}
