// Stage Recipes
// Command units and artifact checks for every stage, derived from the config

use crate::config::{ForgeConfig, Layout};
use crate::discovery::Query;
use crate::host::HostArch;
use crate::models::CommandUnit;
use crate::postcondition::Postcondition;
use crate::stages::StageId;

use regex::Regex;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

/// Headers needed to build compiler-rt builtins for foreign targets without a
/// real sysroot
const CROSS_SYSROOT_HEADERS: [(&str, &str); 4] = [
    (
        "assert.h",
        "#define assert(x) ((void)0)\n#define static_assert _Static_assert\n",
    ),
    (
        "sys/auxv.h",
        "#pragma once\n#define AT_HWCAP 16\n#define AT_HWCAP2 26\nint elf_aux_info(int, void *, int);\nunsigned long getauxval(unsigned long);\n",
    ),
    ("linux/unistd.h", "#include <asm/unistd.h>\n"),
    ("asm/unistd.h", "#define __NR_riscv_flush_icache 259\n"),
];

fn path(p: &Path) -> String {
    p.display().to_string()
}

/// Files involved in optimizing one clang binary with BOLT
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoltTarget {
    pub clang: PathBuf,
    pub instrumented: PathBuf,
    pub bolted: PathBuf,
    /// `clang++.inst` next to the instrumented binary
    pub clangpp_instrumented: PathBuf,
    pub llvm_bolt: PathBuf,
    pub merge_fdata: PathBuf,
}

impl BoltTarget {
    pub fn new(clang: PathBuf, install_bin: &Path) -> Self {
        let with_suffix = |suffix: &str| {
            let mut name = clang.clone().into_os_string();
            name.push(suffix);
            PathBuf::from(name)
        };
        let instrumented = with_suffix(".inst");
        let bolted = with_suffix(".bolt");
        let clangpp_instrumented = instrumented
            .parent()
            .unwrap_or(install_bin)
            .join("clang++.inst");

        Self {
            instrumented,
            bolted,
            clangpp_instrumented,
            llvm_bolt: install_bin.join("llvm-bolt"),
            merge_fdata: install_bin.join("merge-fdata"),
            clang,
        }
    }

    /// File name of the instrumented binary, the target of the `clang++.inst`
    /// symlink
    pub fn instrumented_name(&self) -> PathBuf {
        self.instrumented
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| self.instrumented.clone())
    }

    /// Intermediate files removed once the phase is over
    pub fn intermediates(&self) -> Vec<PathBuf> {
        vec![
            self.instrumented.clone(),
            self.clangpp_instrumented.clone(),
            self.bolted.clone(),
        ]
    }
}

/// Builds the command units of every stage from one configuration
#[derive(Debug, Clone)]
pub struct Recipes {
    config: ForgeConfig,
    layout: Layout,
    arch: HostArch,
}

impl Recipes {
    pub fn new(config: ForgeConfig, arch: HostArch) -> Self {
        let layout = config.layout();
        Self {
            config,
            layout,
            arch,
        }
    }

    pub fn config(&self) -> &ForgeConfig {
        &self.config
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn arch(&self) -> HostArch {
        self.arch
    }

    fn ninja(&self) -> String {
        path(&self.layout.custom_ninja())
    }

    // clone_llvm

    pub fn clone_llvm(&self) -> CommandUnit {
        CommandUnit::new(
            StageId::CloneLlvm,
            "Clone LLVM",
            format!(
                "git clone --depth 1 --branch {} {} {}",
                self.config.llvm_branch,
                self.config.llvm_repo,
                path(&self.layout.llvm_source)
            ),
        )
        .with_retries(self.config.clone_retries)
    }

    // build_ninja

    pub fn clone_ninja(&self) -> CommandUnit {
        CommandUnit::new(
            StageId::BuildNinja,
            format!("Clone Ninja {}", self.config.ninja_tag),
            format!(
                "git clone --depth 1 --branch {} {} {}",
                self.config.ninja_tag,
                self.config.ninja_repo,
                path(&self.layout.ninja_source)
            ),
        )
        .with_retries(self.config.clone_retries)
    }

    /// Make ninja weigh edges by their previous build time from `.ninja_log`
    pub fn patch_ninja(&self) -> CommandUnit {
        CommandUnit::new(
            StageId::BuildNinja,
            "Patch Ninja EdgeWeightHeuristic",
            format!(
                r"sed -i 's/return edge->is_phony() ? 0 : 1;/int64_t w = edge->prev_elapsed_time_millis < 0 ? 1 : edge->prev_elapsed_time_millis;\n  return edge->is_phony() ? 0 : w;/' {}",
                path(&self.layout.ninja_source.join("src").join("build.cc"))
            ),
        )
    }

    pub fn build_ninja(&self) -> CommandUnit {
        let build = path(&self.layout.ninja_build);
        CommandUnit::sequence(
            StageId::BuildNinja,
            "Build Ninja",
            vec![
                format!(
                    "cmake -B {} -S {} -DCMAKE_BUILD_TYPE=Release -DBUILD_TESTING=OFF",
                    build,
                    path(&self.layout.ninja_source)
                ),
                format!("cmake --build {}", build),
            ],
        )
    }

    // stage1_build

    pub fn stage1_configure(&self) -> CommandUnit {
        let flags = [
            "-G Ninja".to_string(),
            r#"-DLLVM_ENABLE_PROJECTS="clang;lld""#.to_string(),
            r#"-DLLVM_ENABLE_RUNTIMES="compiler-rt""#.to_string(),
            "-DLLVM_TARGETS_TO_BUILD=Native".to_string(),
            "-DCMAKE_BUILD_TYPE=Release".to_string(),
            "-DLLVM_BUILD_INSTRUMENTED=IR".to_string(),
            format!("-DCMAKE_C_COMPILER={}", self.config.host_tool("clang")),
            format!("-DCMAKE_CXX_COMPILER={}", self.config.host_tool("clang++")),
            "-DLLVM_ENABLE_LLD=ON".to_string(),
            "-DLLVM_ENABLE_TERMINFO=OFF".to_string(),
            "-DLLVM_ENABLE_ZLIB=OFF".to_string(),
            "-DLLVM_ENABLE_ZSTD=OFF".to_string(),
            format!("-DCMAKE_INSTALL_PREFIX={}", path(&self.layout.stage1_install)),
            format!("-S {}", path(&self.layout.llvm_source.join("llvm"))),
            format!("-B {}", path(&self.layout.stage1_build)),
        ];

        CommandUnit::new(
            StageId::Stage1Build,
            "Stage 1 CMake (instrumented clang)",
            format!("cmake {}", flags.join(" ")),
        )
    }

    pub fn stage1_build(&self) -> CommandUnit {
        CommandUnit::new(
            StageId::Stage1Build,
            "Stage 1 Build (instrumented clang)",
            format!("{} -C {} clang lld", self.ninja(), path(&self.layout.stage1_build)),
        )
    }

    pub fn stage1_install(&self) -> CommandUnit {
        CommandUnit::new(
            StageId::Stage1Build,
            "Stage 1 Install",
            format!(
                "{} -C {} install-clang install-clang-resource-headers install-lld",
                self.ninja(),
                path(&self.layout.stage1_build)
            ),
        )
    }

    /// `lib/clang/<version>` directories of the stage 1 install; the resource
    /// include dir is `<version>/include`
    pub fn resource_dir_query(&self) -> (PathBuf, Regex) {
        let dir = self.layout.stage1_install.join("lib").join("clang");
        (dir, VERSION_DIR.clone())
    }

    pub fn install_xray_headers(&self, resource_include: &Path) -> CommandUnit {
        CommandUnit::new(
            StageId::Stage1Build,
            "Install compiler-rt headers",
            format!(
                "cp -r {} {}",
                path(&self.layout.llvm_source.join("compiler-rt").join("include").join("xray")),
                path(&resource_include.join("xray"))
            ),
        )
    }

    // profile_collection

    pub fn checkout_submodules(&self) -> CommandUnit {
        let repo = path(&self.config.repo_path);
        CommandUnit::sequence(
            StageId::ProfileCollection,
            "Checkout submodules for profile collection",
            vec![
                format!("git -C {} submodule sync", repo),
                format!("git -C {} submodule init", repo),
                format!("{}/contrib/update-submodules.sh --max-procs 10", repo),
            ],
        )
        .with_retries(self.config.clone_retries)
    }

    /// CMake invocation for the database engine built with the given compilers
    fn engine_configure(&self, c_compiler: &Path, cxx_compiler: &Path, build_dir: &Path) -> String {
        let flags = [
            "-DCMAKE_BUILD_TYPE=None".to_string(),
            "-DENABLE_THINLTO=0".to_string(),
            format!("-DCMAKE_C_COMPILER={}", path(c_compiler)),
            format!("-DCMAKE_CXX_COMPILER={}", path(cxx_compiler)),
            "-DCOMPILER_CACHE=disabled".to_string(),
            "-DENABLE_TESTS=0".to_string(),
            "-DENABLE_UTILS=0".to_string(),
            format!(
                "-DCMAKE_TOOLCHAIN_FILE={}",
                path(&self.arch.toolchain_file(&self.config.repo_path))
            ),
            path(&self.config.repo_path),
            format!("-B {}", path(build_dir)),
        ];
        format!("cmake {}", flags.join(" "))
    }

    pub fn profile_configure(&self) -> CommandUnit {
        let bin = self.layout.stage1_install.join("bin");
        CommandUnit::new(
            StageId::ProfileCollection,
            "Profile collection CMake",
            self.engine_configure(&bin.join("clang"), &bin.join("clang++"), &self.layout.profile_build),
        )
    }

    /// Linking with the instrumented compiler usually fails; the profiles
    /// written while compiling are what matters
    pub fn profile_build(&self) -> CommandUnit {
        CommandUnit::new(
            StageId::ProfileCollection,
            "Profile collection build (ClickHouse)",
            format!("{} -C {} clickhouse", self.ninja(), path(&self.layout.profile_build)),
        )
    }

    pub fn raw_profiles(&self) -> Postcondition {
        Postcondition::NonEmptyDir(self.layout.raw_profiles())
    }

    /// Merged with the host llvm-profdata: raw profiles may hold compressed
    /// sections the stage 1 build cannot read
    pub fn merge_profiles(&self) -> CommandUnit {
        CommandUnit::new(
            StageId::ProfileCollection,
            "Merge PGO profiles",
            format!(
                "{} merge -output={} {}/",
                self.config.host_tool("llvm-profdata"),
                path(&self.layout.profdata),
                path(&self.layout.raw_profiles())
            ),
        )
    }

    pub fn merged_profile(&self) -> Postcondition {
        Postcondition::NonEmptyFile(self.layout.profdata.clone())
    }

    /// Build timing log of the profile collection build
    pub fn profile_ninja_log(&self) -> PathBuf {
        self.layout.profile_build.join(".ninja_log")
    }

    // stage2_build

    pub fn stage2_configure(&self) -> CommandUnit {
        let sysroot = path(&self.layout.cross_sysroot);
        let include = path(&self.layout.cross_sysroot.join("include"));
        let cross_flags = format!("-ffreestanding --sysroot={} -isystem {}", sysroot, include);

        let builtin_targets: Vec<&str> = self
            .config
            .cross_builtin_targets
            .iter()
            .map(|t| t.triple.as_str())
            .collect();

        let mut flags = vec![
            "-G Ninja".to_string(),
            format!(r#"-DLLVM_ENABLE_PROJECTS="{}""#, self.config.stage2_projects.join(";")),
            r#"-DLLVM_ENABLE_RUNTIMES="compiler-rt""#.to_string(),
            "-DLLVM_TARGETS_TO_BUILD=all".to_string(),
            "-DCMAKE_BUILD_TYPE=Release".to_string(),
            format!("-DLLVM_PROFDATA_FILE={}", path(&self.layout.profdata)),
            format!("-DCMAKE_C_COMPILER={}", self.config.host_tool("clang")),
            format!("-DCMAKE_CXX_COMPILER={}", self.config.host_tool("clang++")),
            "-DLLVM_ENABLE_LLD=ON".to_string(),
            "-DLLVM_ENABLE_LTO=Thin".to_string(),
            r#"-DCMAKE_EXE_LINKER_FLAGS="-Wl,--emit-relocs,-znow""#.to_string(),
            r#"-DCMAKE_SHARED_LINKER_FLAGS="-Wl,--emit-relocs,-znow""#.to_string(),
            "-DLLVM_ENABLE_TERMINFO=OFF".to_string(),
            "-DLLVM_ENABLE_ZLIB=OFF".to_string(),
            "-DLLVM_ENABLE_ZSTD=OFF".to_string(),
            "-DLLVM_BINUTILS_INCDIR=/usr/include".to_string(),
            format!(r#"-DLLVM_BUILTIN_TARGETS="{}""#, builtin_targets.join(";")),
        ];

        for target in &self.config.cross_builtin_targets {
            let triple = &target.triple;
            flags.push(format!("-DBUILTINS_{}_CMAKE_SYSTEM_NAME={}", triple, target.system));
            flags.push(format!("-DBUILTINS_{}_COMPILER_RT_BAREMETAL_BUILD=ON", triple));
            flags.push(format!(r#"-DBUILTINS_{}_CMAKE_C_FLAGS="{}""#, triple, cross_flags));
            flags.push(format!(r#"-DBUILTINS_{}_CMAKE_CXX_FLAGS="{}""#, triple, cross_flags));
        }

        flags.push(format!("-DCMAKE_INSTALL_PREFIX={}", path(&self.layout.stage2_install)));
        flags.push(format!("-S {}", path(&self.layout.llvm_source.join("llvm"))));
        flags.push(format!("-B {}", path(&self.layout.stage2_build)));

        CommandUnit::new(
            StageId::Stage2Build,
            "Stage 2 CMake (PGO-optimized clang)",
            format!("cmake {}", flags.join(" ")),
        )
    }

    pub fn stage2_build(&self) -> CommandUnit {
        CommandUnit::new(
            StageId::Stage2Build,
            "Stage 2 Build",
            format!("{} -C {}", self.ninja(), path(&self.layout.stage2_build)),
        )
    }

    pub fn stage2_install(&self) -> CommandUnit {
        CommandUnit::new(
            StageId::Stage2Build,
            "Stage 2 Install",
            format!("{} -C {} install", self.ninja(), path(&self.layout.stage2_build)),
        )
    }

    // bolt_optimization

    /// `clang-<major>`, else the newest `clang-<N>`, else plain `clang`
    pub fn clang_query(&self) -> Query {
        let bin = self.layout.stage2_bin();
        Query {
            expected: bin.join(format!("clang-{}", self.config.clang_major)),
            dir: bin.clone(),
            pattern: VERSIONED_CLANG.clone(),
            fallback: bin.join("clang"),
        }
    }

    pub fn bolt_target(&self, clang: PathBuf) -> BoltTarget {
        BoltTarget::new(clang, &self.layout.stage2_bin())
    }

    pub fn bolt_instrument(&self, target: &BoltTarget) -> CommandUnit {
        CommandUnit::new(
            StageId::BoltOptimization,
            "BOLT instrument clang",
            format!(
                "{} {} -o {} -instrument --instrumentation-file-append-pid --instrumentation-file={}",
                path(&target.llvm_bolt),
                path(&target.clang),
                path(&target.instrumented),
                path(&self.layout.bolt_profiles.join("prof"))
            ),
        )
    }

    pub fn bolt_configure(&self, target: &BoltTarget) -> CommandUnit {
        CommandUnit::new(
            StageId::BoltOptimization,
            "BOLT profile collection CMake",
            self.engine_configure(
                &target.instrumented,
                &target.clangpp_instrumented,
                &self.layout.bolt_build,
            ),
        )
    }

    /// Build errors are tolerated; only the collected profiles count
    pub fn bolt_collect(&self) -> CommandUnit {
        CommandUnit::new(
            StageId::BoltOptimization,
            "BOLT profile collection build (time-limited)",
            format!(
                "{} -j{} -k0 -C {} clickhouse || true",
                self.ninja(),
                self.config.bolt_parallelism,
                path(&self.layout.bolt_build)
            ),
        )
        .with_time_box(self.config.bolt_profile_timeout())
    }

    pub fn bolt_profiles(&self) -> Postcondition {
        Postcondition::MatchingFiles {
            dir: self.layout.bolt_profiles.clone(),
            pattern: BOLT_PROFILE.clone(),
        }
    }

    pub fn bolt_merge(&self, target: &BoltTarget) -> CommandUnit {
        CommandUnit::new(
            StageId::BoltOptimization,
            "Merge BOLT profiles",
            format!(
                "{} -o {} {}/prof.*",
                path(&target.merge_fdata),
                path(&self.layout.bolt_fdata),
                path(&self.layout.bolt_profiles)
            ),
        )
    }

    pub fn bolt_optimize(&self, target: &BoltTarget) -> CommandUnit {
        let flags = [
            "-reorder-blocks=ext-tsp",
            "-reorder-functions=cdsort",
            "-split-functions",
            "-split-all-cold",
            "-split-eh",
            "-dyno-stats",
            "-use-gnu-stack",
        ];
        CommandUnit::new(
            StageId::BoltOptimization,
            "BOLT optimize clang",
            format!(
                "{} {} -o {} -data={} {}",
                path(&target.llvm_bolt),
                path(&target.clang),
                path(&target.bolted),
                path(&self.layout.bolt_fdata),
                flags.join(" ")
            ),
        )
    }

    pub fn bolt_install(&self, target: &BoltTarget) -> CommandUnit {
        CommandUnit::new(
            StageId::BoltOptimization,
            "Install BOLTed clang",
            format!("mv {} {}", path(&target.bolted), path(&target.clang)),
        )
    }

    // package

    /// Strip ELF executables and shared libraries; scripts are left alone
    pub fn strip_binaries(&self) -> CommandUnit {
        let install = &self.layout.stage2_install;
        CommandUnit::new(
            StageId::Package,
            "Strip binaries",
            format!(
                r#"find {} -type f -executable -exec sh -c 'file "$1" | grep -q ELF && strip --strip-unneeded "$1"' _ {{}} \; && find {} -name '*.so*' -type f -exec strip --strip-unneeded {{}} +"#,
                path(&install.join("bin")),
                path(&install.join("lib"))
            ),
        )
    }

    pub fn archive(&self) -> CommandUnit {
        CommandUnit::new(
            StageId::Package,
            "Package toolchain",
            format!(
                "tar -C {} -cf - . | zstd -T0 -19 -o {}",
                path(&self.layout.stage2_install),
                path(&self.layout.archive)
            ),
        )
    }

    /// Where the custom ninja is installed in the toolchain
    pub fn packaged_ninja(&self) -> PathBuf {
        self.layout.stage2_bin().join("ninja")
    }

    /// Where the saved `.ninja_log` is installed in the toolchain
    pub fn packaged_ninja_log(&self) -> PathBuf {
        self.layout
            .stage2_install
            .join(&self.config.ninja_log_share_dir)
            .join("ninja_log")
    }
}

static VERSION_DIR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+").expect("static pattern"));

static VERSIONED_CLANG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^clang-\d+$").expect("static pattern"));

static BOLT_PROFILE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^prof\.").expect("static pattern"));

/// Write the stub headers used to build compiler-rt builtins for every cross
/// target
pub fn write_cross_sysroot(sysroot: &Path) -> io::Result<()> {
    let include = sysroot.join("include");
    for (name, content) in CROSS_SYSROOT_HEADERS {
        let header = include.join(name);
        if let Some(parent) = header.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&header, content)?;
    }
    tracing::debug!(sysroot = %sysroot.display(), "Wrote cross builtins sysroot");
    Ok(())
}
