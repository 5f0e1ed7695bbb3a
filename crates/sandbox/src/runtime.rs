//! Built-in runtime table.
//!
//! Each language maps to the source file name the program is materialized
//! as, an optional compile step, and the run step. Arguments and
//! environment values may contain placeholders that are expanded per
//! execution:
//!
//! - `{workspace}`: absolute path of the request's workspace
//! - `{heap_mb}`: the profile's memory ceiling in MiB

use std::path::{Path, PathBuf};

/// One process spawned for an execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    /// Executable name (resolved on `PATH`) or absolute path template.
    pub program: String,
    /// Argument templates.
    pub args: Vec<String>,
    /// Apply the memory ceiling as `RLIMIT_AS`.
    pub limit_address_space: bool,
}

impl Step {
    /// Create a step.
    pub fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            limit_address_space: false,
        }
    }

    /// Apply the memory ceiling as `RLIMIT_AS`.
    pub fn address_space_limited(mut self) -> Self {
        self.limit_address_space = true;
        self
    }
}

/// How to execute programs of one language.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeSpec {
    /// Language ID this runtime serves.
    pub language: String,
    /// File name the source is written to inside the workspace.
    pub source_file: String,
    /// Compile step; a non-zero exit ends the execution with its output.
    pub compile: Option<Step>,
    /// Run step; receives stdin.
    pub run: Step,
    /// Extra environment (templated values).
    pub env: Vec<(String, String)>,
}

/// A step with placeholders expanded, ready to spawn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub address_space_limit: Option<u64>,
    /// Last step of the execution (the user program itself).
    pub is_final: bool,
}

impl RuntimeSpec {
    /// Built-in runtime for a language ID, if one exists.
    pub fn builtin(language: &str) -> Option<Self> {
        let spec = match language {
            "python" => Self::interpreted(
                language,
                "main.py",
                Step::new("python3", &["-I", "main.py"]).address_space_limited(),
            ),
            "javascript" => Self::interpreted(
                language,
                "main.js",
                Step::new("node", &["--max-old-space-size={heap_mb}", "main.js"]),
            ),
            "typescript" => Self::interpreted(language, "main.ts", Step::new("tsx", &["main.ts"]))
                .with_env("NODE_OPTIONS", "--max-old-space-size={heap_mb}"),
            "java" => Self::interpreted(
                language,
                "Main.java",
                Step::new("java", &["-Xmx{heap_mb}m", "Main.java"]),
            ),
            "php" => Self::interpreted(
                language,
                "main.php",
                Step::new("php", &["-d", "memory_limit={heap_mb}M", "main.php"]),
            ),
            "ruby" => Self::interpreted(
                language,
                "main.rb",
                Step::new("ruby", &["main.rb"]).address_space_limited(),
            ),
            "go" => Self::interpreted(language, "main.go", Step::new("go", &["run", "main.go"]))
                .with_env("GOCACHE", "{workspace}/.gocache")
                .with_env("GOPATH", "{workspace}/.gopath")
                .with_env("GO111MODULE", "off"),
            "cpp" => Self::compiled(
                language,
                "main.cpp",
                Step::new("g++", &["-O2", "-std=c++17", "-o", "main", "main.cpp"]),
            ),
            "c" => Self::compiled(
                language,
                "main.c",
                Step::new("gcc", &["-O2", "-std=c11", "-o", "main", "main.c", "-lm"]),
            ),
            "rust" => Self::compiled(
                language,
                "main.rs",
                Step::new("rustc", &["-O", "--edition", "2021", "-o", "main", "main.rs"]),
            ),
            "shell" => Self::interpreted(
                language,
                "main.sh",
                Step::new("sh", &["main.sh"]).address_space_limited(),
            ),
            "bash" => Self::interpreted(
                language,
                "main.sh",
                Step::new("bash", &["main.sh"]).address_space_limited(),
            ),
            _ => return None,
        };
        Some(spec)
    }

    /// Runtime running the source file directly.
    pub fn interpreted(language: &str, source_file: &str, run: Step) -> Self {
        Self {
            language: language.to_string(),
            source_file: source_file.to_string(),
            compile: None,
            run,
            env: Vec::new(),
        }
    }

    /// Runtime compiling to `{workspace}/main` first.
    pub fn compiled(language: &str, source_file: &str, compile: Step) -> Self {
        Self {
            language: language.to_string(),
            source_file: source_file.to_string(),
            compile: Some(compile),
            run: Step::new("{workspace}/main", &[]).address_space_limited(),
            env: Vec::new(),
        }
    }

    /// Add an environment variable.
    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.push((key.to_string(), value.to_string()));
        self
    }

    /// Program whose absence makes this runtime unusable.
    pub fn required_program(&self) -> &str {
        self.compile
            .as_ref()
            .map(|s| s.program.as_str())
            .unwrap_or(self.run.program.as_str())
    }

    /// Whether the required program can be found on `PATH`.
    pub fn is_installed(&self) -> bool {
        let program = self.required_program();
        program.contains('{') || find_on_path(program).is_some()
    }

    /// Expand all steps for one execution.
    pub fn invocations(&self, workspace: &Path, memory_limit_bytes: u64) -> Vec<Invocation> {
        let build = |step: &Step, is_final: bool| Invocation {
            program: expand(&step.program, workspace, memory_limit_bytes),
            args: step
                .args
                .iter()
                .map(|a| expand(a, workspace, memory_limit_bytes))
                .collect(),
            address_space_limit: step.limit_address_space.then_some(memory_limit_bytes),
            is_final,
        };

        self.compile
            .iter()
            .map(|s| build(s, false))
            .chain(std::iter::once(build(&self.run, true)))
            .collect()
    }

    /// Expand environment templates for one execution.
    pub fn environment(&self, workspace: &Path, memory_limit_bytes: u64) -> Vec<(String, String)> {
        self.env
            .iter()
            .map(|(k, v)| (k.clone(), expand(v, workspace, memory_limit_bytes)))
            .collect()
    }
}

fn expand(template: &str, workspace: &Path, memory_limit_bytes: u64) -> String {
    let heap_mb = (memory_limit_bytes / (1024 * 1024)).max(16);
    template
        .replace("{workspace}", &workspace.to_string_lossy())
        .replace("{heap_mb}", &heap_mb.to_string())
}

/// Locate an executable on `PATH`.
pub fn find_on_path(program: &str) -> Option<PathBuf> {
    if program.contains('/') {
        let path = PathBuf::from(program);
        return path.is_file().then_some(path);
    }
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_languages() {
        for lang in [
            "python", "javascript", "typescript", "java", "php", "ruby", "go", "cpp", "c", "rust",
            "shell", "bash",
        ] {
            let spec = RuntimeSpec::builtin(lang).unwrap();
            assert_eq!(spec.language, lang);
        }
        assert!(RuntimeSpec::builtin("brainfuck").is_none());
    }

    #[test]
    fn test_compiled_runtime_expands_binary_path() {
        let spec = RuntimeSpec::builtin("cpp").unwrap();
        let steps = spec.invocations(Path::new("/tmp/ws-1"), 256 * 1024 * 1024);
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].program, "g++");
        assert!(!steps[0].is_final);
        assert_eq!(steps[0].address_space_limit, None);
        assert_eq!(steps[1].program, "/tmp/ws-1/main");
        assert!(steps[1].is_final);
        assert_eq!(steps[1].address_space_limit, Some(256 * 1024 * 1024));
        assert_eq!(spec.required_program(), "g++");
    }

    #[test]
    fn test_heap_placeholder() {
        let spec = RuntimeSpec::builtin("javascript").unwrap();
        let steps = spec.invocations(Path::new("/tmp/ws"), 128 * 1024 * 1024);
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].args[0], "--max-old-space-size=128");

        let ts = RuntimeSpec::builtin("typescript").unwrap();
        let env = ts.environment(Path::new("/tmp/ws"), 64 * 1024 * 1024);
        assert_eq!(env, vec![("NODE_OPTIONS".to_string(), "--max-old-space-size=64".to_string())]);
    }

    #[test]
    fn test_shell_is_installed() {
        assert!(RuntimeSpec::builtin("shell").unwrap().is_installed());
        let missing = RuntimeSpec::interpreted(
            "ghost",
            "main.gh",
            Step::new("definitely-not-a-real-runtime", &[]),
        );
        assert!(!missing.is_installed());
    }
}
