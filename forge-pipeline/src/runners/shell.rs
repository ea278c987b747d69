// Shell Runner
// Runs one shell command, streaming and capturing its output

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

/// How long output readers may keep draining after a forced stop
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration for a single shell invocation
#[derive(Debug, Clone)]
pub struct ShellConfig {
    /// Wall-clock limit (None = no limit)
    pub timeout: Option<Duration>,
    /// Time between the interrupt and the kill once the limit is reached
    pub kill_grace: Duration,
    /// Lines of stdout and of stderr to keep
    pub tail_lines: usize,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            timeout: None,
            kill_grace: Duration::from_secs(120),
            tail_lines: 200,
        }
    }
}

/// Output collected during a command
#[derive(Debug, Clone, Default)]
pub struct ShellOutput {
    /// Last lines of standard output
    pub stdout: String,
    /// Last lines of standard error
    pub stderr: String,
    /// Exit code (None when killed by a signal or never spawned)
    pub exit_code: Option<i32>,
    /// The time limit was reached and the process group was stopped
    pub timed_out: bool,
}

impl ShellOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Stdout followed by stderr, for step diagnostics
    pub fn combined(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout, self.stderr),
        }
    }
}

/// Callback for output lines as they arrive; the flag is true for stderr
pub type OutputCallback = Arc<dyn Fn(&str, bool) + Send + Sync>;

/// Shell runner for executing commands through `sh -c`
#[derive(Debug, Clone, Default)]
pub struct ShellRunner;

impl ShellRunner {
    pub fn new() -> Self {
        Self
    }

    fn shell_command() -> (&'static str, &'static [&'static str]) {
        if cfg!(target_os = "windows") {
            ("cmd", &["/C"])
        } else {
            ("sh", &["-c"])
        }
    }

    /// Run a command and wait for it, honoring the configured time limit
    pub async fn run(
        &self,
        script: &str,
        env: &HashMap<String, String>,
        working_dir: &Path,
        config: &ShellConfig,
        on_output: Option<OutputCallback>,
    ) -> ShellOutput {
        let (shell_cmd, shell_args) = Self::shell_command();

        let mut cmd = Command::new(shell_cmd);
        cmd.args(shell_args);
        cmd.arg(script);
        cmd.current_dir(working_dir);
        cmd.envs(env);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        // Own process group, so a time limit stops the whole build tree
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return ShellOutput {
                    stderr: format!("Failed to spawn shell process '{}': {}", shell_cmd, e),
                    ..ShellOutput::default()
                };
            }
        };

        let stdout_handle =
            collect_lines(child.stdout.take(), false, config.tail_lines, on_output.clone());
        let stderr_handle = collect_lines(child.stderr.take(), true, config.tail_lines, on_output);

        let (wait_result, timed_out) = match config.timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
                Ok(result) => (result, false),
                Err(_) => {
                    tracing::warn!(
                        limit_secs = limit.as_secs(),
                        "Time limit reached, interrupting process group"
                    );
                    (stop_process_group(&mut child, config.kill_grace).await, true)
                }
            },
            None => (child.wait().await, false),
        };

        let (stdout, mut stderr) = if timed_out {
            (
                drain(stdout_handle, DRAIN_TIMEOUT).await,
                drain(stderr_handle, DRAIN_TIMEOUT).await,
            )
        } else {
            (
                stdout_handle.await.unwrap_or_default(),
                stderr_handle.await.unwrap_or_default(),
            )
        };

        let exit_code = match wait_result {
            Ok(status) => status.code(),
            Err(e) => {
                if !stderr.is_empty() {
                    stderr.push('\n');
                }
                stderr.push_str(&format!("Process error: {}", e));
                None
            }
        };

        ShellOutput {
            stdout,
            stderr,
            exit_code,
            timed_out,
        }
    }
}

fn collect_lines<R>(
    stream: Option<R>,
    is_error: bool,
    tail_lines: usize,
    on_output: Option<OutputCallback>,
) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let Some(stream) = stream else {
            return String::new();
        };
        // Raw bytes: a non-UTF-8 line must not stop the reader and close the pipe
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        let mut tail = TailBuffer::new(tail_lines);
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf)
                        .trim_end_matches(['\n', '\r'])
                        .to_string();
                    if let Some(callback) = &on_output {
                        callback(&line, is_error);
                    }
                    tail.push(line);
                }
                Err(e) => {
                    tracing::warn!(error = %e, is_error, "Failed to read command output");
                    break;
                }
            }
        }
        tail.join()
    })
}

async fn drain(handle: JoinHandle<String>, limit: Duration) -> String {
    match tokio::time::timeout(limit, handle).await {
        Ok(joined) => joined.unwrap_or_default(),
        Err(_) => String::new(),
    }
}

/// Interrupt the child's process group, then kill it after `grace`
async fn stop_process_group(
    child: &mut Child,
    grace: Duration,
) -> std::io::Result<std::process::ExitStatus> {
    let pid = child.id();

    if let Some(pid) = pid {
        signal_group(pid, GroupSignal::Interrupt);
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(result) => {
            // Descendants may outlive the shell and hold the pipes open
            if let Some(pid) = pid {
                signal_group(pid, GroupSignal::Kill);
            }
            result
        }
        Err(_) => {
            tracing::warn!(grace_secs = grace.as_secs(), "Process ignored interrupt, killing");
            if let Some(pid) = pid {
                signal_group(pid, GroupSignal::Kill);
            }
            let _ = child.kill().await;
            child.wait().await
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GroupSignal {
    Interrupt,
    Kill,
}

/// Signal every process in the group led by `pid`; false when delivery failed
#[cfg(unix)]
fn signal_group(pid: u32, signal: GroupSignal) -> bool {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let sig = match signal {
        GroupSignal::Interrupt => Signal::SIGINT,
        GroupSignal::Kill => Signal::SIGKILL,
    };
    match killpg(Pid::from_raw(pid as i32), sig) {
        Ok(()) => true,
        // The group already exited
        Err(nix::errno::Errno::ESRCH) => {
            tracing::debug!(pid, signal = ?signal, "Process group already gone");
            false
        }
        Err(e) => {
            tracing::warn!(pid, signal = ?signal, error = %e, "Failed to signal process group");
            false
        }
    }
}

#[cfg(not(unix))]
fn signal_group(_pid: u32, _signal: GroupSignal) -> bool {
    false
}

/// Keeps the last `capacity` lines
struct TailBuffer {
    lines: VecDeque<String>,
    capacity: usize,
}

impl TailBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            capacity,
        }
    }

    fn push(&mut self, line: String) {
        if self.capacity == 0 {
            return;
        }
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    fn join(self) -> String {
        Vec::from(self.lines).join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Instant;

    fn cwd() -> std::path::PathBuf {
        std::env::current_dir().unwrap()
    }

    #[tokio::test]
    async fn test_shell_runner_echo() {
        let runner = ShellRunner::new();
        let output = runner
            .run("echo hello", &HashMap::new(), &cwd(), &ShellConfig::default(), None)
            .await;

        assert_eq!(output.exit_code, Some(0));
        assert!(output.success());
        assert_eq!(output.stdout, "hello");
        assert!(output.stderr.is_empty());
        assert!(!output.timed_out);
    }

    #[tokio::test]
    async fn test_shell_runner_with_env() {
        let runner = ShellRunner::new();
        let mut env = HashMap::new();
        env.insert("MY_VAR".to_string(), "test_value".to_string());

        let output = runner
            .run("echo $MY_VAR", &env, &cwd(), &ShellConfig::default(), None)
            .await;

        assert!(output.stdout.contains("test_value"));
    }

    #[tokio::test]
    async fn test_shell_runner_exit_code_and_stderr() {
        let runner = ShellRunner::new();
        let output = runner
            .run(
                "echo broken >&2; exit 42",
                &HashMap::new(),
                &cwd(),
                &ShellConfig::default(),
                None,
            )
            .await;

        assert_eq!(output.exit_code, Some(42));
        assert_eq!(output.stderr, "broken");
        assert_eq!(output.combined(), "broken");
    }

    #[tokio::test]
    async fn test_shell_runner_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "x").unwrap();

        let runner = ShellRunner::new();
        let output = runner
            .run("ls", &HashMap::new(), dir.path(), &ShellConfig::default(), None)
            .await;

        assert!(output.stdout.contains("marker.txt"));
    }

    #[tokio::test]
    async fn test_time_limit_stops_process() {
        let runner = ShellRunner::new();
        let config = ShellConfig {
            timeout: Some(Duration::from_millis(300)),
            kill_grace: Duration::from_secs(2),
            ..ShellConfig::default()
        };

        let start = Instant::now();
        let output = runner
            .run("echo started; sleep 30", &HashMap::new(), &cwd(), &config, None)
            .await;

        assert!(output.timed_out);
        assert_eq!(output.stdout, "started");
        assert!(start.elapsed() < Duration::from_secs(15));
    }

    #[tokio::test]
    async fn test_output_tail_is_bounded() {
        let runner = ShellRunner::new();
        let config = ShellConfig {
            tail_lines: 2,
            ..ShellConfig::default()
        };

        let output = runner
            .run("for i in 1 2 3 4 5; do echo $i; done", &HashMap::new(), &cwd(), &config, None)
            .await;

        assert_eq!(output.stdout, "4\n5");
    }

    #[tokio::test]
    async fn test_output_callback_sees_every_line() {
        let seen: Arc<Mutex<Vec<(String, bool)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callback: OutputCallback = Arc::new(move |line, is_error| {
            sink.lock().unwrap().push((line.to_string(), is_error));
        });

        let runner = ShellRunner::new();
        let config = ShellConfig {
            tail_lines: 1,
            ..ShellConfig::default()
        };
        runner
            .run("echo a; echo b; echo c >&2", &HashMap::new(), &cwd(), &config, Some(callback))
            .await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert!(seen.contains(&("c".to_string(), true)));
        assert!(seen.contains(&("a".to_string(), false)));
    }

    #[tokio::test]
    async fn test_invalid_utf8_line_keeps_reading() {
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callback: OutputCallback = Arc::new(move |line, _| {
            sink.lock().unwrap().push(line.to_string());
        });

        let runner = ShellRunner::new();
        let script = "printf 'caf\\351\\n'; sleep 0.5; \
                      i=0; while [ $i -lt 20000 ]; do echo line $i; i=$((i+1)); done; exit 0";
        let output = runner
            .run(script, &HashMap::new(), &cwd(), &ShellConfig::default(), Some(callback))
            .await;

        assert_eq!(output.exit_code, Some(0));
        assert!(output.stdout.ends_with("line 19999"));
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 20001);
        assert_eq!(seen[0], "caf\u{FFFD}");
    }

    #[tokio::test]
    async fn test_ignored_interrupt_kills_whole_group() {
        let runner = ShellRunner::new();
        let config = ShellConfig {
            timeout: Some(Duration::from_millis(300)),
            kill_grace: Duration::from_millis(300),
            ..ShellConfig::default()
        };

        // The background sleep holds the pipes open unless the group is killed
        let start = Instant::now();
        let output = runner
            .run(
                "trap '' INT; echo started; sleep 30 & wait",
                &HashMap::new(),
                &cwd(),
                &config,
                None,
            )
            .await;

        assert!(output.timed_out);
        assert_eq!(output.stdout, "started");
        assert!(start.elapsed() < DRAIN_TIMEOUT);
    }

    #[cfg(unix)]
    #[test]
    fn test_signal_missing_group_reports_failure() {
        assert!(!signal_group(i32::MAX as u32, GroupSignal::Kill));
    }

    #[test]
    fn test_tail_buffer_zero_capacity() {
        let mut tail = TailBuffer::new(0);
        tail.push("dropped".to_string());
        assert_eq!(tail.join(), "");
    }
}
