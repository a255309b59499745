use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use thiserror::Error;
use tracing::debug;

#[cfg(unix)]
use std::os::unix::process::{CommandExt, ExitStatusExt};

/// Argv placeholder replaced per-execution by a temp file holding the mutant.
pub const FILE_PLACEHOLDER: &str = "@@";

/// Upper bound on captured stdout (head) and stderr (tail) bytes. Well above
/// the 8 KiB the sanitizer scanner needs.
const CAPTURE_LIMIT: usize = 64 * 1024;

/// How often the wait loop polls the child for exit.
const WAIT_POLL: Duration = Duration::from_millis(2);

#[derive(Error, Debug)]
pub enum ExecutorError {
    /// The child could not be started at all. Fatal to the driver.
    #[error("Failed to spawn target {argv:?}: {source}")]
    Spawn {
        argv: Vec<String>,
        source: std::io::Error,
    },

    #[error("Executor I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Target command line is empty")]
    EmptyArgv,
}

/// Outcome of one target execution.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    /// The child ran to completion without a signal or timeout.
    pub exited_normally: bool,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    /// The child outlived `timeout` and its process group was killed.
    pub timed_out: bool,
    /// First `CAPTURE_LIMIT` bytes of stdout.
    pub stdout: Vec<u8>,
    /// Last `CAPTURE_LIMIT` bytes of stderr; sanitizer reports land at the
    /// end of the stream, so the tail is the interesting part.
    pub stderr: Vec<u8>,
    pub wall_time: Duration,
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub argv: Vec<String>,
    pub timeout: Duration,
    pub memory_limit_bytes: u64,
    pub sanitizers: bool,
}

/// Runs the target once per mutant: spawn in a fresh process group, feed
/// stdin (or a temp file via `@@`), enforce the timeout, capture output.
pub struct CommandExecutor {
    config: ExecutorConfig,
    uses_file: bool,
    scratch: TempDir,
}

impl CommandExecutor {
    pub fn new(config: ExecutorConfig) -> Result<Self, ExecutorError> {
        if config.argv.is_empty() {
            return Err(ExecutorError::EmptyArgv);
        }
        let uses_file = config.argv.iter().any(|a| a == FILE_PLACEHOLDER);
        let scratch = TempDir::new()?;
        Ok(Self {
            config,
            uses_file,
            scratch,
        })
    }

    /// Execute the target against `input`.
    ///
    /// An empty input is valid: stdin is opened and immediately closed.
    pub fn execute(&mut self, input: &[u8]) -> Result<ExecutionResult, ExecutorError> {
        let input_path = self.scratch.path().join("cur_input");
        if self.uses_file {
            std::fs::write(&input_path, input)?;
        }

        let argv = self.resolved_argv(&input_path);
        let mut command = Command::new(&argv[0]);
        command
            .args(&argv[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        if self.config.sanitizers {
            // Leaks must not masquerade as crashes; aborts must raise SIGABRT
            // so signal classification sees them.
            const SAN_OPTS: &str = "abort_on_error=1:detect_leaks=0";
            command.env("ASAN_OPTIONS", SAN_OPTS);
            command.env("MSAN_OPTIONS", SAN_OPTS);
            command.env("UBSAN_OPTIONS", SAN_OPTS);
        }

        #[cfg(unix)]
        self.apply_child_limits(&mut command);

        let started = Instant::now();
        let mut child = command.spawn().map_err(|source| ExecutorError::Spawn {
            argv: argv.clone(),
            source,
        })?;

        // Readers must be draining before stdin is fed, or a target that
        // floods stdout while we block on a large write deadlocks both sides.
        let stdout_reader = child.stdout.take().map(|s| capture_stream(s, Keep::Head));
        let stderr_reader = child.stderr.take().map(|s| capture_stream(s, Keep::Tail));

        if let Some(mut stdin) = child.stdin.take() {
            if !self.uses_file && !input.is_empty() {
                // The child may exit before reading everything; a broken pipe
                // is its prerogative, not our error.
                match stdin.write_all(input) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
                    Err(e) => return Err(ExecutorError::Io(e)),
                }
            }
            drop(stdin);
        }

        let deadline = started + self.config.timeout;
        let mut timed_out = false;
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if Instant::now() >= deadline {
                timed_out = true;
                debug!(pid = child.id(), "execution timed out, killing process group");
                kill_process_group(child.id());
                break child.wait()?;
            }
            thread::sleep(WAIT_POLL);
        };

        let stdout = join_capture(stdout_reader);
        let stderr = join_capture(stderr_reader);
        let wall_time = started.elapsed();

        let mut exit_code = status.code();
        #[cfg(unix)]
        let mut signal = status.signal();
        #[cfg(not(unix))]
        let mut signal: Option<i32> = None;

        // Some platforms report death-by-signal as a negative exit code.
        if let Some(code) = exit_code {
            if code < 0 {
                signal = Some(-code);
                exit_code = None;
            }
        }

        Ok(ExecutionResult {
            exited_normally: !timed_out && signal.is_none(),
            exit_code,
            signal,
            timed_out,
            stdout,
            stderr,
            wall_time,
        })
    }

    fn resolved_argv(&self, input_path: &std::path::Path) -> Vec<String> {
        let path: PathBuf = input_path.to_path_buf();
        self.config
            .argv
            .iter()
            .map(|arg| {
                if arg == FILE_PLACEHOLDER {
                    path.to_string_lossy().into_owned()
                } else {
                    arg.clone()
                }
            })
            .collect()
    }

    #[cfg(unix)]
    fn apply_child_limits(&self, command: &mut Command) {
        use nix::sys::resource::{setrlimit, Resource};
        use nix::unistd::{setpgid, Pid};

        let memory_limit = self.config.memory_limit_bytes;
        // A whole-second ceiling with one second of slack; the wall-clock
        // timeout is the real enforcement, this just caps runaway spinning.
        let cpu_limit = self.config.timeout.as_secs() + 1;

        // Safety: only async-signal-safe calls run between fork and exec.
        unsafe {
            command.pre_exec(move || {
                setpgid(Pid::from_raw(0), Pid::from_raw(0))
                    .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
                if memory_limit > 0 {
                    let _ = setrlimit(Resource::RLIMIT_AS, memory_limit, memory_limit);
                }
                let _ = setrlimit(Resource::RLIMIT_CPU, cpu_limit, cpu_limit);
                Ok(())
            });
        }
    }
}

/// Kill the child's entire process group so hanging grandchildren are reaped
/// along with it.
fn kill_process_group(pid: u32) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;
        let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
    }
    #[cfg(not(unix))]
    let _ = pid;
}

enum Keep {
    Head,
    Tail,
}

fn capture_stream<R: Read + Send + 'static>(mut stream: R, keep: Keep) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut kept: Vec<u8> = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            match stream.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => match keep {
                    Keep::Head => {
                        if kept.len() < CAPTURE_LIMIT {
                            let take = n.min(CAPTURE_LIMIT - kept.len());
                            kept.extend_from_slice(&chunk[..take]);
                        }
                        // Keep draining so the child never blocks on a full
                        // pipe.
                    }
                    Keep::Tail => {
                        kept.extend_from_slice(&chunk[..n]);
                        if kept.len() > CAPTURE_LIMIT {
                            let excess = kept.len() - CAPTURE_LIMIT;
                            kept.drain(..excess);
                        }
                    }
                },
                Err(_) => break,
            }
        }
        kept
    })
}

fn join_capture(handle: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    handle
        .and_then(|h| h.join().ok())
        .unwrap_or_default()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn executor_for(argv: &[&str], timeout_ms: u64) -> CommandExecutor {
        CommandExecutor::new(ExecutorConfig {
            argv: argv.iter().map(|s| s.to_string()).collect(),
            timeout: Duration::from_millis(timeout_ms),
            memory_limit_bytes: 0,
            sanitizers: false,
        })
        .unwrap()
    }

    #[test]
    fn successful_execution_captures_stdout() {
        let mut executor = executor_for(&["echo", "hello"], 2000);
        let result = executor.execute(b"").unwrap();

        assert!(result.exited_normally);
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.signal, None);
        assert!(!result.timed_out);
        assert_eq!(result.stdout, b"hello\n");
    }

    #[test]
    fn stdin_is_fed_and_closed() {
        let mut executor = executor_for(&["cat"], 2000);
        let result = executor.execute(b"fed via stdin").unwrap();

        assert!(result.exited_normally);
        assert_eq!(result.stdout, b"fed via stdin");
    }

    #[test]
    fn empty_input_is_accepted() {
        let mut executor = executor_for(&["cat"], 2000);
        let result = executor.execute(b"").unwrap();

        assert!(result.exited_normally);
        assert!(result.stdout.is_empty());
    }

    #[test]
    fn timeout_kills_the_target() {
        let mut executor = executor_for(&["sleep", "10"], 200);
        let started = Instant::now();
        let result = executor.execute(b"").unwrap();

        assert!(result.timed_out);
        assert!(!result.exited_normally);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn death_by_signal_is_normalized() {
        let mut executor = executor_for(&["/bin/sh", "-c", "kill -SEGV $$"], 2000);
        let result = executor.execute(b"").unwrap();

        assert!(!result.exited_normally);
        assert_eq!(result.signal, Some(11));
        assert_eq!(result.exit_code, None);
    }

    #[test]
    fn stderr_tail_is_captured() {
        let mut executor = executor_for(&["/bin/sh", "-c", "echo oops >&2; exit 1"], 2000);
        let result = executor.execute(b"").unwrap();

        assert!(result.exited_normally);
        assert_eq!(result.exit_code, Some(1));
        assert_eq!(result.stderr, b"oops\n");
    }

    #[test]
    fn file_placeholder_is_substituted() {
        let mut executor = executor_for(&["/bin/sh", "-c", "cat \"$0\"", FILE_PLACEHOLDER], 2000);
        let result = executor.execute(b"delivered by file").unwrap();

        assert!(result.exited_normally);
        assert_eq!(result.stdout, b"delivered by file");
    }

    #[test]
    fn spawn_failure_is_reported() {
        let mut executor = executor_for(&["./does-not-exist-5150"], 1000);
        match executor.execute(b"") {
            Err(ExecutorError::Spawn { argv, .. }) => {
                assert_eq!(argv[0], "./does-not-exist-5150");
            }
            other => panic!("expected spawn failure, got {other:?}"),
        }
    }

    #[test]
    fn empty_argv_is_rejected() {
        let result = CommandExecutor::new(ExecutorConfig {
            argv: Vec::new(),
            timeout: Duration::from_secs(1),
            memory_limit_bytes: 0,
            sanitizers: true,
        });
        assert!(matches!(result, Err(ExecutorError::EmptyArgv)));
    }
}
