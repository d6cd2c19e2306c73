use disexec_core::Result;
use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::warn;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    /// `None` when the process was killed by a signal or the timeout.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0) && !self.timed_out
    }

    pub fn status_label(&self) -> String {
        if self.timed_out {
            "timeout".to_string()
        } else {
            self.code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string())
        }
    }
}

/// Runs the external command of a task. Blocks until the process exits.
pub trait ProcessInvoker: Send + Sync {
    fn invoke(&self, command: &Path, args: &[String], cwd: &Path) -> Result<ProcessOutput>;
}

#[derive(Debug, Clone, Default)]
pub struct SystemProcess {
    timeout: Option<Duration>,
}

impl SystemProcess {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }
}

impl ProcessInvoker for SystemProcess {
    fn invoke(&self, command: &Path, args: &[String], cwd: &Path) -> Result<ProcessOutput> {
        let mut cmd = Command::new(command);
        cmd.args(args);
        cmd.current_dir(cwd);
        cmd.stdin(Stdio::null());
        match self.timeout {
            None => {
                let output = cmd.output()?;
                Ok(ProcessOutput {
                    code: output.status.code(),
                    stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                    stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                    timed_out: false,
                })
            }
            Some(timeout) => run_with_timeout(cmd, timeout),
        }
    }
}

fn run_with_timeout(mut cmd: Command, timeout: Duration) -> Result<ProcessOutput> {
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    let mut child = cmd.spawn()?;
    let stdout = child.stdout.take().map(spawn_reader);
    let stderr = child.stderr.take().map(spawn_reader);

    let deadline = Instant::now() + timeout;
    let mut timed_out = false;
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if Instant::now() >= deadline {
            warn!(pid = child.id(), timeout_s = timeout.as_secs(), "killing process after timeout");
            let _ = child.kill();
            timed_out = true;
            break child.wait()?;
        }
        thread::sleep(POLL_INTERVAL);
    };

    Ok(ProcessOutput {
        code: if timed_out { None } else { status.code() },
        stdout: join_reader(stdout),
        stderr: join_reader(stderr),
        timed_out,
    })
}

fn spawn_reader<R: Read + Send + 'static>(mut stream: R) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = stream.read_to_end(&mut buf);
        buf
    })
}

fn join_reader(handle: Option<thread::JoinHandle<Vec<u8>>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .map(|bytes| String::from_utf8_lossy(&bytes).to_string())
        .unwrap_or_default()
}
