//! Constrained process spawning on the host.
//!
//! A run request passes [`ShellPolicy::authorize`] before the spawner is ever
//! touched. The spawn strategy is chosen once for the platform; every process
//! runs with the sandbox root as its working directory. Output is forwarded
//! per read as [`ShellEvent::Output`] on `stdout`/`stderr`, followed by exactly
//! one [`ShellEvent::Exit`] after both streams have closed.

use crate::error::{RelayError, RelayResult};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::{Semaphore, mpsc};
use tracing::{debug, info, warn};

/// Commands `cmd.exe` implements itself and that have no executable on PATH.
const WINDOWS_BUILTINS: &[&str] = &[
    "dir", "cd", "copy", "move", "del", "type", "echo", "cls", "md", "rd",
];

const READ_BUFFER_SIZE: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellEvent {
    Output { stream: OutputStream, data: String },
    /// `None` when the process was killed by a signal.
    Exit { code: Option<i32> },
}

#[derive(Debug, Clone, Default)]
pub struct ShellPolicy {
    pub enabled: bool,
    /// Allowed command base names. Empty means any command.
    pub whitelist: Vec<String>,
}

impl ShellPolicy {
    pub fn authorize(&self, command: &str) -> RelayResult<()> {
        if !self.enabled {
            return Err(RelayError::denied("Shell disabled"));
        }
        if !self.whitelist.is_empty() {
            let base = base_name(command);
            if !self.whitelist.iter().any(|allowed| allowed == base) {
                warn!("Rejected non-whitelisted command {:?}", base);
                return Err(RelayError::denied("Command not allowed"));
            }
        }
        Ok(())
    }
}

fn base_name(command: &str) -> &str {
    Path::new(command)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(command)
}

/// Starts a child process. The one seam between the relay and the OS.
pub trait ProcessSpawner: Send + Sync + 'static {
    fn spawn(&self, command: &str, args: &[String], working_dir: &Path) -> io::Result<Child>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnStrategy {
    /// Built-ins through `cmd /c`, everything else through `cmd /d /s /c`.
    WindowsCmd,
    /// Everything through `/bin/sh` so PATH lookup applies.
    PosixShell,
}

impl SpawnStrategy {
    pub fn for_current_platform() -> Self {
        if cfg!(windows) {
            SpawnStrategy::WindowsCmd
        } else {
            SpawnStrategy::PosixShell
        }
    }

    /// Build the command line for `command args...`.
    ///
    /// Arguments are handed over as separate argv entries and never
    /// concatenated into a shell string.
    pub fn command(&self, command: &str, args: &[String]) -> Command {
        match self {
            SpawnStrategy::WindowsCmd => {
                let builtin = base_name(command).to_ascii_lowercase();
                let mut cmd = Command::new("cmd");
                if WINDOWS_BUILTINS.contains(&builtin.as_str()) {
                    cmd.arg("/c");
                } else {
                    cmd.args(["/d", "/s", "/c"]);
                }
                cmd.arg(command).args(args);
                cmd
            }
            SpawnStrategy::PosixShell => {
                // `$0` is the command, `$@` the untouched arguments.
                let mut cmd = Command::new("/bin/sh");
                cmd.arg("-c").arg(r#""$0" "$@""#).arg(command).args(args);
                cmd
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SystemSpawner {
    strategy: SpawnStrategy,
}

impl SystemSpawner {
    pub fn new(strategy: SpawnStrategy) -> Self {
        Self { strategy }
    }

    pub fn for_current_platform() -> Self {
        Self::new(SpawnStrategy::for_current_platform())
    }
}

impl ProcessSpawner for SystemSpawner {
    fn spawn(&self, command: &str, args: &[String], working_dir: &Path) -> io::Result<Child> {
        self.strategy
            .command(command, args)
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
    }
}

pub struct ShellRunner {
    policy: ShellPolicy,
    spawner: Arc<dyn ProcessSpawner>,
    working_dir: PathBuf,
    slots: Arc<Semaphore>,
}

impl ShellRunner {
    pub fn new(
        policy: ShellPolicy,
        spawner: Arc<dyn ProcessSpawner>,
        working_dir: PathBuf,
        max_concurrent: usize,
    ) -> Self {
        Self {
            policy,
            spawner,
            working_dir,
            slots: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.policy.enabled
    }

    /// Start `command` and stream its events into `events`.
    ///
    /// Errors are returned synchronously for policy denials and spawn
    /// failures; once this returns `Ok`, a final [`ShellEvent::Exit`] is
    /// guaranteed unless the receiver is dropped.
    pub fn run(
        &self,
        command: &str,
        args: &[String],
        events: mpsc::UnboundedSender<ShellEvent>,
    ) -> RelayResult<()> {
        self.policy.authorize(command)?;
        let permit = self
            .slots
            .clone()
            .try_acquire_owned()
            .map_err(|_| RelayError::denied("Too many running commands"))?;

        let mut child = self
            .spawner
            .spawn(command, args, &self.working_dir)
            .map_err(|e| RelayError::io("spawn", &e))?;
        info!("Spawned {:?} with {} args (pid {:?})", command, args.len(), child.id());

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        tokio::spawn(async move {
            tokio::join!(
                pump(stdout, OutputStream::Stdout, events.clone()),
                pump(stderr, OutputStream::Stderr, events.clone()),
            );
            let code = match child.wait().await {
                Ok(status) => status.code(),
                Err(e) => {
                    warn!("Failed waiting for child: {}", e);
                    None
                }
            };
            debug!("Child exited with {:?}", code);
            let _ = events.send(ShellEvent::Exit { code });
            drop(permit);
        });
        Ok(())
    }
}

async fn pump<R: AsyncRead + Unpin>(
    reader: Option<R>,
    stream: OutputStream,
    events: mpsc::UnboundedSender<ShellEvent>,
) {
    let Some(mut reader) = reader else { return };
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let data = String::from_utf8_lossy(&buf[..n]).into_owned();
                if events.send(ShellEvent::Output { stream, data }).is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!("Read from {:?} failed: {}", stream, e);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingSpawner {
        calls: AtomicUsize,
    }

    impl ProcessSpawner for CountingSpawner {
        fn spawn(&self, _command: &str, _args: &[String], _dir: &Path) -> io::Result<Child> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(io::Error::new(io::ErrorKind::NotFound, "no such command"))
        }
    }

    fn policy(whitelist: &[&str]) -> ShellPolicy {
        ShellPolicy {
            enabled: true,
            whitelist: whitelist.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn whitelist_matches_base_name() {
        let policy = policy(&["ls", "git"]);
        assert!(policy.authorize("ls").is_ok());
        assert!(policy.authorize("/usr/bin/git").is_ok());
        assert_eq!(
            policy.authorize("rm"),
            Err(RelayError::denied("Command not allowed"))
        );
    }

    #[test]
    fn disabled_policy_denies_everything() {
        let policy = ShellPolicy { enabled: false, whitelist: vec![] };
        assert_eq!(policy.authorize("ls"), Err(RelayError::denied("Shell disabled")));
    }

    #[test]
    fn empty_whitelist_allows_any() {
        assert!(policy(&[]).authorize("anything").is_ok());
    }

    #[tokio::test]
    async fn denied_command_never_reaches_spawner() {
        let spawner = Arc::new(CountingSpawner::default());
        let runner = ShellRunner::new(policy(&["ls"]), spawner.clone(), PathBuf::from("."), 2);
        let (tx, _rx) = mpsc::unbounded_channel();

        let err = runner.run("rm", &["-rf".into(), "/".into()], tx).unwrap_err();
        assert!(matches!(err, RelayError::ConfigurationDenied(_)));
        assert_eq!(spawner.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn spawn_failure_is_sanitized() {
        let spawner = Arc::new(CountingSpawner::default());
        let runner = ShellRunner::new(policy(&[]), spawner.clone(), PathBuf::from("."), 2);
        let (tx, _rx) = mpsc::unbounded_channel();

        assert_eq!(runner.run("ls", &[], tx), Err(RelayError::Io("Not found")));
        assert_eq!(spawner.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn windows_builtins_go_through_cmd_c() {
        let cmd = SpawnStrategy::WindowsCmd.command("dir", &["/b".into()]);
        let args: Vec<_> = cmd.as_std().get_args().collect();
        assert_eq!(cmd.as_std().get_program(), "cmd");
        assert_eq!(args, ["/c", "dir", "/b"]);

        let cmd = SpawnStrategy::WindowsCmd.command("git", &["status".into()]);
        let args: Vec<_> = cmd.as_std().get_args().collect();
        assert_eq!(args, ["/d", "/s", "/c", "git", "status"]);
    }

    #[test]
    fn posix_arguments_are_positional() {
        let cmd = SpawnStrategy::PosixShell.command("echo", &["a; rm -rf /".into()]);
        let args: Vec<_> = cmd.as_std().get_args().collect();
        assert_eq!(cmd.as_std().get_program(), "/bin/sh");
        assert_eq!(args, ["-c", r#""$0" "$@""#, "echo", "a; rm -rf /"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn streams_output_then_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ShellRunner::new(
            policy(&[]),
            Arc::new(SystemSpawner::for_current_platform()),
            dir.path().to_path_buf(),
            2,
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        runner.run("echo", &["hi; there".into()], tx).unwrap();

        let mut stdout = String::new();
        let mut exit = None;
        while let Some(event) = rx.recv().await {
            match event {
                ShellEvent::Output { stream: OutputStream::Stdout, data } => stdout.push_str(&data),
                ShellEvent::Output { .. } => {}
                ShellEvent::Exit { code } => exit = Some(code),
            }
        }
        assert_eq!(stdout, "hi; there\n");
        assert_eq!(exit, Some(Some(0)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn runs_in_working_dir_and_reports_failure() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), b"x").unwrap();
        let runner = ShellRunner::new(
            policy(&[]),
            Arc::new(SystemSpawner::for_current_platform()),
            dir.path().to_path_buf(),
            2,
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        runner.run("ls", &["marker.txt".into(), "absent.txt".into()], tx).unwrap();

        let mut stdout = String::new();
        let mut stderr = String::new();
        let mut code = None;
        while let Some(event) = rx.recv().await {
            match event {
                ShellEvent::Output { stream: OutputStream::Stdout, data } => stdout.push_str(&data),
                ShellEvent::Output { stream: OutputStream::Stderr, data } => stderr.push_str(&data),
                ShellEvent::Exit { code: c } => code = c,
            }
        }
        assert!(stdout.contains("marker.txt"));
        assert!(!stderr.is_empty());
        assert_ne!(code, Some(0));
    }

    #[tokio::test]
    async fn concurrency_cap_denies_extra_runs() {
        let runner = ShellRunner::new(
            policy(&[]),
            Arc::new(CountingSpawner::default()),
            PathBuf::from("."),
            1,
        );
        let _held = runner.slots.clone().try_acquire_owned().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        assert_eq!(
            runner.run("ls", &[], tx),
            Err(RelayError::denied("Too many running commands"))
        );
    }
}
