use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

use crate::error::AgentError;

#[derive(Debug, Clone)]
pub enum SshAuth {
    /// Initial-boot auth for freshly built root filesystems.
    Password(String),
    /// Key auth for prebuild and workspace sessions.
    KeyFile(PathBuf),
}

#[derive(Debug, Clone)]
pub struct SshConfig {
    pub host: Ipv4Addr,
    pub port: u16,
    pub user: String,
    pub auth: SshAuth,
}

pub type OutputCallback<'a> = Box<dyn FnMut(&[u8]) + Send + 'a>;

/// Options for one remote command.
pub struct ExecOpts<'a> {
    /// Working directory inside the guest.
    pub cwd: Option<String>,
    /// Environment additions, prepended to the remote command.
    pub env: Vec<(String, String)>,
    /// When false (the default) a non-zero exit is an error; when true it
    /// is handed back in [`ExecOutput::code`].
    pub allow_non_zero_exit_code: bool,
    /// Invoked with every raw stdout chunk as it arrives.
    pub on_stdout: Option<OutputCallback<'a>>,
    /// Invoked with every raw stderr chunk as it arrives.
    pub on_stderr: Option<OutputCallback<'a>>,
    /// Host-side file the session appends a transcript of both streams to.
    pub log_file_path: Option<PathBuf>,
    /// A command past its deadline takes the whole session down.
    pub timeout: Option<Duration>,
}

impl Default for ExecOpts<'_> {
    fn default() -> Self {
        Self {
            cwd: None,
            env: Vec::new(),
            allow_non_zero_exit_code: false,
            on_stdout: None,
            on_stderr: None,
            log_file_path: None,
            timeout: None,
        }
    }
}

#[derive(Debug)]
pub struct ExecOutput {
    pub code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ExecOutput {
    pub fn stdout_utf8(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }
}

/// An authenticated command channel into one guest, driven through the
/// OpenSSH client. Every `exec` is its own transport process, so
/// [`dispose`](SshSession::dispose) can interrupt all in-flight commands
/// from another concurrent flow by killing them; the corresponding calls
/// fail with [`AgentError::SshDisposed`].
pub struct SshSession {
    config: SshConfig,
    disposed: AtomicBool,
    live: Mutex<HashMap<u64, i32>>,
    next_token: AtomicU64,
}

impl SshSession {
    pub fn new(config: SshConfig) -> Self {
        Self {
            config,
            disposed: AtomicBool::new(false),
            live: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &SshConfig {
        &self.config
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Closes the channel. Any in-flight command fails with
    /// [`AgentError::SshDisposed`]; later calls fail immediately. This is
    /// the cancellation signal the prebuild supervisor relies on.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let live = self.live.lock().expect("ssh session pid table poisoned");
        for pid in live.values() {
            tracing::debug!(pid = *pid, "killing in-flight ssh child on dispose");
            //SAFETY: signalling a child we spawned and have not yet reaped
            unsafe {
                libc::kill(*pid, libc::SIGKILL);
            }
        }
    }

    /// Runs `argv` in the guest, streaming output into the configured
    /// callbacks and transcript while also collecting it.
    pub async fn exec(&self, argv: &[&str], mut opts: ExecOpts<'_>) -> Result<ExecOutput> {
        if self.is_disposed() {
            return Err(AgentError::SshDisposed.into());
        }

        let remote = build_remote_command(argv, opts.cwd.as_deref(), &opts.env);
        let mut command = self.base_ssh_command();
        command
            .arg(&remote)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true); //IMPORTANT - dropping an in-flight exec kills the transport
        let mut child = command.spawn().context("failed to spawn ssh")?;
        let pid = child.id().context("ssh child has no pid")? as i32;
        let token = self.register(pid);

        let transcript = match &opts.log_file_path {
            Some(path) => Some(
                tokio::fs::OpenOptions::new()
                    .append(true)
                    .create(true)
                    .open(path)
                    .await
                    .with_context(|| format!("could not open transcript {}", path.display()))?,
            ),
            None => None,
        };
        let transcript = tokio::sync::Mutex::new(transcript);

        let stdout_pipe = child.stdout.take().context("ssh stdout pipe missing")?;
        let stderr_pipe = child.stderr.take().context("ssh stderr pipe missing")?;
        let mut stdout_buf = Vec::new();
        let mut stderr_buf = Vec::new();

        let io_and_wait = async {
            let (out_res, err_res) = tokio::join!(
                pump(stdout_pipe, opts.on_stdout.as_mut(), &transcript, &mut stdout_buf),
                pump(stderr_pipe, opts.on_stderr.as_mut(), &transcript, &mut stderr_buf),
            );
            out_res?;
            err_res?;
            child.wait().await.context("failed to wait for ssh")
        };

        let waited = match opts.timeout {
            Some(limit) => match tokio::time::timeout(limit, io_and_wait).await {
                Ok(status) => status,
                Err(_) => {
                    self.dispose();
                    self.deregister(token);
                    return Err(anyhow::Error::new(AgentError::SshDisposed)
                        .context(format!("command timed out after {limit:?}")));
                }
            },
            None => io_and_wait.await,
        };
        self.deregister(token);
        if self.is_disposed() {
            return Err(AgentError::SshDisposed.into());
        }
        let status = waited?;

        match status.code() {
            Some(0) => Ok(ExecOutput {
                code: 0,
                stdout: stdout_buf,
                stderr: stderr_buf,
            }),
            Some(code) if opts.allow_non_zero_exit_code => Ok(ExecOutput {
                code,
                stdout: stdout_buf,
                stderr: stderr_buf,
            }),
            code => Err(AgentError::SshExecFailed {
                code,
                stderr: String::from_utf8_lossy(&stderr_buf).into_owned(),
            }
            .into()),
        }
    }

    /// Writes `bytes` to `remote_path`, creating parent directories.
    pub async fn write_file(&self, remote_path: &str, bytes: &[u8]) -> Result<()> {
        if self.is_disposed() {
            return Err(AgentError::SshDisposed.into());
        }

        let mut remote = String::new();
        if let Some((parent, _)) = remote_path.rsplit_once('/') {
            if !parent.is_empty() {
                remote.push_str(&format!("mkdir -p {} && ", shell_quote(parent)));
            }
        }
        remote.push_str(&format!("cat > {}", shell_quote(remote_path)));

        let mut command = self.base_ssh_command();
        command
            .arg(&remote)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = command.spawn().context("failed to spawn ssh")?;
        let pid = child.id().context("ssh child has no pid")? as i32;
        let token = self.register(pid);

        let streamed = async {
            let mut stdin = child.stdin.take().context("ssh stdin pipe missing")?;
            stdin
                .write_all(bytes)
                .await
                .context("failed to stream file bytes over ssh")?;
            stdin.shutdown().await.ok();
            drop(stdin);
            child
                .wait_with_output()
                .await
                .context("failed to wait for ssh")
        }
        .await;
        self.deregister(token);
        if self.is_disposed() {
            return Err(AgentError::SshDisposed.into());
        }
        let output = streamed?;
        if !output.status.success() {
            return Err(AgentError::SshExecFailed {
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            }
            .into());
        }
        Ok(())
    }

    /// Recursively uploads a host directory to `remote_dir`.
    pub async fn put_directory(&self, local_dir: &Path, remote_dir: &str) -> Result<()> {
        if self.is_disposed() {
            return Err(AgentError::SshDisposed.into());
        }
        if let Some((parent, _)) = remote_dir.rsplit_once('/') {
            if !parent.is_empty() {
                self.exec(&["mkdir", "-p", parent], ExecOpts::default())
                    .await?;
            }
        }

        let mut command = self.base_copy_command();
        command
            .arg("-r")
            .arg(local_dir)
            .arg(format!(
                "{}@{}:{}",
                self.config.user, self.config.host, remote_dir
            ))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = command.spawn().context("failed to spawn scp")?;
        let pid = child.id().context("scp child has no pid")? as i32;
        let token = self.register(pid);
        let waited = child.wait_with_output().await.context("failed to wait for scp");
        self.deregister(token);
        if self.is_disposed() {
            return Err(AgentError::SshDisposed.into());
        }
        let output = waited?;
        if !output.status.success() {
            return Err(AgentError::SshExecFailed {
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            }
            .into());
        }
        Ok(())
    }

    fn base_ssh_command(&self) -> Command {
        let mut command = match &self.config.auth {
            SshAuth::Password(password) => {
                let mut c = Command::new("sshpass");
                c.arg("-p").arg(password).arg("ssh");
                c
            }
            SshAuth::KeyFile(path) => {
                let mut c = Command::new("ssh");
                c.arg("-i").arg(path).arg("-o").arg("BatchMode=yes");
                c
            }
        };
        self.common_options(&mut command);
        command
            .arg("-p")
            .arg(self.config.port.to_string())
            .arg(format!("{}@{}", self.config.user, self.config.host));
        command
    }

    fn base_copy_command(&self) -> Command {
        let mut command = match &self.config.auth {
            SshAuth::Password(password) => {
                let mut c = Command::new("sshpass");
                c.arg("-p").arg(password).arg("scp");
                c
            }
            SshAuth::KeyFile(path) => {
                let mut c = Command::new("scp");
                c.arg("-i").arg(path).arg("-o").arg("BatchMode=yes");
                c
            }
        };
        self.common_options(&mut command);
        //scp spells the port flag differently
        command.arg("-P").arg(self.config.port.to_string());
        command
    }

    fn common_options(&self, command: &mut Command) {
        command
            .arg("-o")
            .arg("StrictHostKeyChecking=no")
            .arg("-o")
            .arg("UserKnownHostsFile=/dev/null")
            .arg("-o")
            .arg("LogLevel=ERROR")
            .arg("-o")
            .arg("ConnectTimeout=5");
    }

    fn register(&self, pid: i32) -> u64 {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.live
            .lock()
            .expect("ssh session pid table poisoned")
            .insert(token, pid);
        if self.is_disposed() {
            //dispose raced with the spawn, make sure this child dies too
            unsafe {
                libc::kill(pid, libc::SIGKILL);
            }
        }
        token
    }

    fn deregister(&self, token: u64) {
        self.live
            .lock()
            .expect("ssh session pid table poisoned")
            .remove(&token);
    }
}

async fn pump(
    mut pipe: impl tokio::io::AsyncRead + Unpin,
    mut callback: Option<&mut OutputCallback<'_>>,
    transcript: &tokio::sync::Mutex<Option<tokio::fs::File>>,
    collected: &mut Vec<u8>,
) -> Result<()> {
    let mut buf = [0u8; 8192];
    loop {
        let n = pipe
            .read(&mut buf)
            .await
            .context("failed to read from ssh pipe")?;
        if n == 0 {
            return Ok(());
        }
        let chunk = &buf[..n];
        collected.extend_from_slice(chunk);
        if let Some(cb) = callback.as_mut() {
            cb(chunk);
        }
        if let Some(file) = transcript.lock().await.as_mut() {
            file.write_all(chunk)
                .await
                .context("failed to append to transcript")?;
        }
    }
}

/// Quotes a string for the guest shell.
pub(crate) fn shell_quote(value: &str) -> String {
    let safe = !value.is_empty()
        && value
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"@%+=:,./-_".contains(&b));
    if safe {
        value.to_owned()
    } else {
        format!("'{}'", value.replace('\'', r#"'\''"#))
    }
}

fn build_remote_command(argv: &[&str], cwd: Option<&str>, env: &[(String, String)]) -> String {
    let mut parts = Vec::new();
    if let Some(dir) = cwd {
        parts.push(format!("cd {} &&", shell_quote(dir)));
    }
    for (key, value) in env {
        parts.push(format!("{key}={}", shell_quote(value)));
    }
    parts.extend(argv.iter().map(|arg| shell_quote(arg)));
    parts.join(" ")
}

/// Probes sshd inside a booting guest until it answers or the deadline
/// passes, then hands back a fresh session.
pub async fn wait_for_ssh(config: &SshConfig, limit: Duration) -> Result<SshSession> {
    let started = tokio::time::Instant::now();
    loop {
        let probe = SshSession::new(config.clone());
        let attempt = probe
            .exec(
                &["true"],
                ExecOpts {
                    timeout: Some(Duration::from_secs(5)),
                    ..Default::default()
                },
            )
            .await;
        match attempt {
            Ok(_) => return Ok(SshSession::new(config.clone())),
            Err(err) => {
                if started.elapsed() >= limit {
                    return Err(err.context(format!("ssh did not come up within {limit:?}")));
                }
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoting_leaves_plain_words_alone() {
        assert_eq!(shell_quote("git"), "git");
        assert_eq!(shell_quote("/home/hocus/dev"), "/home/hocus/dev");
        assert_eq!(shell_quote("a=b"), "a=b");
    }

    #[test]
    fn quoting_wraps_specials_and_escapes_single_quotes() {
        assert_eq!(shell_quote("echo hi"), "'echo hi'");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("it's"), r#"'it'\''s'"#);
    }

    #[test]
    fn remote_command_includes_cwd_and_env() {
        let remote = build_remote_command(
            &["git", "fetch", "--all"],
            Some("/home/hocus/dev/project"),
            &[(
                "GIT_SSH_COMMAND".to_owned(),
                "ssh -o StrictHostKeyChecking=no".to_owned(),
            )],
        );
        assert_eq!(
            remote,
            "cd /home/hocus/dev/project && GIT_SSH_COMMAND='ssh -o StrictHostKeyChecking=no' git fetch --all"
        );
    }

    #[test]
    fn remote_command_without_options_is_just_the_argv() {
        assert_eq!(build_remote_command(&["true"], None, &[]), "true");
    }

    #[tokio::test]
    async fn disposed_session_rejects_new_commands() {
        let session = SshSession::new(SshConfig {
            host: Ipv4Addr::new(127, 0, 0, 1),
            port: 22,
            user: "hocus".to_owned(),
            auth: SshAuth::Password("hocus".to_owned()),
        });
        session.dispose();
        let err = session
            .exec(&["true"], ExecOpts::default())
            .await
            .expect_err("disposed session must refuse to run commands");
        assert!(matches!(
            err.downcast_ref::<crate::error::AgentError>(),
            Some(crate::error::AgentError::SshDisposed)
        ));
    }
}
