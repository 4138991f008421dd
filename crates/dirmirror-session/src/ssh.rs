//! SSH transport using the system `ssh` client
//!
//! Relying on the system client picks up the user's existing SSH config,
//! known hosts and agent. Every operation is a single non-interactive remote
//! command; content is streamed over stdin.

use crate::credentials::Credentials;
use crate::transport::RemoteTransport;
use bytes::Bytes;
use dirmirror_types::{Error, RelativePath, Result};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::RwLock;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Exit status ssh reports for its own failures (connection, auth, ...)
pub const SSH_CONNECTION_FAILURE: i32 = 255;

/// SSH endpoint settings
#[derive(Debug, Clone)]
pub struct SshConfig {
    /// Remote host
    pub host: String,
    /// Remote port
    pub port: u16,
    /// Default user name, overridden by credentials
    pub username: Option<String>,
    /// Default private key, overridden by credentials
    pub identity_file: Option<PathBuf>,
    /// Remote directory the mirror lives in
    pub remote_root: String,
    /// Timeout for establishing the connection
    pub connect_timeout: Duration,
    /// Bound on a single blocking protocol call once connected
    pub operation_timeout: Duration,
    /// Client program to run
    pub program: String,
}

impl SshConfig {
    /// Settings for `host` mirroring into `remote_root`
    pub fn new<H: Into<String>, R: Into<String>>(host: H, remote_root: R) -> Self {
        Self {
            host: host.into(),
            port: 22,
            username: None,
            identity_file: None,
            remote_root: remote_root.into(),
            connect_timeout: Duration::from_secs(10),
            operation_timeout: Duration::from_secs(60),
            program: "ssh".to_string(),
        }
    }

    /// Absolute remote path for `path`
    pub fn remote_path(&self, path: &RelativePath) -> String {
        let root = self.remote_root.trim_end_matches('/');
        if root.is_empty() && self.remote_root.starts_with('/') {
            format!("/{}", path)
        } else if root.is_empty() {
            path.to_string()
        } else {
            format!("{}/{}", root, path)
        }
    }
}

/// Parent directory and temporary sibling used to replace `remote` atomically
pub(crate) fn temp_sibling(remote: &str) -> (&str, String) {
    let (dir, name) = remote.rsplit_once('/').unwrap_or((".", remote));
    let dir = if dir.is_empty() { "/" } else { dir };
    let temp = if dir == "/" {
        format!("/.{}.dirmirror-tmp", name)
    } else {
        format!("{}/.{}.dirmirror-tmp", dir, name)
    };
    (dir, temp)
}

#[derive(Debug, Clone)]
struct Target {
    destination: String,
    identity_file: Option<PathBuf>,
}

/// Transport running remote shell commands over ssh in batch mode
#[derive(Debug)]
pub struct SshTransport {
    config: SshConfig,
    target: RwLock<Option<Target>>,
}

impl SshTransport {
    /// Create a transport; nothing is contacted until `connect`
    pub fn new(config: SshConfig) -> Self {
        Self {
            config,
            target: RwLock::new(None),
        }
    }

    /// Absolute remote path for `path`
    pub fn remote_path(&self, path: &RelativePath) -> String {
        self.config.remote_path(path)
    }

    fn resolve_target(&self, credentials: &Credentials) -> Target {
        let user = credentials
            .username()
            .map(str::to_string)
            .or_else(|| self.config.username.clone());
        let destination = match user {
            Some(user) => format!("{}@{}", user, self.config.host),
            None => self.config.host.clone(),
        };
        Target {
            destination,
            identity_file: credentials
                .identity_file()
                .map(PathBuf::from)
                .or_else(|| self.config.identity_file.clone()),
        }
    }

    fn current_target(&self) -> Result<Target> {
        self.target
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
            .ok_or_else(|| Error::transient("", "ssh transport is not connected"))
    }

    /// Arguments passed to the ssh client before the remote command
    fn base_args(&self, target: &Target) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            self.config.port.to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.config.connect_timeout.as_secs().max(1)),
        ];
        if let Some(identity) = &target.identity_file {
            args.push("-i".to_string());
            args.push(identity.display().to_string());
        }
        args.push(target.destination.clone());
        args
    }

    async fn run(&self, path: &str, command: &str, stdin: Option<Bytes>) -> Result<()> {
        let target = self.current_target()?;
        let mut cmd = Command::new(&self.config.program);
        cmd.args(self.base_args(&target))
            .arg(command)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!("ssh {}: {}", target.destination, command);
        let mut child = cmd.spawn().map_err(|e| {
            Error::permanent(path, format!("failed to run {}: {}", self.config.program, e))
        })?;

        if let (Some(content), Some(mut pipe)) = (stdin, child.stdin.take()) {
            if let Err(e) = pipe.write_all(&content).await {
                return Err(Error::transient(path, format!("failed to stream content: {}", e)));
            }
            // closing stdin lets `cat` finish
            drop(pipe);
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| Error::transient(path, format!("ssh did not complete: {}", e)))?;
        classify_exit(path, output.status.code(), &String::from_utf8_lossy(&output.stderr))
    }
}

/// Map an ssh exit status onto the failure taxonomy
pub fn classify_exit(path: &str, code: Option<i32>, stderr: &str) -> Result<()> {
    let stderr = stderr.trim();
    match code {
        Some(0) => Ok(()),
        Some(SSH_CONNECTION_FAILURE) => Err(Error::transient(
            path,
            format!("ssh connection failed: {}", stderr),
        )),
        // killed by a signal
        None => Err(Error::transient(path, "ssh terminated by signal")),
        Some(code) => Err(Error::permanent(
            path,
            format!("remote command exited with {}: {}", code, stderr),
        )),
    }
}

fn quote(value: &str) -> String {
    shell_words::quote(value).into_owned()
}

/// Remote command replacing `remote` with stdin via a temporary sibling
pub fn put_command(remote: &str) -> String {
    let (dir, temp) = temp_sibling(remote);
    format!(
        "mkdir -p -- {dir} && if [ -d {target} ]; then rm -rf -- {target}; fi && cat > {temp} && mv -f -- {temp} {target}",
        dir = quote(dir),
        target = quote(remote),
        temp = quote(&temp),
    )
}

/// Remote command removing `remote` recursively
pub fn remove_command(remote: &str) -> String {
    format!("rm -rf -- {}", quote(remote))
}

/// Remote command creating `remote` and its parents
pub fn mkdir_command(remote: &str) -> String {
    let target = quote(remote);
    format!(
        "if [ -e {t} ] && [ ! -d {t} ]; then rm -f -- {t}; fi && mkdir -p -- {t}",
        t = target
    )
}

#[async_trait::async_trait]
impl RemoteTransport for SshTransport {
    fn name(&self) -> &'static str {
        "ssh"
    }

    async fn connect(&self, credentials: &Credentials) -> Result<()> {
        if credentials.password().is_some() && credentials.identity_file().is_none() {
            warn!("ssh runs in batch mode and ignores the password; use the sftp transport for password login");
        }

        let target = self.resolve_target(credentials);
        info!(
            "Connecting to {}:{}",
            target.destination, self.config.port
        );
        *self
            .target
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(target);

        let root = self.config.remote_root.clone();
        self.run("", &format!("mkdir -p -- {}", quote(&root)), None)
            .await
    }

    async fn put(&self, path: &RelativePath, content: Bytes) -> Result<()> {
        let command = put_command(&self.remote_path(path));
        self.run(path.as_str(), &command, Some(content)).await
    }

    async fn remove(&self, path: &RelativePath) -> Result<()> {
        let command = remove_command(&self.remote_path(path));
        self.run(path.as_str(), &command, None).await
    }

    async fn mkdir_all(&self, path: &RelativePath) -> Result<()> {
        let command = mkdir_command(&self.remote_path(path));
        self.run(path.as_str(), &command, None).await
    }

    async fn close(&self) -> Result<()> {
        self.target
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn rel(path: &str) -> RelativePath {
        RelativePath::new(path).unwrap()
    }

    #[rstest]
    #[case("/srv/mirror", "a/b.txt", "/srv/mirror/a/b.txt")]
    #[case("/srv/mirror/", "a", "/srv/mirror/a")]
    #[case("mirror", "a", "mirror/a")]
    #[case("/", "a", "/a")]
    fn test_remote_path(#[case] root: &str, #[case] path: &str, #[case] expected: &str) {
        let transport = SshTransport::new(SshConfig::new("host", root));
        assert_eq!(transport.remote_path(&rel(path)), expected);
    }

    #[rstest]
    #[case("/srv/a/b.txt", "/srv/a", "/srv/a/.b.txt.dirmirror-tmp")]
    #[case("/top.txt", "/", "/.top.txt.dirmirror-tmp")]
    #[case("plain.txt", ".", "./.plain.txt.dirmirror-tmp")]
    fn test_temp_sibling(#[case] remote: &str, #[case] dir: &str, #[case] temp: &str) {
        assert_eq!(temp_sibling(remote), (dir, temp.to_string()));
    }

    #[test]
    fn test_commands_quote_paths() {
        let command = put_command("/srv/my files/it's.txt");
        assert!(command.contains("mkdir -p -- '/srv/my files'"));
        assert!(command.contains("cat > '/srv/my files/.it'\\''s.txt.dirmirror-tmp'"));
        assert_eq!(remove_command("/srv/a b"), "rm -rf -- '/srv/a b'");
        assert!(mkdir_command("/srv/d").ends_with("mkdir -p -- /srv/d"));

        let parsed = shell_words::split(&remove_command("/x/$(whoami)")).unwrap();
        assert_eq!(parsed, vec!["rm", "-rf", "--", "/x/$(whoami)"]);
    }

    #[rstest]
    #[case(Some(0), None)]
    #[case(Some(255), Some(true))]
    #[case(None, Some(true))]
    #[case(Some(1), Some(false))]
    fn test_classify_exit(#[case] code: Option<i32>, #[case] recoverable: Option<bool>) {
        let result = classify_exit("a.txt", code, "boom");
        match recoverable {
            None => assert!(result.is_ok()),
            Some(expected) => assert_eq!(result.unwrap_err().is_recoverable(), expected),
        }
    }

    #[test]
    fn test_target_prefers_credentials() {
        let mut config = SshConfig::new("example.org", "/srv");
        config.username = Some("config-user".to_string());
        config.port = 2222;
        let transport = SshTransport::new(config);

        let target = transport.resolve_target(&Credentials::for_user("cred-user"));
        assert_eq!(target.destination, "cred-user@example.org");

        let target = transport.resolve_target(&Credentials::anonymous());
        assert_eq!(target.destination, "config-user@example.org");
        let args = transport.base_args(&target);
        assert_eq!(&args[..2], &["-p".to_string(), "2222".to_string()]);
        assert!(args.contains(&"BatchMode=yes".to_string()));
    }

    #[tokio::test]
    async fn test_operations_require_connect() {
        let transport = SshTransport::new(SshConfig::new("example.org", "/srv"));
        let error = transport.remove(&rel("a")).await.unwrap_err();
        assert!(error.is_recoverable());
    }

    #[tokio::test]
    async fn test_missing_client_is_permanent() {
        let mut config = SshConfig::new("example.org", "/srv");
        config.program = "/nonexistent/dirmirror-ssh".to_string();
        let transport = SshTransport::new(config);

        let error = transport
            .connect(&Credentials::anonymous())
            .await
            .unwrap_err();
        assert!(!error.is_recoverable());
    }
}
