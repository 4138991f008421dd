//! SFTP transport over libssh2
//!
//! Unlike [`SshTransport`](crate::SshTransport) this transport speaks the SSH
//! protocol itself, so it can log in with a password as well as with a key
//! file or the user's agent. libssh2 is blocking: every call runs on the
//! blocking pool, and calls on one connection are serialized.

use crate::credentials::Credentials;
use crate::ssh::{temp_sibling, SshConfig};
use crate::transport::RemoteTransport;
use bytes::Bytes;
use dirmirror_types::{is_transient_io_kind, Error, RelativePath, Result};
use ssh2::{ErrorCode, RenameFlags, Sftp};
use std::io::Write;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info};

const LIBSSH2_ERROR_FILE: i32 = -16;
const LIBSSH2_ERROR_AUTHENTICATION_FAILED: i32 = -18;
const LIBSSH2_ERROR_PUBLICKEY_UNVERIFIED: i32 = -19;

const SFTP_NO_SUCH_FILE: i32 = 2;
const SFTP_NO_CONNECTION: i32 = 6;
const SFTP_CONNECTION_LOST: i32 = 7;

const DIR_MODE: i32 = 0o755;

/// How the transport authenticates, in order of preference
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    /// Password from the credentials
    Password,
    /// Private key file from the credentials or the configuration
    KeyFile,
    /// Keys offered by a running ssh agent
    Agent,
}

impl AuthMethod {
    /// The method used for `credentials` under `config`
    pub fn select(config: &SshConfig, credentials: &Credentials) -> Self {
        if credentials.password().is_some() {
            Self::Password
        } else if credentials.identity_file().is_some() || config.identity_file.is_some() {
            Self::KeyFile
        } else {
            Self::Agent
        }
    }
}

struct Connection {
    session: ssh2::Session,
    sftp: Sftp,
}

impl Connection {
    fn disconnect(&self) {
        if let Err(e) = self.session.disconnect(None, "dirmirror closing", None) {
            debug!("sftp disconnect failed: {}", e);
        }
    }
}

/// Transport writing to a remote directory over SFTP
pub struct SftpTransport {
    config: SshConfig,
    connection: Arc<Mutex<Option<Connection>>>,
}

impl std::fmt::Debug for SftpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SftpTransport")
            .field("config", &self.config)
            .field("connected", &lock(&self.connection).is_some())
            .finish()
    }
}

impl SftpTransport {
    /// Create a transport; nothing is contacted until `connect`
    pub fn new(config: SshConfig) -> Self {
        Self {
            config,
            connection: Arc::new(Mutex::new(None)),
        }
    }

    /// Run `op` against the open connection on the blocking pool
    async fn run<F>(&self, path: &RelativePath, op: F) -> Result<()>
    where
        F: FnOnce(&Sftp, &str) -> Result<()> + Send + 'static,
    {
        let slot = Arc::clone(&self.connection);
        let label = path.to_string();
        blocking(path.as_str(), move || {
            let guard = lock(&slot);
            let connection = guard
                .as_ref()
                .ok_or_else(|| Error::transient(&label, "sftp transport is not connected"))?;
            op(&connection.sftp, &label)
        })
        .await
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

async fn blocking<F>(path: &str, task: F) -> Result<()>
where
    F: FnOnce() -> Result<()> + Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|e| Error::transient(path, format!("sftp task failed: {}", e)))?
}

/// Map a libssh2 error onto the failure taxonomy
pub fn classify(path: &str, error: &ssh2::Error) -> Error {
    let transient = match error.code() {
        ErrorCode::Session(code) => !matches!(
            code,
            LIBSSH2_ERROR_FILE
                | LIBSSH2_ERROR_AUTHENTICATION_FAILED
                | LIBSSH2_ERROR_PUBLICKEY_UNVERIFIED
        ),
        ErrorCode::SFTP(code) => matches!(code, SFTP_NO_CONNECTION | SFTP_CONNECTION_LOST),
    };
    let message = format!("sftp: {}", error.message());
    if transient {
        Error::transient(path, message)
    } else {
        Error::permanent(path, message)
    }
}

fn classify_io(path: &str, error: &std::io::Error) -> Error {
    let message = format!("sftp write failed: {}", error);
    if is_transient_io_kind(error.kind()) {
        Error::transient(path, message)
    } else {
        Error::permanent(path, message)
    }
}

fn is_missing(error: &ssh2::Error) -> bool {
    matches!(error.code(), ErrorCode::SFTP(SFTP_NO_SUCH_FILE))
}

fn millis(duration: Duration) -> u32 {
    u32::try_from(duration.as_millis()).unwrap_or(u32::MAX)
}

/// Every directory from the top of `remote` down to `remote` itself
pub fn directory_chain(remote: &str) -> Vec<String> {
    let mut chain = Vec::new();
    let mut current = if remote.starts_with('/') {
        String::from("/")
    } else {
        String::new()
    };
    for segment in remote.split('/').filter(|s| !s.is_empty() && *s != ".") {
        if !current.is_empty() && !current.ends_with('/') {
            current.push('/');
        }
        current.push_str(segment);
        chain.push(current.clone());
    }
    chain
}

fn open(config: &SshConfig, credentials: &Credentials) -> Result<Connection> {
    let user = credentials
        .username()
        .map(str::to_string)
        .or_else(|| config.username.clone())
        .ok_or_else(|| Error::config("the sftp transport needs a remote user name"))?;

    let address = (config.host.as_str(), config.port)
        .to_socket_addrs()
        .map_err(|e| Error::transient("", format!("cannot resolve {}: {}", config.host, e)))?
        .next()
        .ok_or_else(|| Error::transient("", format!("{} has no address", config.host)))?;
    let tcp = TcpStream::connect_timeout(&address, config.connect_timeout)
        .map_err(|e| Error::transient("", format!("cannot reach {}: {}", address, e)))?;

    let mut session = ssh2::Session::new().map_err(|e| classify("", &e))?;
    session.set_tcp_stream(tcp);
    session.set_timeout(millis(config.connect_timeout));
    session.handshake().map_err(|e| classify("", &e))?;

    let method = AuthMethod::select(config, credentials);
    let authenticated = match method {
        AuthMethod::Password => {
            session.userauth_password(&user, credentials.password().unwrap_or_default())
        }
        AuthMethod::KeyFile => {
            let key = credentials
                .identity_file()
                .or(config.identity_file.as_deref())
                .unwrap_or_else(|| Path::new(""));
            session.userauth_pubkey_file(&user, None, key, None)
        }
        AuthMethod::Agent => session.userauth_agent(&user),
    };
    if let Err(e) = authenticated {
        return Err(Error::permanent(
            "",
            format!("{:?} authentication as {} failed: {}", method, user, e.message()),
        ));
    }
    if !session.authenticated() {
        return Err(Error::permanent(
            "",
            format!("{:?} authentication as {} was not accepted", method, user),
        ));
    }

    session.set_timeout(millis(config.operation_timeout));
    let sftp = session.sftp().map_err(|e| classify("", &e))?;
    info!(
        "Connected to {}@{}:{} over sftp ({:?})",
        user, config.host, config.port, method
    );
    Ok(Connection { session, sftp })
}

fn mkdir_all(sftp: &Sftp, path: &str, remote: &str) -> Result<()> {
    for dir in directory_chain(remote) {
        let dir = Path::new(&dir);
        match sftp.lstat(dir) {
            Ok(stat) if stat.is_dir() => continue,
            Ok(_) => sftp.unlink(dir).map_err(|e| classify(path, &e))?,
            Err(e) if is_missing(&e) => {}
            Err(e) => return Err(classify(path, &e)),
        }
        sftp.mkdir(dir, DIR_MODE).map_err(|e| classify(path, &e))?;
    }
    Ok(())
}

fn remove_tree(sftp: &Sftp, path: &str, remote: &Path) -> Result<()> {
    let stat = match sftp.lstat(remote) {
        Ok(stat) => stat,
        Err(e) if is_missing(&e) => return Ok(()),
        Err(e) => return Err(classify(path, &e)),
    };
    let removed = if stat.is_dir() {
        let entries = sftp.readdir(remote).map_err(|e| classify(path, &e))?;
        for (child, _) in entries {
            remove_tree(sftp, path, &child)?;
        }
        sftp.rmdir(remote)
    } else {
        sftp.unlink(remote)
    };
    match removed {
        Err(e) if !is_missing(&e) => Err(classify(path, &e)),
        _ => Ok(()),
    }
}

fn put_file(sftp: &Sftp, path: &str, remote: &str, content: &[u8]) -> Result<()> {
    let (dir, temp) = temp_sibling(remote);
    if dir != "." {
        mkdir_all(sftp, path, dir)?;
    }
    let target = Path::new(remote);
    if matches!(sftp.lstat(target), Ok(stat) if stat.is_dir()) {
        remove_tree(sftp, path, target)?;
    }

    let temp = Path::new(&temp);
    let mut file = sftp.create(temp).map_err(|e| classify(path, &e))?;
    file.write_all(content).map_err(|e| classify_io(path, &e))?;
    drop(file);

    let flags = RenameFlags::OVERWRITE | RenameFlags::ATOMIC | RenameFlags::NATIVE;
    if let Err(e) = sftp.rename(temp, target, Some(flags)) {
        // servers without posix-rename refuse to replace an existing file
        debug!("overwriting rename of {} refused: {}", remote, e);
        match sftp.unlink(target) {
            Err(e) if !is_missing(&e) => return Err(classify(path, &e)),
            _ => {}
        }
        sftp.rename(temp, target, None)
            .map_err(|e| classify(path, &e))?;
    }
    Ok(())
}

#[async_trait::async_trait]
impl RemoteTransport for SftpTransport {
    fn name(&self) -> &'static str {
        "sftp"
    }

    async fn connect(&self, credentials: &Credentials) -> Result<()> {
        let config = self.config.clone();
        let credentials = credentials.clone();
        let slot = Arc::clone(&self.connection);
        blocking("", move || {
            let connection = open(&config, &credentials)?;
            mkdir_all(&connection.sftp, "", &config.remote_root)?;
            if let Some(previous) = lock(&slot).replace(connection) {
                previous.disconnect();
            }
            Ok(())
        })
        .await
    }

    async fn put(&self, path: &RelativePath, content: Bytes) -> Result<()> {
        let remote = self.config.remote_path(path);
        self.run(path, move |sftp, label| put_file(sftp, label, &remote, &content))
            .await
    }

    async fn remove(&self, path: &RelativePath) -> Result<()> {
        let remote = self.config.remote_path(path);
        self.run(path, move |sftp, label| {
            remove_tree(sftp, label, Path::new(&remote))
        })
        .await
    }

    async fn mkdir_all(&self, path: &RelativePath) -> Result<()> {
        let remote = self.config.remote_path(path);
        self.run(path, move |sftp, label| mkdir_all(sftp, label, &remote))
            .await
    }

    async fn close(&self) -> Result<()> {
        let slot = Arc::clone(&self.connection);
        blocking("", move || {
            if let Some(connection) = lock(&slot).take() {
                connection.disconnect();
            }
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::net::TcpListener;

    #[rstest]
    #[case("/srv/mirror/a", &["/srv", "/srv/mirror", "/srv/mirror/a"])]
    #[case("mirror/a/", &["mirror", "mirror/a"])]
    #[case("./mirror", &["mirror"])]
    #[case("/", &[])]
    fn test_directory_chain(#[case] remote: &str, #[case] expected: &[&str]) {
        assert_eq!(directory_chain(remote), expected);
    }

    #[test]
    fn test_auth_method_prefers_password() {
        let mut config = SshConfig::new("example.org", "/srv");
        let password = Credentials::for_user("alice").with_password("pw");
        assert_eq!(AuthMethod::select(&config, &password), AuthMethod::Password);

        let anonymous = Credentials::for_user("alice");
        assert_eq!(AuthMethod::select(&config, &anonymous), AuthMethod::Agent);
        config.identity_file = Some("/keys/id".into());
        assert_eq!(AuthMethod::select(&config, &anonymous), AuthMethod::KeyFile);
        let both = password.with_identity_file("/keys/other");
        assert_eq!(AuthMethod::select(&config, &both), AuthMethod::Password);
    }

    #[rstest]
    #[case(ErrorCode::Session(-7), true)]
    #[case(ErrorCode::Session(LIBSSH2_ERROR_AUTHENTICATION_FAILED), false)]
    #[case(ErrorCode::SFTP(SFTP_CONNECTION_LOST), true)]
    #[case(ErrorCode::SFTP(SFTP_NO_SUCH_FILE), false)]
    #[case(ErrorCode::SFTP(3), false)]
    fn test_classify(#[case] code: ErrorCode, #[case] recoverable: bool) {
        let error = ssh2::Error::new(code, "boom");
        assert_eq!(classify("a.txt", &error).is_recoverable(), recoverable);
    }

    #[tokio::test]
    async fn test_operations_require_connect() {
        let transport = SftpTransport::new(SshConfig::new("example.org", "/srv"));
        let error = transport
            .put(&RelativePath::new("a").unwrap(), Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert!(error.is_recoverable());
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_user_is_fatal() {
        let transport = SftpTransport::new(SshConfig::new("127.0.0.1", "/srv"));
        let error = transport
            .connect(&Credentials::anonymous().with_password("pw"))
            .await
            .unwrap_err();
        assert!(error.is_fatal());
    }

    #[tokio::test]
    async fn test_unreachable_host_is_transient() {
        // bind then drop to find a port nobody listens on
        let port = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let mut config = SshConfig::new("127.0.0.1", "/srv");
        config.port = port;
        config.connect_timeout = Duration::from_secs(2);
        let transport = SftpTransport::new(config);

        let error = transport
            .connect(&Credentials::for_user("alice").with_password("hunter2"))
            .await
            .unwrap_err();
        assert!(error.is_recoverable());
        assert!(!error.to_string().contains("hunter2"));
    }
}
