use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use russh::client;
use russh::keys::{self, HashAlg, PrivateKey, PrivateKeyWithHashAlg};
use russh::{ChannelMsg, Disconnect};
use russh_sftp::client::SftpSession;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::{Instant, sleep, sleep_until};
use tokio_util::sync::CancellationToken;

use super::RemoteSession;
use super::backoff::ExponentialBackoff;
use crate::config::SshConfig;
use crate::error::{RemoteExit, RunnerError};
use crate::logging::Diagnostics;

/// Accepts every server key, like `StrictHostKeyChecking=no`. Job VMs are
/// fresh on every run, so there is no known key to compare against.
pub struct SshHandler;

impl client::Handler for SshHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Outcome of one connection attempt that did not produce a session.
#[derive(Debug)]
pub enum ConnectError {
    /// The TCP connection could not be made. The VM may still be booting.
    Dial(io::Error),
    /// Anything after the TCP connection: handshake, authentication.
    Fatal(RunnerError),
}

/// Where and how to connect, and for how long to keep trying.
#[derive(Debug, Clone, Copy)]
pub struct ConnectParams<'a> {
    pub host: &'a str,
    pub ssh: &'a SshConfig,
    /// Bound on a single TCP dial.
    pub dial_timeout: Duration,
    /// Nothing is attempted past this instant.
    pub deadline: Instant,
}

impl ConnectParams<'_> {
    pub fn addr(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.ssh.port)
        } else {
            format!("{}:{}", self.host, self.ssh.port)
        }
    }
}

/// Repeat `attempt` until it succeeds, fails fatally, the deadline passes or
/// `cancel` fires. Only [`ConnectError::Dial`] failures are retried.
pub async fn connect_with_retry<T, F, Fut>(
    addr: &str,
    deadline: Instant,
    cancel: &CancellationToken,
    backoff: ExponentialBackoff,
    diag: Diagnostics,
    mut attempt: F,
) -> Result<T, RunnerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ConnectError>>,
{
    let started = Instant::now();
    let mut last_error: Option<io::Error> = None;
    let mut attempts: u32 = 0;

    let cancelled = || RunnerError::Cancelled {
        what: format!("connecting to {addr}"),
    };

    loop {
        attempts += 1;
        diag.connect_attempt(addr, attempts);

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(cancelled()),
            _ = sleep_until(deadline) => {
                return Err(RunnerError::ConnectTimeout {
                    addr: addr.to_string(),
                    waited: deadline.saturating_duration_since(started),
                    last_error,
                });
            }
            outcome = attempt() => outcome,
        };

        match outcome {
            Ok(value) => {
                tracing::debug!(addr, attempts, "connected");
                return Ok(value);
            }
            Err(ConnectError::Fatal(e)) => return Err(e),
            Err(ConnectError::Dial(e)) => {
                diag.dial_failed(addr, &e);
                last_error = Some(e);
            }
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(cancelled()),
            _ = sleep_until(deadline) => {
                return Err(RunnerError::ConnectTimeout {
                    addr: addr.to_string(),
                    waited: deadline.saturating_duration_since(started),
                    last_error,
                });
            }
            _ = sleep(backoff.delay(attempts)) => {}
        }
    }
}

async fn dial(addr: &str, timeout: Duration) -> Result<TcpStream, io::Error> {
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("dial tcp {addr}: i/o timeout"),
        )),
    }
}

fn ssh_error(context: impl Into<String>) -> impl FnOnce(russh::Error) -> RunnerError {
    let context = context.into();
    move |source| RunnerError::Ssh { context, source }
}

fn sftp_error(context: impl Into<String>) -> impl FnOnce(russh_sftp::client::error::Error) -> RunnerError {
    let context = context.into();
    move |source| RunnerError::Sftp { context, source }
}

fn load_key(path: &Path) -> Result<Arc<PrivateKey>, RunnerError> {
    let key = keys::load_secret_key(path, None).map_err(|source| RunnerError::SshKey {
        path: path.display().to_string(),
        source,
    })?;
    Ok(Arc::new(key))
}

/// An authenticated SSH connection to the job VM.
pub struct SshSession {
    handle: client::Handle<SshHandler>,
    addr: String,
}

impl SshSession {
    /// Connect and authenticate, retrying while the VM refuses TCP
    /// connections.
    ///
    /// The private key is loaded once, up front; a bad key is not worth
    /// retrying.
    pub async fn connect(
        params: &ConnectParams<'_>,
        cancel: &CancellationToken,
        diag: Diagnostics,
    ) -> Result<Self, RunnerError> {
        let addr = params.addr();
        let key = params.ssh.private_key_path.as_deref().map(load_key).transpose()?;
        let config = Arc::new(client::Config::default());

        connect_with_retry(
            &addr,
            params.deadline,
            cancel,
            ExponentialBackoff::default(),
            diag,
            || {
                let config = config.clone();
                let key = key.clone();
                let addr = addr.as_str();
                async move {
                    let stream = dial(addr, params.dial_timeout)
                        .await
                        .map_err(ConnectError::Dial)?;
                    let mut handle = client::connect_stream(config, stream, SshHandler)
                        .await
                        .map_err(ssh_error(format!("handshake with {addr}")))
                        .map_err(ConnectError::Fatal)?;
                    authenticate(&mut handle, params.ssh, key, addr)
                        .await
                        .map_err(ConnectError::Fatal)?;
                    Ok(SshSession {
                        handle,
                        addr: addr.to_string(),
                    })
                }
            },
        )
        .await
    }

    pub async fn disconnect(self) {
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "English")
            .await
        {
            tracing::debug!(addr = %self.addr, "disconnect: {e}");
        }
    }
}

/// The two ways the driver proves who it is to the VM's sshd.
#[allow(async_fn_in_trait)]
pub trait Authenticator {
    async fn try_public_key(&mut self, user: &str, key: Arc<PrivateKey>) -> Result<bool, RunnerError>;
    async fn try_password(&mut self, user: &str, password: &str) -> Result<bool, RunnerError>;
}

/// Signature hash to use with an RSA key, given what the server advertised in
/// `server-sig-algs`. A server that sent no extension info gets
/// `rsa-sha2-256`, not SHA-1 `ssh-rsa`.
fn rsa_hash(advertised: Option<Option<HashAlg>>) -> Option<HashAlg> {
    match advertised {
        Some(hash) => hash,
        None => Some(HashAlg::Sha256),
    }
}

impl Authenticator for client::Handle<SshHandler> {
    async fn try_public_key(&mut self, user: &str, key: Arc<PrivateKey>) -> Result<bool, RunnerError> {
        let hash = if key.algorithm().is_rsa() {
            let advertised = self
                .best_supported_rsa_hash()
                .await
                .map_err(ssh_error("negotiating rsa signature hash"))?;
            rsa_hash(advertised)
        } else {
            None
        };
        let auth = self
            .authenticate_publickey(user, PrivateKeyWithHashAlg::new(key, hash))
            .await
            .map_err(ssh_error("public key authentication"))?;
        Ok(auth.success())
    }

    async fn try_password(&mut self, user: &str, password: &str) -> Result<bool, RunnerError> {
        let auth = self
            .authenticate_password(user, password)
            .await
            .map_err(ssh_error("password authentication"))?;
        Ok(auth.success())
    }
}

/// Key first when one is configured, then the password when one is set.
async fn authenticate<A: Authenticator>(
    session: &mut A,
    ssh: &SshConfig,
    key: Option<Arc<PrivateKey>>,
    addr: &str,
) -> Result<(), RunnerError> {
    if let Some(key) = key {
        if session.try_public_key(&ssh.user, key).await? {
            return Ok(());
        }
    }
    if let Some(password) = &ssh.password {
        if session.try_password(&ssh.user, password).await? {
            return Ok(());
        }
    }

    Err(RunnerError::SshAuth {
        user: ssh.user.clone(),
        addr: addr.to_string(),
    })
}

impl RemoteSession for SshSession {
    async fn upload(&mut self, local: &Path, remote: &str) -> Result<(), RunnerError> {
        let contents = tokio::fs::read(local)
            .await
            .map_err(|source| RunnerError::Io {
                context: format!("reading script {}", local.display()),
                source,
            })?;

        let channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(ssh_error("opening sftp channel"))?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(ssh_error("requesting sftp subsystem"))?;
        let sftp = SftpSession::new(channel.into_stream())
            .await
            .map_err(sftp_error("starting session"))?;

        let mut file = sftp
            .create(remote)
            .await
            .map_err(sftp_error(format!("creating {remote}")))?;
        let io_error = |source| RunnerError::Io {
            context: format!("writing {remote} on {}", self.addr),
            source,
        };
        file.write_all(&contents).await.map_err(io_error)?;
        file.shutdown().await.map_err(io_error)?;

        sftp.close().await.map_err(sftp_error("closing session"))?;
        Ok(())
    }

    async fn exec(&mut self, command: &str) -> Result<RemoteExit, RunnerError> {
        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(ssh_error("opening exec channel"))?;
        channel
            .exec(true, command)
            .await
            .map_err(ssh_error("starting remote command"))?;

        let mut stdout = tokio::io::stdout();
        let mut stderr = tokio::io::stderr();
        let forward_error = |source| RunnerError::Io {
            context: "forwarding remote output".into(),
            source,
        };

        let mut exit = None;
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => {
                    stdout.write_all(data).await.map_err(forward_error)?;
                }
                ChannelMsg::ExtendedData { ref data, ext: 1 } => {
                    stderr.write_all(data).await.map_err(forward_error)?;
                }
                ChannelMsg::ExitStatus { exit_status } => {
                    exit = Some(RemoteExit::Status(exit_status));
                }
                ChannelMsg::ExitSignal { signal_name, .. } => {
                    exit = Some(RemoteExit::Signal(format!("{signal_name:?}")));
                }
                _ => {}
            }
        }
        stdout.flush().await.map_err(forward_error)?;
        stderr.flush().await.map_err(forward_error)?;

        exit.ok_or_else(|| RunnerError::ExitMissing {
            addr: self.addr.clone(),
        })
    }
}
