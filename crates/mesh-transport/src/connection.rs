#[cfg(unix)]
use std::os::fd::{AsRawFd, FromRawFd};
use std::sync::Arc;
use std::time::Duration;

use mesh_error::{io_error_is_expected, MeshError};
use mesh_runtime::CancellationToken;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::stats::ConnectionStats;
use crate::stream::Stream;

const MAX_HANDSHAKE_RETRIES: u32 = 5;

/// TLS role for a connection, or none. The spec does not mandate a TLS
/// library; this crate picks `rustls`/`tokio-rustls` (present in the pack
/// via `paritytech-polkadot-sdk`) since the teacher crate has no TLS
/// dependency of its own.
pub enum TlsMode {
    Plain,
    Client(Arc<rustls::ClientConfig>),
    Server(Arc<rustls::ServerConfig>),
}

/// Bounded exponential reconnect back-off, mirroring
/// `EXPONENTIAL_BACKOFF_RATIO`/`MONITOR_PEERS_INITIAL_DURATION` from the
/// teacher's peer manager (§2 supplemented features: not named by the
/// distilled spec, but implied by "handshake failures... restart the
/// resolve→connect→handshake cycle").
#[derive(Clone, Copy, Debug)]
pub struct BackoffConfig {
    pub initial: Duration,
    pub ratio: f64,
    pub max: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self { initial: Duration::from_millis(100), ratio: 2.0, max: Duration::from_secs(10) }
    }
}

impl BackoffConfig {
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let scaled = self.initial.as_secs_f64() * self.ratio.powi(attempt as i32);
        Duration::from_secs_f64(scaled.min(self.max.as_secs_f64()))
    }
}

/// A task that owns a stream, per §4.A: `connect`, `accept`, `read_exact`,
/// `write_all`, `shutdown(force)`, `cancel`.
pub struct Connection {
    stream: Stream,
    cancel: CancellationToken,
    pub stats: ConnectionStats,
}

impl Connection {
    /// Resolves `hostname`, connects to the first reachable address,
    /// configures `TCP_NODELAY`/`SO_KEEPALIVE` best-effort, performs a TLS
    /// handshake when `tls` requires one, and retries the whole
    /// resolve→connect→handshake cycle up to
    /// [`MAX_HANDSHAKE_RETRIES`] times when the failure is transient.
    #[tracing::instrument(target = "mesh::transport", level = "debug", skip(tls, cancel), fields(hostname, port))]
    pub async fn connect(
        hostname: &str,
        port: u16,
        tls: &TlsMode,
        backoff: BackoffConfig,
        cancel: CancellationToken,
    ) -> Result<Self, MeshError> {
        let mut attempt = 0;
        loop {
            match Self::try_connect_once(hostname, port, tls, &cancel).await {
                Ok(conn) => return Ok(conn),
                Err(e) if attempt + 1 < MAX_HANDSHAKE_RETRIES && is_retryable_handshake(&e) => {
                    attempt += 1;
                    tracing::trace!(
                        target: "mesh::transport",
                        %hostname, port, attempt, error = %e,
                        "transient handshake failure, retrying"
                    );
                    if !cancel.sleep_cancellable(backoff.delay_for_attempt(attempt)).await {
                        return Err(MeshError::aborted());
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn try_connect_once(
        hostname: &str,
        port: u16,
        tls: &TlsMode,
        cancel: &CancellationToken,
    ) -> Result<Self, MeshError> {
        let addr = format!("{hostname}:{port}");
        let tcp = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(MeshError::aborted()),
            result = TcpStream::connect(&addr) => result.map_err(classify_io_error)?,
        };
        configure_socket(&tcp);
        let stream = match tls {
            TlsMode::Plain => Stream::Plain(tcp),
            TlsMode::Client(config) => {
                let connector = tokio_rustls::TlsConnector::from(config.clone());
                let server_name = crate::tls::server_name(hostname)?;
                let tls_stream = connector
                    .connect(server_name, tcp)
                    .await
                    .map_err(|e| MeshError::fatal(format!("TLS handshake failed: {e}")))?;
                Stream::TlsClient(Box::new(tls_stream))
            }
            TlsMode::Server(_) => {
                return Err(MeshError::fatal("cannot connect() with a server TLS config"))
            }
        };
        Ok(Self { stream, cancel: cancel.clone(), stats: ConnectionStats::default() })
    }

    /// Accepts one connection from `listener`, performing a TLS handshake
    /// when `tls` is [`TlsMode::Server`].
    pub async fn accept(
        listener: &TcpListener,
        tls: &TlsMode,
        cancel: CancellationToken,
    ) -> Result<Self, MeshError> {
        let (tcp, _addr) = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(MeshError::aborted()),
            result = listener.accept() => result.map_err(classify_io_error)?,
        };
        configure_socket(&tcp);
        let stream = match tls {
            TlsMode::Plain => Stream::Plain(tcp),
            TlsMode::Server(config) => {
                let acceptor = tokio_rustls::TlsAcceptor::from(config.clone());
                let tls_stream = acceptor
                    .accept(tcp)
                    .await
                    .map_err(|e| MeshError::fatal(format!("TLS handshake failed: {e}")))?;
                Stream::TlsServer(Box::new(tls_stream))
            }
            TlsMode::Client(_) => {
                return Err(MeshError::fatal("cannot accept() with a client TLS config"))
            }
        };
        Ok(Self { stream, cancel, stats: ConnectionStats::default() })
    }

    /// Reads exactly `buf.len()` bytes, or returns `Aborted` if cancelled
    /// first.
    pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), MeshError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                self.shutdown(true).await;
                Err(MeshError::aborted())
            }
            result = self.stream.read_exact(buf) => {
                let n = result.map_err(classify_io_error)?;
                self.stats.record_received(n);
                Ok(())
            }
        }
    }

    pub async fn write_all(&mut self, buf: &[u8]) -> Result<(), MeshError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                self.shutdown(true).await;
                Err(MeshError::aborted())
            }
            result = self.stream.write_all(buf) => {
                result.map_err(classify_io_error)?;
                self.stats.record_sent(buf.len());
                Ok(())
            }
        }
    }

    /// Forceful shutdown: linger set to `(off, 0)` (best-effort via
    /// `socket2`, which owns the raw fd only for the duration of this call)
    /// then `shutdown(both)`.
    pub async fn shutdown(&mut self, force: bool) {
        #[cfg(unix)]
        if force {
            let fd = self.stream.raw_fd_socket().as_raw_fd();
            // SAFETY: `sock2` only reads/writes socket options through the
            // fd for this call and is immediately forgotten, never closing
            // the fd tokio still owns.
            let sock2 = unsafe { socket2::Socket::from_raw_fd(fd) };
            let _ = sock2.set_linger(Some(Duration::ZERO));
            std::mem::forget(sock2);
        }
        let _ = self.stream.shutdown().await;
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

fn configure_socket(stream: &TcpStream) {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::trace!(target: "mesh::transport", error = %e, "failed to set TCP_NODELAY");
    }
    #[cfg(unix)]
    {
        let fd = stream.as_raw_fd();
        // SAFETY: see `Connection::shutdown`; forgotten immediately after use.
        let sock2 = unsafe { socket2::Socket::from_raw_fd(fd) };
        if let Err(e) = sock2.set_keepalive(true) {
            tracing::trace!(target: "mesh::transport", error = %e, "failed to set SO_KEEPALIVE");
        }
        std::mem::forget(sock2);
    }
}

/// `isProtocolHandshakeRetryableError`: transient failures that warrant
/// restarting the resolve→connect→handshake cycle.
fn is_retryable_handshake(error: &MeshError) -> bool {
    error.annotations.get("io_kind").map(|k| k == "transient").unwrap_or(false)
}

fn classify_io_error(error: std::io::Error) -> MeshError {
    let expected = io_error_is_expected(error.kind());
    let mesh_error = if expected {
        MeshError::server(mesh_error::ErrorCode::NotConnected, error.to_string())
    } else {
        MeshError::fatal(error.to_string())
    };
    mesh_error.with_annotation("io_kind", if expected { "transient" } else { "fatal" })
}
