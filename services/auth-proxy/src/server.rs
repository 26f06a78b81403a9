use std::convert::Infallible;
use std::fs::File;
use std::future::Future;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use rustls::pki_types::CertificateDer;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigError, ProxyConfig, ServingConfig};
use crate::proxy::Proxy;

/// How long in-flight connections may take to finish after shutdown.
pub const DRAIN_GRACE_PERIOD: Duration = Duration::from_secs(10);

pub struct ProxyServer {
    config: Arc<ProxyConfig>,
    proxy: Arc<Proxy>,
    tls_acceptor: Option<TlsAcceptor>,
}

impl ProxyServer {
    pub fn new(config: Arc<ProxyConfig>, proxy: Arc<Proxy>) -> Result<Self, ConfigError> {
        let tls_acceptor = match config.serving.tls_cert_path {
            Some(_) => Some(create_tls_acceptor(&config.serving)?),
            None => None,
        };

        Ok(Self {
            config,
            proxy,
            tls_acceptor,
        })
    }

    pub async fn bind(&self) -> Result<TcpListener> {
        let addr: SocketAddr = self
            .config
            .listen_addr()
            .parse()
            .context("Invalid listen address")?;

        TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind to {}", addr))
    }

    /// Serve on the configured address until `shutdown` resolves.
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let listener = self.bind().await?;
        self.serve(listener, shutdown).await
    }

    /// Accept connections until `shutdown` resolves, then stop accepting and
    /// give in-flight connections [`DRAIN_GRACE_PERIOD`] to finish.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let local_addr = listener.local_addr().context("Listener has no local address")?;
        info!(
            addr = %local_addr,
            tls = self.tls_acceptor.is_some(),
            "Proxy server listening"
        );

        let server = Arc::new(self);
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut connections = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            while connections.try_join_next().is_some() {}

            let (stream, peer_addr) = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                        continue;
                    }
                },
                _ = &mut shutdown => break,
            };

            let server = Arc::clone(&server);
            let stop_rx = stop_rx.clone();
            connections.spawn(async move {
                if let Err(e) = server.handle_connection(stream, peer_addr, stop_rx).await {
                    debug!(peer = %peer_addr, error = %e, "Connection error");
                }
            });
        }

        drop(listener);
        let in_flight = connections.len();
        info!(in_flight, "Stopped accepting connections, draining");
        let _ = stop_tx.send(true);

        let drained = tokio::time::timeout(DRAIN_GRACE_PERIOD, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                remaining = connections.len(),
                "Grace period elapsed, closing remaining connections"
            );
            connections.shutdown().await;
        }

        info!("Proxy server stopped");
        Ok(())
    }

    async fn handle_connection(
        &self,
        stream: TcpStream,
        peer_addr: SocketAddr,
        stop_rx: watch::Receiver<bool>,
    ) -> Result<()> {
        match self.tls_acceptor {
            Some(ref acceptor) => {
                let tls_stream = acceptor
                    .accept(stream)
                    .await
                    .context("TLS handshake failed")?;
                let peer_info = PeerInfo {
                    addr: peer_addr,
                    tls: true,
                };
                self.serve_connection(tls_stream, peer_info, stop_rx).await
            }
            None => {
                self.serve_connection(stream, PeerInfo::plaintext(peer_addr), stop_rx)
                    .await
            }
        }
    }

    async fn serve_connection<S>(
        &self,
        stream: S,
        peer_info: PeerInfo,
        mut stop_rx: watch::Receiver<bool>,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let proxy = Arc::clone(&self.proxy);
        let peer_info = Arc::new(peer_info);

        let service = service_fn(move |req| {
            let proxy = Arc::clone(&proxy);
            let peer_info = Arc::clone(&peer_info);
            async move { Ok::<_, Infallible>(proxy.handle_request(req, &peer_info).await) }
        });

        let conn = http1::Builder::new().serve_connection(TokioIo::new(stream), service);
        tokio::pin!(conn);

        tokio::select! {
            result = conn.as_mut() => {
                return result.context("Failed to serve connection");
            }
            _ = stop_rx.wait_for(|stopped| *stopped) => {
                conn.as_mut().graceful_shutdown();
            }
        }

        conn.await.context("Failed to serve connection")
    }
}

fn create_tls_acceptor(serving: &ServingConfig) -> Result<TlsAcceptor, ConfigError> {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let cert_path = serving
        .tls_cert_path
        .as_ref()
        .ok_or(ConfigError::Missing("TLS_CERT_PATH"))?;
    let key_path = serving
        .tls_key_path
        .as_ref()
        .ok_or(ConfigError::Missing("TLS_KEY_PATH"))?;

    let certs = load_certs("TLS_CERT_PATH", cert_path)?;

    let mut key_reader = BufReader::new(open("TLS_KEY_PATH", key_path)?);
    let private_key = rustls_pemfile::private_key(&mut key_reader)
        .map_err(|e| ConfigError::Tls(format!("failed to parse private key: {}", e)))?
        .ok_or_else(|| ConfigError::Tls("no private key found in TLS_KEY_PATH".to_string()))?;

    let mut tls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, private_key)
        .map_err(|e| ConfigError::Tls(format!("failed to build TLS config: {}", e)))?;
    tls_config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(TlsAcceptor::from(Arc::new(tls_config)))
}

fn open(name: &'static str, path: &Path) -> Result<File, ConfigError> {
    File::open(path).map_err(|e| ConfigError::UnreadableFile {
        name,
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

fn load_certs(name: &'static str, path: &Path) -> Result<Vec<CertificateDer<'static>>, ConfigError> {
    let mut reader = BufReader::new(open(name, path)?);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ConfigError::Tls(format!("failed to parse {}: {}", name, e)))?;
    if certs.is_empty() {
        return Err(ConfigError::Tls(format!("no certificates found in {}", name)));
    }
    Ok(certs)
}

/// Transport-level facts about the connection a request arrived on.
#[derive(Debug, Clone, Copy)]
pub struct PeerInfo {
    pub addr: SocketAddr,
    pub tls: bool,
}

impl PeerInfo {
    pub fn plaintext(addr: SocketAddr) -> Self {
        Self { addr, tls: false }
    }
}
