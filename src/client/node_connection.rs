//! Control-plane connections
//!
//! One [`NodeConnection`] is a plain (or TLS) stream used for topology
//! commands only; request traffic goes through the per-entry connection
//! pools. [`NodeConnections`] caches one control connection per node the
//! way the manager expects: connect lazily, drop on failure, close all on
//! shutdown.

use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufStream, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;

use crate::config::ClusterConfig;
use crate::cluster::address::NodeAddress;
use crate::utils::{resp, ConnectionError, ProtocolError, RespEncoder, RespValue, Result};

/// A TCP stream that may or may not be wrapped in TLS.
pub enum MaybeTlsStream {
    Plain(TcpStream),
    #[cfg(feature = "tls")]
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for MaybeTlsStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(feature = "tls")]
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MaybeTlsStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(feature = "tls")]
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_flush(cx),
            #[cfg(feature = "tls")]
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(feature = "tls")]
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Control connection to a single node.
pub struct NodeConnection {
    addr: NodeAddress,
    stream: BufStream<MaybeTlsStream>,
    encoder: RespEncoder,
}

impl NodeConnection {
    /// Open a control connection, upgrading to TLS and authenticating
    /// according to the configuration.
    ///
    /// `sni` overrides the TLS server name; the bootstrap passes the
    /// configured endpoint hostname here so certificates verify even
    /// though nodes are addressed by IP.
    pub async fn connect(
        addr: &NodeAddress,
        config: &ClusterConfig,
        sni: Option<&str>,
    ) -> std::result::Result<Self, ConnectionError> {
        let connect = TcpStream::connect((addr.host(), addr.port()));
        let tcp = tokio::time::timeout(config.connect_timeout, connect)
            .await
            .map_err(|_| ConnectionError::Timeout(config.connect_timeout))?
            .map_err(|e| ConnectionError::ConnectFailed {
                addr: addr.to_string(),
                source: e,
            })?;
        tcp.set_nodelay(true).ok();

        let use_tls = addr.is_tls() || config.tls.is_some();
        let stream = if use_tls {
            Self::upgrade_tls(tcp, addr, config, sni).await?
        } else {
            MaybeTlsStream::Plain(tcp)
        };

        let mut conn = Self {
            addr: addr.clone(),
            stream: BufStream::new(stream),
            encoder: RespEncoder::with_capacity(256),
        };

        if let Some(auth) = &config.auth {
            conn.authenticate(&auth.password, auth.username.as_deref())
                .await?;
        }

        Ok(conn)
    }

    #[cfg(feature = "tls")]
    async fn upgrade_tls(
        tcp: TcpStream,
        addr: &NodeAddress,
        config: &ClusterConfig,
        sni: Option<&str>,
    ) -> std::result::Result<MaybeTlsStream, ConnectionError> {
        let default_tls;
        let tls_config = match &config.tls {
            Some(tls) => tls,
            None => {
                default_tls = crate::config::TlsConfig::default();
                &default_tls
            }
        };
        let server_name = sni
            .or(tls_config.sni.as_deref())
            .unwrap_or_else(|| addr.host());
        let stream = super::tls::wrap_tls(tcp, server_name, tls_config).await?;
        Ok(MaybeTlsStream::Tls(Box::new(stream)))
    }

    #[cfg(not(feature = "tls"))]
    async fn upgrade_tls(
        _tcp: TcpStream,
        _addr: &NodeAddress,
        _config: &ClusterConfig,
        _sni: Option<&str>,
    ) -> std::result::Result<MaybeTlsStream, ConnectionError> {
        Err(ConnectionError::TlsFailed(
            "TLS requested but the crate was built without the 'tls' feature".to_string(),
        ))
    }

    pub fn addr(&self) -> &NodeAddress {
        &self.addr
    }

    /// Send a command and read back a single response.
    async fn execute(&mut self, args: &[&str]) -> io::Result<RespValue> {
        self.encoder.clear();
        self.encoder.encode_command_str(args);
        self.stream.write_all(self.encoder.as_bytes()).await?;
        self.stream.flush().await?;
        resp::decode(&mut self.stream).await
    }

    /// Send AUTH
    pub async fn authenticate(
        &mut self,
        password: &str,
        username: Option<&str>,
    ) -> std::result::Result<(), ConnectionError> {
        let response = match username {
            Some(user) => self.execute(&["AUTH", user, password]).await,
            None => self.execute(&["AUTH", password]).await,
        }
        .map_err(|e| ConnectionError::AuthFailed(format!("IO error: {e}")))?;

        match response {
            RespValue::SimpleString(s) if s == "OK" => Ok(()),
            RespValue::Error(e) => Err(ConnectionError::AuthFailed(e)),
            other => Err(ConnectionError::AuthFailed(format!(
                "unexpected response: {other:?}"
            ))),
        }
    }

    /// Send PING and verify PONG
    pub async fn ping(&mut self) -> std::result::Result<(), ConnectionError> {
        match self.execute(&["PING"]).await? {
            RespValue::SimpleString(s) if s == "PONG" => Ok(()),
            RespValue::Error(e) => Err(ConnectionError::AuthFailed(e)),
            _ => Err(ConnectionError::Closed),
        }
    }

    /// Fetch the raw `CLUSTER NODES` text.
    pub async fn cluster_nodes(&mut self) -> Result<String> {
        let response = self
            .execute(&["CLUSTER", "NODES"])
            .await
            .map_err(ConnectionError::from)?;

        match response {
            RespValue::BulkString(_) | RespValue::SimpleString(_) => response
                .as_str()
                .map(str::to_string)
                .ok_or_else(|| ProtocolError::ServerError("invalid UTF-8".to_string()).into()),
            RespValue::Error(e) => Err(ProtocolError::ServerError(e).into()),
            other => Err(ProtocolError::UnexpectedResponse {
                expected: "bulk string".to_string(),
                actual: format!("{other:?}"),
            }
            .into()),
        }
    }
}

/// Node-level control plane used by the topology manager.
///
/// Abstracting the connection cache behind a trait keeps the manager
/// testable against scripted snapshots.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Open (or reuse) a control connection to the node and verify it.
    async fn ensure_node(&self, addr: &NodeAddress, sni: Option<&str>) -> Result<()>;

    /// Fetch the raw `CLUSTER NODES` text from the node.
    async fn cluster_nodes(&self, addr: &NodeAddress, sni: Option<&str>) -> Result<String>;

    /// Drop the cached connection to the node, if any.
    fn disconnect(&self, addr: &NodeAddress);

    /// Drop all cached connections.
    fn close_all(&self);
}

/// Real control plane: one cached [`NodeConnection`] per address.
pub struct NodeConnections {
    config: ClusterConfig,
    connections: Mutex<HashMap<NodeAddress, Arc<AsyncMutex<NodeConnection>>>>,
}

impl NodeConnections {
    pub fn new(config: ClusterConfig) -> Self {
        Self {
            config,
            connections: Mutex::new(HashMap::new()),
        }
    }

    async fn get_or_connect(
        &self,
        addr: &NodeAddress,
        sni: Option<&str>,
    ) -> Result<Arc<AsyncMutex<NodeConnection>>> {
        if let Some(conn) = self.connections.lock().get(addr) {
            return Ok(Arc::clone(conn));
        }

        let conn = NodeConnection::connect(addr, &self.config, sni).await?;
        let conn = Arc::new(AsyncMutex::new(conn));
        self.connections
            .lock()
            .insert(addr.clone(), Arc::clone(&conn));
        Ok(conn)
    }
}

#[async_trait]
impl ControlPlane for NodeConnections {
    async fn ensure_node(&self, addr: &NodeAddress, sni: Option<&str>) -> Result<()> {
        let conn = self.get_or_connect(addr, sni).await?;
        let mut guard = conn.lock().await;
        if let Err(e) = guard.ping().await {
            drop(guard);
            self.disconnect(addr);
            return Err(e.into());
        }
        Ok(())
    }

    async fn cluster_nodes(&self, addr: &NodeAddress, sni: Option<&str>) -> Result<String> {
        let conn = self.get_or_connect(addr, sni).await?;
        let mut guard = conn.lock().await;
        match guard.cluster_nodes().await {
            Ok(text) => Ok(text),
            Err(e) => {
                drop(guard);
                self.disconnect(addr);
                Err(e)
            }
        }
    }

    fn disconnect(&self, addr: &NodeAddress) {
        self.connections.lock().remove(addr);
    }

    fn close_all(&self) {
        self.connections.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    const NODES_TEXT: &str =
        "a1 127.0.0.1:7000@17000 master - 0 0 1 connected 0-16383\n";

    async fn spawn_stub_server() -> NodeAddress {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 512];
            loop {
                let n = match socket.read(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => n,
                };
                let request = String::from_utf8_lossy(&buf[..n]).to_string();
                let reply = if request.contains("PING") {
                    "+PONG\r\n".to_string()
                } else if request.contains("CLUSTER") {
                    format!("${}\r\n{}\r\n", NODES_TEXT.len(), NODES_TEXT)
                } else {
                    "-ERR unknown command\r\n".to_string()
                };
                if socket.write_all(reply.as_bytes()).await.is_err() {
                    return;
                }
            }
        });
        NodeAddress::new("127.0.0.1", port)
    }

    #[tokio::test]
    async fn connect_ping_and_fetch_nodes() {
        let addr = spawn_stub_server().await;
        let config = ClusterConfig::new(vec![addr.clone()]);

        let mut conn = NodeConnection::connect(&addr, &config, None).await.unwrap();
        conn.ping().await.unwrap();
        let text = conn.cluster_nodes().await.unwrap();
        assert_eq!(text, NODES_TEXT);
    }

    #[tokio::test]
    async fn connection_cache_reuses_and_disconnects() {
        let addr = spawn_stub_server().await;
        let config = ClusterConfig::new(vec![addr.clone()]);
        let connections = NodeConnections::new(config);

        connections.ensure_node(&addr, None).await.unwrap();
        assert_eq!(connections.connections.lock().len(), 1);

        let text = connections.cluster_nodes(&addr, None).await.unwrap();
        assert_eq!(text, NODES_TEXT);
        assert_eq!(connections.connections.lock().len(), 1);

        connections.disconnect(&addr);
        assert!(connections.connections.lock().is_empty());
    }

    #[tokio::test]
    async fn connect_to_dead_node_fails() {
        // port 1 is essentially never listening
        let addr = NodeAddress::new("127.0.0.1", 1);
        let config = ClusterConfig::new(vec![addr.clone()]);
        let result = NodeConnection::connect(&addr, &config, None).await;
        assert!(result.is_err());
    }
}
