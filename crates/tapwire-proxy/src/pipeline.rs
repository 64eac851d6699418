//! Connection acceptance and the per-connection processing pipeline.
//!
//! Every accepted connection walks the same stage order for each message:
//! idle-timeout guard, TLS detection and upgrade, request decode, CONNECT
//! handling, recursion marking, handler phases, response write, close
//! decision.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::RwLock;
use tapwire_cert::LeafCertService;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::codec::{write_response, MessageReader, Rewind};
use crate::config::ServerConfig;
use crate::error::{ProxyError, Result};
use crate::handler::{
    DecodeResponseHandler, HandlerContext, MainHandler, MessageHandler, ProcessOutcome,
    RemoveAcceptEncodingHandler,
};
use crate::message::{HttpMessage, HttpRequest, HttpResponse};
use crate::tls::{build_tls_acceptor, SniCertResolver};

/// First byte of a TLS record-layer handshake.
const TLS_HANDSHAKE_BYTE: u8 = 0x16;

/// A bidirectional byte stream the pipeline can own.
pub trait Duplex: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + ?Sized> Duplex for T {}

/// Boxed stream, plain or TLS.
pub type BoxedStream = Box<dyn Duplex>;

/// Collaborator offered connections that switched to a non-message protocol
/// (WebSocket upgrades, event streams).
///
/// Returning `None` accepts the stream; returning it back declines, and the
/// pipeline closes the connection.
pub trait ConnectionHandover: Send + Sync {
    /// Offers the raw stream together with the exchange that triggered the
    /// hand-off.
    fn take_over(&self, msg: &HttpMessage, stream: BoxedStream) -> Option<BoxedStream>;
}

/// An intercepting proxy server.
///
/// Listens on the configured address, upgrades intercepted tunnels to TLS
/// with on-demand certificates and drives registered [`MessageHandler`]s
/// over every decoded exchange.
pub struct Server {
    config: RwLock<Arc<ServerConfig>>,
    handlers: Vec<Arc<dyn MessageHandler>>,
    certs: Arc<LeafCertService>,
    handover: Option<Arc<dyn ConnectionHandover>>,
}

impl Server {
    /// Creates a server serving leaf certificates from the given service.
    pub fn new(config: ServerConfig, certs: Arc<LeafCertService>) -> Self {
        Self {
            config: RwLock::new(Arc::new(config)),
            handlers: Vec::new(),
            certs,
            handover: None,
        }
    }

    /// Appends a message handler. Handlers run in registration order, after
    /// the built-in ones.
    pub fn with_handler(mut self, handler: Arc<dyn MessageHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Sets the collaborator offered upgraded connections.
    pub fn with_handover(mut self, handover: Arc<dyn ConnectionHandover>) -> Self {
        self.handover = Some(handover);
        self
    }

    /// The current configuration snapshot.
    pub fn config(&self) -> Arc<ServerConfig> {
        self.config.read().clone()
    }

    /// Replaces the configuration. Connections accepted from now on use the
    /// new value; in-flight connections keep the snapshot they started with.
    pub fn reload(&self, config: ServerConfig) {
        *self.config.write() = Arc::new(config);
    }

    /// Binds the listener and starts accepting connections.
    pub async fn start(self) -> Result<ServerHandle> {
        let config = self.config();
        let listener = TcpListener::bind((config.address(), config.port())).await?;
        let addr = listener.local_addr()?;
        info!(%addr, "server listening");

        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        let server = Arc::new(self);
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            let server = server.clone();
                            tokio::spawn(async move {
                                server.handle_connection(Box::new(stream), peer).await;
                            });
                        }
                        Err(error) => warn!(%error, "failed to accept connection"),
                    }
                }
            }
            info!(%addr, "server stopped");
        });

        Ok(ServerHandle {
            addr,
            shutdown_tx,
            task,
        })
    }

    async fn handle_connection(&self, stream: BoxedStream, peer: SocketAddr) {
        let config = self.config();
        debug!(%peer, "accepted connection");
        if let Err(error) = self.serve(config, stream, peer).await {
            match &error {
                ProxyError::Io(e) if is_disconnect(e) => {
                    debug!(%peer, error = %e, "connection dropped")
                }
                _ => warn!(%peer, %error, "connection failed"),
            }
        }
    }

    async fn serve(
        &self,
        config: Arc<ServerConfig>,
        stream: BoxedStream,
        peer: SocketAddr,
    ) -> Result<()> {
        let mut handlers: Vec<Arc<dyn MessageHandler>> = Vec::new();
        if config.remove_accept_encoding() {
            handlers.push(Arc::new(RemoveAcceptEncodingHandler));
        }
        if config.decode_response() {
            handlers.push(Arc::new(DecodeResponseHandler));
        }
        handlers.extend(self.handlers.iter().cloned());
        let main = MainHandler::new(handlers);

        let mut reader = MessageReader::new(stream);
        let mut ctx = HandlerContext::new();
        let mut tls = false;
        let mut tunnel_host: Option<String> = None;

        loop {
            let first_byte = {
                let bytes = match timeout(config.read_timeout(), reader.peek(1)).await {
                    Ok(result) => result?,
                    Err(_) => {
                        debug!(%peer, "closing idle connection");
                        return Ok(());
                    }
                };
                bytes.first().copied()
            };
            let Some(first_byte) = first_byte else {
                return Ok(());
            };

            if !tls && first_byte == TLS_HANDSHAKE_BYTE {
                let mut resolver = SniCertResolver::new(self.certs.clone(), config.address());
                if let Some(host) = &tunnel_host {
                    resolver = resolver.with_fallback_host(host.clone());
                }
                let acceptor = build_tls_acceptor(&config, Arc::new(resolver))?;
                let (stream, buffered) = reader.into_parts();
                let accepted = acceptor
                    .accept(Rewind::new(buffered, stream))
                    .await
                    .map_err(|e| ProxyError::Tls(format!("handshake failed: {e}")))?;
                debug!(%peer, "connection upgraded to TLS");
                reader = MessageReader::new(Box::new(accepted));
                tls = true;
                continue;
            }

            let request = match timeout(config.read_timeout(), reader.read_request()).await {
                Ok(result) => result?,
                Err(_) => {
                    debug!(%peer, "closing idle connection");
                    return Ok(());
                }
            };
            let Some(mut request) = request else {
                return Ok(());
            };
            request.secure = tls;
            let mut msg = HttpMessage::new(request);

            let default_port = if tls { 443 } else { 80 };
            let predicate_config = config.clone();
            let is_recursive = move |request: &HttpRequest| {
                request
                    .target(default_port)
                    .map(|(host, port)| predicate_config.is_recursive_target(&host, port))
                    .unwrap_or(false)
            };

            if msg.request.is_connect() && !tls {
                match main.process(&config, &is_recursive, &mut ctx, &mut msg) {
                    ProcessOutcome::Close => return Ok(()),
                    ProcessOutcome::Write => {}
                }
                if msg.response.is_empty() {
                    msg.response = HttpResponse::with_status(200, "Connection established");
                }
                if !self.write(&mut reader, &msg.response, peer).await {
                    return Ok(());
                }
                let Some((host, port)) = msg.request.target(443) else {
                    return Err(ProxyError::Malformed(format!(
                        "invalid tunnel authority: {:?}",
                        msg.request.uri
                    )));
                };
                let authority = format_authority(&host, port);
                if config.is_pass_through(&authority) {
                    debug!(%peer, %authority, "relaying tunnel without interception");
                    return tunnel(reader, &authority).await;
                }
                tunnel_host = Some(host);
                continue;
            }

            if !surface_allowed(&config, is_recursive(&msg.request)) {
                let mut refused = HttpResponse::with_status(403, "Forbidden");
                refused.headers.set("Connection", "close");
                self.write(&mut reader, &refused, peer).await;
                return Ok(());
            }

            match main.process(&config, &is_recursive, &mut ctx, &mut msg) {
                ProcessOutcome::Close => return Ok(()),
                ProcessOutcome::Write => {}
            }
            if !self.write(&mut reader, &msg.response, peer).await {
                return Ok(());
            }

            if is_streaming(&msg.response) {
                if let Some(handover) = &self.handover {
                    let (stream, buffered) = reader.into_parts();
                    let stream: BoxedStream = Box::new(Rewind::new(buffered, stream));
                    if handover.take_over(&msg, stream).is_none() {
                        debug!(%peer, "connection handed over");
                    }
                }
                return Ok(());
            }

            if should_close(&msg) {
                return Ok(());
            }
        }
    }

    /// Writes a response, reporting whether the connection is still usable.
    /// A failed write never escalates; the peer being gone is routine.
    async fn write(
        &self,
        reader: &mut MessageReader<BoxedStream>,
        response: &HttpResponse,
        peer: SocketAddr,
    ) -> bool {
        match write_response(reader.stream_mut(), response).await {
            Ok(()) => true,
            Err(error) => {
                if is_disconnect(&error) {
                    debug!(%peer, %error, "peer closed connection before response was written");
                } else {
                    warn!(%peer, %error, "failed to write response");
                }
                false
            }
        }
    }
}

/// A running server. Dropping the handle leaves the server running;
/// [`ServerHandle::shutdown`] stops it.
pub struct ServerHandle {
    addr: SocketAddr,
    shutdown_tx: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

impl ServerHandle {
    /// The bound address, with the real port when port 0 was configured.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stops accepting connections and waits for the accept loop to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.task.await;
    }
}

/// Relays a pass-through tunnel byte for byte.
async fn tunnel(reader: MessageReader<BoxedStream>, authority: &str) -> Result<()> {
    let mut upstream = TcpStream::connect(authority).await?;
    let (client, buffered) = reader.into_parts();
    let mut client = Rewind::new(buffered, client);
    tokio::io::copy_bidirectional(&mut client, &mut upstream).await?;
    Ok(())
}

/// Formats `host:port`, bracketing IPv6 literals so the result is a valid
/// connect target.
fn format_authority(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

fn surface_allowed(config: &ServerConfig, recursive: bool) -> bool {
    if recursive {
        config.mode().has_api()
    } else {
        config.mode().has_proxy()
    }
}

fn is_disconnect(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::UnexpectedEof
    )
}

/// Whether the exchange switched the connection to a non-message protocol.
fn is_streaming(response: &HttpResponse) -> bool {
    if response.status == 101 {
        return true;
    }
    response
        .headers
        .get("Content-Type")
        .map(|value| {
            let value = value.trim().to_ascii_lowercase();
            value.starts_with("text/event-stream")
                || value.starts_with("multipart/x-mixed-replace")
        })
        .unwrap_or(false)
}

/// Whether the connection must close after writing the response.
///
/// Tunnels never close here; otherwise an empty response, an explicit
/// close per keep-alive rules, or a body whose end cannot be determined
/// forces a close.
fn should_close(msg: &HttpMessage) -> bool {
    if msg.request.is_connect() {
        return false;
    }
    let response = &msg.response;
    if response.is_empty() {
        return true;
    }
    if msg.request.wants_close() || response.wants_close() {
        return true;
    }
    if msg.connection_closed && response.content_length().is_none() {
        return true;
    }
    if response.content_length().is_none() && !response.body.is_empty() {
        return true;
    }
    false
}
