//! Tapwire intercepting proxy.
//!
//! Accepts local HTTP(S) connections, upgrades intercepted `CONNECT`
//! tunnels to TLS with certificates synthesized on demand by
//! `tapwire-cert`, and drives an ordered list of [`MessageHandler`]s over
//! every decoded exchange. Embedders register handlers to observe, rewrite
//! or answer messages; everything else (timeouts, TLS detection,
//! keep-alive, pass-through tunnels) is the pipeline's job.

mod alias;
mod codec;
mod config;
mod error;
mod handler;
mod message;
mod pipeline;
mod tls;

pub use alias::{Alias, PassThrough};
pub use codec::{encode_response, write_response, MessageReader, Rewind};
pub use config::{ServerConfig, ServerMode, TlsProtocol};
pub use error::{ProxyError, Result};
pub use handler::{
    DecodeResponseHandler, HandlerContext, MainHandler, MessageHandler, ProcessOutcome,
    RemoveAcceptEncodingHandler,
};
pub use message::{Headers, HttpMessage, HttpRequest, HttpResponse};
pub use pipeline::{BoxedStream, ConnectionHandover, Duplex, Server, ServerHandle};
pub use tls::{build_tls_acceptor, SniCertResolver};
