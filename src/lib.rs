//! Certmux serves plain HTTP and HTTPS on a single socket, issuing certificates on demand:
//!
//! - A root certificate is generated once, at startup
//! - A leaf certificate is issued, and cached, for every server name a TLS client asks for
//! - Each connection is classified by its first bytes and handed to the matching server
//!
//! The root can be fetched over either protocol from `/ca` when [`WebHandler`] is used.

mod config;
mod error;
mod rewind;
mod service;
mod web;

pub mod certificate_authority;
pub mod router;

use bytes::Bytes;
use http::uri::Scheme;
use http_body_util::Full;
use hyper::{Request, Response, body::Incoming};
use std::{future::Future, net::SocketAddr};

pub use hyper;
pub use rcgen;
pub use tokio_rustls::rustls;

pub use self::config::Config;
pub use error::Error;
pub use rewind::Rewind;
pub use service::{
    Phase, Service, ServiceBuilder,
    builder::{Ready, WantsAddr, WantsCa, WantsHandler},
    lifecycle::ServiceStatus,
};
pub use web::WebHandler;

/// Context for HTTP requests.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub struct HttpContext {
    /// Address of the client that is sending the request.
    pub client_addr: SocketAddr,
    /// `http` or `https`, depending on the server the request arrived on.
    pub scheme: Scheme,
    /// The server name the TLS certificate was issued for. `None` for plain HTTP.
    pub server_name: Option<String>,
}

/// Handler for HTTP requests.
///
/// Serves both the plain and the TLS server. Every request is passed to its own clone of the
/// handler.
pub trait HttpHandler: Clone + Send + Sync + 'static {
    /// This handler will be called for each HTTP request and produces its response.
    fn handle_request(
        &mut self,
        ctx: &HttpContext,
        req: Request<Incoming>,
    ) -> impl Future<Output = Response<Full<Bytes>>> + Send;
}
