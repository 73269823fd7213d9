use crate::{HttpContext, HttpHandler};
use bytes::Bytes;
use http_body_util::Full;
use hyper::{Request, Response, StatusCode, body::Incoming, header};
use std::sync::Arc;
use time::{OffsetDateTime, format_description::well_known::Rfc3339};
use tracing::{debug, error};

const USAGE: &str = "help:
curl /ca # get root cert
curl /hello # rsp world
";

/// The built-in routes, served on both protocols.
///
/// - `/ca` returns the root certificate as PEM.
/// - `/hello` returns a greeting with the current time.
/// - `/` returns a short usage text.
///
/// Every other path is answered with `404 Not Found`.
#[derive(Clone, Debug)]
pub struct WebHandler {
    root_pem: Arc<str>,
}

impl WebHandler {
    /// Creates a handler that serves `root_pem` on `/ca`.
    pub fn new(root_pem: impl Into<Arc<str>>) -> Self {
        Self {
            root_pem: root_pem.into(),
        }
    }

    fn route(&self, path: &str) -> Response<Full<Bytes>> {
        match path {
            "/ca" => text(StatusCode::OK, Bytes::from(self.root_pem.to_string())),
            "/hello" => hello(OffsetDateTime::now_utc()),
            "/" => text(StatusCode::OK, Bytes::from_static(USAGE.as_bytes())),
            _ => text(StatusCode::NOT_FOUND, Bytes::new()),
        }
    }
}

impl HttpHandler for WebHandler {
    async fn handle_request(
        &mut self,
        ctx: &HttpContext,
        req: Request<Incoming>,
    ) -> Response<Full<Bytes>> {
        let res = self.route(req.uri().path());
        debug!(
            scheme = %ctx.scheme,
            method = %req.method(),
            path = req.uri().path(),
            status = res.status().as_u16(),
            "Served request"
        );
        res
    }
}

fn hello(now: OffsetDateTime) -> Response<Full<Bytes>> {
    match now.format(&Rfc3339) {
        Ok(now) => text(StatusCode::OK, format!("rsp world time: {now}\n").into()),
        Err(e) => {
            error!("Failed to format time: {}", e);
            text(StatusCode::INTERNAL_SERVER_ERROR, Bytes::new())
        }
    }
}

fn text(status: StatusCode, body: Bytes) -> Response<Full<Bytes>> {
    let mut res = Response::new(Full::new(body));
    *res.status_mut() = status;
    res.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    res
}
