//! Agent proxy listener (spec §4.3): a plain HTTP/1.1 forward proxy that
//! adapts browser traffic into tunnel envelopes.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::header::CONNECTION;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};
use tunnel_proto::{HeaderMap as TunnelHeaders, HttpRequestPayload, HOP_BY_HOP_HEADERS};

use crate::error::StreamError;
use crate::registry::ConnectEvent;
use crate::tunnel::TunnelClient;

type BoxedBody = BoxBody<Bytes, hyper::Error>;

#[derive(Clone)]
pub struct ProxyListener {
    addr: SocketAddr,
    tunnel: TunnelClient,
    request_timeout: Duration,
    connect_ack_timeout: Duration,
}

impl ProxyListener {
    pub fn new(addr: SocketAddr, tunnel: TunnelClient, request_timeout: Duration, connect_ack_timeout: Duration) -> Self {
        Self {
            addr,
            tunnel,
            request_timeout,
            connect_ack_timeout,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.addr).await?;
        info!("agent proxy listening on {}", self.addr);

        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("failed to accept proxy client: {e}");
                    continue;
                }
            };
            let this = self.clone();
            tokio::spawn(async move {
                if let Err(e) = this.handle_connection(stream).await {
                    debug!("proxy connection from {peer} ended: {e:?}");
                }
            });
        }
    }

    async fn handle_connection(&self, stream: TcpStream) -> anyhow::Result<()> {
        let io = TokioIo::new(stream);
        let this = self.clone();
        let service = service_fn(move |req| {
            let this = this.clone();
            async move { this.handle_request(req).await }
        });

        hyper::server::conn::http1::Builder::new()
            .serve_connection(io, service)
            .with_upgrades()
            .await?;
        Ok(())
    }

    async fn handle_request(
        &self,
        req: Request<Incoming>,
    ) -> Result<Response<BoxedBody>, hyper::Error> {
        if req.method() == hyper::Method::CONNECT {
            return Ok(self.handle_connect(req).await);
        }
        Ok(self.handle_forward(req).await)
    }

    async fn handle_forward(&self, req: Request<Incoming>) -> Response<BoxedBody> {
        let method = req.method().to_string();
        let url = req.uri().to_string();

        if req.uri().scheme().is_none() || req.uri().host().is_none() {
            warn!("rejecting non-absolute-form request: {method} {url}");
            return text_response(StatusCode::BAD_REQUEST, "proxy requires absolute-form request URI");
        }

        let headers = request_headers_to_tunnel(req.headers());
        let (parts, body) = req.into_parts();
        let body_bytes = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                warn!("failed to read request body: {e}");
                return text_response(StatusCode::BAD_REQUEST, "failed to read request body");
            }
        };

        let payload = HttpRequestPayload {
            id: String::new(), // filled in by TunnelClient::send_request
            method: parts.method.as_str().to_ascii_uppercase(),
            url: parts.uri.to_string(),
            headers,
            body: body_bytes.to_vec(),
        };

        match self.tunnel.send_request(payload).await {
            Ok(resp) => {
                if let Some(err) = resp.error {
                    warn!("origin request failed: {err}");
                    return text_response(map_executor_error(&err), &err);
                }
                let mut builder = Response::builder().status(
                    StatusCode::from_u16(resp.status_code).unwrap_or(StatusCode::BAD_GATEWAY),
                );
                builder = tunnel_headers_into_response(&resp.headers, builder);
                builder
                    .body(full_body(resp.body))
                    .unwrap_or_else(|_| text_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to build response"))
            }
            Err(StreamError::Timeout) => text_response(StatusCode::GATEWAY_TIMEOUT, "upstream timed out"),
            Err(StreamError::Unavailable) => {
                text_response(StatusCode::BAD_GATEWAY, "proxy unavailable")
            }
            Err(e) => {
                warn!("tunnel send_request failed: {e}");
                text_response(StatusCode::BAD_GATEWAY, "tunnel unavailable")
            }
        }
    }

    async fn handle_connect(&self, mut req: Request<Incoming>) -> Response<BoxedBody> {
        let host = match req.uri().authority() {
            Some(authority) => authority.to_string(),
            None => {
                warn!("CONNECT request missing authority");
                return text_response(StatusCode::BAD_REQUEST, "CONNECT requires host:port");
            }
        };

        let mut handle = match self.tunnel.open_connect(host.clone()).await {
            Ok(h) => h,
            Err(e) => {
                warn!("failed to open CONNECT stream to {host}: {e}");
                return text_response(StatusCode::BAD_GATEWAY, "proxy unavailable");
            }
        };

        let ack = tokio::time::timeout(self.connect_ack_timeout, handle.recv()).await;
        let established = match ack {
            Ok(Some(ConnectEvent::Ack { success: true, .. })) => true,
            Ok(Some(ConnectEvent::Ack { success: false, error })) => {
                warn!("CONNECT to {host} rejected by server: {error:?}");
                false
            }
            Ok(Some(other)) => {
                error!("protocol violation: expected connect_ack for {host}, got {other:?}");
                false
            }
            Ok(None) => {
                warn!("CONNECT stream to {host} closed before ack");
                false
            }
            Err(_) => {
                warn!("CONNECT to {host} timed out waiting for ack");
                return text_response(StatusCode::GATEWAY_TIMEOUT, "upstream connect timed out");
            }
        };

        if !established {
            return text_response(StatusCode::BAD_GATEWAY, "CONNECT failed");
        }

        let upgrade_fut = hyper::upgrade::on(&mut req);
        tokio::spawn(async move {
            match upgrade_fut.await {
                Ok(upgraded) => {
                    if let Err(e) = pump_connect(upgraded, handle).await {
                        debug!("CONNECT pump ended: {e:?}");
                    }
                }
                Err(e) => warn!("CONNECT upgrade failed: {e}"),
            }
        });

        Response::builder()
            .status(StatusCode::OK)
            .body(empty_body())
            .expect("valid response")
    }
}

async fn pump_connect(upgraded: hyper::upgrade::Upgraded, mut handle: crate::tunnel::ConnectHandle) -> anyhow::Result<()> {
    let mut browser = TokioIo::new(upgraded);
    let mut buf = vec![0u8; 16 * 1024];
    let mut browser_done = false;
    let mut tunnel_done = false;

    loop {
        if browser_done && tunnel_done {
            break;
        }
        tokio::select! {
            read = browser.read(&mut buf), if !browser_done => {
                match read {
                    Ok(0) => {
                        let _ = handle.close(None).await;
                        browser_done = true;
                    }
                    Ok(n) => {
                        if handle.send_chunk(&buf[..n]).await.is_err() {
                            browser_done = true;
                            tunnel_done = true;
                        }
                    }
                    Err(e) => {
                        let _ = handle.close(Some(e.to_string())).await;
                        browser_done = true;
                    }
                }
            }
            event = handle.recv(), if !tunnel_done => {
                match event {
                    Some(ConnectEvent::Data(data)) => {
                        if browser.write_all(&data).await.is_err() {
                            browser_done = true;
                            tunnel_done = true;
                        }
                    }
                    Some(ConnectEvent::Closed { error }) => {
                        if let Some(e) = error {
                            debug!("tunnel side closed with error: {e}");
                        }
                        let _ = browser.shutdown().await;
                        tunnel_done = true;
                    }
                    Some(ConnectEvent::Ack { .. }) => {
                        error!("protocol violation: duplicate connect_ack for {}", handle.id());
                    }
                    None => tunnel_done = true,
                }
            }
        }
    }
    Ok(())
}

fn request_headers_to_tunnel(headers: &hyper::HeaderMap) -> TunnelHeaders {
    let skip = extra_hop_by_hop_names(headers);
    let mut out = TunnelHeaders::new();
    for (name, value) in headers.iter() {
        let lower = name.as_str().to_ascii_lowercase();
        if HOP_BY_HOP_HEADERS.contains(&lower.as_str()) || skip.contains(&lower) {
            continue;
        }
        let value = value.to_str().unwrap_or_default().to_string();
        out.entry(name.as_str().to_string()).or_default().push(value);
    }
    out
}

fn tunnel_headers_into_response(
    headers: &TunnelHeaders,
    mut builder: hyper::http::response::Builder,
) -> hyper::http::response::Builder {
    for (name, values) in headers {
        let lower = name.to_ascii_lowercase();
        if HOP_BY_HOP_HEADERS.contains(&lower.as_str()) {
            continue;
        }
        for value in values {
            builder = builder.header(name.as_str(), value.as_str());
        }
    }
    builder
}

fn extra_hop_by_hop_names(headers: &hyper::HeaderMap) -> HashSet<String> {
    let mut set = HashSet::new();
    for value in headers.get_all(CONNECTION) {
        if let Ok(s) = value.to_str() {
            for token in s.split(',') {
                let token = token.trim().to_ascii_lowercase();
                if !token.is_empty() {
                    set.insert(token);
                }
            }
        }
    }
    set
}

fn map_executor_error(kind: &str) -> StatusCode {
    match kind {
        "timeout" | "request_timeout" => StatusCode::GATEWAY_TIMEOUT,
        "invalid_url" | "response_too_large" => StatusCode::BAD_GATEWAY,
        _ => StatusCode::BAD_GATEWAY,
    }
}

fn empty_body() -> BoxedBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

fn full_body(bytes: Vec<u8>) -> BoxedBody {
    Full::new(Bytes::from(bytes)).map_err(|never| match never {}).boxed()
}

fn text_response(status: StatusCode, message: &str) -> Response<BoxedBody> {
    Response::builder()
        .status(status)
        .header("content-type", "text/plain")
        .body(full_body(message.as_bytes().to_vec()))
        .expect("valid response")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extra_hop_by_hop_names_parses_connection_header_list() {
        let mut headers = hyper::HeaderMap::new();
        headers.insert(CONNECTION, "X-Custom, Keep-Alive".parse().unwrap());
        let set = extra_hop_by_hop_names(&headers);
        assert!(set.contains("x-custom"));
        assert!(set.contains("keep-alive"));
    }

    #[test]
    fn request_headers_to_tunnel_strips_hop_by_hop() {
        let mut headers = hyper::HeaderMap::new();
        headers.insert(CONNECTION, "close".parse().unwrap());
        headers.insert("transfer-encoding", "chunked".parse().unwrap());
        headers.insert("x-trace", "abc".parse().unwrap());
        let converted = request_headers_to_tunnel(&headers);
        assert!(!converted.contains_key("connection"));
        assert!(!converted.contains_key("transfer-encoding"));
        assert_eq!(converted.get("x-trace").unwrap(), &vec!["abc".to_string()]);
    }

    #[test]
    fn map_executor_error_treats_timeouts_as_504() {
        assert_eq!(map_executor_error("request_timeout"), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(map_executor_error("invalid_url"), StatusCode::BAD_GATEWAY);
    }
}
