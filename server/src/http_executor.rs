//! Server HTTP executor (spec §4.6): runs one `http_request` envelope
//! against the real origin and produces exactly one `http_response`.

use std::str::FromStr;
use std::time::Duration;

use futures::StreamExt;
use reqwest::header::{HeaderMap as ReqwestHeaders, HeaderName, HeaderValue, HOST};
use reqwest::{Client, Method, Url};
use tunnel_proto::{HeaderMap as TunnelHeaders, HttpRequestPayload, HttpResponsePayload, HOP_BY_HOP_HEADERS};

const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Builds the shared pooled client (spec §4.6 step 2: "connection pool
/// per-origin, idle timeout >= 60s"). `reqwest` already pools
/// per-origin internally; one client instance is shared by every
/// executor task.
pub fn build_client() -> reqwest::Result<Client> {
    Client::builder()
        .pool_idle_timeout(POOL_IDLE_TIMEOUT)
        .use_rustls_tls()
        .build()
}

/// Execute one request and return the response envelope to send back.
/// Always returns `Ok`-shaped `HttpResponsePayload`; failures are
/// encoded as `error` fields per spec §4.6 step 6, never as an `Err`.
pub async fn execute(
    client: &Client,
    req: HttpRequestPayload,
    request_timeout: Duration,
    max_response_body: usize,
) -> HttpResponsePayload {
    let id = req.id.clone();

    let url = match Url::parse(&req.url) {
        Ok(u) if matches!(u.scheme(), "http" | "https") && u.host().is_some() => u,
        _ => return HttpResponsePayload::error(id, "invalid_url"),
    };

    let method = match Method::from_str(&req.method) {
        Ok(m) => m,
        Err(_) => return HttpResponsePayload::error(id, "invalid_method"),
    };

    let headers = match tunnel_headers_to_reqwest(&req.headers, &url) {
        Ok(h) => h,
        Err(_) => return HttpResponsePayload::error(id, "invalid_header"),
    };

    let send_fut = client
        .request(method, url)
        .headers(headers)
        .body(req.body)
        .timeout(request_timeout)
        .send();

    let resp = match send_fut.await {
        Ok(r) => r,
        Err(e) if e.is_timeout() => return HttpResponsePayload::error(id, "timeout"),
        Err(e) => return HttpResponsePayload::error(id, format!("transport_error:{e}")),
    };

    let status_code = resp.status().as_u16();
    let headers = reqwest_headers_to_tunnel(resp.headers());

    match read_body_capped(resp, max_response_body).await {
        Ok(body) => HttpResponsePayload {
            id,
            status_code,
            headers,
            body,
            error: None,
        },
        Err(BodyError::TooLarge) => HttpResponsePayload::error(id, "response_too_large"),
        Err(BodyError::Transport(e)) => HttpResponsePayload::error(id, format!("transport_error:{e}")),
    }
}

enum BodyError {
    TooLarge,
    Transport(reqwest::Error),
}

async fn read_body_capped(resp: reqwest::Response, max: usize) -> Result<Vec<u8>, BodyError> {
    let mut buf = Vec::new();
    let mut stream = resp.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(BodyError::Transport)?;
        if buf.len() + chunk.len() > max {
            return Err(BodyError::TooLarge);
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf)
}

fn tunnel_headers_to_reqwest(headers: &TunnelHeaders, url: &Url) -> Result<ReqwestHeaders, ()> {
    let mut out = ReqwestHeaders::new();
    for (name, values) in headers {
        let lower = name.to_ascii_lowercase();
        if HOP_BY_HOP_HEADERS.contains(&lower.as_str()) {
            continue;
        }
        let header_name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| ())?;
        for value in values {
            let header_value = HeaderValue::from_str(value).map_err(|_| ())?;
            out.append(header_name.clone(), header_value);
        }
    }
    // Host is driven by the target URL, not whatever the client sent (spec §4.6 step 3).
    if let Some(host) = url.host_str() {
        let host_value = match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };
        if let Ok(v) = HeaderValue::from_str(&host_value) {
            out.insert(HOST, v);
        }
    }
    Ok(out)
}

fn reqwest_headers_to_tunnel(headers: &ReqwestHeaders) -> TunnelHeaders {
    let mut out = TunnelHeaders::new();
    for (name, value) in headers {
        let lower = name.as_str().to_ascii_lowercase();
        if HOP_BY_HOP_HEADERS.contains(&lower.as_str()) {
            continue;
        }
        let value = value.to_str().unwrap_or_default().to_string();
        out.entry(name.as_str().to_string()).or_default().push(value);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn invalid_url_is_rejected_without_dialing() {
        let client = build_client().unwrap();
        let req = HttpRequestPayload {
            id: "r-1".to_string(),
            method: "GET".to_string(),
            url: "not-a-url".to_string(),
            headers: TunnelHeaders::new(),
            body: Vec::new(),
        };
        let resp = execute(&client, req, Duration::from_secs(1), 1024).await;
        assert_eq!(resp.error.as_deref(), Some("invalid_url"));
    }

    #[tokio::test]
    async fn unsupported_scheme_is_rejected() {
        let client = build_client().unwrap();
        let req = HttpRequestPayload {
            id: "r-2".to_string(),
            method: "GET".to_string(),
            url: "ftp://example.org/file".to_string(),
            headers: TunnelHeaders::new(),
            body: Vec::new(),
        };
        let resp = execute(&client, req, Duration::from_secs(1), 1024).await;
        assert_eq!(resp.error.as_deref(), Some("invalid_url"));
    }

    #[test]
    fn host_header_follows_target_url_not_client_header() {
        let mut headers = TunnelHeaders::new();
        headers.insert("host".to_string(), vec!["stale.example".to_string()]);
        let url = Url::parse("http://real.example:8080/path").unwrap();
        let out = tunnel_headers_to_reqwest(&headers, &url).unwrap();
        assert_eq!(out.get(HOST).unwrap(), "real.example:8080");
    }

    #[test]
    fn hop_by_hop_headers_are_stripped_both_ways() {
        let mut headers = TunnelHeaders::new();
        headers.insert("connection".to_string(), vec!["close".to_string()]);
        headers.insert("x-trace".to_string(), vec!["abc".to_string()]);
        let url = Url::parse("http://example.org/").unwrap();
        let out = tunnel_headers_to_reqwest(&headers, &url).unwrap();
        assert!(!out.contains_key("connection"));
        assert!(out.contains_key("x-trace"));
    }
}
