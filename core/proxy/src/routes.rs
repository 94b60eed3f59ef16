//! HTTP surface: file serving, the OAuth callback and a health check.

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::Deserialize;
use std::future::Future;
use std::io;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::io::ReaderStream;
use tracing::{info, warn};

use cloudshelf_common::{CallerIdentity, Error, FileId};
use cloudshelf_remote::TokenManager;

use crate::service::{status_for, FileProxy, ServeBody, ServeResponse};

/// Header carrying the caller identity, set by the host's auth front.
pub const CALLER_HEADER: &str = "x-caller-identity";

/// RFC 5987 `attr-char` set: everything else is percent-encoded.
const FILENAME_ESCAPE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'!')
    .remove(b'#')
    .remove(b'$')
    .remove(b'&')
    .remove(b'+')
    .remove(b'-')
    .remove(b'.')
    .remove(b'^')
    .remove(b'_')
    .remove(b'`')
    .remove(b'|')
    .remove(b'~');

/// Shared state of the HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub proxy: Arc<FileProxy>,
    pub tokens: Arc<TokenManager>,
}

/// Build the router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/files/{file_id}", get(serve_file))
        .route("/oauth/callback", get(oauth_callback))
        .route("/health", get(health))
        .with_state(state)
}

/// Serve the router on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!("Serving files on http://{}", addr);
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn health() -> &'static str {
    "ok"
}

async fn serve_file(
    State(app): State<AppState>,
    Path(file_id): Path<i64>,
    headers: HeaderMap,
) -> Response {
    let caller = headers
        .get(CALLER_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(CallerIdentity::new)
        .unwrap_or_else(CallerIdentity::anonymous);
    let range = headers
        .get(header::RANGE)
        .and_then(|value| value.to_str().ok());

    let served = app.proxy.serve(FileId(file_id), &caller, range).await;
    into_http(served)
}

fn into_http(served: ServeResponse) -> Response {
    let status = StatusCode::from_u16(served.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    let mut headers = HeaderMap::new();
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(served.content_length));
    if let Some(value) = served
        .content_type
        .as_deref()
        .and_then(|v| HeaderValue::from_str(v).ok())
    {
        headers.insert(header::CONTENT_TYPE, value);
    }
    if let Some(value) = served
        .content_range
        .as_deref()
        .and_then(|v| HeaderValue::from_str(v).ok())
    {
        headers.insert(header::CONTENT_RANGE, value);
    }
    if let Some(seconds) = served.retry_after {
        headers.insert(header::RETRY_AFTER, HeaderValue::from(seconds));
    }
    if let Some(value) = served
        .file_name
        .as_deref()
        .and_then(|name| HeaderValue::from_str(&content_disposition(name)).ok())
    {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }

    let body = match served.body {
        ServeBody::Empty => Body::empty(),
        ServeBody::Bytes(data) => Body::from(data),
        ServeBody::Blob(reader) => Body::from_stream(ReaderStream::new(reader)),
    };

    (status, headers, body).into_response()
}

/// `Content-Disposition: inline` with an ASCII fallback and the exact
/// name in RFC 5987 form.
pub fn content_disposition(name: &str) -> String {
    let fallback: String = name
        .chars()
        .map(|c| {
            if (c.is_ascii_graphic() && c != '"' && c != '\\') || c == ' ' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!(
        "inline; filename=\"{}\"; filename*=UTF-8''{}",
        fallback,
        utf8_percent_encode(name, FILENAME_ESCAPE)
    )
}

#[derive(Debug, Deserialize)]
struct CallbackParams {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
}

async fn oauth_callback(
    State(app): State<AppState>,
    Query(params): Query<CallbackParams>,
) -> (StatusCode, String) {
    if let Some(error) = params.error {
        warn!("Authorization was denied: {}", error);
        return (StatusCode::BAD_REQUEST, format!("Authorization was denied: {}", error));
    }
    let (Some(code), Some(nonce)) = (params.code, params.state) else {
        return (
            StatusCode::BAD_REQUEST,
            "Missing code or state parameter".to_string(),
        );
    };

    match app.tokens.complete_authorization(&code, &nonce).await {
        Ok(()) => (
            StatusCode::OK,
            "Authorization complete. You can close this window.".to_string(),
        ),
        Err(e @ (Error::Auth(_) | Error::Validation(_))) => {
            (StatusCode::BAD_REQUEST, e.to_string())
        }
        Err(e) => (
            StatusCode::from_u16(status_for(&e)).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            e.to_string(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Harness;
    use cloudshelf_common::{BackoffConfig, BackoffExecutor, Credential, CredentialState};
    use cloudshelf_remote::MemoryTokenEndpoint;
    use std::net::SocketAddr;
    use tokio::sync::oneshot;

    struct Running {
        addr: SocketAddr,
        stop: oneshot::Sender<()>,
        task: tokio::task::JoinHandle<io::Result<()>>,
    }

    impl Running {
        fn url(&self, path: &str) -> String {
            format!("http://{}{}", self.addr, path)
        }

        async fn stop(self) {
            let _ = self.stop.send(());
            self.task.await.unwrap().unwrap();
        }
    }

    async fn start(state: AppState) -> Running {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop, stopped) = oneshot::channel::<()>();
        let task = tokio::spawn(serve(listener, state, async {
            let _ = stopped.await;
        }));
        Running { addr, stop, task }
    }

    fn state(h: &Harness) -> AppState {
        AppState {
            proxy: h.proxy.clone(),
            tokens: h.tokens.clone(),
        }
    }

    #[tokio::test]
    async fn test_health() {
        let h = Harness::new().await;
        let server = start(state(&h)).await;

        let response = reqwest::get(server.url("/health")).await.unwrap();
        assert_eq!(response.status().as_u16(), 200);
        assert_eq!(response.text().await.unwrap(), "ok");

        server.stop().await;
    }

    #[tokio::test]
    async fn test_file_headers_and_range() {
        let h = Harness::new().await;
        let data: Vec<u8> = (0..1000u32).map(|i| (i % 256) as u8).collect();
        let file = h.synced_file("Rechnung März.pdf", &data);
        h.host.grant("alice", file.id);
        let server = start(state(&h)).await;
        let client = reqwest::Client::new();

        let url = server.url(&format!("/files/{}", file.id));
        // First request fills the cache, second streams from it.
        for _ in 0..2 {
            let response = client
                .get(&url)
                .header("X-Caller-Identity", "alice")
                .header("Range", "bytes=100-199")
                .send()
                .await
                .unwrap();

            assert_eq!(response.status().as_u16(), 206);
            let headers = response.headers();
            assert_eq!(headers["content-range"], "bytes 100-199/1000");
            assert_eq!(headers["content-length"], "100");
            assert_eq!(headers["accept-ranges"], "bytes");
            assert_eq!(headers["content-type"], "application/pdf");
            assert_eq!(
                headers["content-disposition"],
                "inline; filename=\"Rechnung M_rz.pdf\"; filename*=UTF-8''Rechnung%20M%C3%A4rz.pdf"
            );
            assert_eq!(response.bytes().await.unwrap().to_vec(), data[100..200].to_vec());
        }

        server.stop().await;
    }

    #[tokio::test]
    async fn test_file_denied_and_missing() {
        let h = Harness::new().await;
        let file = h.synced_file("a.pdf", b"x");
        let server = start(state(&h)).await;
        let client = reqwest::Client::new();

        let response = client
            .get(server.url(&format!("/files/{}", file.id)))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 403);

        h.host.allow_all();
        let response = client.get(server.url("/files/999")).send().await.unwrap();
        assert_eq!(response.status().as_u16(), 404);

        let log = h.host.access_log();
        assert_eq!(log[0].caller, CallerIdentity::anonymous());
        server.stop().await;
    }

    #[tokio::test]
    async fn test_unavailable_sets_retry_after() {
        let h = Harness::new().await;
        h.host.allow_all();
        let file = h.synced_file("a.pdf", b"x");
        h.remote
            .inject_failures(3, cloudshelf_common::RemoteError::server("down"));
        let server = start(state(&h)).await;

        let response = reqwest::get(server.url(&format!("/files/{}", file.id)))
            .await
            .unwrap();

        assert_eq!(response.status().as_u16(), 503);
        assert_eq!(response.headers()["retry-after"], "30");
        server.stop().await;
    }

    #[tokio::test]
    async fn test_oauth_callback() {
        let h = Harness::new().await;
        let tokens = Arc::new(TokenManager::new(
            Credential::new("main", "client", "secret"),
            Arc::new(MemoryTokenEndpoint::new()),
            BackoffExecutor::new(BackoffConfig::new(1)),
        ));
        let server = start(AppState {
            proxy: h.proxy.clone(),
            tokens: tokens.clone(),
        })
        .await;

        let (_, nonce) = tokens
            .request_authorization(&server.url("/oauth/callback"))
            .await
            .unwrap();

        let response = reqwest::get(server.url("/oauth/callback?code=abc&state=forged"))
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 400);
        assert_eq!(tokens.snapshot().await.state, CredentialState::Pending);

        let response = reqwest::get(server.url("/oauth/callback?error=access_denied"))
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 400);

        let callback = format!("/oauth/callback?code=abc&state={}", nonce);
        let response = reqwest::get(server.url(&callback)).await.unwrap();
        assert_eq!(response.status().as_u16(), 200);
        assert_eq!(tokens.snapshot().await.state, CredentialState::Authorized);

        server.stop().await;
    }

    #[test]
    fn test_content_disposition_plain_name() {
        assert_eq!(
            content_disposition("scan.pdf"),
            "inline; filename=\"scan.pdf\"; filename*=UTF-8''scan.pdf"
        );
    }
}
