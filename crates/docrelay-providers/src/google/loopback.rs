//! Browser + loopback listener grant surface.
//!
//! The consent page is opened in the system browser and Google redirects to
//! `http://127.0.0.1:<port>/callback`. Each callback request is reported as a
//! navigation and its connection is held open until the flow closes the
//! surface, so the browser tab shows the final outcome. A browser tab closed
//! by the user cannot be observed from here; the surface reports itself
//! closed once `callback_timeout` passes without the flow finishing.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::endpoint::BoxFuture;
use crate::error::{ProviderError, ProviderResult};
use crate::surface::{GrantSurface, SurfaceEvent, SurfaceHandle, SurfaceOutcome, UrlBuilder};

use super::config::GoogleConfig;

const MAX_REQUEST_HEAD: usize = 8 * 1024;
const REQUEST_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Grant surface backed by the system browser and a loopback listener.
#[derive(Debug, Clone)]
pub struct LoopbackSurface {
    port_range: (u16, u16),
    callback_timeout: Duration,
    open_browser: bool,
}

impl LoopbackSurface {
    pub fn new(port_range: (u16, u16), callback_timeout: Duration) -> Self {
        Self {
            port_range,
            callback_timeout,
            open_browser: true,
        }
    }

    pub fn from_config(config: &GoogleConfig) -> Self {
        Self::new(config.loopback_port_range, config.callback_timeout)
            .with_open_browser(config.open_browser)
    }

    /// When false, the consent URL is only logged.
    pub fn with_open_browser(mut self, open_browser: bool) -> Self {
        self.open_browser = open_browser;
        self
    }
}

impl GrantSurface for LoopbackSurface {
    fn open<'a>(&'a self, url_for: UrlBuilder<'a>) -> BoxFuture<'a, ProviderResult<SurfaceHandle>> {
        Box::pin(async move {
            let (listener, port) = bind_loopback(self.port_range).await?;
            let redirect_uri = format!("http://127.0.0.1:{port}/callback");
            let url = url_for(&redirect_uri);

            info!(%url, "Open this URL to authorize docrelay");
            if self.open_browser {
                if let Err(e) = open::that(&url) {
                    warn!(error = %e, "Failed to open browser");
                }
            }

            let (events_tx, events_rx) = mpsc::channel(8);
            let (close_tx, close_rx) = oneshot::channel();
            tokio::spawn(serve(
                listener,
                port,
                events_tx,
                close_rx,
                self.callback_timeout,
            ));
            Ok(SurfaceHandle::new(redirect_uri, events_rx, close_tx))
        })
    }
}

async fn bind_loopback((start, end): (u16, u16)) -> ProviderResult<(TcpListener, u16)> {
    for port in start..=end {
        let Ok(listener) = TcpListener::bind(("127.0.0.1", port)).await else {
            continue;
        };
        let bound = listener
            .local_addr()
            .map_err(|e| ProviderError::internal("loopback listener has no address").with_source(e))?
            .port();
        debug!(port = bound, "Bound loopback listener");
        return Ok((listener, bound));
    }
    Err(ProviderError::configuration(format!(
        "no available loopback port in range {start}-{end}"
    )))
}

async fn serve(
    listener: TcpListener,
    port: u16,
    events: mpsc::Sender<SurfaceEvent>,
    mut close_rx: oneshot::Receiver<SurfaceOutcome>,
    callback_timeout: Duration,
) {
    let deadline = tokio::time::sleep(callback_timeout);
    tokio::pin!(deadline);
    let mut waiting: Vec<TcpStream> = Vec::new();

    let outcome = loop {
        tokio::select! {
            outcome = &mut close_rx => {
                break outcome.unwrap_or_else(|_| SurfaceOutcome::Failed("authorization abandoned".into()));
            }
            () = &mut deadline => {
                debug!("Loopback surface timed out");
                let _ = events.send(SurfaceEvent::Closed).await;
                break SurfaceOutcome::Failed("timed out waiting for authorization".into());
            }
            accepted = listener.accept() => {
                let Ok((mut stream, _)) = accepted else { continue };
                match read_request_target(&mut stream).await {
                    Some(target) if target.starts_with("/callback") => {
                        let url = format!("http://127.0.0.1:{port}{target}");
                        if events.send(SurfaceEvent::Navigated(url)).await.is_err() {
                            break SurfaceOutcome::Failed("authorization abandoned".into());
                        }
                        waiting.push(stream);
                    }
                    _ => respond(&mut stream, "404 Not Found", "<h1>Not found</h1>").await,
                }
            }
        }
    };

    let (status, page) = match &outcome {
        SurfaceOutcome::Authorized => (
            "200 OK",
            "<h1>Authorization complete</h1><p>You can close this window.</p>".to_string(),
        ),
        SurfaceOutcome::Failed(reason) => (
            "400 Bad Request",
            format!(
                "<h1>Authorization failed</h1><p>{}</p><p>You can close this window.</p>",
                escape_html(reason)
            ),
        ),
    };
    for mut stream in waiting {
        respond(&mut stream, status, &page).await;
    }
}

/// Reads the request head and returns the request target of a GET.
async fn read_request_target(stream: &mut TcpStream) -> Option<String> {
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    let read = async {
        while !head.windows(4).any(|w| w == b"\r\n\r\n") && head.len() < MAX_REQUEST_HEAD {
            let n = stream.read(&mut buf).await.ok()?;
            if n == 0 {
                break;
            }
            head.extend_from_slice(&buf[..n]);
        }
        Some(())
    };
    tokio::time::timeout(REQUEST_READ_TIMEOUT, read).await.ok()??;

    let head = String::from_utf8_lossy(&head);
    let mut parts = head.lines().next()?.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some("GET"), Some(target)) => Some(target.to_string()),
        _ => None,
    }
}

async fn respond(stream: &mut TcpStream, status: &str, body: &str) {
    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: text/html; charset=utf-8\r\n\
         Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn surface(timeout: Duration) -> LoopbackSurface {
        LoopbackSurface::new((0, 0), timeout).with_open_browser(false)
    }

    async fn get(redirect_uri: &str, path: &str) -> TcpStream {
        let addr = redirect_uri
            .trim_start_matches("http://")
            .trim_end_matches("/callback")
            .to_string();
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!("GET {path} HTTP/1.1\r\nHost: 127.0.0.1\r\n\r\n");
        stream.write_all(request.as_bytes()).await.unwrap();
        stream
    }

    async fn read_all(mut stream: TcpStream) -> String {
        let mut out = String::new();
        stream.read_to_string(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn callback_is_reported_and_answered_on_close() {
        let surface = surface(Duration::from_secs(30));
        let mut handle = surface
            .open(Box::new(|redirect: &str| format!("https://consent?redirect={redirect}")))
            .await
            .unwrap();
        assert!(handle.redirect_uri().starts_with("http://127.0.0.1:"));

        let redirect = handle.redirect_uri().to_string();
        let stream = get(&redirect, "/callback?code=4%2Fabc&state=xyz").await;

        let event = handle.next_event().await;
        assert_eq!(
            event,
            SurfaceEvent::Navigated(format!("{redirect}?code=4%2Fabc&state=xyz"))
        );

        handle.close(SurfaceOutcome::Authorized);
        let response = read_all(stream).await;
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.contains("Authorization complete"));
    }

    #[tokio::test]
    async fn failure_page_escapes_reason() {
        let surface = surface(Duration::from_secs(30));
        let mut handle = surface.open(Box::new(|r: &str| r.to_string())).await.unwrap();
        let stream = get(handle.redirect_uri(), "/callback?error=access_denied").await;
        handle.next_event().await;

        handle.close(SurfaceOutcome::Failed("<denied>".into()));
        let response = read_all(stream).await;
        assert!(response.starts_with("HTTP/1.1 400"));
        assert!(response.contains("&lt;denied&gt;"));
    }

    #[tokio::test]
    async fn other_paths_are_not_reported() {
        let surface = surface(Duration::from_millis(300));
        let mut handle = surface.open(Box::new(|r: &str| r.to_string())).await.unwrap();

        let response = read_all(get(handle.redirect_uri(), "/favicon.ico").await).await;
        assert!(response.starts_with("HTTP/1.1 404"));
        assert_eq!(handle.next_event().await, SurfaceEvent::Closed);
    }

    #[tokio::test]
    async fn surface_closes_after_timeout() {
        let surface = surface(Duration::from_millis(50));
        let mut handle = surface.open(Box::new(|r: &str| r.to_string())).await.unwrap();
        assert_eq!(handle.next_event().await, SurfaceEvent::Closed);
    }

    #[tokio::test]
    async fn url_builder_receives_redirect_uri() {
        let surface = surface(Duration::from_millis(50));
        let (tx, rx) = std::sync::mpsc::channel();
        let handle = surface
            .open(Box::new(move |r: &str| {
                tx.send(r.to_string()).unwrap();
                String::new()
            }))
            .await
            .unwrap();
        assert_eq!(rx.recv().unwrap(), handle.redirect_uri());
    }
}
