use crate::cli::app_config::Proxy;
use hyper::Uri;
use hyper_util::client::legacy::connect::proxy::Tunnel;
use hyper_util::rt::TokioIo;
use std::future::{ready, Ready};
use std::io;
use std::task::{Context, Poll};
use tokio::net::TcpStream;
use tower_service::Service;

/// Where requests of one scheme should be sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Direct,
    /// `host:port` of an HTTP proxy.
    Proxy(String),
}

/// Picks the route for `scheme://host`. An explicit `--proxy` always wins;
/// otherwise the proxy environment variables apply unless disabled or
/// bypassed by `NO_PROXY`.
pub fn select_route(explicit: Option<&Proxy>, noproxy: bool, scheme: &str, host: &str) -> Route {
    if let Some(proxy) = explicit {
        return match proxy.address() {
            Some(addr) => Route::Proxy(addr),
            None => Route::Direct,
        };
    }
    if noproxy || should_bypass_proxy(Some(host)) {
        return Route::Direct;
    }
    match get_proxy_from_env(scheme) {
        Some(addr) => Route::Proxy(addr),
        None => Route::Direct,
    }
}

/// Read proxy address from environment variables.
///
/// Checks `HTTPS_PROXY`/`https_proxy` for HTTPS, `HTTP_PROXY`/`http_proxy`
/// otherwise, then `ALL_PROXY`/`all_proxy`. Only http(s) proxies are
/// supported; anything else yields `None`.
pub fn get_proxy_from_env(scheme: &str) -> Option<String> {
    let env_var = if scheme == "https" {
        std::env::var("HTTPS_PROXY")
            .or_else(|_| std::env::var("https_proxy"))
            .or_else(|_| std::env::var("ALL_PROXY"))
            .or_else(|_| std::env::var("all_proxy"))
            .ok()
    } else {
        std::env::var("HTTP_PROXY")
            .or_else(|_| std::env::var("http_proxy"))
            .or_else(|_| std::env::var("ALL_PROXY"))
            .or_else(|_| std::env::var("all_proxy"))
            .ok()
    }?;

    debug!("Proxy env var found for {}: {}", scheme, env_var);
    proxy_address(&env_var)
}

fn proxy_address(value: &str) -> Option<String> {
    if let Ok(url) = url::Url::parse(value) {
        match url.scheme() {
            "http" | "https" => {
                let host = url.host_str()?;
                let port = url.port_or_known_default()?;
                Some(format!("{}:{}", host, port))
            }
            // a bare "host:port" parses with the host as scheme
            _ if !value.contains("://") => Some(value.to_string()),
            _ => None,
        }
    } else {
        Some(value.to_string())
    }
}

/// Check if a host should bypass the proxy based on `NO_PROXY`.
///
/// Supports exact matches (`example.com`, `192.168.1.1`) and domain suffixes
/// (`.example.com`).
pub fn should_bypass_proxy(host: Option<&str>) -> bool {
    let host = match host {
        Some(h) => h,
        None => return false,
    };

    let no_proxy = match std::env::var("NO_PROXY").or_else(|_| std::env::var("no_proxy")) {
        Ok(val) => val,
        Err(_) => return false,
    };
    no_proxy_matches(&no_proxy, host)
}

fn no_proxy_matches(no_proxy: &str, host: &str) -> bool {
    for pattern in no_proxy.split(',') {
        let pattern = pattern.trim();
        if pattern.is_empty() {
            continue;
        }
        if pattern == "*" {
            return true;
        }
        if let Some(domain) = pattern.strip_prefix('.') {
            if host.ends_with(pattern) || host == domain {
                return true;
            }
        } else if host == pattern {
            return true;
        }
    }
    false
}

/// Hands an already dialed proxy connection to [`Tunnel`], so the dial itself
/// stays visible to the probe's checkpoints.
struct Preconnected(Option<TcpStream>);

impl Service<Uri> for Preconnected {
    type Response = TokioIo<TcpStream>;
    type Error = io::Error;
    type Future = Ready<Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _proxy: Uri) -> Self::Future {
        ready(self.0.take().map(TokioIo::new).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "proxy connection already used")
        }))
    }
}

/// Opens an HTTP CONNECT tunnel to `host:port` over `stream`, a connection
/// to the proxy at `proxy_addr`.
pub async fn connect_tunnel(
    stream: TcpStream,
    proxy_addr: &str,
    host: &str,
    port: u16,
) -> Result<TcpStream, anyhow::Error> {
    let proxy_dst: Uri = format!("http://{}", proxy_addr).parse()?;
    let target: Uri = format!("https://{}:{}", host, port).parse()?;
    let mut tunnel = Tunnel::new(proxy_dst, Preconnected(Some(stream)));
    let io = tunnel
        .call(target)
        .await
        .map_err(|e| anyhow!("CONNECT {}:{} through proxy {} failed: {}", host, port, proxy_addr, e))?;
    Ok(io.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_no_proxy_patterns() {
        assert!(no_proxy_matches("example.com", "example.com"));
        assert!(!no_proxy_matches("example.com", "www.example.com"));
        assert!(no_proxy_matches(".example.com", "www.example.com"));
        assert!(no_proxy_matches(".example.com", "example.com"));
        assert!(no_proxy_matches("localhost, 10.0.0.1", "10.0.0.1"));
        assert!(no_proxy_matches("*", "anything"));
        assert!(!no_proxy_matches("", "example.com"));
    }

    #[test]
    fn test_proxy_address_forms() {
        assert_eq!(Some("p:8080".to_string()), proxy_address("http://p:8080"));
        assert_eq!(Some("p:80".to_string()), proxy_address("http://p"));
        assert_eq!(Some("p:3128".to_string()), proxy_address("p:3128"));
        assert_eq!(None, proxy_address("socks5://p:1080"));
    }

    #[test]
    fn test_explicit_proxy_wins() {
        let proxy: Proxy = "10.1.1.1:3128".parse().unwrap();
        assert_eq!(
            Route::Proxy("10.1.1.1:3128".to_string()),
            select_route(Some(&proxy), true, "https", "example.com")
        );
    }

    #[tokio::test]
    async fn test_connect_tunnel_through_proxy() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = listener.local_addr().unwrap().to_string();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 512];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                request.extend_from_slice(&buf[..n]);
            }
            socket
                .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                .await
                .unwrap();
            String::from_utf8(request).unwrap()
        });

        let stream = TcpStream::connect(&proxy_addr).await.unwrap();
        connect_tunnel(stream, &proxy_addr, "example.com", 443)
            .await
            .unwrap();
        let request = server.await.unwrap();
        assert!(request.starts_with("CONNECT example.com:443 HTTP/1.1\r\n"));
    }
}
