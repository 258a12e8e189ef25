use crate::http::proxy::{connect_tunnel, select_route, Route};
use crate::http::request::{next_hop, Hop, RequestTemplate};
use crate::http::resolver::CoalescingResolver;
use crate::http::traced_io::TracedIo;
use crate::timing::{Checkpoints, ProbeRecorder, ProbeSlot};
use anyhow::Context;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use http::header::LOCATION;
use http::{HeaderValue, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use rustls::{ClientConfig, HandshakeKind};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use url::Url;

const HOP_TIMEOUT: Duration = Duration::from_secs(30);

/// What the driver learns about a completed request. The body has been
/// drained by the time this is returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeResponse {
    pub status: u16,
    pub tls_used: bool,
    pub tls_resumed: bool,
}

/// Executes the probed request, invoking the recorder's checkpoints as the
/// request progresses.
pub trait Transport {
    fn execute<'a>(
        &'a mut self,
        recorder: &'a ProbeRecorder,
    ) -> BoxFuture<'a, Result<ProbeResponse, anyhow::Error>>;
}

#[derive(Debug, Clone)]
pub struct TransportSettings {
    pub max_redirects: usize,
    pub proxy: Option<crate::cli::app_config::Proxy>,
    pub noproxy: bool,
}

trait Io: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Io for T {}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Origin {
    scheme: String,
    host: String,
    port: u16,
}

impl Origin {
    fn of(url: &Url) -> Result<Self, anyhow::Error> {
        Ok(Origin {
            scheme: url.scheme().to_string(),
            host: url.host_str().ok_or(anyhow!("No host in {}", url))?.to_string(),
            port: url
                .port_or_known_default()
                .ok_or(anyhow!("No port for {}", url))?,
        })
    }

    fn is_https(&self) -> bool {
        self.scheme == "https"
    }

    /// Host without the brackets `Url` keeps around IPv6 literals.
    fn bare_host(&self) -> &str {
        self.host.trim_start_matches('[').trim_end_matches(']')
    }
}

struct Connection {
    origin: Origin,
    sender: http1::SendRequest<Full<Bytes>>,
    slot: ProbeSlot,
    absolute_form: bool,
    local_addr: String,
    remote_addr: String,
    tls_resumed: Option<bool>,
}

/// HTTP/1.1 transport that keeps one idle connection per origin between
/// probes, so every hop of a redirect chain can be reused.
pub struct HttpTransport {
    template: RequestTemplate,
    settings: TransportSettings,
    tls_config: Arc<ClientConfig>,
    resolver: CoalescingResolver,
    idle: HashMap<Origin, Connection>,
}

impl HttpTransport {
    pub fn new(
        template: RequestTemplate,
        settings: TransportSettings,
        tls_config: Arc<ClientConfig>,
    ) -> Self {
        Self {
            template,
            settings,
            tls_config,
            resolver: CoalescingResolver::new(),
            idle: HashMap::new(),
        }
    }

    async fn follow(&mut self, recorder: &ProbeRecorder) -> Result<ProbeResponse, anyhow::Error> {
        let mut hop = self.template.first_hop();
        let mut redirects = 0;
        loop {
            let (response, location) = self.round_trip(&hop, recorder).await?;
            if redirects >= self.settings.max_redirects {
                return Ok(response);
            }
            let status = StatusCode::from_u16(response.status)?;
            match next_hop(&hop, status, location.as_ref())? {
                Some(next) => {
                    redirects += 1;
                    debug!(
                        "Redirecting to: {} ({}/{})",
                        next.url, redirects, self.settings.max_redirects
                    );
                    recorder.begin_hop();
                    hop = next;
                }
                None => return Ok(response),
            }
        }
    }

    async fn round_trip(
        &mut self,
        hop: &Hop,
        recorder: &ProbeRecorder,
    ) -> Result<(ProbeResponse, Option<HeaderValue>), anyhow::Error> {
        let origin = Origin::of(&hop.url)?;
        recorder.connection_requested();
        let (mut conn, reused) = match self.take_idle(&origin).await {
            Some(conn) => (conn, true),
            None => (self.dial(&origin, recorder).await?, false),
        };
        conn.slot.attach(recorder);
        recorder.connection_obtained(reused, &conn.local_addr, &conn.remote_addr);

        let result = timeout(HOP_TIMEOUT, send(&mut conn, &self.template, hop))
            .await
            .context("Request timed out after 30 seconds")
            .and_then(|r| r);
        conn.slot.detach();

        let (status, location) = result?;
        let tls_used = conn.tls_resumed.is_some();
        let tls_resumed = conn.tls_resumed.unwrap_or(false);
        recorder.set_status(status.as_u16());
        recorder.set_tls(tls_used, tls_resumed);

        if conn.sender.is_closed() {
            debug!("Connection to {}:{} closed by peer", origin.host, origin.port);
        } else {
            self.put_idle(conn);
        }
        Ok((
            ProbeResponse {
                status: status.as_u16(),
                tls_used,
                tls_resumed,
            },
            location,
        ))
    }

    /// Parks `conn` for the next request to its origin. At most one
    /// connection per hop of a full redirect chain is kept.
    fn put_idle(&mut self, conn: Connection) {
        let limit = self.settings.max_redirects + 1;
        if !self.idle.contains_key(&conn.origin) && self.idle.len() >= limit {
            if let Some(stale) = self.idle.keys().next().cloned() {
                debug!("Dropping idle connection to {}:{}", stale.host, stale.port);
                self.idle.remove(&stale);
            }
        }
        self.idle.insert(conn.origin.clone(), conn);
    }

    async fn take_idle(&mut self, origin: &Origin) -> Option<Connection> {
        let mut conn = self.idle.remove(origin)?;
        match conn.sender.ready().await {
            Ok(()) => Some(conn),
            Err(e) => {
                debug!("Idle connection unusable: {}", e);
                None
            }
        }
    }

    async fn dial(
        &self,
        origin: &Origin,
        recorder: &ProbeRecorder,
    ) -> Result<Connection, anyhow::Error> {
        let route = select_route(
            self.settings.proxy.as_ref(),
            self.settings.noproxy,
            &origin.scheme,
            origin.bare_host(),
        );
        let (dial_host, dial_port) = match &route {
            Route::Direct => (origin.bare_host().to_string(), origin.port),
            Route::Proxy(addr) => split_host_port(addr)?,
        };

        let addrs: Vec<SocketAddr> = match dial_host.parse::<IpAddr>() {
            Ok(ip) => vec![SocketAddr::new(ip, dial_port)],
            Err(_) => self.resolver.resolve(&dial_host, dial_port, recorder).await?,
        };

        recorder.connect_started();
        let stream = timeout(HOP_TIMEOUT, TcpStream::connect(&addrs[..]))
            .await
            .context("Connect timed out after 30 seconds")?
            .with_context(|| format!("Couldn't connect to {}:{}", dial_host, dial_port))?;
        recorder.connect_done();
        stream.set_nodelay(true)?;
        let local_addr = stream.local_addr()?.to_string();
        let remote_addr = stream.peer_addr()?.to_string();
        debug!("Connected {} -> {}", local_addr, remote_addr);

        let stream = match (&route, origin.is_https()) {
            (Route::Proxy(addr), true) => {
                connect_tunnel(stream, addr, origin.bare_host(), origin.port).await?
            }
            _ => stream,
        };

        let (io, tls_resumed): (Box<dyn Io>, Option<bool>) = if origin.is_https() {
            let domain = pki_types::ServerName::try_from(origin.bare_host())
                .map_err(|e| anyhow!("Invalid TLS server name {}: {}", origin.host, e))?
                .to_owned();
            let tls = TlsConnector::from(self.tls_config.clone())
                .connect(domain, stream)
                .await
                .with_context(|| format!("TLS handshake with {} failed", origin.host))?;
            let (_, session) = tls.get_ref();
            let resumed = session.handshake_kind() == Some(HandshakeKind::Resumed);
            debug!(
                "TLS {:?} {:?} resumed={}",
                session.protocol_version(),
                session.negotiated_cipher_suite().map(|s| s.suite()),
                resumed
            );
            (Box::new(tls), Some(resumed))
        } else {
            (Box::new(stream), None)
        };

        let slot = ProbeSlot::default();
        let traced = TracedIo::new(io, slot.clone());
        let (sender, connection) = http1::handshake(TokioIo::new(traced)).await?;
        let peer = remote_addr.clone();
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                debug!("Connection to {} failed: {:?}", peer, err);
            }
        });

        Ok(Connection {
            origin: origin.clone(),
            sender,
            slot,
            absolute_form: matches!(route, Route::Proxy(_)) && !origin.is_https(),
            local_addr,
            remote_addr,
            tls_resumed,
        })
    }
}

async fn send(
    conn: &mut Connection,
    template: &RequestTemplate,
    hop: &Hop,
) -> Result<(StatusCode, Option<HeaderValue>), anyhow::Error> {
    let request = template.build(hop, conn.absolute_form)?;
    debug!("> {} {} {:?}", request.method(), request.uri(), request.version());
    for (key, value) in request.headers().iter() {
        trace!("> {}: {:?}", key, value);
    }
    let response = conn
        .sender
        .send_request(request)
        .await
        .context("Failed to execute request")?;
    let status = response.status();
    debug!("< {:?} {}", response.version(), status);
    let location = response.headers().get(LOCATION).cloned();
    let body = response
        .into_body()
        .collect()
        .await
        .context("Error reading response body")?
        .to_bytes();
    trace!("Read {} body bytes", body.len());
    Ok((status, location))
}

fn split_host_port(addr: &str) -> Result<(String, u16), anyhow::Error> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or(anyhow!("Proxy address '{}' has no port", addr))?;
    let port = port
        .parse()
        .with_context(|| format!("Invalid proxy port in '{}'", addr))?;
    Ok((
        host.trim_start_matches('[').trim_end_matches(']').to_string(),
        port,
    ))
}

impl Transport for HttpTransport {
    fn execute<'a>(
        &'a mut self,
        recorder: &'a ProbeRecorder,
    ) -> BoxFuture<'a, Result<ProbeResponse, anyhow::Error>> {
        self.follow(recorder).boxed()
    }
}
