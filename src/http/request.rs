use crate::cli::app_config::Cli;
use anyhow::Context;
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, HOST, LOCATION, USER_AGENT};
use http::{Method, Request, StatusCode, Uri};
use http_body_util::Full;
use std::str::FromStr;
use url::Url;

/// Everything needed to issue the probed request, hop after hop.
#[derive(Debug, Clone)]
pub struct RequestTemplate {
    pub method: Method,
    pub url: Url,
    pub headers: Vec<(HeaderName, HeaderValue)>,
    pub body: Option<Bytes>,
}

/// One concrete request: where it goes and what it carries.
#[derive(Debug, Clone)]
pub struct Hop {
    pub method: Method,
    pub url: Url,
    pub body: Option<Bytes>,
}

impl RequestTemplate {
    pub fn from_cli(cli: &Cli) -> Result<Self, anyhow::Error> {
        let url: Url = cli
            .url
            .parse()
            .with_context(|| format!("Failed to parse URL '{}'", cli.url))?;
        match url.scheme() {
            "http" | "https" => {}
            other => return Err(anyhow!("Unsupported scheme '{}' in {}", other, url)),
        }
        if url.host_str().is_none() {
            return Err(anyhow!("No host in {}", url));
        }
        let method = Method::from_str(&cli.method.to_uppercase())
            .with_context(|| format!("Invalid method '{}'", cli.method))?;
        let mut headers: Vec<(HeaderName, HeaderValue)> = Vec::with_capacity(cli.headers.len());
        for header in &cli.headers {
            let name = HeaderName::from_str(&header.name)
                .with_context(|| format!("header error: '{}'", header))?;
            let value = HeaderValue::from_str(&header.value)
                .with_context(|| format!("header error: '{}'", header))?;
            // a repeated -H replaces the earlier value
            match headers.iter_mut().find(|(n, _)| *n == name) {
                Some(existing) => existing.1 = value,
                None => headers.push((name, value)),
            }
        }
        Ok(RequestTemplate {
            method,
            url,
            headers,
            body: cli.data.clone().map(Bytes::from),
        })
    }

    pub fn first_hop(&self) -> Hop {
        Hop {
            method: self.method.clone(),
            url: self.url.clone(),
            body: self.body.clone(),
        }
    }

    /// Builds the request for `hop`. `absolute_form` is for plain HTTP sent
    /// through a forward proxy.
    pub fn build(&self, hop: &Hop, absolute_form: bool) -> Result<Request<Full<Bytes>>, anyhow::Error> {
        let uri: Uri = if absolute_form {
            hop.url.as_str().parse()?
        } else {
            let mut target = hop.url.path().to_string();
            if let Some(query) = hop.url.query() {
                target.push('?');
                target.push_str(query);
            }
            target.parse()?
        };

        let mut builder = Request::builder().method(hop.method.clone()).uri(uri);
        let has = |name: &HeaderName| self.headers.iter().any(|(n, _)| n == name);
        if !has(&HOST) {
            builder = builder.header(HOST, authority(&hop.url)?);
        }
        if !has(&USER_AGENT) {
            builder = builder.header(USER_AGENT, concat!("reuse/", env!("CARGO_PKG_VERSION")));
        }
        for (name, value) in &self.headers {
            builder = builder.header(name, value);
        }
        let body = hop.body.clone().unwrap_or_default();
        Ok(builder.body(Full::new(body))?)
    }
}

fn authority(url: &Url) -> Result<String, anyhow::Error> {
    let host = url.host_str().ok_or(anyhow!("No host in {}", url))?;
    Ok(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}

/// The hop a redirect response points to, or `None` when `status` is not a
/// followable redirect.
pub fn next_hop(
    hop: &Hop,
    status: StatusCode,
    location: Option<&HeaderValue>,
) -> Result<Option<Hop>, anyhow::Error> {
    let keep_method = match status {
        StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND | StatusCode::SEE_OTHER => false,
        StatusCode::TEMPORARY_REDIRECT | StatusCode::PERMANENT_REDIRECT => true,
        _ => return Ok(None),
    };
    let location = match location {
        Some(location) => location.to_str()?,
        None => return Ok(None),
    };
    let url = hop
        .url
        .join(location)
        .with_context(|| format!("Invalid redirect location '{}'", location))?;

    let next = if keep_method || hop.method == Method::HEAD {
        Hop {
            method: hop.method.clone(),
            url,
            body: hop.body.clone(),
        }
    } else {
        Hop {
            method: Method::GET,
            url,
            body: None,
        }
    };
    Ok(Some(next))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn template(args: &[&str]) -> RequestTemplate {
        let cli = Cli::try_parse_from(args).unwrap();
        RequestTemplate::from_cli(&cli).unwrap()
    }

    #[test]
    fn test_origin_form_request() {
        let template = template(&["reuse", "-H", "X-Probe: 1", "http://example.com:8080/a/b?c=d"]);
        let request = template.build(&template.first_hop(), false).unwrap();
        assert_eq!(Method::GET, request.method());
        assert_eq!("/a/b?c=d", request.uri().to_string());
        assert_eq!("example.com:8080", request.headers()[HOST]);
        assert_eq!("1", request.headers()["x-probe"]);
        assert!(request.headers().contains_key(USER_AGENT));
    }

    #[test]
    fn test_repeated_header_keeps_last_value() {
        let template = template(&["reuse", "-H", "X-Env: a", "-H", "x-env: b", "http://example.com/"]);
        let request = template.build(&template.first_hop(), false).unwrap();
        let values: Vec<_> = request.headers().get_all("x-env").iter().collect();
        assert_eq!(vec![&HeaderValue::from_static("b")], values);
    }

    #[test]
    fn test_header_overrides_default_host() {
        let template = template(&["reuse", "-H", "Host: other.example", "http://example.com/"]);
        let request = template.build(&template.first_hop(), false).unwrap();
        assert_eq!(1, request.headers().get_all(HOST).iter().count());
        assert_eq!("other.example", request.headers()[HOST]);
    }

    #[test]
    fn test_absolute_form_for_forward_proxy() {
        let template = template(&["reuse", "http://example.com/"]);
        let request = template.build(&template.first_hop(), true).unwrap();
        assert_eq!("http://example.com/", request.uri().to_string());
        assert_eq!("example.com", request.headers()[HOST]);
    }

    #[test]
    fn test_data_keeps_requested_method() {
        let template = template(&["reuse", "-d", "payload", "http://example.com/"]);
        assert_eq!(Method::GET, template.method);
        assert_eq!(Some(Bytes::from("payload")), template.body);
    }

    #[test]
    fn test_rejects_unsupported_scheme() {
        let cli = Cli::try_parse_from(["reuse", "ftp://example.com/"]).unwrap();
        assert!(RequestTemplate::from_cli(&cli).is_err());
    }

    #[test]
    fn test_redirect_rules() {
        let template = template(&["reuse", "-X", "POST", "-d", "x", "http://example.com/a"]);
        let hop = template.first_hop();
        let location = HeaderValue::from_static("/b");

        let see_other = next_hop(&hop, StatusCode::SEE_OTHER, Some(&location))
            .unwrap()
            .unwrap();
        assert_eq!(Method::GET, see_other.method);
        assert_eq!(None, see_other.body);
        assert_eq!("http://example.com/b", see_other.url.as_str());

        let temporary = next_hop(&hop, StatusCode::TEMPORARY_REDIRECT, Some(&location))
            .unwrap()
            .unwrap();
        assert_eq!(Method::POST, temporary.method);
        assert_eq!(Some(Bytes::from("x")), temporary.body);

        assert!(next_hop(&hop, StatusCode::OK, Some(&location)).unwrap().is_none());
        assert!(next_hop(&hop, StatusCode::FOUND, None).unwrap().is_none());
    }
}
