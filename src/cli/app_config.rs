use clap::{ArgAction, Parser};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

#[derive(Parser, Debug, Clone)]
#[command(
    author,
    version = concat!("version ", env!("CARGO_PKG_VERSION"), "."),
    about = "Repeats an HTTP request and breaks down where its latency goes",
    long_about = None
)]
pub struct Cli {
    /// URL to connect to
    #[arg(value_name = "URL")]
    pub url: String,
    /// Number of times to repeat connecting
    #[arg(short = 'r', long = "repetitions", default_value_t = 2)]
    pub repetitions: usize,
    /// Maximum number of redirects to follow
    #[arg(long = "max-redirs", value_name = "num", default_value_t = 10)]
    pub max_redirects: usize,
    /// Skip SSL verification
    #[arg(short = 'k', long = "insecure")]
    pub insecure: bool,
    /// Data to send
    #[arg(short = 'd', long = "data", value_name = "data")]
    pub data: Option<String>,
    /// HTTP method
    #[arg(short = 'X', long = "request", value_name = "method", default_value = "GET")]
    pub method: String,
    /// HTTP proxy to use
    #[arg(short = 'x', long = "proxy", value_name = "[protocol://]host[:port]")]
    pub proxy: Option<Proxy>,
    /// Ignore proxy environment variables
    #[arg(long = "noproxy")]
    pub noproxy: bool,
    /// Time to wait between connections
    #[arg(
        short = 'w',
        long = "wait",
        value_name = "duration",
        default_value = "5s",
        value_parser = humantime::parse_duration
    )]
    pub wait: Duration,
    /// Additional header
    #[arg(short = 'H', long = "header", value_name = "name:value")]
    pub headers: Vec<Header>,
    /// CA certificates to trust instead of the bundled roots
    #[arg(short = 'c', long = "cacert", value_name = "pem file")]
    pub cacert: Option<PathBuf>,
    /// Skip failed repetitions instead of stopping the run
    #[arg(long = "keep-going")]
    pub keep_going: bool,
    /// Make the operation more talkative
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    pub verbosity: u8,
}

/// A `name:value` request header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: String,
}

impl FromStr for Header {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 2 {
            return Err(String::from("expected 2 strings separated by a :"));
        }
        Ok(Header {
            name: parts[0].trim().to_string(),
            value: parts[1].trim_start().to_string(),
        })
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.value)
    }
}

/// Proxy given on the command line. A bare `host:port` means `http://host:port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proxy {
    pub url: Url,
}

impl Proxy {
    /// `host:port` to dial.
    pub fn address(&self) -> Option<String> {
        let host = self.url.host_str()?;
        let port = self.url.port_or_known_default()?;
        Some(format!("{}:{}", host, port))
    }
}

impl FromStr for Proxy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = if s.starts_with("http://") || s.starts_with("https://") {
            s.to_string()
        } else {
            format!("http://{}", s)
        };
        let url = Url::parse(&value).map_err(|e| format!("invalid proxy '{}': {}", s, e))?;
        if url.host_str().is_none() {
            return Err(format!("invalid proxy '{}': no host", s));
        }
        Ok(Proxy { url })
    }
}

impl fmt::Display for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cli = Cli::try_parse_from(["reuse", "https://example.com"]).unwrap();
        assert_eq!(2, cli.repetitions);
        assert_eq!(10, cli.max_redirects);
        assert_eq!("GET", cli.method);
        assert_eq!(Duration::from_secs(5), cli.wait);
        assert!(!cli.insecure);
        assert!(!cli.keep_going);
        assert!(cli.headers.is_empty());
        assert_eq!(None, cli.proxy);
    }

    #[test]
    fn test_all_options() {
        let cli = Cli::try_parse_from([
            "reuse",
            "-r",
            "5",
            "--max-redirs",
            "3",
            "-k",
            "-d",
            "a=b",
            "-X",
            "POST",
            "-x",
            "127.0.0.1:3128",
            "-w",
            "250ms",
            "-H",
            "Accept: text/plain",
            "-H",
            "X-Trace:1",
            "-vv",
            "http://example.com/path",
        ])
        .unwrap();
        assert_eq!(5, cli.repetitions);
        assert_eq!(3, cli.max_redirects);
        assert!(cli.insecure);
        assert_eq!(Some("a=b".to_string()), cli.data);
        assert_eq!("POST", cli.method);
        assert_eq!(Duration::from_millis(250), cli.wait);
        assert_eq!(2, cli.headers.len());
        assert_eq!("Accept", cli.headers[0].name);
        assert_eq!("text/plain", cli.headers[0].value);
        assert_eq!(2, cli.verbosity);
        let proxy = cli.proxy.unwrap();
        assert_eq!("http", proxy.url.scheme());
        assert_eq!(Some("127.0.0.1:3128".to_string()), proxy.address());
        assert_eq!("http://example.com/path", cli.url);
    }

    #[test]
    fn test_header_needs_exactly_one_colon() {
        assert!("NoColon".parse::<Header>().is_err());
        assert!("Host: example.com:8080".parse::<Header>().is_err());
        let header: Header = "Name:Value".parse().unwrap();
        assert_eq!("Name:Value", header.to_string());
    }

    #[test]
    fn test_proxy_default_port() {
        let proxy: Proxy = "proxy.local".parse().unwrap();
        assert_eq!(Some("proxy.local:80".to_string()), proxy.address());
        let proxy: Proxy = "https://proxy.local".parse().unwrap();
        assert_eq!(Some("proxy.local:443".to_string()), proxy.address());
    }

    #[test]
    fn test_missing_url_is_rejected() {
        assert!(Cli::try_parse_from(["reuse"]).is_err());
    }
}
