pub mod verifier;

use crate::tls::verifier::ProbeCertVerifier;
use anyhow::Context;
use rustls::crypto::ring::{default_provider, DEFAULT_CIPHER_SUITES};
use rustls::{ClientConfig, RootCertStore};
use std::path::Path;
use std::sync::Arc;

/// Builds the client configuration shared by every connection of a run.
///
/// Sharing it keeps one session cache, so later handshakes can resume.
pub fn client_config(
    insecure: bool,
    cacert: Option<&Path>,
) -> Result<Arc<ClientConfig>, anyhow::Error> {
    let mut root_store = RootCertStore::empty();
    if let Some(file_path) = cacert {
        let f = std::fs::File::open(file_path)
            .with_context(|| format!("Failed to open CA file {}", file_path.display()))?;
        let mut rd = std::io::BufReader::new(f);
        for cert in rustls_pemfile::certs(&mut rd) {
            root_store.add(cert?)?;
        }
    } else {
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    };

    let provider = Arc::new(rustls::crypto::CryptoProvider {
        cipher_suites: DEFAULT_CIPHER_SUITES.to_vec(),
        ..default_provider()
    });

    let verifier = ProbeCertVerifier::new(insecure, provider.clone(), &root_store)?;

    let mut tls_config = ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(rustls::DEFAULT_VERSIONS)?
        .with_root_certificates(root_store)
        .with_no_client_auth();
    tls_config
        .dangerous()
        .set_certificate_verifier(Arc::new(verifier));
    tls_config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(Arc::new(tls_config))
}
