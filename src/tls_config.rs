use crate::error::Error;
use rustls::pki_types::CertificateDer;
use rustls::{ClientConfig, RootCertStore};
use rustls_pemfile::certs;
use std::fs::File;
use std::io::BufReader;

fn load_pem_certificates(path: &str) -> Result<Vec<CertificateDer<'static>>, Error> {
    let file = File::open(path).map_err(|e| Error::TlsCertificateLoad {
        path: path.to_string(),
        source: e,
    })?;
    let chain: Vec<CertificateDer<'static>> = certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| Error::TlsInvalidCertificate(format!("Failed to parse certificates: {e}")))?;

    if chain.is_empty() {
        return Err(Error::TlsInvalidCertificate(format!(
            "No certificates found in {path}"
        )));
    }
    Ok(chain)
}

/// Builds a rustls client configuration trusting the CA certificates found in
/// the PEM file at `ca_cert_path`.
pub fn load_tls_client_config(ca_cert_path: &str) -> Result<ClientConfig, Error> {
    let mut root_cert_store = RootCertStore::empty();
    for cert in load_pem_certificates(ca_cert_path)? {
        root_cert_store
            .add(cert)
            .map_err(|e| Error::TlsInvalidCertificate(e.to_string()))?;
    }

    let config = ClientConfig::builder()
        .with_root_certificates(root_cert_store)
        .with_no_client_auth();

    Ok(config)
}
