use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;

/// Build a TLS acceptor backed by an ephemeral self-signed certificate.
///
/// A fresh certificate/key pair is generated on every call; encrypted
/// listeners regenerate their identity on each run.
pub fn ephemeral_acceptor(hosts: &[String]) -> crate::Result<TlsAcceptor> {
    let mut names = hosts.to_vec();
    if names.is_empty() {
        names.push("localhost".to_string());
    }

    let cert = rcgen::generate_simple_self_signed(names)
        .map_err(|e| crate::AnteaterError::Tls(e.to_string()))?;

    let cert_der = CertificateDer::from(
        cert.serialize_der()
            .map_err(|e| crate::AnteaterError::Tls(e.to_string()))?,
    );
    let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
        cert.serialize_private_key_der(),
    ));

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], key_der)
        .map_err(|e| crate::AnteaterError::Tls(e.to_string()))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_acceptor_for_ip_and_dns_names() {
        ephemeral_acceptor(&["127.0.0.1".to_string(), "localhost".to_string()]).unwrap();
    }

    #[test]
    fn empty_host_list_falls_back_to_localhost() {
        ephemeral_acceptor(&[]).unwrap();
    }
}
