//! PEM certificate validation for trust bundles

use std::io::Cursor;

use rustls_pemfile::Item;
use thiserror::Error;

/// Reasons a trust bundle entry is rejected
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CertificateError {
    #[error("certificate data is empty")]
    Empty,
    #[error("failed to decode PEM: no PEM block found")]
    NotPem,
    #[error("failed to decode PEM: {0}")]
    Undecodable(String),
    #[error("block type is not certificate but {0}")]
    WrongBlockType(&'static str),
    #[error("failed to parse X.509 certificate: {0}")]
    InvalidX509(String),
}

/// Check that `data` starts with a PEM `CERTIFICATE` block holding a
/// parseable X.509 certificate. Only the first block is inspected.
pub fn validate_certificate(data: &[u8]) -> Result<(), CertificateError> {
    if data.iter().all(u8::is_ascii_whitespace) {
        return Err(CertificateError::Empty);
    }

    let mut reader = Cursor::new(data);
    let item = rustls_pemfile::read_one(&mut reader)
        .map_err(|e| CertificateError::Undecodable(e.to_string()))?;

    match item {
        None => Err(CertificateError::NotPem),
        Some(Item::X509Certificate(der)) => x509_parser::parse_x509_certificate(der.as_ref())
            .map(|_| ())
            .map_err(|e| CertificateError::InvalidX509(e.to_string())),
        Some(other) => Err(CertificateError::WrongBlockType(block_label(&other))),
    }
}

fn block_label(item: &Item) -> &'static str {
    match item {
        Item::Pkcs1Key(_) => "RSA PRIVATE KEY",
        Item::Pkcs8Key(_) => "PRIVATE KEY",
        Item::Sec1Key(_) => "EC PRIVATE KEY",
        Item::Crl(_) => "X509 CRL",
        _ => "an unsupported block",
    }
}
