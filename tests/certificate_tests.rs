//! Integration tests for trust bundle certificate validation

mod common;

use lightspeed_operator::certs::{validate_certificate, CertificateError};

// ============================================================================
// Accepted Input
// ============================================================================

#[test]
fn generated_certificate_is_valid() {
    let pem = common::pem_certificate();
    assert_eq!(validate_certificate(pem.as_bytes()), Ok(()));
}

#[test]
fn only_first_block_is_inspected() {
    let bundle = format!("{}\nnot a certificate at all\n", common::pem_certificate());
    assert_eq!(validate_certificate(bundle.as_bytes()), Ok(()));
}

// ============================================================================
// Rejected Input
// ============================================================================

#[test]
fn empty_data_is_rejected() {
    assert_eq!(validate_certificate(b""), Err(CertificateError::Empty));
    assert_eq!(validate_certificate(b"  \n"), Err(CertificateError::Empty));
}

#[test]
fn plain_text_is_not_pem() {
    assert_eq!(
        validate_certificate(b"hello world"),
        Err(CertificateError::NotPem)
    );
}

#[test]
fn private_key_block_is_wrong_type() {
    let key = common::pem_private_key();
    assert!(matches!(
        validate_certificate(key.as_bytes()),
        Err(CertificateError::WrongBlockType(_))
    ));
}

#[test]
fn garbage_inside_certificate_block_fails_x509_parsing() {
    let pem = "-----BEGIN CERTIFICATE-----\naGVsbG8gd29ybGQ=\n-----END CERTIFICATE-----\n";
    assert!(matches!(
        validate_certificate(pem.as_bytes()),
        Err(CertificateError::InvalidX509(_))
    ));
}

#[test]
fn invalid_base64_inside_block_is_undecodable() {
    let pem = "-----BEGIN CERTIFICATE-----\n!!!!!!!!\n-----END CERTIFICATE-----\n";
    let err = validate_certificate(pem.as_bytes()).unwrap_err();
    assert!(matches!(err, CertificateError::Undecodable(_)));
    assert!(err.to_string().starts_with("failed to decode PEM: "));
}

#[test]
fn public_key_block_is_wrong_type() {
    let pem = "-----BEGIN PUBLIC KEY-----\naGVsbG8gd29ybGQ=\n-----END PUBLIC KEY-----\n";
    assert_eq!(
        validate_certificate(pem.as_bytes()),
        Err(CertificateError::WrongBlockType("an unsupported block"))
    );
}

#[test]
fn error_messages_describe_the_failure() {
    assert_eq!(
        CertificateError::NotPem.to_string(),
        "failed to decode PEM: no PEM block found"
    );
    assert_eq!(
        CertificateError::WrongBlockType("PRIVATE KEY").to_string(),
        "block type is not certificate but PRIVATE KEY"
    );
}
