//! The certificate and key pair record.

use bytes::Bytes;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::x509::X509;

use crate::commons::error::Error;
use crate::commons::serial::Serial;

//------------ X509Pair ------------------------------------------------------

/// A certificate with its private key, as produced by the PKI engine.
///
/// Both halves are kept in their PEM encodings: the certificate as a
/// "CERTIFICATE" block, the key as a PKCS#1 "RSA PRIVATE KEY" block. A
/// pair is immutable once created; the common name and serial identify it
/// within its PKI.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct X509Pair {
    key_pem: Bytes,
    cert_pem: Bytes,
    cn: String,
    serial: Serial,
}

impl X509Pair {
    pub fn new(
        key_pem: impl Into<Bytes>,
        cert_pem: impl Into<Bytes>,
        cn: impl Into<String>,
        serial: Serial,
    ) -> Self {
        X509Pair {
            key_pem: key_pem.into(),
            cert_pem: cert_pem.into(),
            cn: cn.into(),
            serial,
        }
    }

    pub fn key_pem(&self) -> &Bytes {
        &self.key_pem
    }

    pub fn cert_pem(&self) -> &Bytes {
        &self.cert_pem
    }

    pub fn cn(&self) -> &str {
        &self.cn
    }

    pub fn serial(&self) -> &Serial {
        &self.serial
    }

    /// Parses the stored PEM into a live key and certificate.
    pub fn decode(&self) -> Result<(PKey<Private>, X509), Error> {
        let rsa = Rsa::private_key_from_pem(&self.key_pem)
            .map_err(|e| Error::parse(format!("can't parse key: {}", e)))?;
        let key = PKey::from_rsa(rsa)
            .map_err(|e| Error::parse(format!("can't use key: {}", e)))?;
        let cert = X509::from_pem(&self.cert_pem)
            .map_err(|e| Error::parse(format!("can't parse cert: {}", e)))?;
        Ok((key, cert))
    }
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::cert::{generate_default_key, CertTemplate};
    use crate::crypto::SubjectTemplate;

    #[test]
    fn should_decode_generated_pair() {
        let (key, key_pem) = generate_default_key().unwrap();
        let cert = CertTemplate::ca("ca", Serial::from(1))
            .sign(&SubjectTemplate::default(), &key, None)
            .unwrap();
        let cert_pem = cert.to_pem().unwrap();

        let pair = X509Pair::new(key_pem, cert_pem, "ca", Serial::from(1));
        let (decoded_key, decoded_cert) = pair.decode().unwrap();

        assert_eq!(decoded_key.rsa().unwrap().size(), 256); // 2048 bits
        let serial =
            decoded_cert.serial_number().to_bn().unwrap();
        assert_eq!(
            serial.to_hex_str().unwrap().to_string().to_lowercase(),
            pair.serial().to_hex()
        );
    }

    #[test]
    fn decode_fails_on_malformed_pem() {
        let pair = X509Pair::new(
            &b"not a key"[..],
            &b"not a cert"[..],
            "broken",
            Serial::from(9),
        );
        let err = pair.decode().unwrap_err();
        assert!(matches!(err, Error::Parse(_)));
    }

    #[test]
    fn pem_blocks_use_the_expected_labels() {
        use crate::constants::{
            PEM_CERTIFICATE_BLOCK, PEM_RSA_PRIVATE_KEY_BLOCK,
        };

        let (key, key_pem) = generate_default_key().unwrap();
        let cert = CertTemplate::ca("ca", Serial::from(1))
            .sign(&SubjectTemplate::default(), &key, None)
            .unwrap();
        let cert_pem = cert.to_pem().unwrap();

        let key_header =
            format!("-----BEGIN {}-----", PEM_RSA_PRIVATE_KEY_BLOCK);
        let cert_header =
            format!("-----BEGIN {}-----", PEM_CERTIFICATE_BLOCK);
        assert!(key_pem.starts_with(key_header.as_bytes()));
        assert!(cert_pem.starts_with(cert_header.as_bytes()));
    }
}
