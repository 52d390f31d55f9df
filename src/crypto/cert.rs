//! Assembling and signing X.509 certificates.
//!
//! Certificate issuance starts from a role-specific template which the
//! caller can adjust through [`CertOption`] values applied in order. The
//! assembled template is rendered into an X.509 v3 certificate with
//! openssl and signed with SHA-256.

use std::net::IpAddr;

use chrono::{DateTime, Duration, Utc};
use openssl::asn1::{Asn1Object, Asn1OctetString, Asn1Time};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::x509::extension::{
    AuthorityKeyIdentifier, BasicConstraints, ExtendedKeyUsage, KeyUsage,
    SubjectAlternativeName, SubjectKeyIdentifier,
};
use openssl::x509::{X509, X509Extension, X509Name};
use serde::Deserialize;
use yasna::Tag;

use crate::commons::error::Error;
use crate::commons::serial::Serial;
use crate::constants::{
    DEFAULT_EXPIRE_YEARS, DEFAULT_KEY_SIZE_BITS, NOT_BEFORE_BACKDATE_MINUTES,
};

/// OID of the Netscape Cert Type extension.
const OID_NS_CERT_TYPE: &str = "2.16.840.1.113730.1.1";

/// OID of the NameConstraints extension.
const OID_NAME_CONSTRAINTS: &str = "2.5.29.30";

//------------ SubjectTemplate -----------------------------------------------

/// The distinguished-name template a PKI stamps onto every certificate.
///
/// The common name is overwritten per issuance; all other attributes are
/// carried through as configured.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SubjectTemplate {
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub province: Option<String>,
    #[serde(default)]
    pub locality: Option<String>,
    #[serde(default)]
    pub organization: Option<String>,
    #[serde(default)]
    pub organizational_unit: Option<String>,
}

impl SubjectTemplate {
    /// Renders the template into an X.509 name with the given common name.
    pub fn to_name(&self, common_name: &str) -> Result<X509Name, Error> {
        let mut builder = X509Name::builder()?;
        if let Some(country) = &self.country {
            builder.append_entry_by_nid(Nid::COUNTRYNAME, country)?;
        }
        if let Some(province) = &self.province {
            builder.append_entry_by_nid(Nid::STATEORPROVINCENAME, province)?;
        }
        if let Some(locality) = &self.locality {
            builder.append_entry_by_nid(Nid::LOCALITYNAME, locality)?;
        }
        if let Some(organization) = &self.organization {
            builder.append_entry_by_nid(Nid::ORGANIZATIONNAME, organization)?;
        }
        if let Some(unit) = &self.organizational_unit {
            builder
                .append_entry_by_nid(Nid::ORGANIZATIONALUNITNAME, unit)?;
        }
        builder.append_entry_by_nid(Nid::COMMONNAME, common_name)?;
        Ok(builder.build())
    }
}

//------------ CertRole ------------------------------------------------------

/// The purpose an end-entity certificate is issued for.
///
/// The role decides the key usage bits, the extended key usage and the
/// Netscape Cert Type bit.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CertRole {
    Client,
    Server,
}

//------------ NsCertType ----------------------------------------------------

/// The Netscape Cert Type bit carried by end-entity certificates.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum NsCertType {
    Client,
    Server,
}

impl NsCertType {
    /// The DER encoding of the extension value: a BIT STRING of two bits.
    fn to_der(self) -> Vec<u8> {
        let bits: u8 = match self {
            NsCertType::Client => 0x80,
            NsCertType::Server => 0x40,
        };
        yasna::construct_der(|writer| writer.write_bitvec_bytes(&[bits], 2))
    }
}

//------------ KeyUsageSet ---------------------------------------------------

/// The key usage bits set on a certificate.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
struct KeyUsageSet {
    digital_signature: bool,
    key_encipherment: bool,
    key_agreement: bool,
    key_cert_sign: bool,
    crl_sign: bool,
}

impl KeyUsageSet {
    fn ca_root() -> Self {
        KeyUsageSet {
            digital_signature: true,
            key_cert_sign: true,
            crl_sign: true,
            ..Default::default()
        }
    }

    fn ca_preset() -> Self {
        KeyUsageSet {
            key_cert_sign: true,
            crl_sign: true,
            ..Default::default()
        }
    }

    fn client() -> Self {
        KeyUsageSet {
            digital_signature: true,
            key_agreement: true,
            ..Default::default()
        }
    }

    fn server() -> Self {
        KeyUsageSet {
            digital_signature: true,
            key_agreement: true,
            key_encipherment: true,
            ..Default::default()
        }
    }

    fn to_extension(self) -> Result<X509Extension, Error> {
        let mut usage = KeyUsage::new();
        usage.critical();
        if self.digital_signature {
            usage.digital_signature();
        }
        if self.key_encipherment {
            usage.key_encipherment();
        }
        if self.key_agreement {
            usage.key_agreement();
        }
        if self.key_cert_sign {
            usage.key_cert_sign();
        }
        if self.crl_sign {
            usage.crl_sign();
        }
        usage.build().map_err(Error::from)
    }
}

//------------ CertOption ----------------------------------------------------

/// A single adjustment to a certificate template.
///
/// Options are applied in order; a later option overrides an earlier one
/// touching the same field.
#[derive(Clone, Debug)]
pub enum CertOption {
    /// Overrides the subject common name.
    Cn(String),
    /// Subject alternative DNS names.
    DnsNames(Vec<String>),
    /// Subject alternative IP addresses.
    IpAddresses(Vec<IpAddr>),
    /// Excluded DNS domains (name constraints).
    ExcludedDnsDomains(Vec<String>),
    /// Overrides the expiry time.
    NotAfter(DateTime<Utc>),
    /// CA preset: CA basic constraints plus certificate and CRL signing.
    Ca,
    /// Server preset: TLS server key usage, serverAuth, nsCertType server.
    Server,
    /// Client preset: TLS client key usage, clientAuth, nsCertType client.
    Client,
}

impl CertOption {
    fn apply(&self, template: &mut CertTemplate) {
        match self {
            CertOption::Cn(cn) => template.cn = cn.clone(),
            CertOption::DnsNames(names) => {
                template.dns_names = names.clone()
            }
            CertOption::IpAddresses(addrs) => {
                template.ip_addresses = addrs.clone()
            }
            CertOption::ExcludedDnsDomains(domains) => {
                template.excluded_dns_domains = domains.clone()
            }
            CertOption::NotAfter(when) => template.not_after = *when,
            CertOption::Ca => {
                template.is_ca = true;
                template.key_usage = KeyUsageSet::ca_preset();
            }
            CertOption::Server => {
                template.key_usage = KeyUsageSet::server();
                template.ext_key_usage = Some(ExtKeyUsageKind::ServerAuth);
                template.ns_cert_type = Some(NsCertType::Server);
            }
            CertOption::Client => {
                template.key_usage = KeyUsageSet::client();
                template.ext_key_usage = Some(ExtKeyUsageKind::ClientAuth);
                template.ns_cert_type = Some(NsCertType::Client);
            }
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum ExtKeyUsageKind {
    ClientAuth,
    ServerAuth,
}

//------------ CertTemplate --------------------------------------------------

/// Everything needed to render one certificate.
#[derive(Clone, Debug)]
pub struct CertTemplate {
    cn: String,
    serial: Serial,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
    is_ca: bool,
    key_usage: KeyUsageSet,
    ext_key_usage: Option<ExtKeyUsageKind>,
    ns_cert_type: Option<NsCertType>,
    dns_names: Vec<String>,
    ip_addresses: Vec<IpAddr>,
    excluded_dns_domains: Vec<String>,
}

impl CertTemplate {
    /// The template for a new self-signed CA.
    pub fn ca(cn: &str, serial: Serial) -> Self {
        let mut template = Self::base(cn, serial);
        template.is_ca = true;
        template.key_usage = KeyUsageSet::ca_root();
        template
    }

    /// The template for a new end-entity certificate of the given role.
    pub fn end_entity(cn: &str, serial: Serial, role: CertRole) -> Self {
        let mut template = Self::base(cn, serial);
        match role {
            CertRole::Client => CertOption::Client.apply(&mut template),
            CertRole::Server => CertOption::Server.apply(&mut template),
        }
        template
    }

    fn base(cn: &str, serial: Serial) -> Self {
        let now = Utc::now();
        CertTemplate {
            cn: cn.to_string(),
            serial,
            not_before: now
                - Duration::minutes(NOT_BEFORE_BACKDATE_MINUTES),
            not_after: now
                + Duration::hours(24 * 365 * DEFAULT_EXPIRE_YEARS),
            is_ca: false,
            key_usage: KeyUsageSet::default(),
            ext_key_usage: None,
            ns_cert_type: None,
            dns_names: Vec::new(),
            ip_addresses: Vec::new(),
            excluded_dns_domains: Vec::new(),
        }
    }

    /// Applies the given options in order.
    pub fn apply(&mut self, options: &[CertOption]) {
        for option in options {
            option.apply(self);
        }
    }

    pub fn cn(&self) -> &str {
        &self.cn
    }

    pub fn serial(&self) -> &Serial {
        &self.serial
    }
}

/// # Rendering and signing
///
impl CertTemplate {
    /// Renders the template and signs it, producing the certificate.
    ///
    /// With an issuer, the certificate is signed with the issuer key and
    /// carries the issuer certificate's subject as its issuer name.
    /// Without one it is self-signed.
    pub fn sign(
        &self,
        subject_template: &SubjectTemplate,
        public_key: &PKey<Private>,
        issuer: Option<(&PKey<Private>, &X509)>,
    ) -> Result<X509, Error> {
        let mut builder = X509::builder()?;
        builder.set_version(2)?;

        let serial_bn = self.serial.to_bignum()?;
        let serial = serial_bn.to_asn1_integer()?;
        builder.set_serial_number(&serial)?;

        let subject = subject_template.to_name(&self.cn)?;
        builder.set_subject_name(&subject)?;
        match issuer {
            Some((_, issuer_cert)) => {
                builder.set_issuer_name(issuer_cert.subject_name())?
            }
            None => builder.set_issuer_name(&subject)?,
        }

        let not_before = Asn1Time::from_unix(self.not_before.timestamp())?;
        builder.set_not_before(&not_before)?;
        let not_after = Asn1Time::from_unix(self.not_after.timestamp())?;
        builder.set_not_after(&not_after)?;

        builder.set_pubkey(public_key)?;

        let mut basic = BasicConstraints::new();
        basic.critical();
        if self.is_ca {
            basic.ca();
        }
        builder.append_extension(basic.build()?)?;

        builder.append_extension(self.key_usage.to_extension()?)?;

        if let Some(kind) = self.ext_key_usage {
            let mut ext = ExtendedKeyUsage::new();
            match kind {
                ExtKeyUsageKind::ClientAuth => ext.client_auth(),
                ExtKeyUsageKind::ServerAuth => ext.server_auth(),
            };
            builder.append_extension(ext.build()?)?;
        }

        if self.is_ca {
            let ski = {
                let ctx = builder.x509v3_context(None, None);
                SubjectKeyIdentifier::new().build(&ctx)?
            };
            builder.append_extension(ski)?;
        }

        if let Some((_, issuer_cert)) = issuer {
            let aki = {
                let ctx = builder.x509v3_context(Some(issuer_cert), None);
                AuthorityKeyIdentifier::new().keyid(false).build(&ctx)?
            };
            builder.append_extension(aki)?;
        }

        if let Some(ns_cert_type) = self.ns_cert_type {
            builder
                .append_extension(ns_cert_type_extension(ns_cert_type)?)?;
        }

        if !self.dns_names.is_empty() || !self.ip_addresses.is_empty() {
            let mut alt_name = SubjectAlternativeName::new();
            for name in &self.dns_names {
                alt_name.dns(name);
            }
            for addr in &self.ip_addresses {
                alt_name.ip(&addr.to_string());
            }
            let san = {
                let ctx = match issuer {
                    Some((_, issuer_cert)) => {
                        builder.x509v3_context(Some(issuer_cert), None)
                    }
                    None => builder.x509v3_context(None, None),
                };
                alt_name.build(&ctx)?
            };
            builder.append_extension(san)?;
        }

        if !self.excluded_dns_domains.is_empty() {
            builder.append_extension(name_constraints_extension(
                &self.excluded_dns_domains,
            )?)?;
        }

        let signing_key = match issuer {
            Some((issuer_key, _)) => issuer_key,
            None => public_key,
        };
        builder.sign(signing_key, MessageDigest::sha256())?;

        Ok(builder.build())
    }
}

//------------ Extension helpers ---------------------------------------------

fn ns_cert_type_extension(
    ns_cert_type: NsCertType,
) -> Result<X509Extension, Error> {
    let oid = Asn1Object::from_str(OID_NS_CERT_TYPE)?;
    let value = Asn1OctetString::new_from_bytes(&ns_cert_type.to_der())?;
    X509Extension::new_from_der(&oid, false, &value).map_err(Error::from)
}

/// Builds a NameConstraints extension carrying excluded dNSName subtrees.
fn name_constraints_extension(
    excluded: &[String],
) -> Result<X509Extension, Error> {
    let der = yasna::construct_der(|writer| {
        writer.write_sequence(|writer| {
            // excludedSubtrees [1] IMPLICIT GeneralSubtrees
            writer.next().write_tagged_implicit(Tag::context(1), |writer| {
                writer.write_sequence(|writer| {
                    for domain in excluded {
                        writer.next().write_sequence(|writer| {
                            // base: dNSName [2] IMPLICIT IA5String
                            writer.next().write_tagged_implicit(
                                Tag::context(2),
                                |writer| writer.write_ia5_string(domain),
                            );
                        });
                    }
                })
            });
        })
    });
    let oid = Asn1Object::from_str(OID_NAME_CONSTRAINTS)?;
    let value = Asn1OctetString::new_from_bytes(&der)?;
    X509Extension::new_from_der(&oid, true, &value).map_err(Error::from)
}

//------------ Key generation ------------------------------------------------

/// Generates a fresh RSA key.
///
/// Returns the key for signing plus its PKCS#1 PEM encoding.
pub fn generate_rsa_key(bits: u32) -> Result<(PKey<Private>, Vec<u8>), Error> {
    let rsa = Rsa::generate(bits)
        .map_err(|e| Error::crypto(format!("can't generate key: {}", e)))?;
    let pem = rsa
        .private_key_to_pem()
        .map_err(|e| Error::crypto(format!("can't encode key: {}", e)))?;
    let key = PKey::from_rsa(rsa)
        .map_err(|e| Error::crypto(format!("can't wrap key: {}", e)))?;
    Ok((key, pem))
}

/// Generates a fresh RSA key of the default size.
pub fn generate_default_key() -> Result<(PKey<Private>, Vec<u8>), Error> {
    generate_rsa_key(DEFAULT_KEY_SIZE_BITS)
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use x509_parser::prelude::*;

    fn parse(der: &[u8]) -> X509Certificate {
        X509Certificate::from_der(der).unwrap().1
    }

    fn extension_value<'a>(
        cert: &'a X509Certificate,
        oid: &str,
    ) -> Option<&'a [u8]> {
        cert.extensions()
            .iter()
            .find(|ext| ext.oid.to_id_string() == oid)
            .map(|ext| ext.value)
    }

    #[test]
    fn should_self_sign_a_ca() {
        let (key, _pem) = generate_default_key().unwrap();
        let template = CertTemplate::ca("ca", Serial::from(1));
        let cert = template
            .sign(&SubjectTemplate::default(), &key, None)
            .unwrap();

        let der = cert.to_der().unwrap();
        let parsed = parse(&der);
        assert_eq!(
            parsed
                .subject()
                .iter_common_name()
                .next()
                .unwrap()
                .as_str()
                .unwrap(),
            "ca"
        );
        assert_eq!(parsed.subject(), parsed.issuer());
        let basic = parsed.basic_constraints().unwrap().unwrap();
        assert!(basic.critical);
        assert!(basic.value.ca);

        let key_usage = parsed.key_usage().unwrap().unwrap();
        assert!(key_usage.value.digital_signature());
        assert!(key_usage.value.key_cert_sign());
        assert!(key_usage.value.crl_sign());
    }

    #[test]
    fn should_set_role_extensions_for_clients() {
        let (ca_key, _) = generate_default_key().unwrap();
        let ca = CertTemplate::ca("ca", Serial::from(1))
            .sign(&SubjectTemplate::default(), &ca_key, None)
            .unwrap();

        let (key, _) = generate_default_key().unwrap();
        let template = CertTemplate::end_entity(
            "alice",
            Serial::from(2),
            CertRole::Client,
        );
        let cert = template
            .sign(&SubjectTemplate::default(), &key, Some((&ca_key, &ca)))
            .unwrap();

        let der = cert.to_der().unwrap();
        let parsed = parse(&der);
        let basic = parsed.basic_constraints().unwrap().unwrap();
        assert!(!basic.value.ca);

        let eku = parsed.extended_key_usage().unwrap().unwrap();
        assert!(eku.value.client_auth);
        assert!(!eku.value.server_auth);

        // BIT STRING, two bits, client bit set
        assert_eq!(
            extension_value(&parsed, OID_NS_CERT_TYPE).unwrap(),
            &[0x03, 0x02, 0x06, 0x80]
        );
    }

    #[test]
    fn should_set_role_extensions_for_servers() {
        let (ca_key, _) = generate_default_key().unwrap();
        let ca = CertTemplate::ca("ca", Serial::from(1))
            .sign(&SubjectTemplate::default(), &ca_key, None)
            .unwrap();

        let (key, _) = generate_default_key().unwrap();
        let mut template = CertTemplate::end_entity(
            "www",
            Serial::from(2),
            CertRole::Server,
        );
        template.apply(&[CertOption::DnsNames(vec![
            "www.example.org".to_string(),
        ])]);
        let cert = template
            .sign(&SubjectTemplate::default(), &key, Some((&ca_key, &ca)))
            .unwrap();

        let der = cert.to_der().unwrap();
        let parsed = parse(&der);

        let eku = parsed.extended_key_usage().unwrap().unwrap();
        assert!(eku.value.server_auth);

        let key_usage = parsed.key_usage().unwrap().unwrap();
        assert!(key_usage.value.key_encipherment());

        assert_eq!(
            extension_value(&parsed, OID_NS_CERT_TYPE).unwrap(),
            &[0x03, 0x02, 0x06, 0x40]
        );

        let san = parsed.subject_alternative_name().unwrap().unwrap();
        assert!(san.value.general_names.iter().any(|name| matches!(
            name,
            GeneralName::DNSName("www.example.org")
        )));
    }

    #[test]
    fn later_options_override_earlier_ones() {
        let mut template =
            CertTemplate::end_entity("a", Serial::from(3), CertRole::Client);
        template.apply(&[
            CertOption::Cn("b".to_string()),
            CertOption::Cn("c".to_string()),
            CertOption::Server,
        ]);
        assert_eq!(template.cn(), "c");
        assert_eq!(template.ns_cert_type, Some(NsCertType::Server));
    }

    #[test]
    fn carries_subject_template_attributes() {
        let subject = SubjectTemplate {
            country: Some("NL".to_string()),
            organization: Some("Example Org".to_string()),
            ..Default::default()
        };
        let (key, _) = generate_default_key().unwrap();
        let cert = CertTemplate::ca("ca", Serial::from(1))
            .sign(&subject, &key, None)
            .unwrap();

        let der = cert.to_der().unwrap();
        let parsed = parse(&der);
        let org = parsed
            .subject()
            .iter_organization()
            .next()
            .unwrap()
            .as_str()
            .unwrap();
        assert_eq!(org, "Example Org");
    }
}
