//! Certificate revocation lists.
//!
//! A [`Crl`] is the logical revocation list of one PKI: the revoked
//! serials with their revocation times plus the update window. The list
//! is rebuilt and re-signed by the most recent CA on every revocation,
//! so this module only ever constructs complete lists. The DER rendering
//! is an X.509 v2 CertificateList signed with sha256WithRSAEncryption.

use chrono::{DateTime, TimeZone, Utc};
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private};
use openssl::sign::Signer;
use ::time::OffsetDateTime;
use x509_parser::prelude::*;
use x509_parser::revocation_list::CertificateRevocationList;
use yasna::models::{GeneralizedTime, UTCTime};
use yasna::{DERWriter, DERWriterSeq};

use crate::commons::error::Error;
use crate::commons::serial::Serial;
use crate::constants::PEM_X509_CRL_BLOCK;

/// sha256WithRSAEncryption, RFC 4055.
const OID_SHA256_WITH_RSA: &[u64] = &[1, 2, 840, 113549, 1, 1, 11];

//------------ CrlEntry ------------------------------------------------------

/// One revoked certificate: its serial and the time of revocation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CrlEntry {
    pub serial: Serial,
    pub revocation_time: DateTime<Utc>,
}

impl CrlEntry {
    pub fn new(serial: Serial, revocation_time: DateTime<Utc>) -> Self {
        CrlEntry {
            serial,
            revocation_time,
        }
    }

    /// Marks the serial as revoked right now.
    pub fn now(serial: Serial) -> Self {
        Self::new(serial, Utc::now())
    }
}

//------------ Crl -----------------------------------------------------------

/// The revocation list of a PKI.
#[derive(Clone, Debug, Default)]
pub struct Crl {
    this_update: Option<DateTime<Utc>>,
    next_update: Option<DateTime<Utc>>,
    entries: Vec<CrlEntry>,
}

/// # Data access
///
impl Crl {
    /// An empty list, as returned when no CRL has been produced yet.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[CrlEntry] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<CrlEntry> {
        self.entries
    }

    pub fn this_update(&self) -> Option<DateTime<Utc>> {
        self.this_update
    }

    pub fn next_update(&self) -> Option<DateTime<Utc>> {
        self.next_update
    }

    /// Returns whether the given serial number is on this list.
    pub fn contains(&self, serial: &Serial) -> bool {
        self.entries.iter().any(|entry| entry.serial == *serial)
    }
}

/// # Decoding
///
impl Crl {
    /// Parses a PEM block of type "X509 CRL".
    pub fn from_pem(bytes: &[u8]) -> Result<Self, Error> {
        let block = ::pem::parse(bytes)
            .map_err(|e| Error::parse(format!("bad crl pem: {}", e)))?;
        if block.tag() != PEM_X509_CRL_BLOCK {
            return Err(Error::parse(format!(
                "expected '{}' pem block, got '{}'",
                PEM_X509_CRL_BLOCK,
                block.tag()
            )));
        }
        Self::from_der(block.contents())
    }

    /// Parses the DER encoding of a certificate list.
    pub fn from_der(der: &[u8]) -> Result<Self, Error> {
        let (_, list) = CertificateRevocationList::from_der(der)
            .map_err(|e| Error::parse(format!("bad crl der: {}", e)))?;

        let mut entries = Vec::new();
        for revoked in list.iter_revoked_certificates() {
            entries.push(CrlEntry::new(
                Serial::from_bytes_be(revoked.raw_serial()),
                parse_time(&revoked.revocation_date)?,
            ));
        }

        Ok(Crl {
            this_update: Some(parse_time(&list.last_update())?),
            next_update: match list.next_update() {
                Some(time) => Some(parse_time(&time)?),
                None => None,
            },
            entries,
        })
    }
}

/// # Building
///
impl Crl {
    /// Appends an entry to the revoked set.
    pub fn push(&mut self, entry: CrlEntry) {
        self.entries.push(entry);
    }

    /// Drops duplicate serials, keeping the first occurrence of each.
    pub fn dedup_by_serial(&mut self) {
        let mut seen = std::collections::HashSet::new();
        self.entries.retain(|entry| seen.insert(entry.serial.clone()));
    }

    /// Signs the list and returns the "X509 CRL" PEM encoding.
    ///
    /// The issuer name is lifted from the signing CA's certificate; the
    /// update window is stamped onto the list as a side effect.
    pub fn to_signed_pem(
        &mut self,
        ca_cert_der: &[u8],
        ca_key: &PKey<Private>,
        this_update: DateTime<Utc>,
        next_update: DateTime<Utc>,
    ) -> Result<Vec<u8>, Error> {
        self.this_update = Some(this_update);
        self.next_update = Some(next_update);

        let issuer = issuer_name_der(ca_cert_der)?;
        let this_update = to_asn1_time(this_update)?;
        let next_update = to_asn1_time(next_update)?;
        let entries = self
            .entries
            .iter()
            .map(|entry| {
                Ok((
                    entry.serial.to_bytes_be(),
                    to_asn1_time(entry.revocation_time)?,
                ))
            })
            .collect::<Result<Vec<_>, Error>>()?;

        let tbs = yasna::construct_der(|writer| {
            write_tbs_cert_list(
                writer,
                &issuer,
                this_update,
                next_update,
                &entries,
            )
        });

        let mut signer = Signer::new(MessageDigest::sha256(), ca_key)
            .map_err(|e| Error::crypto(format!("can't create signer: {}", e)))?;
        signer
            .update(&tbs)
            .map_err(|e| Error::crypto(format!("can't sign crl: {}", e)))?;
        let signature = signer
            .sign_to_vec()
            .map_err(|e| Error::crypto(format!("can't sign crl: {}", e)))?;

        let der = yasna::construct_der(|writer| {
            writer.write_sequence(|writer| {
                writer.next().write_der(&tbs);
                write_signature_algorithm(writer.next());
                writer
                    .next()
                    .write_bitvec_bytes(&signature, signature.len() * 8);
            })
        });

        Ok(::pem::encode(&::pem::Pem::new(PEM_X509_CRL_BLOCK, der)).into_bytes())
    }
}

//------------ DER helpers ---------------------------------------------------

fn write_tbs_cert_list(
    writer: DERWriter,
    issuer: &[u8],
    this_update: OffsetDateTime,
    next_update: OffsetDateTime,
    entries: &[(Vec<u8>, OffsetDateTime)],
) {
    writer.write_sequence(|writer| {
        // version: v2
        writer.next().write_u8(1);
        write_signature_algorithm(writer.next());
        writer.next().write_der(issuer);
        write_time(writer.next(), this_update);
        write_time(writer.next(), next_update);
        if !entries.is_empty() {
            writer.next().write_sequence(|writer| {
                for (serial, revoked_at) in entries {
                    write_revoked_cert(writer, serial, *revoked_at);
                }
            });
        }
    })
}

fn write_revoked_cert(
    writer: &mut DERWriterSeq,
    serial: &[u8],
    revoked_at: OffsetDateTime,
) {
    writer.next().write_sequence(|writer| {
        writer.next().write_bigint_bytes(serial, true);
        write_time(writer.next(), revoked_at);
    })
}

fn write_signature_algorithm(writer: DERWriter) {
    writer.write_sequence(|writer| {
        writer
            .next()
            .write_oid(&yasna::models::ObjectIdentifier::from_slice(
                OID_SHA256_WITH_RSA,
            ));
        writer.next().write_null();
    })
}

/// Writes an X.509 Time value.
///
/// RFC 5280 requires dates up to the year 2049 as UTCTime and dates in
/// 2050 or later as GeneralizedTime.
fn write_time(writer: DERWriter, time: OffsetDateTime) {
    if (1950..2050).contains(&time.year()) {
        writer.write_utctime(&UTCTime::from_datetime(time));
    } else {
        writer.write_generalized_time(&GeneralizedTime::from_datetime(time));
    }
}

/// Converts to the whole-second UTC representation DER requires.
fn to_asn1_time(time: DateTime<Utc>) -> Result<OffsetDateTime, Error> {
    OffsetDateTime::from_unix_timestamp(time.timestamp()).map_err(|e| {
        Error::crypto(format!("timestamp out of range: {}", e))
    })
}

fn parse_time(time: &ASN1Time) -> Result<DateTime<Utc>, Error> {
    Utc.timestamp_opt(time.timestamp(), 0)
        .single()
        .ok_or_else(|| Error::parse("timestamp out of range"))
}

/// Extracts the DER-encoded subject name from a certificate.
fn issuer_name_der(cert_der: &[u8]) -> Result<Vec<u8>, Error> {
    let (_, cert) = X509Certificate::from_der(cert_der)
        .map_err(|e| Error::parse(format!("bad ca cert: {}", e)))?;
    Ok(cert.subject().as_raw().to_vec())
}

//------------ Tests ---------------------------------------------------------
