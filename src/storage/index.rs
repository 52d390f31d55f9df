//! The OpenSSL ca-style certificate database.
//!
//! The easy-rsa v3 layout keeps an `index.txt` in the format of the
//! OpenSSL `ca` tool: one tab-separated record per certificate with a
//! status flag, the expiration date, an optional revocation date (and
//! reason), the serial in hex, the certificate file name and the subject
//! DN. See <https://pki-tutorial.readthedocs.io/en/latest/cadb.html>.

use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};

use crate::commons::error::Error;

/// The `YYMMDDHHMMSSZ` layout used by the OpenSSL ca database.
const DATE_LAYOUT: &str = "%y%m%d%H%M%SZ";

//------------ CertStatus ----------------------------------------------------

/// Certificate status flag.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CertStatus {
    Valid,
    Revoked,
    Expired,
}

impl CertStatus {
    fn as_char(self) -> char {
        match self {
            CertStatus::Valid => 'V',
            CertStatus::Revoked => 'R',
            CertStatus::Expired => 'E',
        }
    }

    fn from_char(flag: char) -> Result<Self, Error> {
        match flag {
            'V' => Ok(CertStatus::Valid),
            'R' => Ok(CertStatus::Revoked),
            'E' => Ok(CertStatus::Expired),
            other => Err(Error::parse(format!(
                "unknown status flag '{}' in index",
                other
            ))),
        }
    }
}

//------------ Record --------------------------------------------------------

/// One certificate database record.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Record {
    status: CertStatus,
    expiration_date: DateTime<Utc>,
    revocation_date: Option<DateTime<Utc>>,
    revocation_reason: Option<String>,
    serial_hex: String,
    file_name: String,
    dn: String,
}

impl Record {
    /// A fresh record for a just-issued certificate.
    ///
    /// The file name is the literal `unknown`, as easy-rsa writes it.
    pub fn issued(
        expiration_date: DateTime<Utc>,
        serial_hex: impl Into<String>,
        dn: impl Into<String>,
    ) -> Self {
        Record {
            status: CertStatus::Valid,
            expiration_date,
            revocation_date: None,
            revocation_reason: None,
            serial_hex: serial_hex.into(),
            file_name: "unknown".to_string(),
            dn: dn.into(),
        }
    }

    /// Flips the record to revoked.
    pub fn revoke(
        &mut self,
        when: DateTime<Utc>,
        reason: Option<String>,
    ) {
        self.status = CertStatus::Revoked;
        self.revocation_date = Some(when);
        self.revocation_reason = reason;
    }

    pub fn status(&self) -> CertStatus {
        self.status
    }

    pub fn serial_hex(&self) -> &str {
        &self.serial_hex
    }

    pub fn dn(&self) -> &str {
        &self.dn
    }

    fn parse_line(line: &str) -> Result<Self, Error> {
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() != 6 {
            return Err(Error::parse(format!(
                "wrong record format: {}",
                line
            )));
        }

        let status = CertStatus::from_char(
            fields[0].chars().next().ok_or_else(|| {
                Error::parse("empty status field in index")
            })?,
        )?;
        let expiration_date = parse_date(fields[1])?;

        let (revocation_date, revocation_reason) = if fields[2].is_empty() {
            (None, None)
        } else {
            match fields[2].split_once(',') {
                Some((date, reason)) => {
                    (Some(parse_date(date)?), Some(reason.to_string()))
                }
                None => (Some(parse_date(fields[2])?), None),
            }
        };

        Ok(Record {
            status,
            expiration_date,
            revocation_date,
            revocation_reason,
            serial_hex: fields[3].to_string(),
            file_name: fields[4].to_string(),
            dn: fields[5].to_string(),
        })
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let revocation = match (&self.revocation_date, &self.revocation_reason)
        {
            (Some(date), Some(reason)) => {
                format!("{},{}", format_date(*date), reason)
            }
            (Some(date), None) => format_date(*date),
            _ => String::new(),
        };
        write!(
            f,
            "{}\t{}\t{}\t{}\t{}\t{}",
            self.status.as_char(),
            format_date(self.expiration_date),
            revocation,
            self.serial_hex,
            self.file_name,
            self.dn
        )
    }
}

fn format_date(date: DateTime<Utc>) -> String {
    date.format(DATE_LAYOUT).to_string()
}

fn parse_date(s: &str) -> Result<DateTime<Utc>, Error> {
    NaiveDateTime::parse_from_str(s, DATE_LAYOUT)
        .map(|naive| naive.and_utc())
        .map_err(|e| {
            Error::parse(format!("couldn't parse date from '{}': {}", s, e))
        })
}

//------------ Index ---------------------------------------------------------

/// The whole certificate database.
#[derive(Clone, Debug, Default)]
pub struct Index {
    records: Vec<Record>,
}

impl Index {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn push(&mut self, record: Record) {
        self.records.push(record);
    }

    /// Returns the record for a serial, if any.
    pub fn find_by_serial_mut(
        &mut self,
        serial_hex: &str,
    ) -> Option<&mut Record> {
        self.records
            .iter_mut()
            .find(|record| record.serial_hex == serial_hex)
    }

    /// Parses a database from its text form.
    pub fn decode(input: &str) -> Result<Self, Error> {
        let mut records = Vec::new();
        for line in input.lines() {
            if line.is_empty() {
                continue;
            }
            records.push(Record::parse_line(line)?);
        }
        Ok(Index { records })
    }

    /// Renders the database to its text form, one record per line.
    pub fn encode(&self) -> String {
        let mut out = String::new();
        for record in &self.records {
            out.push_str(&record.to_string());
            out.push('\n');
        }
        out
    }
}

//------------ Tests ---------------------------------------------------------
