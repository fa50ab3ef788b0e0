//! X.509 certificate view used by authorization, signer validity checks,
//! and validation caching.
//!
//! [`Certificate`] carries only the fields the request core inspects. It is
//! parsed from DER with `x509-parser`, or assembled directly through its
//! builder when the transport has already decoded the peer certificate.
//!
//! # Identity
//!
//! Two certificates are the same for caching purposes when their normalized
//! issuer DN and normalized serial number are equal (see
//! [`Certificate::identity`]).

use std::fmt;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use signet_storage::ConfigError;
use thiserror::Error;
use x509_parser::{
    prelude::{FromDer, X509Certificate},
    time::ASN1Time,
};

/// Maximum accepted DER size (16 KiB is generous for a single certificate).
pub const MAX_CERT_SIZE: usize = 16 * 1024;

/// Encoded object identifier of `id-ce-privateKeyUsagePeriod` (2.5.29.16).
const PRIVATE_KEY_USAGE_PERIOD_OID: &[u8] = &[0x55, 0x1d, 0x10];

/// Errors raised while decoding a certificate.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CertificateError {
    /// The encoded certificate exceeds [`MAX_CERT_SIZE`].
    #[error("certificate too large: {0} bytes (max {MAX_CERT_SIZE})")]
    TooLarge(usize),

    /// The DER structure could not be parsed.
    #[error("failed to parse X.509 certificate: {0}")]
    Parse(String),
}

/// A certificate serial number, held as normalized lowercase hex.
///
/// Normalization strips an optional `0x` prefix and every leading zero, so
/// the DER sign-bit padding byte never affects equality:
/// `0x0111114711`, `111114711` and `00111114711` are the same serial.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SerialNumber(String);

impl SerialNumber {
    /// Parses a hex serial number, with or without a `0x` prefix.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] if the input is empty or contains
    /// non-hex characters.
    pub fn parse(input: &str) -> Result<Self, ConfigError> {
        let trimmed = input.trim();
        let digits = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);

        if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ConfigError::InvalidValue {
                field: "serial_number",
                value: input.to_owned(),
                reason: "expected a hexadecimal serial number".to_owned(),
            });
        }

        Ok(Self::normalized(digits))
    }

    /// Builds a serial number from its big-endian byte encoding.
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self::normalized(&hex::encode(bytes))
    }

    fn normalized(digits: &str) -> Self {
        let stripped = digits.trim_start_matches('0');
        if stripped.is_empty() {
            Self("0".to_owned())
        } else {
            Self(stripped.to_ascii_lowercase())
        }
    }

    /// Returns the normalized hex representation.
    #[must_use]
    pub fn as_hex(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SerialNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for SerialNumber {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<SerialNumber> for String {
    fn from(serial: SerialNumber) -> Self {
        serial.0
    }
}

impl std::str::FromStr for SerialNumber {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Normalizes a distinguished name for comparison.
///
/// Each RDN is trimmed, its attribute type is upper-cased, and whitespace
/// around `=` is removed. RDNs are joined with `,` in their original order.
/// Escaped commas (`\,`) stay inside their RDN.
#[must_use]
pub fn normalize_dn(dn: &str) -> String {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut escaped = false;

    for c in dn.chars() {
        if escaped {
            current.push(c);
            escaped = false;
        } else if c == '\\' {
            current.push(c);
            escaped = true;
        } else if c == ',' {
            parts.push(std::mem::take(&mut current));
        } else {
            current.push(c);
        }
    }
    parts.push(current);

    parts
        .iter()
        .map(|rdn| rdn.trim())
        .filter(|rdn| !rdn.is_empty())
        .map(|rdn| match rdn.split_once('=') {
            Some((attr, value)) => {
                format!("{}={}", attr.trim().to_ascii_uppercase(), value.trim())
            },
            None => rdn.to_owned(),
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Key usage bits the request core cares about.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyUsageFlags {
    /// `digitalSignature` bit.
    pub digital_signature: bool,
    /// `nonRepudiation` (content commitment) bit.
    pub non_repudiation: bool,
}

/// Parsed view of an X.509 certificate.
#[derive(Clone, PartialEq, Eq, bon::Builder)]
pub struct Certificate {
    /// Subject distinguished name as rendered by the parser.
    #[builder(into)]
    subject_dn: String,
    /// Issuer distinguished name as rendered by the parser.
    #[builder(into)]
    issuer_dn: String,
    /// Normalized serial number.
    serial_number: SerialNumber,
    /// Start of the certificate validity period.
    not_before: DateTime<Utc>,
    /// End of the certificate validity period.
    not_after: DateTime<Utc>,
    /// Start of the private key usage period extension, if present.
    private_key_not_before: Option<DateTime<Utc>>,
    /// End of the private key usage period extension, if present.
    private_key_not_after: Option<DateTime<Utc>>,
    /// Whether basic constraints mark this certificate as a CA.
    #[builder(default)]
    is_ca: bool,
    /// Key usage extension bits. `None` when the extension is absent.
    key_usage: Option<KeyUsageFlags>,
    /// Raw subject public key bytes.
    #[builder(default)]
    public_key: Vec<u8>,
    /// Original DER encoding. Empty when built by hand.
    #[builder(default)]
    der: Vec<u8>,
}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Certificate")
            .field("subject_dn", &self.subject_dn)
            .field("issuer_dn", &self.issuer_dn)
            .field("serial_number", &self.serial_number)
            .field("not_before", &self.not_before)
            .field("not_after", &self.not_after)
            .finish_non_exhaustive()
    }
}

fn asn1_to_utc(time: ASN1Time) -> Result<DateTime<Utc>, CertificateError> {
    Utc.timestamp_opt(time.timestamp(), 0)
        .single()
        .ok_or_else(|| CertificateError::Parse(format!("timestamp out of range: {time}")))
}

type UsagePeriod = (Option<DateTime<Utc>>, Option<DateTime<Utc>>);

/// Decodes the extension value
/// `SEQUENCE { notBefore [0] GeneralizedTime OPTIONAL, notAfter [1] GeneralizedTime OPTIONAL }`.
///
/// Both implicit (RFC 5280) and explicit tagging of the two fields are accepted.
fn parse_private_key_usage_period(value: &[u8]) -> Result<UsagePeriod, CertificateError> {
    let (tag, mut fields, rest) = der_element(value)?;
    if tag != 0x30 || !rest.is_empty() {
        return Err(malformed_usage_period());
    }

    let mut period: UsagePeriod = (None, None);
    while !fields.is_empty() {
        let (tag, mut content, rest) = der_element(fields)?;
        if tag & 0x20 != 0 {
            let (inner, time, trailing) = der_element(content)?;
            if inner != 0x18 || !trailing.is_empty() {
                return Err(malformed_usage_period());
            }
            content = time;
        }
        let time = parse_generalized_time(content)?;
        match tag & !0x20 {
            0x80 => period.0 = Some(time),
            0x81 => period.1 = Some(time),
            _ => return Err(malformed_usage_period()),
        }
        fields = rest;
    }
    Ok(period)
}

/// Splits one DER element into tag, content and the bytes after it.
fn der_element(input: &[u8]) -> Result<(u8, &[u8], &[u8]), CertificateError> {
    let (&tag, rest) = input.split_first().ok_or_else(malformed_usage_period)?;
    let (&first, rest) = rest.split_first().ok_or_else(malformed_usage_period)?;
    let (len, rest) = if first < 0x80 {
        (usize::from(first), rest)
    } else {
        let count = usize::from(first & 0x7f);
        if count == 0 || count > 2 || rest.len() < count {
            return Err(malformed_usage_period());
        }
        let (octets, rest) = rest.split_at(count);
        (octets.iter().fold(0usize, |len, octet| (len << 8) | usize::from(*octet)), rest)
    };
    if rest.len() < len {
        return Err(malformed_usage_period());
    }
    let (content, rest) = rest.split_at(len);
    Ok((tag, content, rest))
}

fn parse_generalized_time(content: &[u8]) -> Result<DateTime<Utc>, CertificateError> {
    let text = std::str::from_utf8(content).map_err(|_| malformed_usage_period())?;
    let naive = NaiveDateTime::parse_from_str(text, "%Y%m%d%H%M%SZ").map_err(|e| {
        CertificateError::Parse(format!("invalid private key usage time {text:?}: {e}"))
    })?;
    Ok(Utc.from_utc_datetime(&naive))
}

fn malformed_usage_period() -> CertificateError {
    CertificateError::Parse("malformed private key usage period extension".to_owned())
}

impl Certificate {
    /// Parses a DER-encoded X.509 certificate.
    ///
    /// # Errors
    ///
    /// - [`CertificateError::TooLarge`] if the input exceeds [`MAX_CERT_SIZE`]
    /// - [`CertificateError::Parse`] if the structure is malformed
    pub fn from_der(der: &[u8]) -> Result<Self, CertificateError> {
        if der.len() > MAX_CERT_SIZE {
            return Err(CertificateError::TooLarge(der.len()));
        }

        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| CertificateError::Parse(format!("{e:?}")))?;

        let (private_key_not_before, private_key_not_after) = cert
            .extensions()
            .iter()
            .find(|ext| ext.oid.as_bytes() == PRIVATE_KEY_USAGE_PERIOD_OID)
            .map(|ext| parse_private_key_usage_period(ext.value))
            .transpose()?
            .unwrap_or_default();

        let is_ca = cert
            .basic_constraints()
            .map_err(|e| CertificateError::Parse(format!("{e:?}")))?
            .is_some_and(|bc| bc.value.ca);

        let key_usage = cert
            .key_usage()
            .map_err(|e| CertificateError::Parse(format!("{e:?}")))?
            .map(|ku| KeyUsageFlags {
                digital_signature: ku.value.digital_signature(),
                non_repudiation: ku.value.non_repudiation(),
            });

        Ok(Self {
            subject_dn: cert.subject().to_string(),
            issuer_dn: cert.issuer().to_string(),
            serial_number: SerialNumber::from_bytes(cert.raw_serial()),
            not_before: asn1_to_utc(cert.validity().not_before.clone())?,
            not_after: asn1_to_utc(cert.validity().not_after.clone())?,
            private_key_not_before,
            private_key_not_after,
            is_ca,
            key_usage,
            public_key: cert.public_key().subject_public_key.data.to_vec(),
            der: der.to_vec(),
        })
    }

    /// Returns the subject DN.
    #[must_use]
    pub fn subject_dn(&self) -> &str {
        &self.subject_dn
    }

    /// Returns the issuer DN.
    #[must_use]
    pub fn issuer_dn(&self) -> &str {
        &self.issuer_dn
    }

    /// Returns the normalized serial number.
    #[must_use]
    pub fn serial_number(&self) -> &SerialNumber {
        &self.serial_number
    }

    /// Returns the start of the validity period.
    #[must_use]
    pub fn not_before(&self) -> DateTime<Utc> {
        self.not_before
    }

    /// Returns the end of the validity period.
    #[must_use]
    pub fn not_after(&self) -> DateTime<Utc> {
        self.not_after
    }

    /// Returns the private key usage period bounds, if the extension is present.
    #[must_use]
    pub fn private_key_usage_period(&self) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
        (self.private_key_not_before, self.private_key_not_after)
    }

    /// Returns whether this is a CA certificate.
    #[must_use]
    pub fn is_ca(&self) -> bool {
        self.is_ca
    }

    /// Returns the key usage bits, if the extension is present.
    #[must_use]
    pub fn key_usage(&self) -> Option<KeyUsageFlags> {
        self.key_usage
    }

    /// Returns the raw subject public key.
    #[must_use]
    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    /// Returns the DER encoding, empty for hand-built certificates.
    #[must_use]
    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// Returns `true` if `now` lies inside the validity period.
    #[must_use]
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.not_before <= now && now <= self.not_after
    }

    /// Stable identity used as the validation cache key.
    #[must_use]
    pub fn identity(&self) -> String {
        format!("{}|{}", normalize_dn(&self.issuer_dn), self.serial_number)
    }

    /// SHA-256 fingerprint of the DER encoding, or of the identity when the
    /// certificate was built by hand.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        if self.der.is_empty() {
            hex::encode(Sha256::digest(self.identity().as_bytes()))
        } else {
            hex::encode(Sha256::digest(&self.der))
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use chrono::Duration;
    use proptest::prelude::*;
    use signet_storage::WorkerId;

    use super::*;

    #[test]
    fn test_serial_leading_zero_is_ignored() {
        let padded = SerialNumber::parse("0x0111114711").unwrap();
        let plain = SerialNumber::parse("0x111114711").unwrap();
        assert_eq!(padded, plain);
        assert_eq!(plain.as_hex(), "111114711");
    }

    #[test]
    fn test_serial_from_der_bytes_matches_hex() {
        // DER sign-bit padding: 0x00 prepended to a high-bit serial.
        let from_bytes = SerialNumber::from_bytes(&[0x00, 0xAB, 0xCD]);
        assert_eq!(from_bytes, SerialNumber::parse("abcd").unwrap());
        assert_eq!(SerialNumber::from_bytes(&[0x00]).as_hex(), "0");
    }

    #[test]
    fn test_serial_rejects_non_hex() {
        assert!(SerialNumber::parse("").is_err());
        assert!(SerialNumber::parse("0x").is_err());
        assert!(SerialNumber::parse("12g4").is_err());
    }

    #[test]
    fn test_serial_serde_normalizes() {
        let serial: SerialNumber = serde_json::from_str("\"0x00FF\"").unwrap();
        assert_eq!(serial.as_hex(), "ff");
        assert_eq!(serde_json::to_string(&serial).unwrap(), "\"ff\"");
        assert!(serde_json::from_str::<SerialNumber>("\"zz\"").is_err());
    }

    #[test]
    fn test_normalize_dn() {
        assert_eq!(normalize_dn("CN=X"), "CN=X");
        assert_eq!(normalize_dn("cn = Signer 1 , o=Acme,  c=SE"), "CN=Signer 1,O=Acme,C=SE");
        assert_eq!(normalize_dn("CN=Doe\\, John,O=Acme"), "CN=Doe\\, John,O=Acme");
        // Order is significant.
        assert_ne!(normalize_dn("CN=A,O=B"), normalize_dn("O=B,CN=A"));
    }

    #[test]
    fn test_identity_ignores_formatting_differences() {
        let now = Utc::now();
        let a = Certificate::builder()
            .subject_dn("CN=client")
            .issuer_dn("CN=Issuer, O=Acme")
            .serial_number(SerialNumber::parse("0x00ab").unwrap())
            .not_before(now)
            .not_after(now)
            .build();
        let b = Certificate::builder()
            .subject_dn("CN=other")
            .issuer_dn("cn=Issuer,o=Acme")
            .serial_number(SerialNumber::parse("AB").unwrap())
            .not_before(now)
            .not_after(now)
            .build();
        assert_eq!(a.identity(), b.identity());
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_is_valid_at_bounds() {
        let now = Utc::now();
        let cert = Certificate::builder()
            .subject_dn("CN=s")
            .issuer_dn("CN=i")
            .serial_number(SerialNumber::from_bytes(&[1]))
            .not_before(now - Duration::days(1))
            .not_after(now + Duration::days(1))
            .build();
        assert!(cert.is_valid_at(now));
        assert!(!cert.is_valid_at(now - Duration::days(2)));
        assert!(!cert.is_valid_at(now + Duration::days(2)));
    }

    #[test]
    fn test_from_der_rejects_oversized_and_garbage() {
        assert!(matches!(
            Certificate::from_der(&vec![0u8; MAX_CERT_SIZE + 1]),
            Err(CertificateError::TooLarge(_))
        ));
        assert!(matches!(
            Certificate::from_der(b"not a certificate"),
            Err(CertificateError::Parse(_))
        ));
    }

    #[test]
    fn test_from_der_parses_generated_certificate() {
        let mut params = rcgen::CertificateParams::new(vec!["signer.test".to_owned()]).unwrap();
        params.distinguished_name = rcgen::DistinguishedName::new();
        params.distinguished_name.push(rcgen::DnType::CommonName, "Test Signer");
        params.serial_number = Some(rcgen::SerialNumber::from(vec![0x01, 0x11, 0x11, 0x47, 0x11]));
        params.not_before = rcgen::date_time_ymd(2020, 1, 1);
        params.not_after = rcgen::date_time_ymd(2040, 1, 1);
        let key_pair = rcgen::KeyPair::generate().unwrap();
        let generated = params.self_signed(&key_pair).unwrap();

        let cert = Certificate::from_der(generated.der()).unwrap();
        assert_eq!(cert.subject_dn(), "CN=Test Signer");
        assert_eq!(cert.issuer_dn(), "CN=Test Signer");
        assert_eq!(cert.serial_number(), &SerialNumber::parse("0x0111114711").unwrap());
        assert!(cert.is_valid_at(Utc::now()));
        assert!(!cert.public_key().is_empty());
        assert_eq!(cert.der(), &generated.der()[..]);
    }

    fn usage_period_value(fields: &[(u8, &str)]) -> Vec<u8> {
        let mut body = Vec::new();
        for (tag, time) in fields {
            body.push(*tag);
            body.push(u8::try_from(time.len()).unwrap());
            body.extend_from_slice(time.as_bytes());
        }
        let mut value = vec![0x30, u8::try_from(body.len()).unwrap()];
        value.extend(body);
        value
    }

    fn certificate_with_usage_period(value: Vec<u8>) -> Vec<u8> {
        let mut params = rcgen::CertificateParams::new(vec!["signer.test".to_owned()]).unwrap();
        params.distinguished_name = rcgen::DistinguishedName::new();
        params.distinguished_name.push(rcgen::DnType::CommonName, "Period Signer");
        params.not_before = rcgen::date_time_ymd(2020, 1, 1);
        params.not_after = rcgen::date_time_ymd(2030, 1, 1);
        let extension = rcgen::CustomExtension::from_oid_content(&[2, 5, 29, 16], value);
        params.custom_extensions.push(extension);
        let key_pair = rcgen::KeyPair::generate().unwrap();
        params.self_signed(&key_pair).unwrap().der().to_vec()
    }

    fn at(year: i32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(year, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_from_der_reads_private_key_usage_period() {
        let value = usage_period_value(&[(0x80, "20210101000000Z"), (0x81, "20240101000000Z")]);
        let cert = Certificate::from_der(&certificate_with_usage_period(value)).unwrap();
        assert_eq!(cert.private_key_usage_period(), (Some(at(2021)), Some(at(2024))));

        let config = crate::config::SignerValidityConfig::default();
        let check = |now| crate::pipeline::check_signer_validity(WorkerId(1), &cert, &config, now);
        check(at(2022)).unwrap();
        assert!(check(at(2025)).is_err(), "key usage ends before the certificate expires");
        assert!(check(at(2020)).is_err(), "key usage starts after the certificate");
    }

    #[test]
    fn test_usage_period_bounds_are_optional() {
        let value = usage_period_value(&[(0x81, "20260615123000Z")]);
        let cert = Certificate::from_der(&certificate_with_usage_period(value)).unwrap();
        let end = Utc.with_ymd_and_hms(2026, 6, 15, 12, 30, 0).unwrap();
        assert_eq!(cert.private_key_usage_period(), (None, Some(end)));

        let generated = certificate_with_usage_period(usage_period_value(&[]));
        let cert = Certificate::from_der(&generated).unwrap();
        assert_eq!(cert.private_key_usage_period(), (None, None));
    }

    #[test]
    fn test_explicitly_tagged_usage_period_is_accepted() {
        let time = b"20220301000000Z";
        let mut value = vec![0x30, 19, 0xA0, 17, 0x18, 15];
        value.extend_from_slice(time);
        let cert = Certificate::from_der(&certificate_with_usage_period(value)).unwrap();
        let start = Utc.with_ymd_and_hms(2022, 3, 1, 0, 0, 0).unwrap();
        assert_eq!(cert.private_key_usage_period(), (Some(start), None));
    }

    #[test]
    fn test_malformed_usage_period_is_rejected() {
        for value in [
            vec![0x30, 0x05, 0x80, 0x0f],
            usage_period_value(&[(0x80, "not a time")]),
            usage_period_value(&[(0x82, "20210101000000Z")]),
        ] {
            let der = certificate_with_usage_period(value);
            assert!(matches!(Certificate::from_der(&der), Err(CertificateError::Parse(_))));
        }
    }

    #[test]
    fn test_certificate_without_usage_period_has_none() {
        let mut params = rcgen::CertificateParams::new(vec!["plain.test".to_owned()]).unwrap();
        params.not_before = rcgen::date_time_ymd(2020, 1, 1);
        params.not_after = rcgen::date_time_ymd(2030, 1, 1);
        let key_pair = rcgen::KeyPair::generate().unwrap();
        let der = params.self_signed(&key_pair).unwrap().der().to_vec();
        assert_eq!(Certificate::from_der(&der).unwrap().private_key_usage_period(), (None, None));
    }

    proptest! {
        /// Any number of leading zeros and an optional prefix normalize away.
        #[test]
        fn serial_normalization_ignores_padding(
            digits in "[1-9a-f][0-9a-f]{0,15}",
            zeros in 0usize..4,
            prefixed in any::<bool>(),
        ) {
            let prefix = if prefixed { "0x" } else { "" };
            let padded = format!("{prefix}{}{digits}", "0".repeat(zeros));
            let a = SerialNumber::parse(&padded).unwrap();
            let b = SerialNumber::parse(&digits.to_ascii_uppercase()).unwrap();
            prop_assert_eq!(a, b);
        }

        /// Normalizing twice is the same as normalizing once.
        #[test]
        fn dn_normalization_is_idempotent(dn in "([a-zA-Z]{1,3} ?= ?[a-zA-Z0-9 ]{1,8}, ?){0,3}[a-zA-Z]{1,3}=[a-zA-Z0-9]{1,8}") {
            let once = normalize_dn(&dn);
            prop_assert_eq!(normalize_dn(&once), once.clone());
        }
    }
}
