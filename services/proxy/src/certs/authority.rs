//! Self-signed root and leaf issuance.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use chrono::{DateTime, Duration, Utc};
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    Ia5String, IsCa, KeyPair, KeyUsagePurpose, SanType, SerialNumber,
};
use time::OffsetDateTime;

use super::{CertError, Certificate};

pub const CA_COMMON_NAME: &str = "hostgate Local CA";
pub const CA_ORG_NAME: &str = "hostgate";

/// Root validity for a freshly generated CA.
pub const CA_VALIDITY_DAYS: i64 = 3650;

/// The local root used to sign leaf certificates.
pub struct CertificateAuthority {
    issuer: rcgen::Certificate,
    key: KeyPair,
    cert_pem: String,
}

impl fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("common_name", &CA_COMMON_NAME)
            .finish_non_exhaustive()
    }
}

fn to_offset(at: DateTime<Utc>) -> Result<OffsetDateTime, CertError> {
    OffsetDateTime::from_unix_timestamp(at.timestamp())
        .map_err(|e| CertError::InvalidMaterial(format!("validity out of range: {e}")))
}

/// `now`, truncated to whole seconds as X.509 stores it.
fn now_seconds() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp(now.timestamp(), 0).unwrap_or(now)
}

impl CertificateAuthority {
    /// Generate a new self-signed root.
    pub fn generate() -> Result<Self, CertError> {
        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, CA_COMMON_NAME);
        dn.push(DnType::OrganizationName, CA_ORG_NAME);
        params.distinguished_name = dn;

        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let now = now_seconds();
        params.not_before = to_offset(now)?;
        params.not_after = to_offset(now + Duration::days(CA_VALIDITY_DAYS))?;
        params.serial_number = Some(SerialNumber::from(rand::random::<u64>()));

        let key = KeyPair::generate()?;
        let issuer = params.self_signed(&key)?;
        let cert_pem = issuer.pem();

        Ok(Self {
            issuer,
            key,
            cert_pem,
        })
    }

    /// Load a root from its PEM-encoded certificate and private key.
    pub fn load(cert_pem: &str, key_pem: &str) -> Result<Self, CertError> {
        let key = KeyPair::from_pem(key_pem)
            .map_err(|e| CertError::InvalidMaterial(format!("CA key: {e}")))?;
        let params = CertificateParams::from_ca_cert_pem(cert_pem)
            .map_err(|e| CertError::InvalidMaterial(format!("CA certificate: {e}")))?;
        if !matches!(params.is_ca, IsCa::Ca(_)) {
            return Err(CertError::InvalidMaterial(
                "CA certificate is not a certificate authority".to_string(),
            ));
        }

        // Re-signing yields an issuer with the same subject and key; the
        // original PEM stays the one clients trust.
        let issuer = params.self_signed(&key)?;

        Ok(Self {
            issuer,
            key,
            cert_pem: cert_pem.to_string(),
        })
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    pub fn key_pem(&self) -> String {
        self.key.serialize_pem()
    }

    /// Issue a wildcard leaf for `suffix`, valid from now for `validity`.
    pub fn issue_leaf(&self, suffix: &str, validity: Duration) -> Result<Certificate, CertError> {
        let wildcard = format!("*.{suffix}");

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, wildcard.as_str());
        dn.push(DnType::OrganizationName, CA_ORG_NAME);
        params.distinguished_name = dn;

        let mut sans = vec![
            SanType::DnsName(Ia5String::try_from(wildcard.as_str())?),
            SanType::DnsName(Ia5String::try_from(suffix)?),
        ];
        if suffix != "localhost" {
            sans.push(SanType::DnsName(Ia5String::try_from("localhost")?));
        }
        sans.push(SanType::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST)));
        sans.push(SanType::IpAddress(IpAddr::V6(Ipv6Addr::LOCALHOST)));
        params.subject_alt_names = sans;

        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.use_authority_key_identifier_extension = true;

        let now = now_seconds();
        let not_after = now + validity;
        params.not_before = to_offset(now)?;
        params.not_after = to_offset(not_after)?;
        params.serial_number = Some(SerialNumber::from(rand::random::<u64>()));

        let key = KeyPair::generate()?;
        let cert = params.signed_by(&key, &self.issuer, &self.key)?;

        Ok(Certificate {
            domain_suffix: suffix.to_string(),
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
            not_after,
        })
    }
}
