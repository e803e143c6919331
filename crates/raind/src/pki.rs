//! SPIFFE client certificate issuance.
//!
//! The `createRuntime` hook sends a CSR carrying exactly one URI SAN,
//! `spiffe://<trust domain>/container/<id>`. The issuer verifies it, signs it
//! with the client CA and records the identity against the container.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use once_cell::sync::Lazy;
use raind_common::fs::atomic_write;
use raind_common::{RaindError, RaindResult};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, CertificateSigningRequestParams, DnType,
    ExtendedKeyUsagePurpose, Ia5String, IsCa, KeyPair, KeyUsagePurpose, SanType,
};
use regex::Regex;
use time::{Duration, OffsetDateTime};

use crate::runtime::ContainerStore;

/// Validity of issued client certificates.
pub const CERT_VALIDITY_DAYS: i64 = 365;

/// The only role certificates are issued for.
pub const CONTAINER_ROLE: &str = "container";

/// File name of the client CA certificate under the PKI directory.
pub const CA_CERT: &str = "client-ca.crt";
const CA_KEY: &str = "client-ca.key";

static SPIFFE_URI: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^spiffe://([a-z0-9.\-]+)/([a-z0-9-]+)/([a-z0-9-]+)$")
        .unwrap_or_else(|_| unreachable!("static pattern"))
});

/// A parsed SPIFFE id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpiffeId {
    /// Trust domain.
    pub trust_domain: String,
    /// Workload role.
    pub role: String,
    /// Workload id.
    pub id: String,
}

impl SpiffeId {
    /// The id of a container.
    pub fn container(trust_domain: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            trust_domain: trust_domain.into(),
            role: CONTAINER_ROLE.to_string(),
            id: id.into(),
        }
    }

    /// Parse `spiffe://<trust domain>/<role>/<id>`.
    ///
    /// # Errors
    ///
    /// Returns a validation error for anything else, or a role other than
    /// `container`.
    pub fn parse(uri: &str) -> RaindResult<Self> {
        let captures = SPIFFE_URI
            .captures(uri)
            .ok_or_else(|| RaindError::validation("spiffe id", uri.to_string()))?;
        let parsed = Self {
            trust_domain: captures[1].to_string(),
            role: captures[2].to_string(),
            id: captures[3].to_string(),
        };
        if parsed.role != CONTAINER_ROLE {
            return Err(RaindError::validation(
                "spiffe id",
                format!("unsupported role {} in {uri}", parsed.role),
            ));
        }
        Ok(parsed)
    }
}

impl fmt::Display for SpiffeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "spiffe://{}/{}/{}", self.trust_domain, self.role, self.id)
    }
}

/// A signed client certificate.
#[derive(Debug, Clone)]
pub struct IssuedCertificate {
    /// Identity in the SAN.
    pub spiffe_id: SpiffeId,
    /// PEM-encoded certificate.
    pub pem: String,
}

fn pki_error(context: &str, err: &rcgen::Error) -> RaindError {
    RaindError::Pki {
        message: format!("{context}: {err}"),
    }
}

/// Signs container CSRs with the client CA.
pub struct PkiIssuer {
    trust_domain: String,
    ca_cert: Certificate,
    ca_key: KeyPair,
    ca_pem: String,
    containers: Arc<ContainerStore>,
}

impl fmt::Debug for PkiIssuer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PkiIssuer")
            .field("trust_domain", &self.trust_domain)
            .finish_non_exhaustive()
    }
}

impl PkiIssuer {
    /// Load the client CA from `dir`, generating and persisting one when
    /// absent.
    ///
    /// # Errors
    ///
    /// Returns I/O or certificate errors.
    pub fn load_or_generate(
        dir: &Path,
        trust_domain: impl Into<String>,
        containers: Arc<ContainerStore>,
    ) -> RaindResult<Self> {
        let trust_domain = trust_domain.into();
        let cert_path = dir.join(CA_CERT);
        let key_path = dir.join(CA_KEY);

        let (params, ca_key, ca_pem) = if cert_path.exists() && key_path.exists() {
            let ca_pem = std::fs::read_to_string(&cert_path)?;
            let key_pem = std::fs::read_to_string(&key_path)?;
            let ca_key = KeyPair::from_pem(&key_pem).map_err(|e| pki_error("load CA key", &e))?;
            let params = CertificateParams::from_ca_cert_pem(&ca_pem)
                .map_err(|e| pki_error("load CA certificate", &e))?;
            tracing::debug!(path = %cert_path.display(), "Loaded client CA");
            (params, ca_key, Some(ca_pem))
        } else {
            let ca_key = KeyPair::generate().map_err(|e| pki_error("generate CA key", &e))?;
            let mut params =
                CertificateParams::new(Vec::<String>::new()).map_err(|e| pki_error("CA params", &e))?;
            params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
            params
                .distinguished_name
                .push(DnType::CommonName, format!("raind client CA ({trust_domain})"));
            params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
            params.not_before = OffsetDateTime::now_utc();
            params.not_after = OffsetDateTime::now_utc() + Duration::days(CERT_VALIDITY_DAYS * 10);
            (params, ca_key, None)
        };

        let ca_cert = params
            .self_signed(&ca_key)
            .map_err(|e| pki_error("self-sign CA", &e))?;
        let ca_pem = match ca_pem {
            Some(pem) => pem,
            None => {
                std::fs::create_dir_all(dir)?;
                let pem = ca_cert.pem();
                atomic_write(&cert_path, pem.as_bytes())?;
                atomic_write(&key_path, ca_key.serialize_pem().as_bytes())?;
                tracing::info!(path = %cert_path.display(), "Generated client CA");
                pem
            }
        };

        Ok(Self {
            trust_domain,
            ca_cert,
            ca_key,
            ca_pem,
            containers,
        })
    }

    /// PEM of the client CA certificate.
    #[must_use]
    pub fn ca_pem(&self) -> &str {
        &self.ca_pem
    }

    /// Trust domain certificates are issued in.
    #[must_use]
    pub fn trust_domain(&self) -> &str {
        &self.trust_domain
    }

    /// Issue a server certificate for the hook listener, valid for `hosts`
    /// (DNS names or IP addresses); returns `(certificate, key)` as PEM.
    ///
    /// # Errors
    ///
    /// Returns [`RaindError::Pki`] when a host is not a valid SAN or signing
    /// fails.
    pub fn server_identity(&self, hosts: Vec<String>) -> RaindResult<(String, String)> {
        let key = KeyPair::generate().map_err(|e| pki_error("generate server key", &e))?;
        let mut params = CertificateParams::new(hosts).map_err(|e| pki_error("server SAN", &e))?;
        params
            .distinguished_name
            .push(DnType::CommonName, "raindd hook listener");
        let now = OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + Duration::days(CERT_VALIDITY_DAYS);
        params.is_ca = IsCa::ExplicitNoCa;
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        let cert = params
            .signed_by(&key, &self.ca_cert, &self.ca_key)
            .map_err(|e| pki_error("sign server certificate", &e))?;
        tracing::debug!(trust_domain = %self.trust_domain, "Hook listener certificate issued");
        Ok((cert.pem(), key.serialize_pem()))
    }

    /// Verify and sign a PEM CSR.
    ///
    /// # Errors
    ///
    /// Returns [`RaindError::Validation`] for unparsable or badly signed CSRs
    /// and for a missing, duplicated or foreign SPIFFE URI,
    /// [`RaindError::NotFound`] for unknown containers and [`RaindError::Pki`]
    /// when signing itself fails.
    pub fn sign(&self, csr_pem: &str) -> RaindResult<IssuedCertificate> {
        let mut csr = CertificateSigningRequestParams::from_pem(csr_pem)
            .map_err(|e| RaindError::validation("csr", e.to_string()))?;

        let uris: Vec<&str> = csr
            .params
            .subject_alt_names
            .iter()
            .filter_map(|san| match san {
                SanType::URI(uri) => Some(uri.as_str()),
                _ => None,
            })
            .collect();
        let [uri] = uris.as_slice() else {
            return Err(RaindError::validation(
                "spiffe id",
                format!("expected exactly one URI SAN, found {}", uris.len()),
            ));
        };
        let spiffe_id = SpiffeId::parse(uri)?;
        if spiffe_id.trust_domain != self.trust_domain {
            return Err(RaindError::validation(
                "spiffe id",
                format!(
                    "trust domain {} does not match {}",
                    spiffe_id.trust_domain, self.trust_domain
                ),
            ));
        }
        // the container must exist before anything is signed
        self.containers.get(&spiffe_id.id)?;

        let now = OffsetDateTime::now_utc();
        csr.params.not_before = now;
        csr.params.not_after = now + Duration::days(CERT_VALIDITY_DAYS);
        csr.params.is_ca = IsCa::ExplicitNoCa;
        csr.params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        csr.params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];

        let cert = csr
            .signed_by(&self.ca_cert, &self.ca_key)
            .map_err(|e| pki_error("sign CSR", &e))?;

        let recorded = spiffe_id.to_string();
        self.containers.update(&spiffe_id.id, |record| {
            record.spiffe_id = Some(recorded);
            Ok(())
        })?;
        tracing::info!(container_id = %spiffe_id.id, spiffe_id = %spiffe_id, "Client certificate issued");

        Ok(IssuedCertificate {
            spiffe_id,
            pem: cert.pem(),
        })
    }
}

/// Build a PEM CSR for `spiffe_id` with a fresh key; returns `(csr, key)`.
///
/// # Errors
///
/// Returns [`RaindError::Pki`] when key generation or encoding fails.
pub fn container_csr(spiffe_id: &SpiffeId) -> RaindResult<(String, String)> {
    let key = KeyPair::generate().map_err(|e| pki_error("generate key", &e))?;
    let mut params =
        CertificateParams::new(Vec::<String>::new()).map_err(|e| pki_error("CSR params", &e))?;
    params
        .distinguished_name
        .push(DnType::CommonName, spiffe_id.id.clone());
    let uri = Ia5String::try_from(spiffe_id.to_string()).map_err(|e| pki_error("SAN", &e))?;
    params.subject_alt_names = vec![SanType::URI(uri)];
    let csr = params
        .serialize_request(&key)
        .map_err(|e| pki_error("serialize CSR", &e))?;
    let pem = csr.pem().map_err(|e| pki_error("encode CSR", &e))?;
    Ok((pem, key.serialize_pem()))
}
