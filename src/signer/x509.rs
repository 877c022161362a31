//! X.509 support: building the to-be-signed parts of self-signed
//! certificates and certificate requests, and reading certificates that
//! are imported.
//!
//! Nothing in here signs. The caller sends the to-be-signed bytes through
//! the normal signing path of the token holding the key and then completes
//! the structure with the signature.
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bcder::decode::Constructed as DecodeConstructed;
use bcder::encode::{Constructed, PrimitiveContent, Values};
use bcder::{BitString, Captured, Mode, OctetString, Oid, Tag, decode, encode};
use bytes::Bytes;
use chrono::{DateTime, Datelike, Utc};
use openssl::x509::X509;

use crate::commons::error::Error;
use crate::signer::algorithm::SignAlgorithm;
use crate::signer::model::{CertRequestFormat, KeyUsage};

//------------ OIDs ----------------------------------------------------------

const AT_COUNTRY: Oid<&[u8]> = Oid(&[85, 4, 6]);
const AT_STATE: Oid<&[u8]> = Oid(&[85, 4, 8]);
const AT_LOCALITY: Oid<&[u8]> = Oid(&[85, 4, 7]);
const AT_ORGANIZATION: Oid<&[u8]> = Oid(&[85, 4, 10]);
const AT_ORGANIZATIONAL_UNIT: Oid<&[u8]> = Oid(&[85, 4, 11]);
const AT_COMMON_NAME: Oid<&[u8]> = Oid(&[85, 4, 3]);
const AT_SERIAL_NUMBER: Oid<&[u8]> = Oid(&[85, 4, 5]);

const CE_KEY_USAGE: Oid<&[u8]> = Oid(&[85, 29, 15]);
const CE_BASIC_CONSTRAINTS: Oid<&[u8]> = Oid(&[85, 29, 19]);
const CE_EXTENDED_KEY_USAGE: Oid<&[u8]> = Oid(&[85, 29, 37]);
const KP_CLIENT_AUTH: Oid<&[u8]> = Oid(&[43, 6, 1, 5, 5, 7, 3, 2]);
const PKCS9_EXTENSION_REQUEST: Oid<&[u8]> = Oid(&[42, 134, 72, 134, 247, 13, 1, 9, 14]);

//------------ Key usage bits ------------------------------------------------

const KU_DIGITAL_SIGNATURE: usize = 0;
const KU_NON_REPUDIATION: usize = 1;
const KU_KEY_ENCIPHERMENT: usize = 2;
const KU_DATA_ENCIPHERMENT: usize = 3;
const KU_KEY_AGREEMENT: usize = 4;

fn key_usage_bits(usage: KeyUsage) -> BitString {
    let bits: &[usize] = match usage {
        KeyUsage::Signing => &[KU_NON_REPUDIATION],
        KeyUsage::Authentication => &[
            KU_DIGITAL_SIGNATURE,
            KU_KEY_ENCIPHERMENT,
            KU_DATA_ENCIPHERMENT,
            KU_KEY_AGREEMENT,
        ],
    };
    let byte = bits.iter().fold(0u8, |acc, bit| acc | (0x80 >> bit));
    BitString::new(byte.trailing_zeros() as u8, Bytes::copy_from_slice(&[byte]))
}

fn decode_err(e: impl std::fmt::Display) -> Error {
    Error::invalid(format!("invalid DER: {}", e))
}

//------------ Name ----------------------------------------------------------

/// A distinguished name given as comma separated `TYPE=value` pairs.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Name {
    rdns: Vec<(&'static str, String)>,
}

impl Name {
    const TYPES: &'static [&'static str] = &["C", "ST", "L", "O", "OU", "CN", "SERIALNUMBER"];

    pub fn parse(s: &str) -> Result<Self, Error> {
        let mut rdns = vec![];
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (typ, value) = part
                .split_once('=')
                .ok_or_else(|| Error::invalid(format!("invalid name component '{}'", part)))?;
            let typ = typ.trim().to_ascii_uppercase();
            let typ = Self::TYPES
                .iter()
                .find(|t| **t == typ)
                .ok_or_else(|| Error::invalid(format!("unsupported name attribute '{}'", typ)))?;
            let value = value.trim();
            if value.is_empty() {
                return Err(Error::invalid(format!("empty value for '{}'", typ)));
            }
            rdns.push((*typ, value.to_string()));
        }
        if rdns.is_empty() {
            return Err(Error::invalid("empty subject name"));
        }
        Ok(Name { rdns })
    }

    pub fn common_name(cn: &str) -> Result<Self, Error> {
        Self::parse(&format!("CN={}", cn))
    }

    /// Normalised representation used to compare names.
    pub fn normalized(&self) -> String {
        self.rdns
            .iter()
            .map(|(t, v)| format!("{}={}", t, v.to_lowercase()))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn oid(typ: &str) -> Oid<&'static [u8]> {
        match typ {
            "C" => AT_COUNTRY,
            "ST" => AT_STATE,
            "L" => AT_LOCALITY,
            "O" => AT_ORGANIZATION,
            "OU" => AT_ORGANIZATIONAL_UNIT,
            "SERIALNUMBER" => AT_SERIAL_NUMBER,
            _ => AT_COMMON_NAME,
        }
    }

    /// Encodes the name as an RDNSequence with one attribute per RDN.
    fn to_captured(&self) -> Captured {
        let rdns: Vec<Captured> = self
            .rdns
            .iter()
            .map(|(typ, value)| {
                let tag = match *typ {
                    "C" | "SERIALNUMBER" => Tag::PRINTABLE_STRING,
                    _ => Tag::UTF8_STRING,
                };
                Captured::from_values(
                    Mode::Der,
                    encode::set(encode::sequence((
                        Self::oid(typ).encode(),
                        OctetString::new(Bytes::from(value.clone())).encode_as(tag),
                    ))),
                )
            })
            .collect();
        Captured::from_values(Mode::Der, encode::sequence(rdns))
    }
}

//------------ Validity time -------------------------------------------------

/// UTCTime until 2049, GeneralizedTime after.
fn encode_time(time: &DateTime<Utc>) -> impl Values {
    if time.year() < 2050 {
        let s = time.format("%y%m%d%H%M%SZ").to_string();
        OctetString::new(Bytes::from(s)).encode_as(Tag::UTC_TIME)
    } else {
        let s = time.format("%Y%m%d%H%M%SZ").to_string();
        OctetString::new(Bytes::from(s)).encode_as(Tag::GENERALIZED_TIME)
    }
}

fn capture_spki(public_key_der: &[u8]) -> Result<Captured, Error> {
    Mode::Der
        .decode(Bytes::copy_from_slice(public_key_der), |cons| cons.capture_one())
        .map_err(decode_err)
}

fn encode_key_usage_extension(usage: KeyUsage) -> impl Values {
    let value = key_usage_bits(usage).encode().to_captured(Mode::Der).into_bytes();
    encode::sequence((
        CE_KEY_USAGE.encode(),
        true.encode(),
        OctetString::new(value).encode(),
    ))
}

//------------ TbsCertificate ------------------------------------------------

/// The to-be-signed part of a self-signed certificate.
///
/// ```text
/// TBSCertificate  ::=  SEQUENCE  {
///     version         [0]  EXPLICIT Version DEFAULT v1,
///     serialNumber         CertificateSerialNumber,
///     signature            AlgorithmIdentifier,
///     issuer               Name,
///     validity             Validity,
///     subject              Name,
///     subjectPublicKeyInfo SubjectPublicKeyInfo,
///     extensions      [3]  EXPLICIT Extensions OPTIONAL }
/// ```
pub struct TbsCertificate {
    encoded: Captured,
    algorithm: SignAlgorithm,
}

impl TbsCertificate {
    pub fn new(
        serial_number: u64,
        subject: &Name,
        not_before: DateTime<Utc>,
        not_after: DateTime<Utc>,
        public_key_der: &[u8],
        usage: KeyUsage,
        algorithm: SignAlgorithm,
    ) -> Result<Self, Error> {
        if not_after <= not_before {
            return Err(Error::invalid("certificate must not expire before it is valid"));
        }
        let name = subject.to_captured();
        let spki = capture_spki(public_key_der)?;

        let basic_constraints = encode::sequence((
            CE_BASIC_CONSTRAINTS.encode(),
            true.encode(),
            OctetString::new(encode::sequence(encode::Nothing).to_captured(Mode::Der).into_bytes())
                .encode(),
        ));

        let encoded = encode::sequence((
            (
                Constructed::new(Tag::CTX_0, 2.encode()),
                serial_number.encode(),
                algorithm.x509_signature_encode(),
                name.clone(),
            ),
            (
                encode::sequence((encode_time(&not_before), encode_time(&not_after))),
                name,
                spki,
                encode::sequence_as(
                    Tag::CTX_3,
                    encode::sequence((basic_constraints, encode_key_usage_extension(usage))),
                ),
            ),
        ))
        .to_captured(Mode::Der);

        Ok(TbsCertificate { encoded, algorithm })
    }

    pub fn to_be_signed(&self) -> &[u8] {
        self.encoded.as_slice()
    }

    pub fn sign_algorithm(&self) -> SignAlgorithm {
        self.algorithm
    }

    /// Completes the certificate with the signature over the to-be-signed
    /// bytes, returning the DER encoded certificate.
    pub fn into_certificate(self, signature: Bytes) -> Bytes {
        encode::sequence((
            self.encoded,
            self.algorithm.x509_signature_encode(),
            BitString::new(0, signature).encode(),
        ))
        .to_captured(Mode::Der)
        .into_bytes()
    }
}

//------------ TbsCertRequest ------------------------------------------------

/// The to-be-signed part of a PKCS#10 certificate request.
///
/// ```text
/// CertificationRequestInfo ::= SEQUENCE {
///     version       INTEGER { v1(0) },
///     subject       Name,
///     subjectPKInfo SubjectPublicKeyInfo,
///     attributes    [0] Attributes }
/// ```
///
/// The attributes hold an extension request for the key usage.
pub struct TbsCertRequest {
    encoded: Captured,
    algorithm: SignAlgorithm,
}

impl TbsCertRequest {
    pub fn new(
        subject: &Name,
        public_key_der: &[u8],
        usage: KeyUsage,
        algorithm: SignAlgorithm,
    ) -> Result<Self, Error> {
        let name = subject.to_captured();
        let spki = capture_spki(public_key_der)?;

        let extension_request = encode::sequence((
            PKCS9_EXTENSION_REQUEST.encode(),
            encode::set(encode::sequence(encode_key_usage_extension(usage))),
        ));

        let encoded = encode::sequence((
            0.encode(),
            name,
            spki,
            Constructed::new(Tag::CTX_0, extension_request),
        ))
        .to_captured(Mode::Der);

        Ok(TbsCertRequest { encoded, algorithm })
    }

    pub fn to_be_signed(&self) -> &[u8] {
        self.encoded.as_slice()
    }

    pub fn sign_algorithm(&self) -> SignAlgorithm {
        self.algorithm
    }

    pub fn into_request(self, signature: Bytes, format: CertRequestFormat) -> Bytes {
        let der = encode::sequence((
            self.encoded,
            self.algorithm.x509_signature_encode(),
            BitString::new(0, signature).encode(),
        ))
        .to_captured(Mode::Der)
        .into_bytes();

        match format {
            CertRequestFormat::Der => der,
            CertRequestFormat::Pem => Bytes::from(to_pem("CERTIFICATE REQUEST", &der)),
        }
    }
}

pub fn to_pem(label: &str, der: &[u8]) -> String {
    let encoded = BASE64.encode(der);
    let mut pem = format!("-----BEGIN {}-----\n", label);
    for line in encoded.as_bytes().chunks(64) {
        pem.push_str(&String::from_utf8_lossy(line));
        pem.push('\n');
    }
    pem.push_str(&format!("-----END {}-----\n", label));
    pem
}

//------------ ParsedCert ----------------------------------------------------

/// A certificate offered for import.
pub struct ParsedCert {
    x509: X509,
    der: Bytes,
}

impl ParsedCert {
    /// Parses a DER or PEM encoded certificate.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let x509 = if bytes.starts_with(b"-----BEGIN") {
            X509::from_pem(bytes)
        } else {
            X509::from_der(bytes)
        }
        .map_err(|e| Error::invalid(format!("cannot parse certificate: {}", e)))?;
        let der = Bytes::from(x509.to_der()?);
        Ok(ParsedCert { x509, der })
    }

    pub fn der(&self) -> &Bytes {
        &self.der
    }

    pub fn x509(&self) -> &X509 {
        &self.x509
    }

    /// The base64 encoded SubjectPublicKeyInfo.
    pub fn public_key_base64(&self) -> Result<String, Error> {
        let der = self.x509.public_key()?.public_key_to_der()?;
        Ok(BASE64.encode(der))
    }

    /// The subject in the form used by [`Name::normalized`].
    pub fn subject_normalized(&self) -> String {
        self.x509
            .subject_name()
            .entries()
            .map(|entry| {
                let typ = entry
                    .object()
                    .nid()
                    .short_name()
                    .map(|s| s.to_ascii_uppercase())
                    .unwrap_or_else(|_| entry.object().to_string());
                let value = entry
                    .data()
                    .as_utf8()
                    .map(|v| v.to_string().to_lowercase())
                    .unwrap_or_default();
                format!("{}={}", typ, value)
            })
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub fn is_self_signed(&self) -> bool {
        let same_name = self.x509.subject_name().to_der().ok()
            == self.x509.issuer_name().to_der().ok();
        same_name
            && self
                .x509
                .public_key()
                .and_then(|key| self.x509.verify(&key))
                .unwrap_or(false)
    }

    /// Determines what the certificate may be used for.
    ///
    /// Signing certificates have the nonRepudiation key usage,
    /// authentication certificates digitalSignature, keyEncipherment or
    /// dataEncipherment, or the clientAuth extended key usage. A missing
    /// key usage or both usages are an error.
    pub fn usage(&self) -> Result<KeyUsage, Error> {
        let exts = Mode::Ber
            .decode(self.der.clone(), |cons| {
                cons.take_sequence(|cons| {
                    let exts = cons.take_sequence(CertExtensions::take_from_tbs)?;
                    cons.capture_all()?;
                    Ok(exts)
                })
            })
            .map_err(decode_err)?;

        let key_usage = exts
            .key_usage
            .ok_or_else(|| Error::WrongCertUsage("certificate has no key usage".to_string()))?;
        let bits = Mode::Der
            .decode(key_usage, BitString::take_from)
            .map_err(decode_err)?;

        let client_auth = match exts.extended_key_usage {
            Some(eku) => Mode::Der
                .decode(eku, |cons| {
                    cons.take_sequence(|cons| {
                        let mut found = false;
                        while let Some(oid) = Oid::take_opt_from(cons)? {
                            found |= oid == KP_CLIENT_AUTH;
                        }
                        Ok(found)
                    })
                })
                .map_err(decode_err)?,
            None => false,
        };

        let signing = bits.bit(KU_NON_REPUDIATION);
        let auth = bits.bit(KU_DIGITAL_SIGNATURE)
            || bits.bit(KU_KEY_ENCIPHERMENT)
            || bits.bit(KU_DATA_ENCIPHERMENT)
            || client_auth;

        match (signing, auth) {
            (true, false) => Ok(KeyUsage::Signing),
            (false, true) => Ok(KeyUsage::Authentication),
            (true, true) => Err(Error::WrongCertUsage(
                "certificate has both signing and authentication usage".to_string(),
            )),
            (false, false) => Err(Error::WrongCertUsage(
                "certificate has neither signing nor authentication usage".to_string(),
            )),
        }
    }
}

//------------ CertExtensions ------------------------------------------------

/// The raw values of the extensions that determine certificate usage.
#[derive(Default)]
struct CertExtensions {
    key_usage: Option<Bytes>,
    extended_key_usage: Option<Bytes>,
}

impl CertExtensions {
    /// Takes the content of a TBSCertificate, keeping the usage extensions.
    fn take_from_tbs<S: decode::Source>(
        cons: &mut DecodeConstructed<S>,
    ) -> Result<Self, decode::DecodeError<S::Error>> {
        cons.take_opt_constructed_if(Tag::CTX_0, |cons| cons.capture_all())?;
        // serialNumber, signature, issuer, validity, subject, spki
        for _ in 0..6 {
            cons.capture_one()?;
        }

        let mut exts = CertExtensions::default();
        cons.take_opt_constructed_if(Tag::CTX_3, |cons| {
            cons.take_sequence(|cons| {
                while let Some(()) = cons.take_opt_sequence(|cons| {
                    let id = Oid::take_from(cons)?;
                    let _critical = cons.take_opt_bool()?;
                    let value = OctetString::take_from(cons)?;
                    if id == CE_KEY_USAGE {
                        exts.key_usage = Some(value.to_bytes());
                    } else if id == CE_EXTENDED_KEY_USAGE {
                        exts.extended_key_usage = Some(value.to_bytes());
                    }
                    Ok(())
                })? {}
                Ok(())
            })
        })?;
        cons.capture_all()?;
        Ok(exts)
    }
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use openssl::pkey::{PKey, Private};
    use openssl::rsa::Rsa;
    use openssl::x509::X509Req;

    use super::*;
    use crate::signer::algorithm::{DigestAlgorithm, SignatureScheme};

    fn sign(pkey: &PKey<Private>, algorithm: SignAlgorithm, tbs: &[u8]) -> Bytes {
        let mechanism = match algorithm.scheme() {
            SignatureScheme::RsaPss => "CKM_RSA_PKCS_PSS",
            _ => "CKM_RSA_PKCS",
        };
        let hash = algorithm.digest().digest(tbs).unwrap();
        algorithm
            .prepare(mechanism, &hash)
            .unwrap()
            .sign_with(pkey)
            .unwrap()
    }

    fn pkcs1(digest: DigestAlgorithm) -> SignAlgorithm {
        SignAlgorithm::rsa(digest)
    }

    #[test]
    fn parse_names() {
        let name = Name::parse("C=FI, O=Test Org,  cn = Member ").unwrap();
        assert_eq!(name.normalized(), "C=fi, O=test org, CN=member");
        assert!(Name::parse("").is_err());
        assert!(Name::parse("X=unknown").is_err());
        assert!(Name::parse("CN").is_err());
    }

    #[test]
    fn multi_rdn_name_is_readable() {
        let name = Name::parse(
            "C=FI, ST=Uusimaa, L=Helsinki, O=Test Org, OU=Unit, CN=member, SERIALNUMBER=1234",
        )
        .unwrap();
        let der = name.to_captured().into_bytes();

        let rdn_count = Mode::Der
            .decode(der.clone(), |cons| {
                cons.take_sequence(|cons| {
                    let mut count = 0;
                    while cons.take_opt_set(|cons| cons.capture_all())?.is_some() {
                        count += 1;
                    }
                    Ok(count)
                })
            })
            .unwrap();
        assert_eq!(rdn_count, 7);

        let parsed = openssl::x509::X509Name::from_der(&der).unwrap();
        let values: Vec<String> = parsed
            .entries()
            .map(|entry| entry.data().as_utf8().unwrap().to_string())
            .collect();
        assert_eq!(
            values,
            vec!["FI", "Uusimaa", "Helsinki", "Test Org", "Unit", "member", "1234"]
        );
    }

    #[test]
    fn self_signed_cert_is_valid() {
        let pkey = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();
        let spki = pkey.public_key_to_der().unwrap();

        let now = Utc::now();
        let tbs = TbsCertificate::new(
            42,
            &Name::parse("C=FI, O=Test, CN=signer").unwrap(),
            now - Duration::minutes(5),
            now + Duration::days(365),
            &spki,
            KeyUsage::Signing,
            pkcs1(DigestAlgorithm::Sha256),
        )
        .unwrap();
        let signature = sign(&pkey, tbs.sign_algorithm(), tbs.to_be_signed());
        let der = tbs.into_certificate(signature);

        let cert = ParsedCert::from_bytes(&der).unwrap();
        assert!(cert.is_self_signed());
        assert_eq!(cert.usage().unwrap(), KeyUsage::Signing);
        assert_eq!(cert.subject_normalized(), "C=fi, O=test, CN=signer");
        assert_eq!(cert.public_key_base64().unwrap(), BASE64.encode(&spki));
    }

    #[test]
    fn auth_cert_usage() {
        let pkey = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();
        let spki = pkey.public_key_to_der().unwrap();

        let now = Utc::now();
        let tbs = TbsCertificate::new(
            1,
            &Name::common_name("server").unwrap(),
            now,
            now + Duration::days(1),
            &spki,
            KeyUsage::Authentication,
            pkcs1(DigestAlgorithm::Sha512),
        )
        .unwrap();
        let signature = sign(&pkey, tbs.sign_algorithm(), tbs.to_be_signed());
        let cert = ParsedCert::from_bytes(&tbs.into_certificate(signature)).unwrap();
        assert_eq!(cert.usage().unwrap(), KeyUsage::Authentication);
    }

    #[test]
    fn cert_request_verifies() {
        let pkey = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();
        let spki = pkey.public_key_to_der().unwrap();

        let tbs = TbsCertRequest::new(
            &Name::parse("C=FI, O=Test, SERIALNUMBER=1234").unwrap(),
            &spki,
            KeyUsage::Signing,
            pkcs1(DigestAlgorithm::Sha256),
        )
        .unwrap();
        let signature = sign(&pkey, tbs.sign_algorithm(), tbs.to_be_signed());
        let pem = tbs.into_request(signature, CertRequestFormat::Pem);
        assert!(pem.starts_with(b"-----BEGIN CERTIFICATE REQUEST-----\n"));

        let req = X509Req::from_pem(&pem).unwrap();
        assert!(req.verify(&pkey).unwrap());
    }

    #[test]
    fn pss_cert_request_verifies() {
        let pkey = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();
        let spki = pkey.public_key_to_der().unwrap();

        let algorithm =
            SignAlgorithm::for_mechanism("CKM_RSA_PKCS_PSS", DigestAlgorithm::Sha256).unwrap();
        let tbs = TbsCertRequest::new(
            &Name::parse("C=FI, O=Test, CN=pss").unwrap(),
            &spki,
            KeyUsage::Signing,
            algorithm,
        )
        .unwrap();
        let signature = sign(&pkey, tbs.sign_algorithm(), tbs.to_be_signed());
        let der = tbs.into_request(signature, CertRequestFormat::Der);

        let req = X509Req::from_der(&der).unwrap();
        assert!(req.verify(&pkey).unwrap());
    }

    #[test]
    fn pss_self_signed_cert_is_valid() {
        let pkey = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();
        let spki = pkey.public_key_to_der().unwrap();

        let now = Utc::now();
        let algorithm =
            SignAlgorithm::for_mechanism("CKM_RSA_PKCS_PSS", DigestAlgorithm::Sha512).unwrap();
        let tbs = TbsCertificate::new(
            7,
            &Name::common_name("pss").unwrap(),
            now,
            now + Duration::days(1),
            &spki,
            KeyUsage::Signing,
            algorithm,
        )
        .unwrap();
        let signature = sign(&pkey, tbs.sign_algorithm(), tbs.to_be_signed());
        let cert = ParsedCert::from_bytes(&tbs.into_certificate(signature)).unwrap();
        assert!(cert.is_self_signed());
    }

    #[test]
    fn rejects_inverted_validity() {
        let rsa = Rsa::generate(2048).unwrap();
        let spki = PKey::from_rsa(rsa).unwrap().public_key_to_der().unwrap();
        let now = Utc::now();
        assert!(
            TbsCertificate::new(
                1,
                &Name::common_name("x").unwrap(),
                now,
                now - Duration::days(1),
                &spki,
                KeyUsage::Signing,
                pkcs1(DigestAlgorithm::Sha256),
            )
            .is_err()
        );
    }
}
