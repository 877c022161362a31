//! Digest and signature algorithms.
//!
//! Tokens only ever sign a digest the caller has already calculated, with
//! either the RSA PKCS#1 v1.5 or the RSA-PSS mechanism configured for the
//! key. The algorithm id a caller supplies is checked against that
//! mechanism and used to build the input the token signs.
use std::fmt;
use std::str::FromStr;

use bcder::encode::{Choice2, Constructed, PrimitiveContent, Values};
use bcder::{Mode, OctetString, Oid, Tag, encode};
use bytes::Bytes;
use openssl::error::ErrorStack;
use openssl::hash::{MessageDigest, hash};
use openssl::md::{Md, MdRef};
use openssl::pkey::{PKeyRef, Private};
use openssl::pkey_ctx::PkeyCtx;
use openssl::rsa::Padding;
use openssl::sign::RsaPssSaltlen;
use serde::{Deserialize, Deserializer, de};

use crate::commons::error::Error;

use self::DigestAlgorithm::*;
use self::SignatureScheme::*;

//------------ OIDs ----------------------------------------------------------

const SHA1: Oid<&[u8]> = Oid(&[43, 14, 3, 2, 26]);
const SHA224: Oid<&[u8]> = Oid(&[96, 134, 72, 1, 101, 3, 4, 2, 4]);
const SHA256: Oid<&[u8]> = Oid(&[96, 134, 72, 1, 101, 3, 4, 2, 1]);
const SHA384: Oid<&[u8]> = Oid(&[96, 134, 72, 1, 101, 3, 4, 2, 2]);
const SHA512: Oid<&[u8]> = Oid(&[96, 134, 72, 1, 101, 3, 4, 2, 3]);

const SHA1_WITH_RSA: Oid<&[u8]> = Oid(&[42, 134, 72, 134, 247, 13, 1, 1, 5]);
const SHA224_WITH_RSA: Oid<&[u8]> = Oid(&[42, 134, 72, 134, 247, 13, 1, 1, 14]);
const SHA256_WITH_RSA: Oid<&[u8]> = Oid(&[42, 134, 72, 134, 247, 13, 1, 1, 11]);
const SHA384_WITH_RSA: Oid<&[u8]> = Oid(&[42, 134, 72, 134, 247, 13, 1, 1, 12]);
const SHA512_WITH_RSA: Oid<&[u8]> = Oid(&[42, 134, 72, 134, 247, 13, 1, 1, 13]);
const RSASSA_PSS: Oid<&[u8]> = Oid(&[42, 134, 72, 134, 247, 13, 1, 1, 10]);
const MGF1: Oid<&[u8]> = Oid(&[42, 134, 72, 134, 247, 13, 1, 1, 8]);

//------------ DigestAlgorithm -----------------------------------------------

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum DigestAlgorithm {
    Sha1,
    Sha224,
    Sha256,
    Sha384,
    Sha512,
}

impl DigestAlgorithm {
    pub fn digest_len(self) -> usize {
        match self {
            DigestAlgorithm::Sha1 => 20,
            DigestAlgorithm::Sha224 => 28,
            DigestAlgorithm::Sha256 => 32,
            DigestAlgorithm::Sha384 => 48,
            DigestAlgorithm::Sha512 => 64,
        }
    }

    fn message_digest(self) -> MessageDigest {
        match self {
            DigestAlgorithm::Sha1 => MessageDigest::sha1(),
            DigestAlgorithm::Sha224 => MessageDigest::sha224(),
            DigestAlgorithm::Sha256 => MessageDigest::sha256(),
            DigestAlgorithm::Sha384 => MessageDigest::sha384(),
            DigestAlgorithm::Sha512 => MessageDigest::sha512(),
        }
    }

    pub fn md(self) -> &'static MdRef {
        match self {
            DigestAlgorithm::Sha1 => Md::sha1(),
            DigestAlgorithm::Sha224 => Md::sha224(),
            DigestAlgorithm::Sha256 => Md::sha256(),
            DigestAlgorithm::Sha384 => Md::sha384(),
            DigestAlgorithm::Sha512 => Md::sha512(),
        }
    }

    fn oid(self) -> Oid<&'static [u8]> {
        match self {
            DigestAlgorithm::Sha1 => SHA1,
            DigestAlgorithm::Sha224 => SHA224,
            DigestAlgorithm::Sha256 => SHA256,
            DigestAlgorithm::Sha384 => SHA384,
            DigestAlgorithm::Sha512 => SHA512,
        }
    }

    /// The OID of the matching PKCS#1 v1.5 RSA signature algorithm.
    pub fn rsa_signature_oid(self) -> Oid<&'static [u8]> {
        match self {
            DigestAlgorithm::Sha1 => SHA1_WITH_RSA,
            DigestAlgorithm::Sha224 => SHA224_WITH_RSA,
            DigestAlgorithm::Sha256 => SHA256_WITH_RSA,
            DigestAlgorithm::Sha384 => SHA384_WITH_RSA,
            DigestAlgorithm::Sha512 => SHA512_WITH_RSA,
        }
    }

    /// Encodes the AlgorithmIdentifier of the digest, with NULL parameters.
    fn encode_algorithm_id(self) -> impl Values {
        encode::sequence((self.oid().encode(), ().encode()))
    }

    pub fn digest(self, data: &[u8]) -> Result<Bytes, Error> {
        let digest = hash(self.message_digest(), data)?;
        Ok(Bytes::copy_from_slice(&digest))
    }

    /// Wraps a digest into a DER encoded DigestInfo.
    ///
    /// ```text
    /// DigestInfo ::= SEQUENCE {
    ///     digestAlgorithm AlgorithmIdentifier,
    ///     digest OCTET STRING
    /// }
    /// ```
    pub fn digest_info(self, digest: &[u8]) -> Result<Bytes, Error> {
        if digest.len() != self.digest_len() {
            return Err(Error::UnsupportedAlgorithm(format!(
                "digest of {} bytes does not match {}",
                digest.len(),
                self
            )));
        }
        let info = encode::sequence((
            self.encode_algorithm_id(),
            OctetString::new(Bytes::copy_from_slice(digest)).encode(),
        ));
        Ok(info.to_captured(Mode::Der).into_bytes())
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            DigestAlgorithm::Sha1 => "SHA-1",
            DigestAlgorithm::Sha224 => "SHA-224",
            DigestAlgorithm::Sha256 => "SHA-256",
            DigestAlgorithm::Sha384 => "SHA-384",
            DigestAlgorithm::Sha512 => "SHA-512",
        };
        f.write_str(s)
    }
}

impl FromStr for DigestAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().replace('-', "").as_str() {
            "SHA1" => Ok(DigestAlgorithm::Sha1),
            "SHA224" => Ok(DigestAlgorithm::Sha224),
            "SHA256" => Ok(DigestAlgorithm::Sha256),
            "SHA384" => Ok(DigestAlgorithm::Sha384),
            "SHA512" => Ok(DigestAlgorithm::Sha512),
            _ => Err(Error::UnsupportedAlgorithm(s.to_string())),
        }
    }
}

impl<'de> Deserialize<'de> for DigestAlgorithm {
    fn deserialize<D>(d: D) -> Result<DigestAlgorithm, D::Error>
    where
        D: Deserializer<'de>,
    {
        let string = String::deserialize(d)?;
        DigestAlgorithm::from_str(&string).map_err(de::Error::custom)
    }
}

//------------ SignatureScheme -----------------------------------------------

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum SignatureScheme {
    RsaPkcs1,
    RsaPss,
    Ecdsa,
}

impl fmt::Display for SignatureScheme {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            RsaPkcs1 => "RSA",
            RsaPss => "RSA-PSS",
            Ecdsa => "ECDSA",
        })
    }
}

//------------ SignMechanism -------------------------------------------------

/// The PKCS#11 mechanism a token signs with.
///
/// Both take a digest computed outside the token: `CKM_RSA_PKCS` signs a
/// DigestInfo, `CKM_RSA_PKCS_PSS` the bare digest.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum SignMechanism {
    RsaPkcs,
    RsaPkcsPss,
}

impl SignMechanism {
    pub const SUPPORTED: &'static [SignMechanism] =
        &[SignMechanism::RsaPkcs, SignMechanism::RsaPkcsPss];

    pub fn name(self) -> &'static str {
        match self {
            SignMechanism::RsaPkcs => "CKM_RSA_PKCS",
            SignMechanism::RsaPkcsPss => "CKM_RSA_PKCS_PSS",
        }
    }

    fn scheme(self) -> SignatureScheme {
        match self {
            SignMechanism::RsaPkcs => RsaPkcs1,
            SignMechanism::RsaPkcsPss => RsaPss,
        }
    }
}

impl fmt::Display for SignMechanism {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SignMechanism {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::SUPPORTED
            .iter()
            .find(|m| m.name() == s)
            .copied()
            .ok_or_else(|| {
                Error::UnsupportedAlgorithm(format!("sign mechanism '{}' is not supported", s))
            })
    }
}

//------------ SignInput -----------------------------------------------------

/// The data a token signs, together with the mechanism to sign it with.
#[derive(Clone, Debug)]
pub struct SignInput {
    mechanism: SignMechanism,
    digest: DigestAlgorithm,
    data: Bytes,
}

impl SignInput {
    pub fn mechanism(&self) -> SignMechanism {
        self.mechanism
    }

    pub fn digest(&self) -> DigestAlgorithm {
        self.digest
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// PSS always uses a salt as long as the digest.
    pub fn pss_salt_len(&self) -> usize {
        self.digest.digest_len()
    }

    /// Signs with a private key held in memory.
    pub fn sign_with(&self, pkey: &PKeyRef<Private>) -> Result<Bytes, ErrorStack> {
        let mut ctx = PkeyCtx::new(pkey)?;
        ctx.sign_init()?;
        match self.mechanism {
            SignMechanism::RsaPkcs => {
                ctx.set_rsa_padding(Padding::PKCS1)?;
            }
            SignMechanism::RsaPkcsPss => {
                ctx.set_rsa_padding(Padding::PKCS1_PSS)?;
                ctx.set_signature_md(self.digest.md())?;
                ctx.set_rsa_mgf1_md(self.digest.md())?;
                ctx.set_rsa_pss_saltlen(RsaPssSaltlen::DIGEST_LENGTH)?;
            }
        }
        let mut signature = vec![];
        ctx.sign_to_vec(&self.data, &mut signature)?;
        Ok(Bytes::from(signature))
    }
}

//------------ SignAlgorithm -------------------------------------------------

/// A signature algorithm as requested by a caller.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct SignAlgorithm {
    digest: DigestAlgorithm,
    scheme: SignatureScheme,
}

/// Known algorithm ids: Java style names and XML-DSig URIs.
const ALGORITHM_IDS: &[(&str, DigestAlgorithm, SignatureScheme)] = &[
    ("SHA1withRSA", Sha1, RsaPkcs1),
    ("SHA224withRSA", Sha224, RsaPkcs1),
    ("SHA256withRSA", Sha256, RsaPkcs1),
    ("SHA384withRSA", Sha384, RsaPkcs1),
    ("SHA512withRSA", Sha512, RsaPkcs1),
    ("SHA256withRSAandMGF1", Sha256, RsaPss),
    ("SHA384withRSAandMGF1", Sha384, RsaPss),
    ("SHA512withRSAandMGF1", Sha512, RsaPss),
    ("SHA1withECDSA", Sha1, Ecdsa),
    ("SHA256withECDSA", Sha256, Ecdsa),
    ("SHA384withECDSA", Sha384, Ecdsa),
    ("SHA512withECDSA", Sha512, Ecdsa),
    ("http://www.w3.org/2000/09/xmldsig#rsa-sha1", Sha1, RsaPkcs1),
    ("http://www.w3.org/2001/04/xmldsig-more#rsa-sha224", Sha224, RsaPkcs1),
    ("http://www.w3.org/2001/04/xmldsig-more#rsa-sha256", Sha256, RsaPkcs1),
    ("http://www.w3.org/2001/04/xmldsig-more#rsa-sha384", Sha384, RsaPkcs1),
    ("http://www.w3.org/2001/04/xmldsig-more#rsa-sha512", Sha512, RsaPkcs1),
    ("http://www.w3.org/2007/05/xmldsig-more#sha256-rsa-MGF1", Sha256, RsaPss),
    ("http://www.w3.org/2007/05/xmldsig-more#sha384-rsa-MGF1", Sha384, RsaPss),
    ("http://www.w3.org/2007/05/xmldsig-more#sha512-rsa-MGF1", Sha512, RsaPss),
    ("http://www.w3.org/2001/04/xmldsig-more#ecdsa-sha256", Sha256, Ecdsa),
    ("http://www.w3.org/2001/04/xmldsig-more#ecdsa-sha384", Sha384, Ecdsa),
    ("http://www.w3.org/2001/04/xmldsig-more#ecdsa-sha512", Sha512, Ecdsa),
];

impl SignAlgorithm {
    pub fn rsa(digest: DigestAlgorithm) -> Self {
        SignAlgorithm {
            digest,
            scheme: RsaPkcs1,
        }
    }

    /// The algorithm a key with the given mechanism uses to sign with
    /// `digest`, as used for certificates and requests signed by the key.
    pub fn for_mechanism(mechanism: &str, digest: DigestAlgorithm) -> Result<Self, Error> {
        let mechanism = SignMechanism::from_str(mechanism)?;
        let algorithm = SignAlgorithm {
            digest,
            scheme: mechanism.scheme(),
        };
        algorithm.check(mechanism)?;
        Ok(algorithm)
    }

    pub fn digest(&self) -> DigestAlgorithm {
        self.digest
    }

    pub fn scheme(&self) -> SignatureScheme {
        self.scheme
    }

    fn is_known(&self) -> bool {
        ALGORITHM_IDS
            .iter()
            .any(|(_, digest, scheme)| *digest == self.digest && *scheme == self.scheme)
    }

    fn check(&self, mechanism: SignMechanism) -> Result<(), Error> {
        if self.scheme != mechanism.scheme() || !self.is_known() {
            return Err(Error::UnsupportedAlgorithm(format!(
                "{} with {} cannot be computed with {}",
                self.digest, self.scheme, mechanism
            )));
        }
        Ok(())
    }

    /// Returns what a token signing with `mechanism` has to sign.
    ///
    /// Fails before anything is sent to a token if the combination is not
    /// supported or the digest has the wrong length.
    pub fn prepare(&self, mechanism: &str, digest: &[u8]) -> Result<SignInput, Error> {
        let mechanism = SignMechanism::from_str(mechanism)?;
        self.check(mechanism)?;
        let data = match mechanism {
            SignMechanism::RsaPkcs => self.digest.digest_info(digest)?,
            SignMechanism::RsaPkcsPss => {
                if digest.len() != self.digest.digest_len() {
                    return Err(Error::UnsupportedAlgorithm(format!(
                        "digest of {} bytes does not match {}",
                        digest.len(),
                        self.digest
                    )));
                }
                Bytes::copy_from_slice(digest)
            }
        };
        Ok(SignInput {
            mechanism,
            digest: self.digest,
            data,
        })
    }

    /// Encodes the AlgorithmIdentifier used in certificates and requests.
    ///
    /// ```text
    /// RSASSA-PSS-params ::= SEQUENCE {
    ///     hashAlgorithm      [0] HashAlgorithm DEFAULT sha1,
    ///     maskGenAlgorithm   [1] MaskGenAlgorithm DEFAULT mgf1SHA1,
    ///     saltLength         [2] INTEGER DEFAULT 20,
    ///     trailerField       [3] TrailerField DEFAULT trailerFieldBC }
    /// ```
    pub fn x509_signature_encode(&self) -> impl Values {
        match self.scheme {
            RsaPss => Choice2::Two(encode::sequence((
                RSASSA_PSS.encode(),
                encode::sequence((
                    Constructed::new(Tag::CTX_0, self.digest.encode_algorithm_id()),
                    Constructed::new(
                        Tag::CTX_1,
                        encode::sequence((MGF1.encode(), self.digest.encode_algorithm_id())),
                    ),
                    Constructed::new(Tag::CTX_2, (self.digest.digest_len() as u32).encode()),
                )),
            ))),
            _ => Choice2::One(encode::sequence((
                self.digest.rsa_signature_oid().encode(),
                ().encode(),
            ))),
        }
    }
}

impl fmt::Display for SignAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = ALGORITHM_IDS
            .iter()
            .find(|(_, digest, scheme)| *digest == self.digest && *scheme == self.scheme)
            .map(|(name, _, _)| *name)
            .unwrap_or("unknown");
        f.write_str(name)
    }
}

impl FromStr for SignAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ALGORITHM_IDS
            .iter()
            .find(|(id, _, _)| *id == s)
            .map(|(_, digest, scheme)| SignAlgorithm {
                digest: *digest,
                scheme: *scheme,
            })
            .ok_or_else(|| Error::UnsupportedAlgorithm(s.to_string()))
    }
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_info_has_known_prefix() {
        let digest = DigestAlgorithm::Sha256.digest(b"data").unwrap();
        let info = DigestAlgorithm::Sha256.digest_info(&digest).unwrap();

        let prefix = hex::decode("3031300d060960864801650304020105000420").unwrap();
        assert_eq!(&info[..prefix.len()], prefix.as_slice());
        assert_eq!(&info[prefix.len()..], digest.as_ref());

        let sha1 = DigestAlgorithm::Sha1.digest(b"data").unwrap();
        let info = DigestAlgorithm::Sha1.digest_info(&sha1).unwrap();
        let prefix = hex::decode("3021300906052b0e03021a05000414").unwrap();
        assert_eq!(&info[..prefix.len()], prefix.as_slice());
    }

    #[test]
    fn parse_algorithm_ids() {
        let alg = SignAlgorithm::from_str("SHA512withRSA").unwrap();
        assert_eq!(alg.digest(), DigestAlgorithm::Sha512);
        assert_eq!(alg.scheme(), SignatureScheme::RsaPkcs1);

        let alg =
            SignAlgorithm::from_str("http://www.w3.org/2001/04/xmldsig-more#rsa-sha256").unwrap();
        assert_eq!(alg, SignAlgorithm::rsa(DigestAlgorithm::Sha256));

        assert!(matches!(
            SignAlgorithm::from_str("SHA256withDSA"),
            Err(Error::UnsupportedAlgorithm(_))
        ));
    }

    #[test]
    fn prepare_rejects_unsupported_combinations() {
        let digest = DigestAlgorithm::Sha256.digest(b"data").unwrap();

        let pss = SignAlgorithm::from_str("SHA256withRSAandMGF1").unwrap();
        assert!(matches!(
            pss.prepare("CKM_RSA_PKCS", &digest),
            Err(Error::UnsupportedAlgorithm(_))
        ));

        let rsa = SignAlgorithm::rsa(DigestAlgorithm::Sha512);
        assert!(matches!(
            rsa.prepare("CKM_RSA_PKCS", &digest),
            Err(Error::UnsupportedAlgorithm(_))
        ));

        let rsa = SignAlgorithm::rsa(DigestAlgorithm::Sha256);
        assert!(rsa.prepare("CKM_RSA_X_509", &digest).is_err());
        assert!(rsa.prepare("CKM_RSA_PKCS_PSS", &digest).is_err());
        assert_eq!(
            rsa.prepare("CKM_RSA_PKCS", &digest).unwrap().data(),
            DigestAlgorithm::Sha256.digest_info(&digest).unwrap().as_ref()
        );

        let ecdsa = SignAlgorithm::from_str("SHA256withECDSA").unwrap();
        assert!(ecdsa.prepare("CKM_RSA_PKCS", &digest).is_err());
    }

    #[test]
    fn pss_signs_the_bare_digest() {
        let digest = DigestAlgorithm::Sha384.digest(b"data").unwrap();
        let pss = SignAlgorithm::from_str("SHA384withRSAandMGF1").unwrap();

        let input = pss.prepare("CKM_RSA_PKCS_PSS", &digest).unwrap();
        assert_eq!(input.mechanism(), SignMechanism::RsaPkcsPss);
        assert_eq!(input.data(), digest.as_ref());
        assert_eq!(input.pss_salt_len(), 48);

        let short = DigestAlgorithm::Sha256.digest(b"data").unwrap();
        assert!(pss.prepare("CKM_RSA_PKCS_PSS", &short).is_err());

        // PSS is only defined for the SHA-2 digests of 256 bits and up
        assert!(SignAlgorithm::for_mechanism("CKM_RSA_PKCS_PSS", DigestAlgorithm::Sha1).is_err());
    }

    #[test]
    fn signatures_verify_with_openssl() {
        use openssl::pkey::PKey;
        use openssl::rsa::Rsa;
        use openssl::sign::Verifier;

        let pkey = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();
        let data = b"to be signed";

        for (id, mechanism, pss) in [
            ("SHA256withRSA", "CKM_RSA_PKCS", false),
            ("SHA512withRSAandMGF1", "CKM_RSA_PKCS_PSS", true),
        ] {
            let alg = SignAlgorithm::from_str(id).unwrap();
            let digest = alg.digest().digest(data).unwrap();
            let signature = alg
                .prepare(mechanism, &digest)
                .unwrap()
                .sign_with(&pkey)
                .unwrap();

            let mut verifier = Verifier::new(alg.digest().message_digest(), &pkey).unwrap();
            if pss {
                verifier.set_rsa_padding(Padding::PKCS1_PSS).unwrap();
                verifier.set_rsa_mgf1_md(alg.digest().message_digest()).unwrap();
                verifier
                    .set_rsa_pss_saltlen(RsaPssSaltlen::DIGEST_LENGTH)
                    .unwrap();
            }
            verifier.update(data).unwrap();
            assert!(verifier.verify(&signature).unwrap(), "{}", id);
        }
    }

    #[test]
    fn mechanism_for_certificates() {
        let alg = SignAlgorithm::for_mechanism("CKM_RSA_PKCS_PSS", DigestAlgorithm::Sha256).unwrap();
        assert_eq!(alg.to_string(), "SHA256withRSAandMGF1");
        let alg = SignAlgorithm::for_mechanism("CKM_RSA_PKCS", DigestAlgorithm::Sha512).unwrap();
        assert_eq!(alg, SignAlgorithm::rsa(DigestAlgorithm::Sha512));
        assert!(SignAlgorithm::for_mechanism("CKM_RSA_PKCS_PSS", DigestAlgorithm::Sha1).is_err());
        assert!(SignAlgorithm::for_mechanism("CKM_ECDSA", DigestAlgorithm::Sha256).is_err());
    }

    #[test]
    fn parse_digest_names() {
        assert_eq!(DigestAlgorithm::from_str("SHA-256").unwrap(), DigestAlgorithm::Sha256);
        assert_eq!(DigestAlgorithm::from_str("sha512").unwrap(), DigestAlgorithm::Sha512);
        assert!(DigestAlgorithm::from_str("MD5").is_err());
    }
}
