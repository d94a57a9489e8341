// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Signing identities and CMS signature production.

A signature over a Code Directory is a detached CMS `SignedData`. The
encapsulated content is the serialized Code Directory itself (detached, so
it isn't embedded). The signer info carries the content type, message
digest and signing time attributes, plus Apple's CDHashes attribute
listing the truncated Code Directory hash.
*/

use {
    crate::error::{MachoCodesignError, SigningError},
    bcder::{Captured, Mode, OctetString, Oid},
    bytes::Bytes,
    cryptographic_message_syntax::{SignedData, SignedDataBuilder, SignerBuilder},
    log::{info, warn},
    std::{path::Path, sync::Arc},
    x509_certificate::{
        rfc5652::AttributeValue, CapturedX509Certificate, InMemorySigningKeyPair, KeyAlgorithm,
        Sign,
    },
};

/// `1.2.840.113635.100.9.1`: plist of Code Directory hashes.
const OID_APPLE_CDHASHES: &[u8] = &[0x2a, 0x86, 0x48, 0x86, 0xf7, 0x63, 0x64, 0x09, 0x01];

/// `1.2.840.113549.1.7.1`: id-data.
const OID_ID_DATA: &[u8] = &[0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x07, 0x01];

/// A private key together with the certificate chain it signs for.
///
/// The first certificate is the leaf. Construction verifies the key
/// belongs to the leaf.
pub struct SigningCredentials {
    key: InMemorySigningKeyPair,
    chain: Vec<CapturedX509Certificate>,
}

impl std::fmt::Debug for SigningCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningCredentials")
            .field("leaf", &self.leaf().subject_common_name())
            .field("chain_len", &self.chain.len())
            .finish()
    }
}

fn describe_certificate(cert: &CapturedX509Certificate) -> String {
    cert.subject_common_name()
        .unwrap_or_else(|| "<no common name>".to_string())
}

impl SigningCredentials {
    /// Pair a key with a certificate chain, leaf first.
    pub fn new(
        key: InMemorySigningKeyPair,
        chain: Vec<CapturedX509Certificate>,
    ) -> Result<Self, MachoCodesignError> {
        let leaf = chain.first().ok_or_else(|| {
            MachoCodesignError::CliGeneralError("certificate chain is empty".into())
        })?;

        match key.key_algorithm() {
            Some(KeyAlgorithm::Rsa) | Some(KeyAlgorithm::Ecdsa(_)) => {}
            Some(other) => {
                return Err(SigningError::UnsupportedAlgorithm(format!("{:?}", other)).into())
            }
            None => return Err(SigningError::UnsupportedAlgorithm("unknown".into()).into()),
        }

        if leaf.key_algorithm() != key.key_algorithm()
            || leaf.public_key_data() != key.public_key_data()
        {
            return Err(SigningError::KeyMismatch(describe_certificate(leaf)).into());
        }

        Ok(Self { key, chain })
    }

    /// Collect credentials from PEM data.
    ///
    /// `PRIVATE KEY` sections provide the key. The first `CERTIFICATE` is the
    /// leaf and the remainder the issuing chain. Other sections are ignored.
    pub fn from_pem(sources: &[&[u8]]) -> Result<Self, MachoCodesignError> {
        let mut keys = vec![];
        let mut certs = vec![];

        for data in sources {
            for pem in pem::parse_many(data)? {
                match pem.tag.as_str() {
                    "CERTIFICATE" => certs.push(CapturedX509Certificate::from_der(pem.contents)?),
                    "PRIVATE KEY" => keys.push(InMemorySigningKeyPair::from_pkcs8_der(&pem.contents)?),
                    tag => warn!("(unhandled PEM tag {}; ignoring)", tag),
                }
            }
        }

        if keys.len() != 1 {
            return Err(MachoCodesignError::CliGeneralError(format!(
                "expected exactly 1 private key; found {}",
                keys.len()
            )));
        }

        Self::new(keys.remove(0), certs)
    }

    /// Read PEM files and collect credentials from them.
    pub fn from_pem_files(
        paths: impl IntoIterator<Item = impl AsRef<Path>>,
    ) -> Result<Self, MachoCodesignError> {
        let data = paths
            .into_iter()
            .map(|path| {
                let path = path.as_ref();
                info!("reading PEM data from {}", path.display());
                std::fs::read(path).map_err(|e| MachoCodesignError::io(path, e))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Self::from_pem(&data.iter().map(|d| d.as_slice()).collect::<Vec<_>>())
    }

    pub fn leaf(&self) -> &CapturedX509Certificate {
        &self.chain[0]
    }

    /// Every certificate, leaf first.
    pub fn chain(&self) -> &[CapturedX509Certificate] {
        &self.chain
    }

    pub fn key(&self) -> &InMemorySigningKeyPair {
        &self.key
    }

    /// Produce a detached CMS signature over a serialized Code Directory.
    ///
    /// `cdhash_truncated` is recorded in the CDHashes signed attribute.
    pub fn sign_code_directory(
        &self,
        code_directory: &[u8],
        cdhash_truncated: &[u8],
    ) -> Result<Vec<u8>, MachoCodesignError> {
        let mut cdhashes = plist::Dictionary::new();
        cdhashes.insert(
            "cdhashes".to_string(),
            plist::Value::Array(vec![plist::Value::Data(cdhash_truncated.to_vec())]),
        );

        let mut plist_xml = vec![];
        plist::Value::from(cdhashes).to_writer_xml(&mut plist_xml)?;
        plist_xml.push(b'\n');

        let signer = SignerBuilder::new(&self.key, self.leaf().clone()).signed_attribute(
            Oid(Bytes::copy_from_slice(OID_APPLE_CDHASHES)),
            vec![AttributeValue::new(Captured::from_values(
                Mode::Der,
                OctetString::encode_slice(&plist_xml),
            ))],
        );

        let mut builder = SignedDataBuilder::default()
            .content_type(Oid(Bytes::copy_from_slice(OID_ID_DATA)))
            .content_external(code_directory.to_vec())
            .signer(signer);

        for cert in &self.chain {
            builder = builder.certificate(cert.clone());
        }

        Ok(builder.build_der()?)
    }
}

/// Who vouches for a signature.
#[derive(Clone, Debug)]
pub enum SigningIdentity {
    /// No certificate. The Code Directory is flagged ad-hoc and carries no CMS.
    AdHoc,
    Certificate(Arc<SigningCredentials>),
}

impl Default for SigningIdentity {
    fn default() -> Self {
        Self::AdHoc
    }
}

impl SigningIdentity {
    pub fn is_ad_hoc(&self) -> bool {
        matches!(self, Self::AdHoc)
    }

    pub fn credentials(&self) -> Option<&SigningCredentials> {
        match self {
            Self::AdHoc => None,
            Self::Certificate(creds) => Some(creds),
        }
    }
}

/// Verify a CMS signature was made over `code_directory`.
///
/// Checks every signer's signature and that its message digest equals the
/// digest of the Code Directory bytes.
pub fn verify_code_directory_signature(
    cms: &[u8],
    code_directory: &[u8],
) -> Result<(), MachoCodesignError> {
    let signed_data = SignedData::parse_ber(cms)?;

    let mut count = 0;
    for signer in signed_data.signers() {
        signer.verify_signature_with_signed_data(&signed_data)?;
        signer.verify_message_digest_with_content(code_directory)?;
        count += 1;
    }

    if count == 0 {
        return Err(MachoCodesignError::SignatureBuilder("CMS signature has no signers"));
    }

    Ok(())
}
