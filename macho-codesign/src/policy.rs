// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Designated requirement derivation.
//!
//! A designated requirement states what a valid signer of a binary looks
//! like. When the caller doesn't provide one, we derive it from the signing
//! certificate the way `codesign` does for the common cases:
//!
//! * `Developer ID Application` certificates anchor to Apple's Developer ID
//!   CA and pin the team identifier.
//! * Any other certificate is pinned by the SHA-1 digest of its DER encoding.

use {
    crate::{
        code_requirement::{CodeRequirement, CodeRequirementExpression, CodeRequirementMatchExpression},
        embedded_signature::DigestType,
        error::MachoCodesignError,
    },
    once_cell::sync::Lazy,
    x509_certificate::CapturedX509Certificate,
};

/// `1.2.840.113635.100.6.2.6`: Developer ID certificate authority marker.
const OID_DEVELOPER_ID_CA: &[u8] = &[0x2a, 0x86, 0x48, 0x86, 0xf7, 0x63, 0x64, 0x06, 0x02, 0x06];

/// `1.2.840.113635.100.6.1.13`: Developer ID Application leaf marker.
const OID_DEVELOPER_ID_APPLICATION: &[u8] =
    &[0x2a, 0x86, 0x48, 0x86, 0xf7, 0x63, 0x64, 0x06, 0x01, 0x0d];

const DEVELOPER_ID_APPLICATION_PREFIX: &str = "Developer ID Application:";

/// `anchor apple generic and certificate 1[field.1.2.840.113635.100.6.2.6] exists and
/// certificate leaf[field.1.2.840.113635.100.6.1.13] exists`
static POLICY_DEVELOPER_ID_APPLICATION: Lazy<CodeRequirementExpression<'static>> =
    Lazy::new(|| {
        CodeRequirementExpression::And(
            Box::new(CodeRequirementExpression::And(
                Box::new(CodeRequirementExpression::AnchorAppleGeneric),
                Box::new(CodeRequirementExpression::CertificateGeneric(
                    1,
                    OID_DEVELOPER_ID_CA.into(),
                    CodeRequirementMatchExpression::Exists,
                )),
            )),
            Box::new(CodeRequirementExpression::CertificateGeneric(
                0,
                OID_DEVELOPER_ID_APPLICATION.into(),
                CodeRequirementMatchExpression::Exists,
            )),
        )
    });

/// Extract the team identifier from a `Developer ID Application: Name (TEAMID)` common name.
fn developer_id_team(common_name: &str) -> Option<&str> {
    let rest = common_name.strip_prefix(DEVELOPER_ID_APPLICATION_PREFIX)?;
    let open = rest.rfind('(')?;
    let team = rest[open + 1..].strip_suffix(')')?;

    if !team.is_empty() && team.chars().all(|c| c.is_ascii_alphanumeric()) {
        Some(team)
    } else {
        None
    }
}

/// The team identifier of a Developer ID Application certificate, if it is one.
pub fn certificate_team_id(cert: &CapturedX509Certificate) -> Option<String> {
    cert.subject_common_name()
        .and_then(|cn| developer_id_team(&cn).map(|s| s.to_string()))
}

/// Derive a designated requirement for code with `identifier` signed by `cert`.
pub fn derive_designated_requirement(
    cert: &CapturedX509Certificate,
    identifier: &str,
) -> Result<CodeRequirement<'static>, MachoCodesignError> {
    let identifier_expr = Box::new(CodeRequirementExpression::Identifier(
        identifier.to_string().into(),
    ));

    let expr = match certificate_team_id(cert) {
        Some(team_id) => CodeRequirementExpression::And(
            identifier_expr,
            Box::new(CodeRequirementExpression::And(
                Box::new(POLICY_DEVELOPER_ID_APPLICATION.clone()),
                Box::new(CodeRequirementExpression::CertificateField(
                    0,
                    "subject.OU".into(),
                    CodeRequirementMatchExpression::Equal(team_id.into()),
                )),
            )),
        ),
        None => {
            let digest = DigestType::Sha1.digest_data(cert.constructed_data())?;

            CodeRequirementExpression::And(
                identifier_expr,
                Box::new(CodeRequirementExpression::AnchorCertificateHash(
                    0,
                    digest.into(),
                )),
            )
        }
    };

    Ok(CodeRequirement(expr))
}

#[cfg(test)]
mod test {
    use super::*;

    fn certificate(cn: &str) -> CapturedX509Certificate {
        crate::cryptography::test::self_signed(cn).0
    }

    #[test]
    fn team_from_common_name() {
        assert_eq!(
            developer_id_team("Developer ID Application: Jane Doe (ABCDE12345)"),
            Some("ABCDE12345")
        );
        assert_eq!(
            developer_id_team("Developer ID Application: Acme (Europe) Ltd (Z9Y8X7W6V5)"),
            Some("Z9Y8X7W6V5")
        );
        assert_eq!(developer_id_team("Apple Development: Jane Doe (ABCDE12345)"), None);
        assert_eq!(developer_id_team("Developer ID Application: Jane Doe"), None);
    }

    #[test]
    fn self_signed_pins_certificate_hash() -> Result<(), MachoCodesignError> {
        let cert = certificate("test signer");
        let req = derive_designated_requirement(&cert, "com.example.tool")?;

        let digest = DigestType::Sha1.digest_data(cert.constructed_data())?;

        assert_eq!(
            req.to_string(),
            format!(
                "(identifier \"com.example.tool\") and (certificate leaf = H\"{}\")",
                hex::encode(digest)
            )
        );

        Ok(())
    }

    #[test]
    fn developer_id_pins_team() -> Result<(), MachoCodesignError> {
        let cert = certificate("Developer ID Application: Jane Doe (ABCDE12345)");
        let req = derive_designated_requirement(&cert, "com.example.tool")?;

        let s = req.to_string();
        assert!(s.starts_with("(identifier \"com.example.tool\") and "));
        assert!(s.contains("anchor apple generic"));
        assert!(s.contains("certificate 1[field.1.2.840.113635.100.6.2.6] /* exists */"));
        assert!(s.contains("certificate leaf[field.1.2.840.113635.100.6.1.13] /* exists */"));
        assert!(s.contains("certificate leaf[subject.OU] = \"ABCDE12345\""));

        // Encodes and parses back to the same expression.
        let blob = req.to_blob_data()?;
        let (parsed, rest) = CodeRequirement::parse_blob(&blob)?;
        assert!(rest.is_empty());
        assert_eq!(parsed, req);

        Ok(())
    }
}
