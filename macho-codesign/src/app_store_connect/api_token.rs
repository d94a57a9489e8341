// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! App Store Connect API tokens.

use {
    crate::error::MachoCodesignError,
    jsonwebtoken::{Algorithm, EncodingKey, Header},
    serde::{Deserialize, Serialize},
    std::{path::Path, time::SystemTime},
};

#[derive(Clone, Debug, Deserialize, Serialize)]
struct ConnectTokenRequest {
    iss: String,
    iat: u64,
    exp: u64,
    aud: String,
}

/// A JWT Token for use with App Store Connect API.
pub type AppStoreConnectToken = String;

/// Represents a private key used to create JWT tokens for use with App Store Connect.
///
/// See https://developer.apple.com/documentation/appstoreconnectapi/generating_tokens_for_api_requests
/// for more details.
///
/// App Store Connect API tokens/JWTs are derived from:
///
/// * A key identifier. This is a short alphanumeric string like `DEADBEEF42`.
/// * An issuer ID. This is likely a UUID.
/// * An ECDSA P-256 private key.
#[derive(Clone)]
pub struct ConnectTokenEncoder {
    key_id: String,
    issuer_id: String,
    encoding_key: EncodingKey,
}

impl ConnectTokenEncoder {
    /// Construct an instance from a DER encoded ECDSA private key.
    pub fn from_ecdsa_der(key_id: String, issuer_id: String, der_data: &[u8]) -> Self {
        Self {
            key_id,
            issuer_id,
            encoding_key: EncodingKey::from_ec_der(der_data),
        }
    }

    /// Create a token from a PEM encoded ECDSA private key.
    pub fn from_ecdsa_pem(
        key_id: String,
        issuer_id: String,
        pem_data: &[u8],
    ) -> Result<Self, MachoCodesignError> {
        Ok(Self {
            key_id,
            issuer_id,
            encoding_key: EncodingKey::from_ec_pem(pem_data)?,
        })
    }

    /// Create a token from a PEM encoded ECDSA private key in a filesystem path.
    pub fn from_ecdsa_pem_path(
        key_id: String,
        issuer_id: String,
        path: impl AsRef<Path>,
    ) -> Result<Self, MachoCodesignError> {
        let path = path.as_ref();
        let data = std::fs::read(path).map_err(|e| MachoCodesignError::io(path, e))?;

        Self::from_ecdsa_pem(key_id, issuer_id, &data)
    }

    /// Attempt to construct in instance from an API Key ID.
    ///
    /// e.g. `DEADBEEF42`. This looks for an `AuthKey_<id>.p8` file in default search
    /// locations like `~/.appstoreconnect/private_keys`.
    pub fn from_api_key_id(key_id: String, issuer_id: String) -> Result<Self, MachoCodesignError> {
        let mut search_paths = vec![std::env::current_dir()?.join("private_keys")];

        if let Some(home) = dirs::home_dir() {
            search_paths.extend([
                home.join("private_keys"),
                home.join(".private_keys"),
                home.join(".appstoreconnect").join("private_keys"),
            ]);
        }

        // AuthKey_<apiKey>.p8
        let filename = format!("AuthKey_{}.p8", key_id);

        for path in search_paths {
            let candidate = path.join(&filename);

            if candidate.exists() {
                return Self::from_ecdsa_pem_path(key_id, issuer_id, candidate);
            }
        }

        Err(MachoCodesignError::AppStoreConnectApiKeyNotFound)
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// Mint a new JWT token valid for `duration` seconds.
    pub fn new_token(&self, duration: u64) -> Result<AppStoreConnectToken, MachoCodesignError> {
        let now = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map_err(|e| MachoCodesignError::CliGeneralError(format!("system clock error: {}", e)))?
            .as_secs();

        self.new_token_at(now, duration)
    }

    fn new_token_at(&self, now: u64, duration: u64) -> Result<AppStoreConnectToken, MachoCodesignError> {
        let header = Header {
            kid: Some(self.key_id.clone()),
            alg: Algorithm::ES256,
            ..Default::default()
        };

        let claims = ConnectTokenRequest {
            iss: self.issuer_id.clone(),
            iat: now,
            exp: now + duration,
            aud: "appstoreconnect-v1".to_string(),
        };

        Ok(jsonwebtoken::encode(&header, &claims, &self.encoding_key)?)
    }
}

#[cfg(test)]
pub(crate) mod test {
    use {
        super::*,
        ring::{
            rand::SystemRandom,
            signature::{EcdsaKeyPair, ECDSA_P256_SHA256_FIXED_SIGNING},
        },
    };

    /// A fresh PKCS#8 DER P-256 private key.
    pub(crate) fn ecdsa_pkcs8() -> Vec<u8> {
        EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, &SystemRandom::new())
            .unwrap()
            .as_ref()
            .to_vec()
    }

    #[test]
    fn token_claims() -> Result<(), MachoCodesignError> {
        let encoder =
            ConnectTokenEncoder::from_ecdsa_der("DEADBEEF42".into(), "issuer-uuid".into(), &ecdsa_pkcs8());

        let token = encoder.new_token_at(1_000, 300)?;

        let header = jsonwebtoken::decode_header(&token)?;
        assert_eq!(header.alg, Algorithm::ES256);
        assert_eq!(header.kid.as_deref(), Some("DEADBEEF42"));

        let payload = token.split('.').nth(1).expect("JWT has payload");
        let payload = base64::decode_config(payload, base64::URL_SAFE_NO_PAD).unwrap();
        let claims = serde_json::from_slice::<ConnectTokenRequest>(&payload)?;

        assert_eq!(claims.iss, "issuer-uuid");
        assert_eq!(claims.iat, 1_000);
        assert_eq!(claims.exp, 1_300);
        assert_eq!(claims.aud, "appstoreconnect-v1");

        Ok(())
    }
}
