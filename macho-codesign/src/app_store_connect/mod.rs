// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

pub mod api_token;
pub mod notary_api;

use {
    self::{
        api_token::{AppStoreConnectToken, ConnectTokenEncoder},
        notary_api::{
            NewSubmissionRequest, NewSubmissionResponse, SubmissionLogResponse,
            SubmissionResponse, APPLE_NOTARY_SUBMIT_SOFTWARE_URL,
        },
    },
    crate::error::{MachoCodesignError, SubmitError},
    log::{debug, error},
    reqwest::{Client, StatusCode},
    serde::{de::DeserializeOwned, Deserialize, Serialize},
    serde_json::Value,
    std::{
        fs::Permissions,
        io::Write,
        path::Path,
        sync::Mutex,
        time::{Duration, Instant},
    },
};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

#[cfg(unix)]
fn set_permissions_private(p: &mut Permissions) {
    p.set_mode(0o600);
}

#[cfg(windows)]
fn set_permissions_private(_: &mut Permissions) {}

/// Lifetime of minted tokens. Apple refuses anything over 20 minutes.
const TOKEN_LIFETIME: Duration = Duration::from_secs(600);

/// Tokens are renewed when less than this remains of their lifetime.
const TOKEN_RENEW_MARGIN: Duration = Duration::from_secs(60);

/// Represents all metadata for an App Store Connect API Key.
///
/// The type supports serialization so we save as a single file or payload
/// to enhance usability (so people don't need to provide all 3 pieces of the
/// API Key for all operations).
#[derive(Clone, Deserialize, Serialize)]
pub struct UnifiedApiKey {
    /// Who issued the key.
    ///
    /// Likely a UUID.
    issuer_id: String,

    /// Key identifier.
    ///
    /// An alphanumeric string like `DEADBEEF42`.
    key_id: String,

    /// Base64 encoded DER of ECDSA private key material.
    private_key: String,
}

impl std::fmt::Debug for UnifiedApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnifiedApiKey")
            .field("issuer_id", &self.issuer_id)
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

impl UnifiedApiKey {
    /// Construct an instance from constitute parts and a PEM encoded ECDSA private key.
    ///
    /// This is what you want to use if importing a private key from the file downloaded
    /// from the App Store Connect web interface.
    pub fn from_ecdsa_pem_path(
        issuer_id: impl ToString,
        key_id: impl ToString,
        path: impl AsRef<Path>,
    ) -> Result<Self, MachoCodesignError> {
        let path = path.as_ref();
        let pem_data = std::fs::read(path).map_err(|e| MachoCodesignError::io(path, e))?;

        Self::from_ecdsa_pem(issuer_id, key_id, &pem_data)
    }

    /// Construct an instance from a PEM encoded PKCS#8 ECDSA private key.
    pub fn from_ecdsa_pem(
        issuer_id: impl ToString,
        key_id: impl ToString,
        pem_data: &[u8],
    ) -> Result<Self, MachoCodesignError> {
        let parsed = pem::parse(pem_data).map_err(|e| {
            MachoCodesignError::AppStoreConnectApiKey(format!("error parsing PEM: {}", e))
        })?;

        if parsed.tag != "PRIVATE KEY" {
            return Err(MachoCodesignError::AppStoreConnectApiKey(
                "does not look like a PRIVATE KEY".to_string(),
            ));
        }

        Ok(Self {
            issuer_id: issuer_id.to_string(),
            key_id: key_id.to_string(),
            private_key: base64::encode(parsed.contents),
        })
    }

    /// Construct an instance from serialized JSON.
    pub fn from_json(data: impl AsRef<[u8]>) -> Result<Self, MachoCodesignError> {
        Ok(serde_json::from_slice(data.as_ref())?)
    }

    /// Construct an instance from a JSON file.
    pub fn from_json_path(path: impl AsRef<Path>) -> Result<Self, MachoCodesignError> {
        let path = path.as_ref();
        let data = std::fs::read(path).map_err(|e| MachoCodesignError::io(path, e))?;

        Self::from_json(data)
    }

    /// Serialize this instance to a JSON object.
    pub fn to_json_string(&self) -> Result<String, MachoCodesignError> {
        Ok(serde_json::to_string_pretty(&self)?)
    }

    /// Write this instance to a JSON file.
    ///
    /// Since the file contains sensitive data, it is readable only by its
    /// owner on platforms where this is implemented. Parent directories will
    /// be created if missing.
    pub fn write_json_file(&self, path: impl AsRef<Path>) -> Result<(), MachoCodesignError> {
        let path = path.as_ref();
        let io = |e| MachoCodesignError::io(path, e);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io)?;
        }

        let data = self.to_json_string()?;

        let mut fh = std::fs::File::create(path).map_err(io)?;
        let mut permissions = fh.metadata().map_err(io)?.permissions();
        set_permissions_private(&mut permissions);
        fh.set_permissions(permissions).map_err(io)?;
        fh.write_all(data.as_bytes()).map_err(io)?;

        Ok(())
    }
}

impl TryFrom<UnifiedApiKey> for ConnectTokenEncoder {
    type Error = MachoCodesignError;

    fn try_from(value: UnifiedApiKey) -> Result<Self, Self::Error> {
        let der = base64::decode(value.private_key).map_err(|e| {
            MachoCodesignError::AppStoreConnectApiKey(format!(
                "failed to base64 decode private key: {}",
                e
            ))
        })?;

        Ok(Self::from_ecdsa_der(value.key_id, value.issuer_id, &der))
    }
}

/// Classify an unsuccessful HTTP response.
fn classify_http_error(status: StatusCode, body: String) -> SubmitError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => SubmitError::Unauthorized(body),
        s if s.is_client_error() => SubmitError::Rejected(body),
        s => SubmitError::Transport(format!("HTTP {}: {}", s, body)),
    }
}

/// A client for the App Store Connect Notary API.
pub struct AppStoreConnectClient {
    client: Client,
    connect_token: ConnectTokenEncoder,
    token: Mutex<Option<(AppStoreConnectToken, Instant)>>,
}

impl AppStoreConnectClient {
    /// Construct a client whose requests time out after `timeout`.
    pub fn new(connect_token: ConnectTokenEncoder, timeout: Duration) -> Result<Self, MachoCodesignError> {
        Ok(Self {
            client: crate::ticket_lookup::default_client(timeout)?,
            connect_token,
            token: Mutex::new(None),
        })
    }

    /// Obtain a bearer token, minting a new one when the cached one is about to expire.
    fn get_token(&self) -> Result<String, MachoCodesignError> {
        let mut token = self.token.lock().unwrap_or_else(|e| e.into_inner());

        let now = Instant::now();
        match token.as_ref() {
            Some((value, expires)) if *expires > now + TOKEN_RENEW_MARGIN => Ok(value.clone()),
            _ => {
                debug!("minting new App Store Connect token");
                let value = self.connect_token.new_token(TOKEN_LIFETIME.as_secs())?;
                token.replace((value.clone(), now + TOKEN_LIFETIME));

                Ok(value)
            }
        }
    }

    async fn send_request<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, MachoCodesignError> {
        let request = request.build()?;
        let url = request.url().to_string();

        debug!("{} {}", request.method(), url);

        let response = self
            .client
            .execute(request)
            .await
            .map_err(|e| SubmitError::Transport(e.to_string()))?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| SubmitError::Transport(e.to_string()))?;

        if status.is_success() {
            Ok(serde_json::from_slice::<T>(&body)?)
        } else {
            error!("HTTP error from {}", url);

            let text = match serde_json::from_slice::<Value>(body.as_ref()) {
                Ok(value) => serde_json::to_string_pretty(&value)?,
                Err(_) => String::from_utf8_lossy(body.as_ref()).to_string(),
            };

            for line in text.lines() {
                error!("{}", line);
            }

            Err(classify_http_error(status, text).into())
        }
    }

    /// Create a submission to the Notary API.
    pub async fn create_submission(
        &self,
        sha256: &str,
        submission_name: &str,
    ) -> Result<NewSubmissionResponse, MachoCodesignError> {
        let token = self.get_token()?;

        let body = NewSubmissionRequest {
            notifications: Vec::new(),
            sha256: sha256.to_string(),
            submission_name: submission_name.to_string(),
        };
        let req = self
            .client
            .post(APPLE_NOTARY_SUBMIT_SOFTWARE_URL)
            .bearer_auth(token)
            .header("Accept", "application/json")
            .json(&body);

        self.send_request(req).await
    }

    /// Fetch the status of a Notary API submission.
    pub async fn get_submission(
        &self,
        submission_id: &str,
    ) -> Result<SubmissionResponse, MachoCodesignError> {
        let token = self.get_token()?;

        let req = self
            .client
            .get(format!("{}/{}", APPLE_NOTARY_SUBMIT_SOFTWARE_URL, submission_id))
            .bearer_auth(token)
            .header("Accept", "application/json");

        self.send_request(req).await
    }

    /// Resolve the URL of the developer log for a completed submission.
    pub async fn get_submission_log_url(
        &self,
        submission_id: &str,
    ) -> Result<String, MachoCodesignError> {
        let token = self.get_token()?;

        let req = self
            .client
            .get(format!(
                "{}/{}/logs",
                APPLE_NOTARY_SUBMIT_SOFTWARE_URL, submission_id
            ))
            .bearer_auth(token)
            .header("Accept", "application/json");

        let res = self.send_request::<SubmissionLogResponse>(req).await?;

        Ok(res.data.attributes.developer_log_url)
    }

    /// Fetch the developer log of a completed submission.
    pub async fn get_submission_log(&self, submission_id: &str) -> Result<Value, MachoCodesignError> {
        let url = self.get_submission_log_url(submission_id).await?;

        Ok(self.client.get(url).send().await?.json::<Value>().await?)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn pkcs8_pem() -> Vec<u8> {
        pem::encode(&pem::Pem {
            tag: "PRIVATE KEY".to_string(),
            contents: api_token::test::ecdsa_pkcs8(),
        })
        .into_bytes()
    }

    #[test]
    fn unified_key_json_roundtrip() -> Result<(), MachoCodesignError> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("keys").join("key.json");

        let key = UnifiedApiKey::from_ecdsa_pem("issuer", "DEADBEEF42", &pkcs8_pem())?;
        key.write_json_file(&path)?;

        #[cfg(unix)]
        assert_eq!(
            std::fs::metadata(&path)?.permissions().mode() & 0o777,
            0o600
        );

        let loaded = UnifiedApiKey::from_json_path(&path)?;
        assert_eq!(loaded.key_id, "DEADBEEF42");
        assert_eq!(loaded.issuer_id, "issuer");
        assert_eq!(loaded.private_key, key.private_key);

        let encoder = ConnectTokenEncoder::try_from(loaded)?;
        assert_eq!(encoder.key_id(), "DEADBEEF42");
        encoder.new_token(60)?;

        // Private key material stays out of debug output.
        assert!(!format!("{:?}", key).contains(&key.private_key));

        Ok(())
    }

    #[test]
    fn non_key_pem_rejected() {
        let cert_pem = pem::encode(&pem::Pem {
            tag: "CERTIFICATE".to_string(),
            contents: vec![0x30, 0x00],
        });

        assert!(matches!(
            UnifiedApiKey::from_ecdsa_pem("issuer", "key", cert_pem.as_bytes()),
            Err(MachoCodesignError::AppStoreConnectApiKey(_))
        ));
    }

    #[test]
    fn http_errors_classified() {
        assert!(matches!(
            classify_http_error(StatusCode::UNAUTHORIZED, "bad token".into()),
            SubmitError::Unauthorized(m) if m == "bad token"
        ));
        assert!(matches!(
            classify_http_error(StatusCode::BAD_REQUEST, "malformed package".into()),
            SubmitError::Rejected(m) if m == "malformed package"
        ));
        assert!(classify_http_error(StatusCode::BAD_GATEWAY, String::new()).is_retryable());
    }

    #[test]
    fn token_cached_until_near_expiry() -> Result<(), MachoCodesignError> {
        let encoder = ConnectTokenEncoder::from_ecdsa_der(
            "KEY".into(),
            "issuer".into(),
            &api_token::test::ecdsa_pkcs8(),
        );
        let client = AppStoreConnectClient::new(encoder, Duration::from_secs(5))?;

        let first = client.get_token()?;
        assert_eq!(client.get_token()?, first);

        // Force the cached token to look nearly expired.
        client
            .token
            .lock()
            .unwrap()
            .as_mut()
            .unwrap()
            .1 = Instant::now() + Duration::from_secs(1);

        // Tokens minted within the same second can be identical, so only the expiry is compared.
        client.get_token()?;
        let cached = client.token.lock().unwrap().as_ref().unwrap().1;
        assert!(cached > Instant::now() + TOKEN_RENEW_MARGIN);

        Ok(())
    }
}
