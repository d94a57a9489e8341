// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! App Store Connect Notary API.
//!
//! See also <https://developer.apple.com/documentation/notaryapi>.

use {
    serde::{Deserialize, Serialize},
    serde_json::Value,
};

pub const APPLE_NOTARY_SUBMIT_SOFTWARE_URL: &str =
    "https://appstoreconnect.apple.com/notary/v2/submissions";

/// A notification that the notary service sends you when notarization finishes.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSubmissionRequestNotification {
    pub channel: String,
    pub target: String,
}

/// Data that you provide when starting a submission to the notary service.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSubmissionRequest {
    pub notifications: Vec<NewSubmissionRequestNotification>,
    pub sha256: String,
    pub submission_name: String,
}

/// Temporary credentials and location for uploading the submitted artifact.
#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSubmissionResponseDataAttributes {
    pub aws_access_key_id: String,
    pub aws_secret_access_key: String,
    pub aws_session_token: String,
    pub bucket: String,
    pub object: String,
}

impl std::fmt::Debug for NewSubmissionResponseDataAttributes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NewSubmissionResponseDataAttributes")
            .field("bucket", &self.bucket)
            .field("object", &self.object)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSubmissionResponseData {
    pub attributes: NewSubmissionResponseDataAttributes,
    pub id: String,
    pub r#type: String,
}

/// The notary service's response to a software submission.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSubmissionResponse {
    pub data: NewSubmissionResponseData,
    #[serde(default)]
    pub meta: Value,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub enum SubmissionResponseStatus {
    Accepted,
    #[serde(rename = "In Progress")]
    InProgress,
    Invalid,
    Rejected,
    #[serde(other)]
    Unknown,
}

impl SubmissionResponseStatus {
    /// Whether the notary service is done with the submission.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Accepted | Self::Invalid | Self::Rejected)
    }
}

impl std::fmt::Display for SubmissionResponseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Accepted => "Accepted",
            Self::InProgress => "In Progress",
            Self::Invalid => "Invalid",
            Self::Rejected => "Rejected",
            Self::Unknown => "Unknown",
        })
    }
}

/// Information about the status of a submission.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionResponseDataAttributes {
    pub created_date: String,
    pub name: String,
    pub status: SubmissionResponseStatus,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionResponseData {
    pub attributes: SubmissionResponseDataAttributes,
    pub id: String,
    pub r#type: String,
}

/// The notary service's response to a request for the status of a submission.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionResponse {
    pub data: SubmissionResponseData,
    #[serde(default)]
    pub meta: Value,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionLogResponseDataAttributes {
    pub developer_log_url: String,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionLogResponseData {
    pub attributes: SubmissionLogResponseDataAttributes,
    pub id: String,
    pub r#type: String,
}

/// Where to find the developer log of a completed submission.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionLogResponse {
    pub data: SubmissionLogResponseData,
    #[serde(default)]
    pub meta: Value,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_submission_status() {
        let json = r#"{
            "data": {
                "attributes": {
                    "createdDate": "2022-06-08T01:38:09.498Z",
                    "name": "tool.zip",
                    "status": "In Progress"
                },
                "id": "2efe2717-52ef-43a5-96dc-0797e4ca1041",
                "type": "submissions"
            },
            "meta": {}
        }"#;

        let response = serde_json::from_str::<SubmissionResponse>(json).unwrap();
        assert_eq!(
            response.data.attributes.status,
            SubmissionResponseStatus::InProgress
        );
        assert!(!response.data.attributes.status.is_terminal());
        assert_eq!(response.data.attributes.status.to_string(), "In Progress");
    }

    #[test]
    fn unknown_status_tolerated() {
        let json = r#"{
            "data": {
                "attributes": {"createdDate": "", "name": "x", "status": "Quarantined"},
                "id": "1",
                "type": "submissions"
            }
        }"#;

        let response = serde_json::from_str::<SubmissionResponse>(json).unwrap();
        assert_eq!(
            response.data.attributes.status,
            SubmissionResponseStatus::Unknown
        );
    }

    #[test]
    fn new_submission_debug_hides_secrets() {
        let json = r#"{
            "data": {
                "attributes": {
                    "awsAccessKeyId": "AKIAEXAMPLE",
                    "awsSecretAccessKey": "secret-value",
                    "awsSessionToken": "session-value",
                    "bucket": "notary-submissions-prod",
                    "object": "prod/AQAAAAEAAAAA/tool.zip"
                },
                "id": "abc",
                "type": "newSubmissions"
            }
        }"#;

        let response = serde_json::from_str::<NewSubmissionResponse>(json).unwrap();
        let debug = format!("{:?}", response);

        assert!(debug.contains("notary-submissions-prod"));
        assert!(!debug.contains("secret-value"));
        assert!(!debug.contains("session-value"));
    }
}
