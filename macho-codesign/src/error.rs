// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use {
    cryptographic_message_syntax::CmsError,
    std::path::PathBuf,
    thiserror::Error,
    x509_certificate::X509CertificateError,
};

/// A Mach-O file could not be interpreted or rewritten.
///
/// Always fatal to the operation on the affected architecture slice.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum FormatError {
    #[error("truncated {what}: need {needed} bytes at offset {offset}, have {available}")]
    Truncated {
        what: &'static str,
        offset: usize,
        needed: usize,
        available: usize,
    },

    #[error("unsupported binary: {0}")]
    Unsupported(String),

    #[error("bad header magic in {0}")]
    BadMagic(&'static str),

    #[error("unable to locate __LINKEDIT segment")]
    MissingLinkedit,

    #[error("__LINKEDIT isn't final Mach-O segment")]
    LinkeditNotLast,

    #[error("data after signature in __LINKEDIT or at end of file")]
    DataAfterSignature,

    #[error("no room for new load command: {available} bytes free, {needed} required")]
    LoadCommandNoRoom { available: usize, needed: usize },

    #[error("load command sizes sum to {actual} but header declares sizeofcmds {declared}")]
    SizeofcmdsMismatch { declared: u32, actual: u32 },

    #[error("segments {0} and {1} overlap in file")]
    SegmentOverlap(String, String),

    #[error("superblob data is malformed")]
    SuperblobMalformed,

    #[error("signature data {actual} bytes exceeds reserved space of {reserved} bytes")]
    SignatureDataTooLarge { actual: usize, reserved: usize },

    #[error("architecture index {0} out of range")]
    ArchOutOfRange(usize),
}

/// The signing identity could not produce a signature.
#[derive(Debug, Error)]
pub enum SigningError {
    #[error("private key does not correspond to leaf certificate {0}")]
    KeyMismatch(String),

    #[error("unsupported signing key algorithm: {0}")]
    UnsupportedAlgorithm(String),
}

/// The notary service refused a new submission.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("notary service rejected credentials: {0}")]
    Unauthorized(String),

    #[error("notary service rejected submission: {0}")]
    Rejected(String),

    #[error("upload of submission {submission_id} failed: {message}")]
    Upload {
        submission_id: String,
        message: String,
    },

    #[error("network error talking to notary service: {0}")]
    Transport(String),
}

impl SubmitError {
    /// Whether a caller may reasonably retry the submission as is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Upload { .. } | Self::Transport(_))
    }
}

/// Waiting on a submitted notarization did not yield an accepted result.
#[derive(Debug, Error)]
pub enum NotarizeError {
    #[error("notarization of {submission_id} did not finish before the deadline; resume later")]
    Timeout { submission_id: String },

    #[error("waiting on notarization of {submission_id} was cancelled (last status: {last_status})")]
    Cancelled {
        submission_id: String,
        last_status: String,
    },

    #[error("notarization of {submission_id} is invalid; log: {}", log_url.as_deref().unwrap_or("<unavailable>"))]
    Invalid {
        submission_id: String,
        log_url: Option<String>,
    },

    #[error("notarization of {submission_id} was rejected; log: {}", log_url.as_deref().unwrap_or("<unavailable>"))]
    Rejected {
        submission_id: String,
        log_url: Option<String>,
    },

    #[error("network error polling {submission_id}: {message}")]
    Transport {
        submission_id: String,
        message: String,
    },
}

impl NotarizeError {
    /// The remote submission identifier this error relates to.
    pub fn submission_id(&self) -> &str {
        match self {
            Self::Timeout { submission_id }
            | Self::Cancelled { submission_id, .. }
            | Self::Invalid { submission_id, .. }
            | Self::Rejected { submission_id, .. }
            | Self::Transport { submission_id, .. } => submission_id,
        }
    }

    /// Whether polling the same submission again may yield a different result.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::Cancelled { .. } | Self::Transport { .. }
        )
    }
}

/// A notarization ticket could not be attached to an artifact.
///
/// Notarization itself succeeded, so this is reported as a warning.
#[derive(Debug, Error)]
pub enum StapleError {
    #[error("binary has no code signature to staple to")]
    NoSignature,

    #[error("notarization ticket lookup for {record_name} failed: {reason}")]
    Lookup { record_name: String, reason: String },

    #[error("failed to rewrite binary with ticket: {0}")]
    Rewrite(String),

    #[error("ticket needs {needed} bytes of signature space but only {reserved} are reserved")]
    NoRoom { needed: usize, reserved: usize },
}

/// Unified error type for Mach-O signing and notarization.
#[derive(Debug, Error)]
pub enum MachoCodesignError {
    #[error(transparent)]
    Format(#[from] FormatError),

    #[error(transparent)]
    Signing(#[from] SigningError),

    #[error(transparent)]
    Submit(#[from] SubmitError),

    #[error(transparent)]
    Notarize(#[from] NotarizeError),

    #[error(transparent)]
    Staple(#[from] StapleError),

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    IoUnpathed(#[from] std::io::Error),

    #[error("{0}")]
    CliGeneralError(String),

    #[error("binary parsing error: {0}")]
    Goblin(#[from] goblin::error::Error),

    #[error("data structure parse error: {0}")]
    Scroll(#[from] scroll::Error),

    #[error("X.509 certificate handler error: {0}")]
    X509(#[from] X509CertificateError),

    #[error("PEM error: {0}")]
    CertificatePem(#[from] pem::PemError),

    #[error("CMS error: {0}")]
    Cms(#[from] CmsError),

    #[error("JSON serialization error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    #[error("plist error: {0}")]
    Plist(#[from] plist::Error),

    #[error("error parsing version string: {0}")]
    VersionParse(#[from] semver::Error),

    #[error("HTTP error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("JWT error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    #[error("App Store Connect API key error: {0}")]
    AppStoreConnectApiKey(String),

    #[error("unable to locate App Store Connect API key")]
    AppStoreConnectApiKeyNotFound,

    #[error("unknown code signature flag: {0}")]
    CodeSignatureUnknownFlag(String),

    #[error("unknown executable segment flag: {0}")]
    ExecutableSegmentUnknownFlag(String),

    #[error("unknown digest algorithm: {0}")]
    DigestUnknownAlgorithm(String),

    #[error("unsupported digest algorithm: {0:?}")]
    DigestUnsupportedAlgorithm(crate::embedded_signature::DigestType),

    #[error("unknown code requirement opcode: {0}")]
    RequirementUnknownOpcode(u32),

    #[error("unknown code requirement match expression: {0}")]
    RequirementUnknownMatchExpression(u32),

    #[error("malformed code requirement: {0}")]
    RequirementMalformed(&'static str),

    #[error("error when formulating code requirements: {0}")]
    PolicyFormulationError(String),

    #[error("entitlements data not valid UTF-8: {0}")]
    EntitlementsBadUtf8(std::str::Utf8Error),

    #[error("binary identifier missing; set one explicitly")]
    NoIdentifier,

    #[error("signature builder misuse: {0}")]
    SignatureBuilder(&'static str),

    #[error("code directory digest mismatch: {0}")]
    DigestMismatch(String),

    #[error("page size {0} is not a power of two")]
    InvalidPageSize(usize),

    #[error("unable to setup any UI")]
    NoUi,

    #[error("unsupported output format: {0}")]
    UnsupportedOutputFormat(String),

    #[error("{}", render_error_list(.0))]
    Multiple(Vec<MachoCodesignError>),
}

fn render_error_list(errors: &[MachoCodesignError]) -> String {
    match errors.len() {
        1 => errors[0].to_string(),
        n => {
            let mut s = format!("{} errors occurred:", n);
            for e in errors {
                s.push_str("\n\t* ");
                s.push_str(&e.to_string());
            }
            s
        }
    }
}

impl MachoCodesignError {
    /// Construct an [MachoCodesignError::Io] bound to the path being operated on.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether this error should be presented as a warning rather than a failure.
    pub fn is_warning(&self) -> bool {
        matches!(self, Self::Staple(_))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn multiple_errors_render_all() {
        let e = MachoCodesignError::Multiple(vec![
            MachoCodesignError::NoUi,
            FormatError::MissingLinkedit.into(),
        ]);

        let s = e.to_string();
        assert!(s.starts_with("2 errors occurred:"));
        assert!(s.contains("unable to setup any UI"));
        assert!(s.contains("__LINKEDIT"));
    }

    #[test]
    fn notarize_error_keeps_submission_id() {
        let e = NotarizeError::Timeout {
            submission_id: "abc-123".into(),
        };
        assert_eq!(e.submission_id(), "abc-123");
        assert!(e.is_retryable());

        let e = NotarizeError::Invalid {
            submission_id: "abc-123".into(),
            log_url: Some("https://example.com/log".into()),
        };
        assert!(!e.is_retryable());
        assert!(e.to_string().contains("https://example.com/log"));
    }
}
