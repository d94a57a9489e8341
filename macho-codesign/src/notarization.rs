// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Apple notarization functionality.

Notarization works by uploading a payload to Apple servers and waiting for
Apple to scan the submitted content. If Apple is appeased by your submission,
they issue a notarization ticket, which can be downloaded and *stapled* (just
a fancy word for *attached*) to the content you upload.

A [Notarizer] drives a single submission through its lifecycle:

```text
Created -> Uploading -> Submitted -> Polling -> Accepted -> Stapled
                                            \-> Invalid
                                            \-> Rejected
```

The remote service is abstracted behind [NotaryService] so the state machine
can be exercised without network access. [AppStoreNotaryService] talks to the
App Store Connect Notary API.
*/

use {
    crate::{
        app_store_connect::{
            api_token::ConnectTokenEncoder,
            notary_api::{NewSubmissionResponseDataAttributes, SubmissionResponseStatus},
            AppStoreConnectClient,
        },
        error::{MachoCodesignError, NotarizeError, StapleError, SubmitError},
        eventloop::CancelToken,
        macho::MachOFile,
        signing::write_file_atomic,
        stapling::{record_name_from_macho, staple_ticket_to_macho},
        ticket_lookup::{default_client, lookup_notarization_ticket},
    },
    async_trait::async_trait,
    log::{debug, info, warn},
    std::{
        future::Future,
        io::Write,
        path::Path,
        time::Duration,
    },
    tokio::{sync::mpsc, time::Instant},
};

/// Maximum number of consecutive failed status queries tolerated while polling.
const MAX_CONSECUTIVE_POLL_FAILURES: usize = 3;

/// Tunables for waiting on a submission.
#[derive(Clone, Debug)]
pub struct NotarizerConfig {
    /// Delay before the second status query.
    pub initial_poll_interval: Duration,

    /// Upper bound on the delay between status queries.
    pub max_poll_interval: Duration,

    /// Factor the delay grows by after each query.
    pub backoff_multiplier: u32,

    /// How long to wait for a terminal status in total.
    pub deadline: Duration,

    /// Timeout applied to every individual request, uploads excepted.
    pub call_timeout: Duration,

    /// Name to give the submission. Defaults to the archive name.
    pub submission_name: Option<String>,
}

impl Default for NotarizerConfig {
    fn default() -> Self {
        Self {
            initial_poll_interval: Duration::from_secs(3),
            max_poll_interval: Duration::from_secs(30),
            backoff_multiplier: 2,
            deadline: Duration::from_secs(600),
            call_timeout: Duration::from_secs(60),
            submission_name: None,
        }
    }
}

impl NotarizerConfig {
    fn next_interval(&self, current: Duration) -> Duration {
        (current * self.backoff_multiplier).min(self.max_poll_interval)
    }
}

/// Where a [Notarizer] is in the lifecycle of a submission.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NotarizationState {
    Created,
    Uploading,
    Submitted,
    Polling,
    Accepted,
    Invalid,
    Rejected,
    Stapled,
}

impl NotarizationState {
    /// Whether no further transitions can occur out of this state.
    ///
    /// `Accepted` is not final since it may still become `Stapled`.
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Invalid | Self::Rejected | Self::Stapled)
    }

    fn can_transition_to(&self, next: Self) -> bool {
        use NotarizationState::*;

        matches!(
            (self, next),
            (Created, Uploading)
                | (Created, Submitted)
                | (Uploading, Submitted)
                | (Submitted, Polling)
                | (Polling, Accepted | Invalid | Rejected)
                // Resuming after a timeout, cancellation or transport failure.
                | (Polling, Submitted)
                | (Accepted, Stapled)
        )
    }
}

/// Remote status of a submission as last observed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum JobStatus {
    Submitted,
    InProgress,
    Accepted,
    Invalid,
    Rejected,
}

impl From<SubmissionResponseStatus> for JobStatus {
    fn from(status: SubmissionResponseStatus) -> Self {
        match status {
            SubmissionResponseStatus::Accepted => Self::Accepted,
            SubmissionResponseStatus::Invalid => Self::Invalid,
            SubmissionResponseStatus::Rejected => Self::Rejected,
            SubmissionResponseStatus::InProgress | SubmissionResponseStatus::Unknown => {
                Self::InProgress
            }
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Submitted => "Submitted",
            Self::InProgress => "In Progress",
            Self::Accepted => "Accepted",
            Self::Invalid => "Invalid",
            Self::Rejected => "Rejected",
        })
    }
}

/// A submission known to the notary service.
#[derive(Clone, Debug)]
pub struct NotarizationJob {
    pub submission_id: String,
    pub status: JobStatus,

    /// Developer log location, once the submission is terminal.
    pub log_url: Option<String>,

    /// Notarization ticket, once fetched for an accepted submission.
    pub ticket: Option<Vec<u8>>,
}

/// Result of notarizing a file on disk.
#[derive(Debug)]
pub struct NotarizationOutcome {
    pub job: NotarizationJob,

    /// Why the ticket couldn't be stapled. The notarization itself succeeded.
    pub staple_warning: Option<StapleError>,
}

/// Progress reported by a [Notarizer].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum NotarizationEvent {
    Uploading {
        name: String,
        size: usize,
    },
    Submitted {
        id: String,
    },
    Polling {
        id: String,
        status: JobStatus,
        attempt: usize,
    },
    Finished {
        id: String,
        status: JobStatus,
    },
    Stapled {
        record_name: String,
    },
    StapleFailed {
        reason: String,
    },
}

/// Destination for [NotarizationEvent]s.
///
/// Events are dropped when nobody listens.
#[derive(Clone, Debug, Default)]
pub struct EventSink(Option<mpsc::UnboundedSender<NotarizationEvent>>);

impl EventSink {
    /// A sink discarding everything.
    pub fn none() -> Self {
        Self(None)
    }

    /// A sink and the receiving end of its events.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<NotarizationEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();

        (Self(Some(tx)), rx)
    }

    pub fn emit(&self, event: NotarizationEvent) {
        if let Some(tx) = &self.0 {
            // Receiver going away means the UI stopped listening.
            let _ = tx.send(event);
        }
    }
}

/// A freshly created submission and where to upload its content.
#[derive(Clone, Debug)]
pub struct Submission {
    pub id: String,
    pub upload: NewSubmissionResponseDataAttributes,
}

/// The operations of a remote notary service.
#[async_trait]
pub trait NotaryService: Send + Sync {
    /// Register a new submission of an archive with the given SHA-256 digest.
    async fn submit(&self, sha256: &str, name: &str) -> Result<Submission, SubmitError>;

    /// Upload archive content for a submission.
    async fn upload(&self, submission: &Submission, data: Vec<u8>) -> Result<(), SubmitError>;

    /// Query the processing status of a submission.
    async fn status(&self, submission_id: &str) -> Result<SubmissionResponseStatus, SubmitError>;

    /// Resolve the developer log URL of a processed submission.
    async fn log_url(&self, submission_id: &str) -> Result<String, SubmitError>;

    /// Fetch the notarization ticket for a ticket record name.
    async fn ticket(&self, record_name: &str) -> Result<Vec<u8>, StapleError>;
}

/// [NotaryService] backed by the App Store Connect Notary API.
pub struct AppStoreNotaryService {
    client: AppStoreConnectClient,
    ticket_client: reqwest::Client,
}

impl AppStoreNotaryService {
    pub fn new(
        token_encoder: ConnectTokenEncoder,
        call_timeout: Duration,
    ) -> Result<Self, MachoCodesignError> {
        Ok(Self {
            client: AppStoreConnectClient::new(token_encoder, call_timeout)?,
            ticket_client: default_client(call_timeout)?,
        })
    }
}

fn submit_error(e: MachoCodesignError) -> SubmitError {
    match e {
        MachoCodesignError::Submit(e) => e,
        e => SubmitError::Transport(e.to_string()),
    }
}

#[async_trait]
impl NotaryService for AppStoreNotaryService {
    async fn submit(&self, sha256: &str, name: &str) -> Result<Submission, SubmitError> {
        let response = self
            .client
            .create_submission(sha256, name)
            .await
            .map_err(submit_error)?;

        Ok(Submission {
            id: response.data.id,
            upload: response.data.attributes,
        })
    }

    async fn upload(&self, submission: &Submission, data: Vec<u8>) -> Result<(), SubmitError> {
        let upload_error = |message: String| SubmitError::Upload {
            submission_id: submission.id.clone(),
            message,
        };

        let attrs = &submission.upload;

        let config = aws_config::from_env()
            .credentials_provider(aws_sdk_s3::Credentials::new(
                attrs.aws_access_key_id.clone(),
                attrs.aws_secret_access_key.clone(),
                Some(attrs.aws_session_token.clone()),
                None,
                "notary",
            ))
            .region(aws_sdk_s3::Region::new("us-west-2"))
            .load()
            .await;

        let s3 = aws_sdk_s3::Client::new(&config);

        info!(
            "uploading {} bytes to s3://{}/{}",
            data.len(),
            attrs.bucket,
            attrs.object
        );

        s3.put_object()
            .bucket(&attrs.bucket)
            .key(&attrs.object)
            .body(aws_smithy_http::byte_stream::ByteStream::from(data))
            .send()
            .await
            .map_err(|e| upload_error(e.to_string()))?;

        Ok(())
    }

    async fn status(&self, submission_id: &str) -> Result<SubmissionResponseStatus, SubmitError> {
        let response = self
            .client
            .get_submission(submission_id)
            .await
            .map_err(submit_error)?;

        Ok(response.data.attributes.status)
    }

    async fn log_url(&self, submission_id: &str) -> Result<String, SubmitError> {
        self.client
            .get_submission_log_url(submission_id)
            .await
            .map_err(submit_error)
    }

    async fn ticket(&self, record_name: &str) -> Result<Vec<u8>, StapleError> {
        lookup_notarization_ticket(&self.ticket_client, record_name).await
    }
}

/// Produce a zip archive holding `data` as a single executable entry named `name`.
///
/// The output depends only on the inputs: timestamps are fixed to the
/// earliest date zip can represent.
pub fn deterministic_zip(name: &str, data: &[u8]) -> Result<Vec<u8>, MachoCodesignError> {
    let mut zf = zip::ZipWriter::new(std::io::Cursor::new(vec![]));

    let options = zip::write::FileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .last_modified_time(zip::DateTime::default())
        .unix_permissions(0o0755);

    zf.start_file(name, options)?;
    zf.write_all(data)?;

    let writer = zf.finish()?;

    Ok(writer.into_inner())
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(ring::digest::digest(&ring::digest::SHA256, data))
}

/// Waits on a cancellation token, or forever when there is none.
async fn cancelled(token: &mut Option<CancelToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

/// An entity for performing notarizations.
///
/// Notarization works by uploading content to Apple, waiting for Apple to inspect
/// and react to that upload, then downloading a notarization "ticket" from Apple
/// and incorporating it into the entity being signed.
pub struct Notarizer<S> {
    service: S,
    config: NotarizerConfig,
    events: EventSink,
    cancel: Option<CancelToken>,
    state: NotarizationState,
}

impl<S: NotaryService> Notarizer<S> {
    pub fn new(service: S, config: NotarizerConfig) -> Self {
        Self {
            service,
            config,
            events: EventSink::none(),
            cancel: None,
            state: NotarizationState::Created,
        }
    }

    /// Send progress events to `events`.
    pub fn set_event_sink(&mut self, events: EventSink) {
        self.events = events;
    }

    /// Stop waiting on a submission once `cancel` fires.
    ///
    /// Uploads are never interrupted.
    pub fn set_cancel_token(&mut self, cancel: CancelToken) {
        self.cancel = Some(cancel);
    }

    pub fn service(&self) -> &S {
        &self.service
    }

    pub fn state(&self) -> NotarizationState {
        self.state
    }

    fn transition(&mut self, next: NotarizationState) -> Result<(), MachoCodesignError> {
        if !self.state.can_transition_to(next) {
            return Err(MachoCodesignError::CliGeneralError(format!(
                "notarizer cannot move from {:?} to {:?}",
                self.state, next
            )));
        }

        debug!("notarization state {:?} -> {:?}", self.state, next);
        self.state = next;

        Ok(())
    }

    /// Run a request under the per-call timeout.
    async fn call<T, F>(&self, fut: F) -> Result<T, SubmitError>
    where
        F: Future<Output = Result<T, SubmitError>>,
    {
        tokio::time::timeout(self.config.call_timeout, fut)
            .await
            .map_err(|_| {
                SubmitError::Transport(format!(
                    "no response within {}s",
                    self.config.call_timeout.as_secs()
                ))
            })?
    }

    /// Notarize a signed Mach-O binary on disk and staple the resulting ticket to it.
    ///
    /// A stapling failure is reported in the outcome rather than as an error.
    pub async fn notarize_path(
        &mut self,
        path: &Path,
    ) -> Result<NotarizationOutcome, MachoCodesignError> {
        let data = std::fs::read(path).map_err(|e| MachoCodesignError::io(path, e))?;
        let macho = MachOFile::parse(data)?;

        // Notarizing something that can't be stapled afterwards is pointless.
        let record_name = record_name_from_macho(&macho)?;

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "binary".to_string());

        let job = self.notarize_data(&name, macho.as_bytes()).await?;
        let stapled = self.staple(path, &macho, &record_name).await;

        Ok(self.staple_outcome(path, job, stapled))
    }

    /// Resume waiting on a submission of the binary at `path` and staple it
    /// once accepted.
    ///
    /// As with [Notarizer::notarize_path], failing to staple is reported in
    /// the outcome. That includes the binary having changed or vanished
    /// since it was submitted.
    pub async fn resume_path(
        &mut self,
        path: &Path,
        submission_id: &str,
    ) -> Result<NotarizationOutcome, MachoCodesignError> {
        let job = self.resume(submission_id).await?;

        let signed = std::fs::read(path)
            .map_err(|e| StapleError::Rewrite(MachoCodesignError::io(path, e).to_string()))
            .and_then(|data| {
                MachOFile::parse(data).map_err(|e| StapleError::Rewrite(e.to_string()))
            })
            .and_then(|macho| Ok((record_name_from_macho(&macho)?, macho)));

        let stapled = match signed {
            Ok((record_name, macho)) => self.staple(path, &macho, &record_name).await,
            Err(e) => Err(e),
        };

        Ok(self.staple_outcome(path, job, stapled))
    }

    fn staple_outcome(
        &mut self,
        path: &Path,
        mut job: NotarizationJob,
        stapled: Result<Vec<u8>, StapleError>,
    ) -> NotarizationOutcome {
        let staple_warning = match stapled {
            Ok(ticket) => {
                job.ticket = Some(ticket);
                None
            }
            Err(e) => {
                warn!("unable to staple {}: {}", path.display(), e);
                self.events.emit(NotarizationEvent::StapleFailed {
                    reason: e.to_string(),
                });
                Some(e)
            }
        };

        NotarizationOutcome {
            job,
            staple_warning,
        }
    }

    async fn staple(
        &mut self,
        path: &Path,
        macho: &MachOFile,
        record_name: &str,
    ) -> Result<Vec<u8>, StapleError> {
        let ticket = tokio::time::timeout(self.config.call_timeout, self.service.ticket(record_name))
            .await
            .map_err(|_| StapleError::Lookup {
                record_name: record_name.to_string(),
                reason: "ticket lookup timed out".into(),
            })??;

        let stapled = staple_ticket_to_macho(macho, &ticket)?;

        write_file_atomic(path, stapled.as_bytes(), None)
            .map_err(|e| StapleError::Rewrite(e.to_string()))?;

        self.transition(NotarizationState::Stapled)
            .map_err(|e| StapleError::Rewrite(e.to_string()))?;
        self.events.emit(NotarizationEvent::Stapled {
            record_name: record_name.to_string(),
        });

        Ok(ticket)
    }

    /// Notarize in-memory content, waiting until the notary service reaches a verdict.
    ///
    /// `name` is the file name the content is archived and submitted under.
    pub async fn notarize_data(
        &mut self,
        name: &str,
        data: &[u8],
    ) -> Result<NotarizationJob, MachoCodesignError> {
        let archive_name = format!("{}.zip", name);
        let archive = deterministic_zip(name, data)?;
        let digest = sha256_hex(&archive);
        let submission_name = self
            .config
            .submission_name
            .clone()
            .unwrap_or_else(|| archive_name.clone());

        self.transition(NotarizationState::Uploading)?;
        self.events.emit(NotarizationEvent::Uploading {
            name: archive_name,
            size: archive.len(),
        });

        info!("creating notary submission {} (sha256 {})", submission_name, digest);
        let submission = self
            .call(self.service.submit(&digest, &submission_name))
            .await?;
        info!("created submission {}", submission.id);

        // Runs to completion regardless of cancellation.
        self.service.upload(&submission, archive).await?;

        self.transition(NotarizationState::Submitted)?;
        self.events.emit(NotarizationEvent::Submitted {
            id: submission.id.clone(),
        });

        self.wait(&submission.id).await
    }

    /// Resume waiting on a previously created submission.
    ///
    /// This works on a fresh instance as well as on one whose previous wait
    /// ended without a verdict.
    pub async fn resume(&mut self, submission_id: &str) -> Result<NotarizationJob, MachoCodesignError> {
        info!("resuming wait on submission {}", submission_id);
        self.transition(NotarizationState::Submitted)?;

        self.wait(submission_id).await
    }

    /// Poll the status of a submission until it is terminal.
    async fn wait(&mut self, submission_id: &str) -> Result<NotarizationJob, MachoCodesignError> {
        self.transition(NotarizationState::Polling)?;

        warn!(
            "waiting up to {}s for submission {} to finish processing",
            self.config.deadline.as_secs(),
            submission_id
        );

        let start = Instant::now();
        let deadline = start + self.config.deadline;
        let mut interval = self.config.initial_poll_interval;
        let mut cancel = self.cancel.clone();
        let mut last_status = JobStatus::Submitted;
        let mut failures = 0;
        let mut attempt = 0;

        loop {
            attempt += 1;

            match self.call(self.service.status(submission_id)).await {
                Ok(status) => {
                    failures = 0;
                    last_status = status.into();

                    info!(
                        "poll state after {}s: {}",
                        start.elapsed().as_secs(),
                        status
                    );
                    self.events.emit(NotarizationEvent::Polling {
                        id: submission_id.to_string(),
                        status: last_status,
                        attempt,
                    });

                    if status == SubmissionResponseStatus::Unknown {
                        warn!("unrecognized submission status; continuing to wait");
                    }

                    if status.is_terminal() {
                        return self.finish(submission_id, last_status).await;
                    }
                }
                Err(e) if e.is_retryable() => {
                    failures += 1;
                    warn!("status query {} failed: {}", attempt, e);

                    if failures >= MAX_CONSECUTIVE_POLL_FAILURES {
                        return Err(NotarizeError::Transport {
                            submission_id: submission_id.to_string(),
                            message: e.to_string(),
                        }
                        .into());
                    }
                }
                Err(e) => return Err(e.into()),
            }

            let now = Instant::now();
            if now >= deadline {
                warn!("reached wait limit after {}s", start.elapsed().as_secs());

                return Err(NotarizeError::Timeout {
                    submission_id: submission_id.to_string(),
                }
                .into());
            }

            tokio::select! {
                _ = tokio::time::sleep(interval.min(deadline - now)) => {}
                _ = cancelled(&mut cancel) => {
                    warn!("stopped waiting on submission {}", submission_id);

                    return Err(NotarizeError::Cancelled {
                        submission_id: submission_id.to_string(),
                        last_status: last_status.to_string(),
                    }
                    .into());
                }
            }

            interval = self.config.next_interval(interval);
        }
    }

    async fn finish(
        &mut self,
        submission_id: &str,
        status: JobStatus,
    ) -> Result<NotarizationJob, MachoCodesignError> {
        let log_url = match self.call(self.service.log_url(submission_id)).await {
            Ok(url) => {
                info!("developer log: {}", url);
                Some(url)
            }
            Err(e) => {
                warn!("unable to resolve developer log: {}", e);
                None
            }
        };

        let next = match status {
            JobStatus::Accepted => NotarizationState::Accepted,
            JobStatus::Invalid => NotarizationState::Invalid,
            _ => NotarizationState::Rejected,
        };
        self.transition(next)?;
        self.events.emit(NotarizationEvent::Finished {
            id: submission_id.to_string(),
            status,
        });

        let submission_id = submission_id.to_string();

        match status {
            JobStatus::Accepted => Ok(NotarizationJob {
                submission_id,
                status,
                log_url,
                ticket: None,
            }),
            JobStatus::Invalid => Err(NotarizeError::Invalid {
                submission_id,
                log_url,
            }
            .into()),
            _ => Err(NotarizeError::Rejected {
                submission_id,
                log_url,
            }
            .into()),
        }
    }
}
