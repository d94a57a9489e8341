// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Presentation of notarization progress.

use {
    crate::{
        error::MachoCodesignError,
        eventloop::Canceller,
        notarization::{JobStatus, NotarizationEvent},
    },
    console::Term,
    log::{info, warn},
};

/// What the event loop should do after an event was handled.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HandleOutcome {
    Continue,

    /// Stop delivering events to this UI.
    Unsubscribe,
}

/// A presentation layer reacting to [NotarizationEvent]s.
pub trait Ux: Send {
    /// Prepare the UI for use.
    ///
    /// `unsubscribe` stops event delivery when fired. An error means this UI
    /// can't run in the current environment.
    fn setup(&mut self, unsubscribe: Canceller) -> Result<(), MachoCodesignError>;

    fn handle(&mut self, event: &NotarizationEvent) -> Result<HandleOutcome, MachoCodesignError>;

    /// Release the UI. `force` is set when events were cut off early.
    fn teardown(&mut self, force: bool) -> Result<(), MachoCodesignError>;
}

fn describe(event: &NotarizationEvent) -> String {
    match event {
        NotarizationEvent::Uploading { name, size } => {
            format!("uploading {} ({} bytes)", name, size)
        }
        NotarizationEvent::Submitted { id } => format!("submission {} created", id),
        NotarizationEvent::Polling {
            id,
            status,
            attempt,
        } => format!("submission {}: {} (check {})", id, status, attempt),
        NotarizationEvent::Finished { id, status } => {
            format!("submission {} finished: {}", id, status)
        }
        NotarizationEvent::Stapled { record_name } => {
            format!("stapled notarization ticket {}", record_name)
        }
        NotarizationEvent::StapleFailed { reason } => format!("stapling failed: {}", reason),
    }
}

/// Narrates events through the logger. Always available.
#[derive(Default)]
pub struct LoggingUx {
    handled: usize,
}

impl Ux for LoggingUx {
    fn setup(&mut self, _unsubscribe: Canceller) -> Result<(), MachoCodesignError> {
        Ok(())
    }

    fn handle(&mut self, event: &NotarizationEvent) -> Result<HandleOutcome, MachoCodesignError> {
        self.handled += 1;

        match event {
            NotarizationEvent::StapleFailed { .. }
            | NotarizationEvent::Finished {
                status: JobStatus::Invalid | JobStatus::Rejected,
                ..
            } => warn!("{}", describe(event)),
            _ => info!("{}", describe(event)),
        }

        Ok(HandleOutcome::Continue)
    }

    fn teardown(&mut self, force: bool) -> Result<(), MachoCodesignError> {
        if force {
            warn!("stopped reporting progress after {} events", self.handled);
        }

        Ok(())
    }
}

/// Writes one line per event to stderr. Requires stderr to be a terminal.
#[derive(Default)]
pub struct TerminalUx {
    term: Option<Term>,
}

impl Ux for TerminalUx {
    fn setup(&mut self, _unsubscribe: Canceller) -> Result<(), MachoCodesignError> {
        if !atty::is(atty::Stream::Stderr) {
            return Err(MachoCodesignError::CliGeneralError(
                "stderr is not a terminal".into(),
            ));
        }

        self.term = Some(Term::stderr());

        Ok(())
    }

    fn handle(&mut self, event: &NotarizationEvent) -> Result<HandleOutcome, MachoCodesignError> {
        let term = self
            .term
            .as_ref()
            .ok_or_else(|| MachoCodesignError::CliGeneralError("terminal UI not set up".into()))?;

        term.write_line(&describe(event))?;

        Ok(HandleOutcome::Continue)
    }

    fn teardown(&mut self, force: bool) -> Result<(), MachoCodesignError> {
        if let Some(term) = self.term.take() {
            if force {
                term.write_line("interrupted")?;
            }
            term.flush()?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn describe_events() {
        assert_eq!(
            describe(&NotarizationEvent::Polling {
                id: "abc".into(),
                status: JobStatus::InProgress,
                attempt: 2
            }),
            "submission abc: In Progress (check 2)"
        );
        assert_eq!(
            describe(&NotarizationEvent::StapleFailed {
                reason: "no ticket".into()
            }),
            "stapling failed: no ticket"
        );
    }

    #[test]
    fn terminal_ui_requires_setup() {
        let mut ux = TerminalUx::default();

        assert!(ux
            .handle(&NotarizationEvent::Submitted { id: "abc".into() })
            .is_err());
        assert!(ux.teardown(true).is_ok());
    }
}
