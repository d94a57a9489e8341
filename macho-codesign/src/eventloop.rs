// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Coordination of a background worker with a presentation layer.

[run_event_loop] multiplexes errors from a worker, progress events destined
for a [Ux] and an external cancellation signal. Errors are accumulated and
reported together once every source has gone quiet.
*/

use {
    crate::{
        error::MachoCodesignError,
        notarization::NotarizationEvent,
        ui::{HandleOutcome, Ux},
    },
    log::{trace, warn},
    std::sync::Arc,
    tokio::sync::{mpsc, watch},
};

/// Fires a cancellation observed by every clone of the paired [CancelToken].
#[derive(Clone, Debug)]
pub struct Canceller(Arc<watch::Sender<bool>>);

impl Canceller {
    pub fn cancel(&self) {
        self.0.send_replace(true);
    }
}

/// Observes a [Canceller].
#[derive(Clone, Debug)]
pub struct CancelToken(watch::Receiver<bool>);

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once cancelled. Never resolves if the [Canceller] was dropped without firing.
    pub async fn cancelled(&mut self) {
        loop {
            if self.is_cancelled() {
                return;
            }

            if self.0.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Create a connected [Canceller] and [CancelToken].
pub fn cancellation() -> (Canceller, CancelToken) {
    let (tx, rx) = watch::channel(false);

    (Canceller(Arc::new(tx)), CancelToken(rx))
}

/// A [CancelToken] that fires on Ctrl-C.
pub fn interrupt_token() -> CancelToken {
    let (canceller, token) = cancellation();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received");
            canceller.cancel();
        }
    });

    token
}

/// Pick the first UI that sets up successfully.
pub fn setup_ux(
    uxs: Vec<Box<dyn Ux>>,
    unsubscribe: &Canceller,
) -> Result<Box<dyn Ux>, MachoCodesignError> {
    for mut ux in uxs {
        match ux.setup(unsubscribe.clone()) {
            Ok(()) => return Ok(ux),
            Err(e) => warn!("unable to setup given UI, falling back to alternative UI: {}", e),
        }
    }

    Err(MachoCodesignError::NoUi)
}

/// Which inputs of the event loop can still deliver something.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LiveSources {
    pub worker_errors: bool,
    pub events: bool,
}

impl Default for LiveSources {
    fn default() -> Self {
        Self {
            worker_errors: true,
            events: true,
        }
    }
}

impl LiveSources {
    pub fn any(&self) -> bool {
        self.worker_errors || self.events
    }
}

/// Collapse accumulated errors into a single result.
fn into_result(mut errors: Vec<MachoCodesignError>) -> Result<(), MachoCodesignError> {
    match errors.len() {
        0 => Ok(()),
        1 => Err(errors.remove(0)),
        _ => Err(MachoCodesignError::Multiple(errors)),
    }
}

/// Drive `uxs` with events until the worker finishes or `cancel` fires.
///
/// A worker error stops event delivery and forces UI teardown, but further
/// worker errors are still collected. Cancellation stops listening to both
/// sources immediately. `cleanup` runs in every case.
pub async fn run_event_loop(
    mut cancel: CancelToken,
    mut worker_errors: mpsc::UnboundedReceiver<MachoCodesignError>,
    mut events: mpsc::UnboundedReceiver<NotarizationEvent>,
    cleanup: Option<Box<dyn FnOnce() + Send>>,
    uxs: Vec<Box<dyn Ux>>,
) -> Result<(), MachoCodesignError> {
    let res = drive(&mut cancel, &mut worker_errors, &mut events, uxs).await;

    if let Some(cleanup) = cleanup {
        cleanup();
    }

    res
}

async fn drive(
    cancel: &mut CancelToken,
    worker_errors: &mut mpsc::UnboundedReceiver<MachoCodesignError>,
    events: &mut mpsc::UnboundedReceiver<NotarizationEvent>,
    uxs: Vec<Box<dyn Ux>>,
) -> Result<(), MachoCodesignError> {
    let (unsubscribe, mut unsubscribed) = cancellation();
    let mut ux = setup_ux(uxs, &unsubscribe)?;

    let mut live = LiveSources::default();
    let mut errors = vec![];
    let mut force_teardown = false;

    while live.any() {
        tokio::select! {
            err = worker_errors.recv(), if live.worker_errors => match err {
                Some(err) => {
                    errors.push(err);
                    live.events = false;
                    force_teardown = true;
                }
                None => {
                    trace!("worker stopped");
                    live.worker_errors = false;
                }
            },
            event = events.recv(), if live.events => match event {
                Some(event) => match ux.handle(&event) {
                    Ok(HandleOutcome::Continue) => {}
                    Ok(HandleOutcome::Unsubscribe) => live.events = false,
                    Err(e) => errors.push(e),
                },
                None => {
                    trace!("event source closed");
                    live.events = false;
                }
            },
            _ = unsubscribed.cancelled(), if live.events => {
                live.events = false;
            },
            _ = cancel.cancelled() => {
                trace!("signal interrupt");
                live = LiveSources {
                    worker_errors: false,
                    events: false,
                };
                force_teardown = true;
            }
        }
    }

    if let Err(e) = ux.teardown(force_teardown) {
        errors.push(e);
    }

    into_result(errors)
}

#[cfg(test)]
mod test {
    use {
        super::*,
        crate::error::{FormatError, NotarizeError},
        std::sync::{
            atomic::{AtomicBool, Ordering},
            Arc, Mutex,
        },
    };

    /// Shared record of what a [RecordingUx] went through.
    #[derive(Default)]
    struct Journal {
        handled: Vec<NotarizationEvent>,
        teardown: Option<bool>,
    }

    struct RecordingUx {
        journal: Arc<Mutex<Journal>>,
        fail_setup: bool,
        outcome: HandleOutcome,
        fail_teardown: bool,
    }

    impl RecordingUx {
        fn new() -> (Self, Arc<Mutex<Journal>>) {
            let journal = Arc::new(Mutex::new(Journal::default()));

            (
                Self {
                    journal: journal.clone(),
                    fail_setup: false,
                    outcome: HandleOutcome::Continue,
                    fail_teardown: false,
                },
                journal,
            )
        }
    }

    impl Ux for RecordingUx {
        fn setup(&mut self, _unsubscribe: Canceller) -> Result<(), MachoCodesignError> {
            if self.fail_setup {
                Err(MachoCodesignError::CliGeneralError("no tty".into()))
            } else {
                Ok(())
            }
        }

        fn handle(&mut self, event: &NotarizationEvent) -> Result<HandleOutcome, MachoCodesignError> {
            self.journal.lock().unwrap().handled.push(event.clone());
            Ok(self.outcome)
        }

        fn teardown(&mut self, force: bool) -> Result<(), MachoCodesignError> {
            self.journal.lock().unwrap().teardown = Some(force);

            if self.fail_teardown {
                Err(MachoCodesignError::CliGeneralError("teardown failed".into()))
            } else {
                Ok(())
            }
        }
    }

    fn submitted(id: &str) -> NotarizationEvent {
        NotarizationEvent::Submitted { id: id.into() }
    }

    #[test]
    fn first_working_ui_wins() {
        let (mut broken, broken_journal) = RecordingUx::new();
        broken.fail_setup = true;
        let (working, _) = RecordingUx::new();
        let (unsubscribe, _token) = cancellation();

        let mut ux = setup_ux(vec![Box::new(broken), Box::new(working)], &unsubscribe).unwrap();
        ux.handle(&submitted("a")).unwrap();
        assert!(broken_journal.lock().unwrap().handled.is_empty());

        let (mut broken, _) = RecordingUx::new();
        broken.fail_setup = true;
        assert!(matches!(
            setup_ux(vec![Box::new(broken)], &unsubscribe),
            Err(MachoCodesignError::NoUi)
        ));
    }

    #[tokio::test]
    async fn clean_run_delivers_events() {
        let (ux, journal) = RecordingUx::new();
        let (_canceller, token) = cancellation();
        let (err_tx, err_rx) = mpsc::unbounded_channel();
        let (ev_tx, ev_rx) = mpsc::unbounded_channel();

        ev_tx.send(submitted("a")).unwrap();
        ev_tx.send(submitted("b")).unwrap();
        drop(ev_tx);
        drop(err_tx);

        let cleaned = Arc::new(AtomicBool::new(false));
        let flag = cleaned.clone();

        run_event_loop(
            token,
            err_rx,
            ev_rx,
            Some(Box::new(move || flag.store(true, Ordering::SeqCst))),
            vec![Box::new(ux)],
        )
        .await
        .unwrap();

        let journal = journal.lock().unwrap();
        assert_eq!(journal.handled, vec![submitted("a"), submitted("b")]);
        assert_eq!(journal.teardown, Some(false));
        assert!(cleaned.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn worker_errors_accumulate_and_force_teardown() {
        let (mut ux, journal) = RecordingUx::new();
        ux.fail_teardown = true;
        let (_canceller, token) = cancellation();
        let (err_tx, err_rx) = mpsc::unbounded_channel();
        // Events stay open; the worker error alone must end delivery.
        let (_ev_tx, ev_rx) = mpsc::unbounded_channel();

        err_tx
            .send(
                NotarizeError::Timeout {
                    submission_id: "abc".into(),
                }
                .into(),
            )
            .unwrap();
        err_tx.send(FormatError::MissingLinkedit.into()).unwrap();
        drop(err_tx);

        match run_event_loop(token, err_rx, ev_rx, None, vec![Box::new(ux)]).await {
            Err(MachoCodesignError::Multiple(errors)) => {
                assert_eq!(errors.len(), 3);
                assert!(matches!(errors[0], MachoCodesignError::Notarize(_)));
                assert!(matches!(errors[1], MachoCodesignError::Format(_)));
                assert_eq!(errors[2].to_string(), "teardown failed");
            }
            other => panic!("unexpected result: {:?}", other),
        }

        assert_eq!(journal.lock().unwrap().teardown, Some(true));
    }

    #[tokio::test]
    async fn unsubscribe_outcome_stops_delivery() {
        let (mut ux, journal) = RecordingUx::new();
        ux.outcome = HandleOutcome::Unsubscribe;
        let (_canceller, token) = cancellation();
        let (err_tx, err_rx) = mpsc::unbounded_channel::<MachoCodesignError>();
        let (ev_tx, ev_rx) = mpsc::unbounded_channel();

        ev_tx.send(submitted("a")).unwrap();
        ev_tx.send(submitted("b")).unwrap();
        drop(err_tx);

        run_event_loop(token, err_rx, ev_rx, None, vec![Box::new(ux)])
            .await
            .unwrap();

        assert_eq!(journal.lock().unwrap().handled, vec![submitted("a")]);
    }

    #[tokio::test]
    async fn cancellation_forces_teardown_without_waiting() {
        let (ux, journal) = RecordingUx::new();
        let (canceller, token) = cancellation();
        // Neither source ever closes.
        let (_err_tx, err_rx) = mpsc::unbounded_channel::<MachoCodesignError>();
        let (_ev_tx, ev_rx) = mpsc::unbounded_channel();

        canceller.cancel();

        let cleaned = Arc::new(AtomicBool::new(false));
        let flag = cleaned.clone();

        run_event_loop(
            token,
            err_rx,
            ev_rx,
            Some(Box::new(move || flag.store(true, Ordering::SeqCst))),
            vec![Box::new(ux)],
        )
        .await
        .unwrap();

        assert_eq!(journal.lock().unwrap().teardown, Some(true));
        assert!(cleaned.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn cleanup_runs_without_ui() {
        let (mut ux, _) = RecordingUx::new();
        ux.fail_setup = true;
        let (_canceller, token) = cancellation();
        let (_err_tx, err_rx) = mpsc::unbounded_channel::<MachoCodesignError>();
        let (_ev_tx, ev_rx) = mpsc::unbounded_channel();

        let cleaned = Arc::new(AtomicBool::new(false));
        let flag = cleaned.clone();

        let res = run_event_loop(
            token,
            err_rx,
            ev_rx,
            Some(Box::new(move || flag.store(true, Ordering::SeqCst))),
            vec![Box::new(ux)],
        )
        .await;

        assert!(matches!(res, Err(MachoCodesignError::NoUi)));
        assert!(cleaned.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn dropped_canceller_never_fires() {
        let (canceller, mut token) = cancellation();
        drop(canceller);

        let fired = tokio::time::timeout(std::time::Duration::from_millis(10), token.cancelled())
            .await
            .is_ok();
        assert!(!fired);
        assert!(!token.is_cancelled());
    }
}
