// SPDX-License-Identifier: AGPL-3.0-or-later
//! The orchestrator: one consumer for every event source, one close per run.

use std::os::raw::c_int;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::Arc;

use log::{debug, error, warn};

use crate::error::Error;
use crate::line_source::Line;
use crate::signal_watch::signal_label;
use crate::sink::{LogRecord, Sink, SinkError};

/// Everything the loop reacts to, funnelled through one channel.
#[derive(Debug)]
pub enum Event {
    Line(Line),
    InputEnded,
    Interrupt(c_int),
    SinkFailed(SinkError),
}

#[derive(Debug, Clone)]
pub enum TerminationReason {
    InputExhausted,
    ExternalInterrupt(c_int),
    SinkFailure(SinkError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Running,
    Draining,
    Terminated,
}

/// Outcome of one run of the loop.
#[derive(Debug)]
pub struct Report {
    pub reason: TerminationReason,
    /// Phase the loop ended in; `Terminated` once close has returned.
    pub phase: Phase,
    pub submitted: u64,
    pub closed: Result<(), SinkError>,
}

impl Report {
    /// Folds the run's outcome into the error, if any, the process exits with.
    ///
    /// A sink failure outranks the close error it usually causes; the latter
    /// is still logged.
    pub fn into_result(self) -> Result<(), Error> {
        match (self.reason, self.closed) {
            (TerminationReason::SinkFailure(e), closed) => {
                if let Err(close_err) = closed {
                    error!("Failed to close client: {}", close_err);
                }
                Err(Error::SinkFailure(e))
            }
            (_, closed) => closed.map_err(Error::Close),
        }
    }
}

pub struct StreamLoop<S> {
    sink: S,
    events: Receiver<Event>,
    draining: Arc<AtomicBool>,
    phase: Phase,
    submitted: u64,
}

impl<S: Sink> StreamLoop<S> {
    /// `draining` is raised as soon as the loop stops selecting, so signal
    /// handlers can tell a shutdown already in progress.
    pub fn new(sink: S, events: Receiver<Event>, draining: Arc<AtomicBool>) -> Self {
        Self {
            sink,
            events,
            draining,
            phase: Phase::Running,
            submitted: 0,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    fn enter(&mut self, phase: Phase) {
        debug!("stream loop {:?} -> {:?}", self.phase, phase);
        if phase == Phase::Draining {
            self.draining.store(true, Ordering::SeqCst);
        }
        self.phase = phase;
    }

    /// Submits lines in order until the first terminal event.
    fn select(&mut self) -> TerminationReason {
        loop {
            match self.events.recv() {
                Ok(Event::Line(line)) => {
                    if let Err(e) = self.sink.submit(LogRecord::from(line)) {
                        return TerminationReason::SinkFailure(e);
                    }
                    self.submitted += 1;
                }
                // A closed channel can only mean every producer is gone.
                Ok(Event::InputEnded) | Err(_) => return TerminationReason::InputExhausted,
                Ok(Event::Interrupt(signal)) => {
                    return TerminationReason::ExternalInterrupt(signal);
                }
                Ok(Event::SinkFailed(e)) => return TerminationReason::SinkFailure(e),
            }
        }
    }

    pub fn run(mut self) -> Report {
        let reason = self.select();
        self.enter(Phase::Draining);

        match &reason {
            TerminationReason::InputExhausted => {
                debug!("input exhausted after {} records", self.submitted);
            }
            TerminationReason::ExternalInterrupt(signal) => {
                warn!(
                    "Terminating program after receiving signal: {}",
                    signal_label(*signal)
                );
            }
            // The exit path logs the failure itself at error level.
            TerminationReason::SinkFailure(e) => {
                warn!("Terminating program after sink failure: {}", e);
            }
        }

        let closed = self.sink.close();
        // `enter` needs all of self and the sink has moved out.
        debug!("stream loop {:?} -> {:?}", self.phase, Phase::Terminated);
        self.phase = Phase::Terminated;

        Report {
            reason,
            phase: self.phase,
            submitted: self.submitted,
            closed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::{self, SyncSender};
    use std::sync::Mutex;

    use signal_hook::consts::SIGINT;

    #[derive(Default)]
    struct Recorded {
        records: Vec<String>,
        closes: usize,
    }

    /// Sink double that shares what it saw with the test.
    struct RecordingSink {
        seen: Arc<Mutex<Recorded>>,
        capacity: usize,
        close_result: Result<(), SinkError>,
    }

    impl Sink for RecordingSink {
        fn submit(&mut self, record: LogRecord) -> Result<(), SinkError> {
            let mut seen = self.seen.lock().unwrap();
            if seen.records.len() == self.capacity {
                return Err(SinkError::Overflow(self.capacity));
            }
            seen.records.push(record.into_payload());
            Ok(())
        }

        fn close(self) -> Result<(), SinkError> {
            self.seen.lock().unwrap().closes += 1;
            self.close_result
        }
    }

    fn harness(
                close_result: Result<(), SinkError>
            ) -> (StreamLoop<RecordingSink>, SyncSender<Event>, Arc<Mutex<Recorded>>) {
        let (tx, rx) = mpsc::sync_channel(64);
        let seen = Arc::new(Mutex::new(Recorded::default()));
        let sink = RecordingSink { seen: seen.clone(), capacity: usize::MAX, close_result };
        let draining = Arc::new(AtomicBool::new(false));
        (StreamLoop::new(sink, rx, draining), tx, seen)
    }

    fn line(s: &str) -> Event {
        Event::Line(Line::from(s))
    }

    #[test]
    fn submits_every_line_in_order_then_closes_once() {
        let (lp, tx, seen) = harness(Ok(()));
        assert_eq!(lp.phase(), Phase::Running);
        for s in ["a", "b", "c"] {
            tx.send(line(s)).unwrap();
        }
        tx.send(Event::InputEnded).unwrap();

        let report = lp.run();
        assert!(matches!(report.reason, TerminationReason::InputExhausted));
        assert_eq!(report.phase, Phase::Terminated);
        assert_eq!(report.submitted, 3);
        assert!(report.closed.is_ok());

        let seen = seen.lock().unwrap();
        assert_eq!(seen.records, vec!["a", "b", "c"]);
        assert_eq!(seen.closes, 1);
    }

    #[test]
    fn nothing_is_submitted_after_an_interrupt() {
        let (lp, tx, seen) = harness(Ok(()));
        tx.send(line("one")).unwrap();
        tx.send(line("two")).unwrap();
        tx.send(Event::Interrupt(SIGINT)).unwrap();
        tx.send(line("three")).unwrap();
        tx.send(Event::InputEnded).unwrap();

        let report = lp.run();
        assert!(matches!(report.reason, TerminationReason::ExternalInterrupt(SIGINT)));
        assert_eq!(report.submitted, 2);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.records, vec!["one", "two"]);
        assert_eq!(seen.closes, 1);
    }

    #[test]
    fn immediate_interrupt_submits_nothing() {
        let (lp, tx, seen) = harness(Ok(()));
        tx.send(Event::Interrupt(SIGINT)).unwrap();

        let report = lp.run();
        assert!(matches!(report.reason, TerminationReason::ExternalInterrupt(_)));
        assert_eq!(report.submitted, 0);
        assert_eq!(seen.lock().unwrap().closes, 1);
    }

    #[test]
    fn sink_failure_stops_the_loop_with_lines_left() {
        let (lp, tx, seen) = harness(Ok(()));
        tx.send(line("kept")).unwrap();
        tx.send(Event::SinkFailed(SinkError::Rejected("quota exhausted".into()))).unwrap();
        tx.send(line("dropped")).unwrap();

        let report = lp.run();
        match report.reason {
            TerminationReason::SinkFailure(SinkError::Rejected(reason)) => {
                assert_eq!(reason, "quota exhausted");
            }
            other => panic!("unexpected reason {other:?}"),
        }
        let seen = seen.lock().unwrap();
        assert_eq!(seen.records, vec!["kept"]);
        assert_eq!(seen.closes, 1);
    }

    #[test]
    fn refused_submission_is_a_sink_failure() {
        let (mut lp, tx, seen) = harness(Ok(()));
        lp.sink.capacity = 2;
        for s in ["a", "b", "c", "d"] {
            tx.send(line(s)).unwrap();
        }
        tx.send(Event::InputEnded).unwrap();

        let report = lp.run();
        assert!(matches!(
            report.reason,
            TerminationReason::SinkFailure(SinkError::Overflow(2))
        ));
        assert_eq!(report.submitted, 2);
        assert_eq!(report.phase, Phase::Terminated);
        assert_eq!(seen.lock().unwrap().closes, 1);
        assert_eq!(report.into_result().unwrap_err().exit_code(), 1);
    }

    #[test]
    fn sink_failure_outranks_the_close_error() {
        let (lp, tx, _seen) = harness(Err(SinkError::Disconnected));
        tx.send(Event::SinkFailed(SinkError::Disconnected)).unwrap();

        let err = lp.run().into_result().unwrap_err();
        assert!(matches!(err, Error::SinkFailure(SinkError::Disconnected)));
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn interrupt_with_clean_close_is_a_success() {
        let (lp, tx, _seen) = harness(Ok(()));
        tx.send(Event::Interrupt(SIGINT)).unwrap();
        assert!(lp.run().into_result().is_ok());
    }

    #[test]
    fn close_error_is_carried_in_the_report() {
        let (lp, tx, seen) = harness(Err(SinkError::Disconnected));
        tx.send(Event::InputEnded).unwrap();

        let report = lp.run();
        assert!(matches!(report.closed, Err(SinkError::Disconnected)));
        assert_eq!(seen.lock().unwrap().closes, 1);
        assert_eq!(report.into_result().unwrap_err().exit_code(), 2);
    }

    #[test]
    fn dropped_producers_count_as_end_of_input() {
        let (lp, tx, _seen) = harness(Ok(()));
        tx.send(line("last")).unwrap();
        drop(tx);

        let report = lp.run();
        assert!(matches!(report.reason, TerminationReason::InputExhausted));
        assert_eq!(report.submitted, 1);
    }

    #[test]
    fn draining_flag_is_raised_before_close() {
        struct FlagCheckingSink(Arc<AtomicBool>);

        impl Sink for FlagCheckingSink {
            fn submit(&mut self, _record: LogRecord) -> Result<(), SinkError> {
                assert!(!self.0.load(Ordering::SeqCst));
                Ok(())
            }

            fn close(self) -> Result<(), SinkError> {
                assert!(self.0.load(Ordering::SeqCst));
                Ok(())
            }
        }

        let (tx, rx) = mpsc::sync_channel(4);
        let draining = Arc::new(AtomicBool::new(false));
        let lp = StreamLoop::new(FlagCheckingSink(draining.clone()), rx, draining.clone());
        tx.send(line("x")).unwrap();
        tx.send(Event::InputEnded).unwrap();

        assert!(lp.run().closed.is_ok());
        assert!(draining.load(Ordering::SeqCst));
    }
}
