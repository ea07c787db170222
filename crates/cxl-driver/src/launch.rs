//! One-batch launch: the CSR handshake with the L2 engine.
//!
//! ```text
//!  Idle ──program──▶ Programming ──0,1 on L2_START──▶ Triggered
//!                                                        │
//!                                  poll RESP bit 0 ◀─────┘
//!                                        │
//!                      ┌─────────────────┴──────────────────┐
//!                      ▼                                    ▼
//!        Done: DELAY = cycles, RESP>>1 = result     TimedOut: budget spent
//!        L2_START cleared                           L2_START cleared
//! ```
//!
//! The driver owns the register bus for as long as it lives; the engine
//! builds one per streaming call and reuses it for every batch.

use crate::error::{CxlError, Result};
use crate::mmio::{Csr, RegisterIo};
use cxl_chip::regs::{response, start, test_case, Reg};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Completion polling parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    /// Sleep between two reads of `RESP`
    pub interval: Duration,
    /// Reads of `RESP` before giving up
    pub max_attempts: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_micros(500),
            max_attempts: 20_000,
        }
    }
}

impl PollConfig {
    /// Upper bound on the time spent waiting for one batch.
    pub fn budget(&self) -> Duration {
        self.interval * self.max_attempts
    }
}

/// Cooperative cancellation, observed once per poll iteration.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// New, not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Parameters of one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLaunch {
    /// Pass index, for diagnostics
    pub pass: u64,
    /// Device address of the converted batch
    pub batch_addr: u64,
    /// Device address of the converted query
    pub query_addr: u64,
    /// Vectors in the batch
    pub vectors: u64,
    /// Samples per vector
    pub dimension: u32,
}

/// What the device reported for one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchOutcome {
    /// L2 cycle count from `DELAY`
    pub cycles: u64,
    /// Result payload, `RESP >> 1`
    pub result: u64,
    /// Reads of `RESP` it took
    pub polls: u32,
}

/// Handshake state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchState {
    /// No batch in flight
    Idle,
    /// Parameters being written
    Programming,
    /// Start edge issued
    Triggered,
    /// Waiting for the completion bit
    Polling,
    /// Last batch completed
    Done,
    /// Last batch exhausted the poll budget or was cancelled
    TimedOut,
}

/// Drives the L2 engine one batch at a time.
#[derive(Debug)]
pub struct LaunchDriver<R> {
    csr: Csr<R>,
    poll: PollConfig,
    cancel: Option<CancelToken>,
    state: LaunchState,
}

impl<R: RegisterIo> LaunchDriver<R> {
    /// Driver over an already mapped register bus.
    pub const fn new(io: R, poll: PollConfig) -> Self {
        Self {
            csr: Csr::new(io),
            poll,
            cancel: None,
            state: LaunchState::Idle,
        }
    }

    /// Observe `token` while polling.
    #[must_use]
    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Current state.
    pub const fn state(&self) -> LaunchState {
        self.state
    }

    /// Register view, for diagnostics.
    pub const fn csr(&self) -> &Csr<R> {
        &self.csr
    }

    /// Release the register bus.
    pub fn into_inner(self) -> R {
        self.csr.into_inner()
    }

    /// Program, trigger and wait for one batch.
    ///
    /// # Errors
    ///
    /// Returns `DeviceTimeout` if the completion bit is not seen within the
    /// poll budget, `Cancelled` if the token fires first. The trigger is
    /// cleared before returning either way.
    pub fn launch(&mut self, req: &BatchLaunch) -> Result<BatchOutcome> {
        self.program(req);
        self.trigger();
        let started = Instant::now();

        match self.wait(req.pass) {
            Ok((resp, polls)) => {
                let cycles = self.csr.read(Reg::Delay);
                self.release_trigger();
                self.state = LaunchState::Done;
                let outcome = BatchOutcome {
                    cycles,
                    result: response::payload(resp),
                    polls,
                };
                tracing::debug!(
                    "pass {}: done after {polls} polls ({:?}), cycles={cycles}",
                    req.pass,
                    started.elapsed()
                );
                Ok(outcome)
            }
            Err(e) => {
                if tracing::enabled!(tracing::Level::DEBUG) {
                    for (reg, value) in self.csr.snapshot() {
                        tracing::debug!("pass {}: {reg} = {value:#x}", req.pass);
                    }
                }
                self.release_trigger();
                self.state = LaunchState::TimedOut;
                tracing::error!("pass {}: {e}", req.pass);
                Err(e)
            }
        }
    }

    fn program(&mut self, req: &BatchLaunch) {
        self.state = LaunchState::Programming;
        // Staged batch data must land before the device is pointed at it.
        self.csr.barrier();
        tracing::debug!(
            "pass {}: base={:#x} query={:#x} vecs={} dim={}",
            req.pass,
            req.batch_addr,
            req.query_addr,
            req.vectors,
            req.dimension
        );
        self.csr.write(Reg::PageAddr0, req.batch_addr);
        self.csr.write(Reg::PageAddr1, req.query_addr);
        self.csr.write(Reg::NumRequests, req.vectors);
        self.csr.write(Reg::AddrRange, u64::from(req.dimension));
        self.csr.write(Reg::TestCase, test_case::L2_STREAM);
        self.csr.barrier();
    }

    fn trigger(&mut self) {
        self.csr.write(Reg::Start, start::IDLE);
        self.csr.barrier();
        self.csr.write(Reg::Start, start::GO);
        self.csr.barrier();
        self.state = LaunchState::Triggered;
    }

    fn wait(&mut self, pass: u64) -> Result<(u64, u32)> {
        self.state = LaunchState::Polling;
        for attempt in 1..=self.poll.max_attempts {
            if self.cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
                return Err(CxlError::Cancelled { pass });
            }
            let resp = self.csr.read(Reg::Response);
            if response::is_done(resp) {
                return Ok((resp, attempt));
            }
            if !self.poll.interval.is_zero() {
                std::thread::sleep(self.poll.interval);
            }
        }
        #[allow(clippy::cast_possible_truncation)]
        let waited_ms = self.poll.budget().as_millis() as u64;
        Err(CxlError::DeviceTimeout {
            pass,
            attempts: self.poll.max_attempts,
            waited_ms,
        })
    }

    fn release_trigger(&mut self) {
        self.csr.write(Reg::Start, start::IDLE);
        self.csr.barrier();
    }
}
