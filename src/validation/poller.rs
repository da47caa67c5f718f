//! Readiness polling with one-time bootstrap.
//!
//! The poller waits for a coordination state transition (a replica-set member
//! becoming primary). If the very first status query answers
//! `NotYetInitialized`, it issues the bootstrap command once and then polls
//! with a full attempt budget.

use crate::core::error::{GatewayError, StageError};
use crate::core::types::{Outcome, StatusSnapshot};
use crate::gateway::{Command, CommandGateway};
use log::{debug, info};
use serde::Serialize;
use std::time::Duration;

/// Blocking delay between poll attempts.
///
/// Injected so tests can run the loop with zero real delay.
pub trait Sleeper: Send + Sync {
    /// Block the calling thread for `duration`.
    fn sleep(&self, duration: Duration);
}

/// Sleeps on the current thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Attempt budget and inter-attempt delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    /// Maximum number of status queries after any bootstrap.
    pub max_attempts: u32,
    /// Fixed delay between unsuccessful attempts.
    pub interval: Duration,
}

impl PollPolicy {
    /// Create a policy.
    pub fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            interval,
        }
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self::new(10, Duration::from_secs(1))
    }
}

/// Lifecycle of the polled resource as seen by the poller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PollState {
    /// The first probe reported the resource needs bootstrapping.
    Uninitialized,
    /// Waiting for the readiness predicate to hold.
    Initializing,
    /// The predicate held.
    Ready,
    /// The attempt budget ran out.
    TimedOut,
    /// A fatal error ended polling.
    Failed,
}

/// Result of [`ReadinessPoller::wait_until_ready`].
#[derive(Debug, Clone)]
pub struct PollReport {
    /// Outcome of the poll.
    pub outcome: Outcome,
    /// Terminal state.
    pub state: PollState,
    /// Status queries issued, including the probe that triggered bootstrap.
    pub status_queries: u32,
    /// Delays performed.
    pub delays: u32,
    /// Whether the bootstrap command was issued.
    pub bootstrapped: bool,
}

/// Polls a status query until a predicate holds.
pub struct ReadinessPoller<'a> {
    gateway: &'a dyn CommandGateway,
    sleeper: &'a dyn Sleeper,
    status_query: Command,
    bootstrap: Option<Command>,
}

impl<'a> ReadinessPoller<'a> {
    /// Create a poller that issues `status_query` through `gateway`.
    pub fn new(
        gateway: &'a dyn CommandGateway,
        sleeper: &'a dyn Sleeper,
        status_query: Command,
    ) -> Self {
        Self {
            gateway,
            sleeper,
            status_query,
            bootstrap: None,
        }
    }

    /// Command issued once when the first probe reports `NotYetInitialized`.
    pub fn with_bootstrap(mut self, command: Command) -> Self {
        self.bootstrap = Some(command);
        self
    }

    /// Poll until `predicate` holds or `policy.max_attempts` is exhausted.
    pub fn wait_until_ready<P>(&self, predicate: P, policy: &PollPolicy) -> PollReport
    where
        P: Fn(&StatusSnapshot) -> bool,
    {
        let mut run = PollRun::default();
        let mut attempt: u32 = 0;
        let mut last_snapshot = None;

        while attempt < policy.max_attempts {
            attempt += 1;
            run.status_queries += 1;
            debug!("status query attempt {}/{}", attempt, policy.max_attempts);

            match self.query_status() {
                Ok(snapshot) => {
                    if predicate(&snapshot) {
                        info!("resource ready after {} attempt(s)", attempt);
                        let message = ready_message(&snapshot, attempt);
                        return run.finish(PollState::Ready, Outcome::success(message));
                    }
                    last_snapshot = Some(snapshot);
                }
                Err(GatewayError::NotYetInitialized { message }) if run.status_queries == 1 => {
                    info!("resource not initialized ({}), bootstrapping", message);
                    debug!("poll state {:?}", PollState::Uninitialized);
                    if let Err(error) = self.bootstrap() {
                        return run.finish(PollState::Failed, Outcome::failure(error));
                    }
                    run.bootstrapped = true;
                    debug!("poll state {:?}", PollState::Initializing);
                    // The probe that revealed the uninitialized state does
                    // not count against the budget.
                    attempt = 0;
                    continue;
                }
                Err(GatewayError::NotYetInitialized { message }) => {
                    debug!("resource still reports not initialized: {}", message);
                }
                Err(error) => {
                    return run.finish(PollState::Failed, Outcome::failure(error.into()));
                }
            }

            if attempt < policy.max_attempts {
                self.sleeper.sleep(policy.interval);
                run.delays += 1;
            }
        }

        info!("resource not ready after {} attempt(s)", attempt);
        run.finish(
            PollState::TimedOut,
            Outcome::TimedOut {
                attempts: attempt,
                last_snapshot,
            },
        )
    }

    fn query_status(&self) -> Result<StatusSnapshot, GatewayError> {
        let response = self.gateway.execute(&self.status_query)?;
        response.into_status().ok_or_else(|| {
            let message = format!("{} returned no status", self.status_query);
            GatewayError::rejected(0, "UnexpectedReply", message)
        })
    }

    fn bootstrap(&self) -> Result<(), StageError> {
        let command = self.bootstrap.as_ref().ok_or(StageError::NotInitialized)?;
        match self.gateway.execute(command) {
            Ok(response) if response.acknowledged => {
                info!("{} acknowledged", command);
                Ok(())
            }
            Ok(_) => Err(StageError::BootstrapFailed(format!("{} was not acknowledged", command))),
            Err(error) => Err(StageError::BootstrapFailed(error.to_string())),
        }
    }
}

#[derive(Default)]
struct PollRun {
    status_queries: u32,
    delays: u32,
    bootstrapped: bool,
}

impl PollRun {
    fn finish(self, state: PollState, outcome: Outcome) -> PollReport {
        PollReport {
            outcome,
            state,
            status_queries: self.status_queries,
            delays: self.delays,
            bootstrapped: self.bootstrapped,
        }
    }
}

fn ready_message(snapshot: &StatusSnapshot, attempt: u32) -> String {
    match snapshot.get_str("myStateStr") {
        Some(state) => format!("node is {} after {} attempt(s)", state, attempt),
        None => format!("ready after {} attempt(s)", attempt),
    }
}

/// Readiness predicate: `field` holds the integer `expected`.
pub fn state_equals(field: &str, expected: i64) -> impl Fn(&StatusSnapshot) -> bool + '_ {
    move |snapshot| snapshot.get_i64(field) == Some(expected)
}
