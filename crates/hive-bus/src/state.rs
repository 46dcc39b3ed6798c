//! ---
//! hive_section: "02-messaging-ipc-data-model"
//! hive_subsection: "module"
//! hive_type: "source"
//! hive_scope: "code"
//! hive_description: "Connection lifecycle state machine."
//! hive_version: "v0.1.0"
//! hive_owner: "messaging"
//! ---
//! Transitions are a pure function of the current [`Machine`] and an
//! [`Input`]. The bus task executes the returned [`Command`]s in order; the
//! machine itself never touches a transport or a timer.
use std::fmt;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

/// Externally observable connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No link. A reconnect may be pending.
    Disconnected,
    /// Opening a link and declaring topology.
    Connecting,
    /// Topology declared and consumer attached.
    Connected,
    /// Torn down by the caller. Terminal.
    Closed,
}

impl ConnectionState {
    /// Numeric code exported on the state gauge.
    pub fn code(&self) -> i64 {
        match self {
            ConnectionState::Disconnected => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::Connected => 2,
            ConnectionState::Closed => 3,
        }
    }

    /// Label used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events fed into the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Input {
    /// Caller asked for a connection.
    ConnectRequested,
    /// Link open, topology declared, consumer attached.
    Established,
    /// Opening the link or declaring topology failed.
    SetupFailed {
        /// When the failure was observed.
        now: Instant,
    },
    /// The live link reported an error or closed unprompted.
    LinkLost {
        /// When the loss was observed.
        now: Instant,
    },
    /// The pending reconnect timer elapsed.
    ReconnectTimerFired,
    /// Caller asked for teardown.
    DisconnectRequested,
}

/// Side effects requested by a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Start opening a link, declaring topology and consuming. The attempt
    /// reports back with [`Input::Established`] or [`Input::SetupFailed`].
    Establish,
    /// Drop the attempt started by [`Command::Establish`].
    AbandonAttempt,
    /// Arm the single reconnect timer.
    ScheduleReconnect {
        /// Deadline of the attempt.
        at: Instant,
    },
    /// Disarm the reconnect timer.
    CancelReconnect,
    /// Detach a dead link; closing it is best effort.
    ReleaseLink,
    /// Close the channel, then the connection.
    CloseLink,
    /// Publish the new state to observers.
    Notify(ConnectionState),
}

/// Current state plus the deadline of the one pending reconnect, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Machine {
    state: ConnectionState,
    reconnect_at: Option<Instant>,
    interval: Duration,
}

impl Machine {
    /// A disconnected machine retrying every `interval`.
    pub fn new(interval: Duration) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            reconnect_at: None,
            interval,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Deadline of the pending reconnect.
    pub fn reconnect_at(&self) -> Option<Instant> {
        self.reconnect_at
    }

    /// Compute the next machine and the commands that realise it.
    pub fn transition(self, input: Input) -> (Machine, Vec<Command>) {
        use ConnectionState::*;

        let mut next = self;
        let mut commands = Vec::new();
        match (self.state, input) {
            (Closed, _) => {}

            (Disconnected, Input::ConnectRequested) => {
                next.leave_disconnected(&mut commands);
                next.enter(Connecting, &mut commands);
                commands.push(Command::Establish);
            }
            (Disconnected, Input::ReconnectTimerFired) if self.reconnect_at.is_some() => {
                next.reconnect_at = None;
                next.enter(Connecting, &mut commands);
                commands.push(Command::Establish);
            }

            (Connecting, Input::Established) => next.enter(Connected, &mut commands),
            (Connecting, Input::SetupFailed { now }) => {
                next.enter(Disconnected, &mut commands);
                next.schedule(now, &mut commands);
            }

            (Connected, Input::LinkLost { now }) => {
                commands.push(Command::ReleaseLink);
                next.enter(Disconnected, &mut commands);
                next.schedule(now, &mut commands);
            }

            (state, Input::DisconnectRequested) => {
                next.leave_disconnected(&mut commands);
                match state {
                    Connecting => commands.push(Command::AbandonAttempt),
                    Connected => commands.push(Command::CloseLink),
                    _ => {}
                }
                next.enter(Closed, &mut commands);
            }

            _ => {}
        }
        (next, commands)
    }

    /// Apply `input` in place and return the commands to run.
    pub fn apply(&mut self, input: Input) -> Vec<Command> {
        let (next, commands) = self.transition(input);
        *self = next;
        commands
    }

    fn enter(&mut self, state: ConnectionState, commands: &mut Vec<Command>) {
        self.state = state;
        commands.push(Command::Notify(state));
    }

    fn leave_disconnected(&mut self, commands: &mut Vec<Command>) {
        if self.reconnect_at.take().is_some() {
            commands.push(Command::CancelReconnect);
        }
    }

    fn schedule(&mut self, now: Instant, commands: &mut Vec<Command>) {
        if self.reconnect_at.is_none() {
            let at = now + self.interval;
            self.reconnect_at = Some(at);
            commands.push(Command::ScheduleReconnect { at });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionState::*;

    const INTERVAL: Duration = Duration::from_millis(100);

    fn connected() -> Machine {
        let mut machine = Machine::new(INTERVAL);
        machine.apply(Input::ConnectRequested);
        machine.apply(Input::Established);
        machine
    }

    #[test]
    fn connect_then_established() {
        let mut machine = Machine::new(INTERVAL);
        assert_eq!(
            machine.apply(Input::ConnectRequested),
            vec![Command::Notify(Connecting), Command::Establish]
        );
        assert_eq!(
            machine.apply(Input::Established),
            vec![Command::Notify(Connected)]
        );
        assert_eq!(machine.state(), Connected);
    }

    #[test]
    fn connect_is_idempotent() {
        let mut machine = connected();
        assert!(machine.apply(Input::ConnectRequested).is_empty());
        assert_eq!(machine.state(), Connected);
    }

    #[test]
    fn setup_failure_schedules_one_retry() {
        let now = Instant::now();
        let mut machine = Machine::new(INTERVAL);
        machine.apply(Input::ConnectRequested);
        assert_eq!(
            machine.apply(Input::SetupFailed { now }),
            vec![
                Command::Notify(Disconnected),
                Command::ScheduleReconnect { at: now + INTERVAL }
            ]
        );
        assert_eq!(machine.reconnect_at(), Some(now + INTERVAL));

        // A stray failure report while disconnected does not arm a second timer.
        assert!(machine.apply(Input::SetupFailed { now }).is_empty());
        assert!(machine.apply(Input::LinkLost { now }).is_empty());
    }

    #[test]
    fn link_loss_releases_and_retries() {
        let now = Instant::now();
        let mut machine = connected();
        assert_eq!(
            machine.apply(Input::LinkLost { now }),
            vec![
                Command::ReleaseLink,
                Command::Notify(Disconnected),
                Command::ScheduleReconnect { at: now + INTERVAL }
            ]
        );
        assert_eq!(
            machine.apply(Input::ReconnectTimerFired),
            vec![Command::Notify(Connecting), Command::Establish]
        );
        assert_eq!(machine.reconnect_at(), None);
    }

    #[test]
    fn manual_connect_cancels_pending_timer() {
        let now = Instant::now();
        let mut machine = connected();
        machine.apply(Input::LinkLost { now });
        assert_eq!(
            machine.apply(Input::ConnectRequested),
            vec![
                Command::CancelReconnect,
                Command::Notify(Connecting),
                Command::Establish
            ]
        );
        assert_eq!(machine.reconnect_at(), None);
    }

    #[test]
    fn stale_timer_is_ignored() {
        let mut machine = Machine::new(INTERVAL);
        assert!(machine.apply(Input::ReconnectTimerFired).is_empty());
        let mut live = connected();
        assert!(live.apply(Input::ReconnectTimerFired).is_empty());
    }

    #[test]
    fn disconnect_closes_link_and_is_terminal() {
        let mut machine = connected();
        assert_eq!(
            machine.apply(Input::DisconnectRequested),
            vec![Command::CloseLink, Command::Notify(Closed)]
        );
        for input in [
            Input::ConnectRequested,
            Input::Established,
            Input::ReconnectTimerFired,
            Input::DisconnectRequested,
            Input::LinkLost {
                now: Instant::now(),
            },
        ] {
            assert!(machine.apply(input).is_empty());
            assert_eq!(machine.state(), Closed);
        }
    }

    #[test]
    fn disconnect_while_waiting_cancels_timer() {
        let now = Instant::now();
        let mut machine = connected();
        machine.apply(Input::LinkLost { now });
        assert_eq!(
            machine.apply(Input::DisconnectRequested),
            vec![Command::CancelReconnect, Command::Notify(Closed)]
        );
        assert_eq!(machine.reconnect_at(), None);
    }

    #[test]
    fn disconnect_while_connecting_abandons_attempt() {
        let mut machine = Machine::new(INTERVAL);
        machine.apply(Input::ConnectRequested);
        assert_eq!(
            machine.apply(Input::DisconnectRequested),
            vec![Command::AbandonAttempt, Command::Notify(Closed)]
        );
        assert!(machine.apply(Input::Established).is_empty());
        assert_eq!(machine.state(), Closed);
    }

    #[test]
    fn connect_while_connecting_waits_on_the_attempt() {
        let mut machine = Machine::new(INTERVAL);
        machine.apply(Input::ConnectRequested);
        assert!(machine.apply(Input::ConnectRequested).is_empty());
        assert_eq!(machine.state(), Connecting);
    }

    #[test]
    fn transition_leaves_original_untouched() {
        let machine = Machine::new(INTERVAL);
        let (next, _) = machine.transition(Input::ConnectRequested);
        assert_eq!(machine.state(), Disconnected);
        assert_eq!(next.state(), Connecting);
    }
}
