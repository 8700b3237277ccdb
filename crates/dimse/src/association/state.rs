//! Upper Layer state table
//!
//! The subset of PS3.8 states an association passes through, and the
//! transitions between them. Every accepted transition names the action
//! it corresponds to so it can be traced.

use std::fmt;

use tracing::debug;

use crate::error::{DimseError, Result};

/// Which side opened the association
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Requestor,
    Acceptor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Sta1
    Idle,
    /// Sta2: transport open, waiting for A-ASSOCIATE-RQ
    AwaitingAssociateRequest,
    /// Sta3: A-ASSOCIATE-RQ received, local answer pending
    AwaitingLocalResponse,
    /// Sta4
    TransportConnecting,
    /// Sta5
    AwaitingAssociateResponse,
    /// Sta6
    DataTransfer,
    /// Sta7
    AwaitingReleaseResponse,
    /// Sta8: peer asked to release, our A-RELEASE-RP pending
    AwaitingLocalReleaseResponse,
}

impl State {
    pub fn code(self) -> u8 {
        match self {
            State::Idle => 1,
            State::AwaitingAssociateRequest => 2,
            State::AwaitingLocalResponse => 3,
            State::TransportConnecting => 4,
            State::AwaitingAssociateResponse => 5,
            State::DataTransfer => 6,
            State::AwaitingReleaseResponse => 7,
            State::AwaitingLocalReleaseResponse => 8,
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sta{}", self.code())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    ConnectRequested,
    TransportConnected,
    AssociateAcReceived,
    AssociateRjReceived,
    TransportAccepted,
    AssociateRqReceived,
    AssociateAcSent,
    AssociateRjSent,
    PDataSent,
    PDataReceived,
    ReleaseRqSent,
    ReleaseRqReceived,
    ReleaseRpSent,
    ReleaseRpReceived,
    AbortSent,
    AbortReceived,
    TransportClosed,
}

/// Looks up the next state and the action label for an event.
///
/// Abort and transport closure are valid in every state.
pub fn next(state: State, event: Event) -> Option<(State, &'static str)> {
    use Event::*;
    use State::*;

    let transition = match (state, event) {
        (_, AbortSent) => (Idle, "AA-1"),
        (_, AbortReceived) => (Idle, "AA-3"),
        (_, TransportClosed) => (Idle, "AA-4"),

        (Idle, ConnectRequested) => (TransportConnecting, "AE-1"),
        (TransportConnecting, TransportConnected) => (AwaitingAssociateResponse, "AE-2"),
        (AwaitingAssociateResponse, AssociateAcReceived) => (DataTransfer, "AE-3"),
        (AwaitingAssociateResponse, AssociateRjReceived) => (Idle, "AE-4"),

        (Idle, TransportAccepted) => (AwaitingAssociateRequest, "AE-5"),
        (AwaitingAssociateRequest, AssociateRqReceived) => (AwaitingLocalResponse, "AE-6"),
        (AwaitingLocalResponse, AssociateAcSent) => (DataTransfer, "AE-7"),
        (AwaitingLocalResponse, AssociateRjSent) => (Idle, "AE-8"),

        (DataTransfer, PDataSent) => (DataTransfer, "DT-1"),
        (DataTransfer, PDataReceived) => (DataTransfer, "DT-2"),

        (DataTransfer, ReleaseRqSent) => (AwaitingReleaseResponse, "AR-1"),
        (DataTransfer, ReleaseRqReceived) => (AwaitingLocalReleaseResponse, "AR-2"),
        (AwaitingReleaseResponse, ReleaseRpReceived) => (Idle, "AR-3"),
        (AwaitingLocalReleaseResponse, ReleaseRpSent) => (Idle, "AR-4"),
        (AwaitingReleaseResponse, PDataReceived) => (AwaitingReleaseResponse, "AR-6"),
        (AwaitingLocalReleaseResponse, PDataSent) => (AwaitingLocalReleaseResponse, "AR-7"),
        // Release collision: answer the peer and keep waiting for its answer
        (AwaitingReleaseResponse, ReleaseRqReceived) => (AwaitingReleaseResponse, "AR-8"),
        (AwaitingReleaseResponse, ReleaseRpSent) => (AwaitingReleaseResponse, "AR-10"),

        _ => return None,
    };
    Some(transition)
}

/// Current state plus the transition log hook
#[derive(Debug, Clone)]
pub struct StateMachine {
    role: Role,
    state: State,
}

impl StateMachine {
    pub fn new(role: Role) -> Self {
        Self { role, state: State::Idle }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Applies an event, failing if the current state does not allow it.
    pub fn apply(&mut self, event: Event) -> Result<State> {
        match next(self.state, event) {
            Some((to, action)) => {
                if to != self.state || !matches!(event, Event::PDataSent | Event::PDataReceived) {
                    debug!(role = ?self.role, from = %self.state, to = %to, action, ?event, "association state change");
                }
                self.state = to;
                Ok(to)
            }
            None => Err(DimseError::InvalidState(format!(
                "{:?} is not valid in {} ({:?})",
                event, self.state, self.role
            ))),
        }
    }

    pub fn is_established(&self) -> bool {
        self.state == State::DataTransfer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requestor_lifecycle() {
        let mut sm = StateMachine::new(Role::Requestor);
        for event in [
            Event::ConnectRequested,
            Event::TransportConnected,
            Event::AssociateAcReceived,
            Event::PDataSent,
            Event::PDataReceived,
            Event::ReleaseRqSent,
            Event::PDataReceived,
            Event::ReleaseRpReceived,
        ] {
            sm.apply(event).unwrap();
        }
        assert_eq!(sm.state(), State::Idle);
    }

    #[test]
    fn test_acceptor_lifecycle() {
        let mut sm = StateMachine::new(Role::Acceptor);
        sm.apply(Event::TransportAccepted).unwrap();
        sm.apply(Event::AssociateRqReceived).unwrap();
        assert_eq!(sm.apply(Event::AssociateAcSent).unwrap(), State::DataTransfer);
        assert!(sm.is_established());
        sm.apply(Event::ReleaseRqReceived).unwrap();
        assert_eq!(sm.apply(Event::ReleaseRpSent).unwrap(), State::Idle);
    }

    #[test]
    fn test_invalid_events_are_refused() {
        let mut sm = StateMachine::new(Role::Requestor);
        assert!(matches!(sm.apply(Event::PDataSent), Err(DimseError::InvalidState(_))));
        sm.apply(Event::ConnectRequested).unwrap();
        sm.apply(Event::TransportConnected).unwrap();
        assert!(sm.apply(Event::ReleaseRqSent).is_err());
        assert_eq!(sm.apply(Event::AbortReceived).unwrap(), State::Idle);
    }

    #[test]
    fn test_state_codes() {
        assert_eq!(State::DataTransfer.to_string(), "Sta6");
        assert_eq!(State::AwaitingLocalReleaseResponse.code(), 8);
    }
}
