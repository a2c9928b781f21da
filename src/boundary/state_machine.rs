use thiserror::Error;

/// Lifecycle of one boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Staged and initialized, not yet routed to
    Created,
    Active,
    /// Out of the routing table, draining in-flight requests
    Retiring,
    Disposed,
}

#[derive(Error, Debug)]
pub enum TransitionError {
    #[error("invalid transition: {0:?} -> {1:?}")]
    InvalidTransition(State, State),
}

pub struct StateMachine {
    pub state: State,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self { state: State::Created }
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn can_transition(&self, to: State) -> bool {
        matches!(
            (self.state, to),
            (State::Created, State::Active)
                | (State::Created, State::Disposed)
                | (State::Active, State::Retiring)
                | (State::Active, State::Disposed)
                | (State::Retiring, State::Disposed)
        )
    }

    pub fn transition(&mut self, to: State) -> Result<(), TransitionError> {
        if self.can_transition(to) {
            tracing::debug!("Boundary state transition: {:?} -> {:?}", self.state, to);
            self.state = to;
            Ok(())
        } else {
            Err(TransitionError::InvalidTransition(self.state, to))
        }
    }
}
