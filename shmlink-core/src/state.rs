// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Endpoint state machine with typed state transitions.
//!
//! Implements the endpoint lifecycle: Uninitialized → Ready → Closed.
//! Invalid transitions result in StateTransitionError.

use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::error::StateTransitionError;

/// Endpoint lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndpointState {
    /// Created, no segment allocated yet.
    Uninitialized,

    /// Segment allocated; reads, writes and exports are allowed.
    Ready,

    /// Torn down. Terminal.
    Closed,
}

impl EndpointState {
    /// Get the state name for error messages.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Uninitialized => "Uninitialized",
            Self::Ready => "Ready",
            Self::Closed => "Closed",
        }
    }

    /// Check if transition to the target state is valid.
    pub fn can_transition_to(&self, target: EndpointState) -> bool {
        matches!(
            (self, target),
            (Self::Uninitialized, Self::Ready)
                | (Self::Uninitialized, Self::Closed)
                | (Self::Ready, Self::Closed)
        )
    }
}

impl std::fmt::Display for EndpointState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// State machine for an endpoint's lifecycle.
/// Enforces valid state transitions and tracks timing metrics.
#[derive(Debug)]
pub struct EndpointStateMachine {
    segment_name: String,
    current_state: EndpointState,
    last_transition: Instant,
    transition_count: u64,
}

impl EndpointStateMachine {
    /// Create a new state machine for the endpoint owning `segment_name`.
    pub fn new(segment_name: impl Into<String>) -> Self {
        Self {
            segment_name: segment_name.into(),
            current_state: EndpointState::Uninitialized,
            last_transition: Instant::now(),
            transition_count: 0,
        }
    }

    /// Get the current state.
    pub fn state(&self) -> EndpointState {
        self.current_state
    }

    /// Get time since last transition.
    pub fn time_in_current_state(&self) -> std::time::Duration {
        self.last_transition.elapsed()
    }

    /// Get total number of transitions.
    pub fn transition_count(&self) -> u64 {
        self.transition_count
    }

    /// Attempt to transition to a new state.
    pub fn transition_to(&mut self, target: EndpointState) -> Result<(), StateTransitionError> {
        if !self.current_state.can_transition_to(target) {
            return Err(StateTransitionError::InvalidTransition {
                segment: self.segment_name.clone(),
                from: self.current_state.name(),
                to: target.name(),
            });
        }

        tracing::debug!(
            segment = %self.segment_name,
            from = self.current_state.name(),
            to = target.name(),
            "Endpoint state transition"
        );

        self.current_state = target;
        self.last_transition = Instant::now();
        self.transition_count += 1;

        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.current_state == EndpointState::Ready
    }

    pub fn is_closed(&self) -> bool {
        self.current_state == EndpointState::Closed
    }
}

/// Diagnostic snapshot of an endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointStats {
    pub segment_name: String,
    pub current_state: String,
    pub time_in_state_ms: u64,
    pub transition_count: u64,
    pub subscriber_count: usize,
    pub remote_attached: bool,
}

impl EndpointStats {
    pub(crate) fn new(
        sm: &EndpointStateMachine,
        subscriber_count: usize,
        remote_attached: bool,
    ) -> Self {
        Self {
            segment_name: sm.segment_name.clone(),
            current_state: sm.current_state.name().to_string(),
            time_in_state_ms: sm.time_in_current_state().as_millis() as u64,
            transition_count: sm.transition_count,
            subscriber_count,
            remote_attached,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let sm = EndpointStateMachine::new("shared_a");
        assert_eq!(sm.state(), EndpointState::Uninitialized);
        assert_eq!(sm.transition_count(), 0);
    }

    #[test]
    fn test_valid_transitions() {
        let mut sm = EndpointStateMachine::new("shared_a");

        assert!(sm.transition_to(EndpointState::Ready).is_ok());
        assert!(sm.is_ready());

        assert!(sm.transition_to(EndpointState::Closed).is_ok());
        assert!(sm.is_closed());
        assert_eq!(sm.transition_count(), 2);
    }

    #[test]
    fn test_close_without_segment() {
        let mut sm = EndpointStateMachine::new("shared_a");
        assert!(sm.transition_to(EndpointState::Closed).is_ok());
    }

    #[test]
    fn test_invalid_transitions() {
        let mut sm = EndpointStateMachine::new("shared_a");
        sm.transition_to(EndpointState::Ready).unwrap();

        // Ready → Ready and Closed → anything are rejected
        assert!(sm.transition_to(EndpointState::Ready).is_err());
        sm.transition_to(EndpointState::Closed).unwrap();
        assert!(sm.transition_to(EndpointState::Ready).is_err());
        assert!(sm.transition_to(EndpointState::Uninitialized).is_err());
        assert_eq!(sm.state(), EndpointState::Closed);
    }
}
