use crate::errors::WardenError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Launching,
    InitialDelay,
    Monitoring,
    Terminating,
    BackoffWait,
    Exited(i32),
}

impl SupervisorState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Launching => "launching",
            Self::InitialDelay => "initial_delay",
            Self::Monitoring => "monitoring",
            Self::Terminating => "terminating",
            Self::BackoffWait => "backoff_wait",
            Self::Exited(_) => "exited",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    NonZeroExit(i32),
    HeartbeatLost,
    Unexpected(String),
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NonZeroExit(_) => "non_zero_exit",
            Self::HeartbeatLost => "heartbeat_lost",
            Self::Unexpected(_) => "unexpected_error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorSnapshot {
    pub state: SupervisorState,
    pub restart_count: u32,
    pub launches: u32,
    pub last_failure: Option<FailureReason>,
    pub shutdown_requested: bool,
}

impl Default for SupervisorSnapshot {
    fn default() -> Self {
        Self {
            state: SupervisorState::Idle,
            restart_count: 0,
            launches: 0,
            last_failure: None,
            shutdown_requested: false,
        }
    }
}

impl SupervisorSnapshot {
    pub fn transition(&mut self, next: SupervisorState) -> Result<(), WardenError> {
        validate_transition(self.state, next)?;
        self.state = next;
        Ok(())
    }

    /// The only way `restart_count` changes: one failure, one increment.
    pub fn record_failure(&mut self, reason: FailureReason) {
        self.restart_count = self.restart_count.saturating_add(1);
        self.last_failure = Some(reason);
    }

    pub fn record_launch(&mut self) {
        self.launches = self.launches.saturating_add(1);
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self.state {
            SupervisorState::Exited(code) => Some(code),
            _ => None,
        }
    }
}

pub fn validate_transition(
    from: SupervisorState,
    to: SupervisorState,
) -> Result<(), WardenError> {
    use SupervisorState as S;

    let allowed = match from {
        S::Idle => matches!(to, S::Launching | S::Exited(_)),
        S::Launching => matches!(to, S::InitialDelay | S::Monitoring | S::BackoffWait),
        S::InitialDelay => matches!(to, S::Monitoring | S::Terminating),
        S::Monitoring => matches!(
            to,
            S::Monitoring | S::Terminating | S::BackoffWait | S::Exited(_)
        ),
        S::Terminating => matches!(to, S::BackoffWait | S::Exited(_)),
        S::BackoffWait => matches!(to, S::Launching | S::Exited(_)),
        S::Exited(_) => false,
    };

    if !allowed {
        return Err(WardenError::IllegalTransition(format!(
            "{:?} -> {:?}",
            from, to
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_cycle_edges_are_allowed() {
        let mut fsm = SupervisorSnapshot::default();
        for next in [
            SupervisorState::Launching,
            SupervisorState::InitialDelay,
            SupervisorState::Monitoring,
            SupervisorState::Monitoring,
            SupervisorState::Terminating,
            SupervisorState::BackoffWait,
            SupervisorState::Launching,
            SupervisorState::Monitoring,
            SupervisorState::Exited(0),
        ] {
            fsm.transition(next).expect("legal edge");
        }
        assert_eq!(fsm.exit_code(), Some(0));
    }

    #[test]
    fn transition_validator_rejects_invalid_edges() {
        let err = validate_transition(SupervisorState::Idle, SupervisorState::Monitoring)
            .expect_err("must reject");
        assert!(matches!(
            err,
            WardenError::IllegalTransition(message) if message.contains("Idle -> Monitoring")
        ));

        assert!(
            validate_transition(SupervisorState::Launching, SupervisorState::Exited(0)).is_err()
        );
        assert!(
            validate_transition(SupervisorState::Terminating, SupervisorState::Launching).is_err()
        );
    }

    #[test]
    fn exited_is_terminal() {
        for next in [
            SupervisorState::Idle,
            SupervisorState::Launching,
            SupervisorState::Exited(1),
        ] {
            assert!(validate_transition(SupervisorState::Exited(0), next).is_err());
        }
    }

    #[test]
    fn failures_increment_restart_count_by_one() {
        let mut fsm = SupervisorSnapshot::default();
        fsm.record_failure(FailureReason::NonZeroExit(1));
        fsm.record_failure(FailureReason::HeartbeatLost);
        fsm.record_failure(FailureReason::Unexpected("io".to_string()));
        assert_eq!(fsm.restart_count, 3);
        assert_eq!(fsm.last_failure.as_ref().map(FailureReason::as_str), Some("unexpected_error"));
        assert_eq!(fsm.exit_code(), None);
    }
}
