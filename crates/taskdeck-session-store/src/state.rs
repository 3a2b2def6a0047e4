use taskdeck_protocol::{SessionError, SessionResult, SessionStatus};

/// Outcome of a status change that actually moved the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusTransition {
    pub from: SessionStatus,
    pub to: SessionStatus,
}

/// Whether `from -> to` is an edge of the session status machine.
///
/// `idle -> working -> waiting_approval -> working -> idle`, with `error`
/// reachable from anywhere and left only towards `idle`.
pub fn transition_allowed(from: SessionStatus, to: SessionStatus) -> bool {
    use SessionStatus::{Error, Idle, WaitingApproval, Working};

    matches!(
        (from, to),
        (Idle, Working)
            | (Working, WaitingApproval)
            | (WaitingApproval, Working)
            | (Working, Idle)
            | (WaitingApproval, Idle)
            | (_, Error)
            | (Error, Idle)
    )
}

pub(crate) fn check_transition(
    from: SessionStatus,
    to: SessionStatus,
) -> SessionResult<Option<StatusTransition>> {
    if from == to {
        return Ok(None);
    }
    if !transition_allowed(from, to) {
        return Err(SessionError::InvalidTransition(format!(
            "{} -> {}",
            from.as_str(),
            to.as_str()
        )));
    }
    Ok(Some(StatusTransition { from, to }))
}
