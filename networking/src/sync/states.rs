/// Sync manager state machine.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncState {
    /// No sync run in progress and none requested.
    #[default]
    Idle,

    /// A sync run is in progress: a session is running, a retry is pending
    /// or a peer is being selected.
    Running,

    /// A sync run is in progress and another was requested meanwhile.
    ///
    /// Any number of requests while running collapse into this one state,
    /// so exactly one further run follows the current one.
    RunningQueued,
}

impl SyncState {
    /// Check if a transition to the target state is valid.
    pub fn can_transition_to(&self, target: SyncState) -> bool {
        match self {
            SyncState::Idle => matches!(target, SyncState::Running),
            SyncState::Running => matches!(target, SyncState::RunningQueued | SyncState::Idle),
            SyncState::RunningQueued => matches!(target, SyncState::Running),
        }
    }

    pub fn is_active(&self) -> bool {
        !matches!(self, SyncState::Idle)
    }

    pub fn is_queued(&self) -> bool {
        matches!(self, SyncState::RunningQueued)
    }
}
