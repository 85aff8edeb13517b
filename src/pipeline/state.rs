//! Pipeline state management

/// Pipeline state machine
///
/// States are ordered: a pipeline moves one step at a time between `Null`
/// and `Playing`, every stage completing each step before the next begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PipelineState {
    /// No resources held, links may be created
    Null,

    /// Resources allocated, links validated
    Ready,

    /// Stages prepared but not processing data
    Paused,

    /// Stage tasks are running and data flows
    Playing,
}

impl PipelineState {
    /// Check if this state transition is valid (a single step up or down)
    pub fn can_transition_to(&self, target: &PipelineState) -> bool {
        StateChange::between(*self, *target).is_some()
    }

    /// Get a human-readable description of this state
    pub fn description(&self) -> &'static str {
        match self {
            PipelineState::Null => "Null",
            PipelineState::Ready => "Ready",
            PipelineState::Paused => "Paused",
            PipelineState::Playing => "Playing",
        }
    }

    /// Check if the pipeline is playing
    pub fn is_running(&self) -> bool {
        matches!(self, PipelineState::Playing)
    }

    /// The single steps leading from `self` to `target`, in order
    pub fn path_to(&self, target: PipelineState) -> Vec<StateChange> {
        let mut path = Vec::new();
        let mut current = *self;
        while current != target {
            let next = if current < target {
                current.next_up()
            } else {
                current.next_down()
            };
            // next_* only return None at the ends, which target cannot be beyond
            let Some(next) = next else { break };
            if let Some(change) = StateChange::between(current, next) {
                path.push(change);
            }
            current = next;
        }
        path
    }

    fn next_up(&self) -> Option<PipelineState> {
        match self {
            PipelineState::Null => Some(PipelineState::Ready),
            PipelineState::Ready => Some(PipelineState::Paused),
            PipelineState::Paused => Some(PipelineState::Playing),
            PipelineState::Playing => None,
        }
    }

    fn next_down(&self) -> Option<PipelineState> {
        match self {
            PipelineState::Null => None,
            PipelineState::Ready => Some(PipelineState::Null),
            PipelineState::Paused => Some(PipelineState::Ready),
            PipelineState::Playing => Some(PipelineState::Paused),
        }
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// One step of the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateChange {
    NullToReady,
    ReadyToPaused,
    PausedToPlaying,
    PlayingToPaused,
    PausedToReady,
    ReadyToNull,
}

impl StateChange {
    /// The step from `from` to `to`, if they are adjacent
    pub fn between(from: PipelineState, to: PipelineState) -> Option<StateChange> {
        use PipelineState::*;

        match (from, to) {
            (Null, Ready) => Some(StateChange::NullToReady),
            (Ready, Paused) => Some(StateChange::ReadyToPaused),
            (Paused, Playing) => Some(StateChange::PausedToPlaying),
            (Playing, Paused) => Some(StateChange::PlayingToPaused),
            (Paused, Ready) => Some(StateChange::PausedToReady),
            (Ready, Null) => Some(StateChange::ReadyToNull),
            _ => None,
        }
    }

    pub fn from_state(&self) -> PipelineState {
        match self {
            StateChange::NullToReady => PipelineState::Null,
            StateChange::ReadyToPaused => PipelineState::Ready,
            StateChange::PausedToPlaying => PipelineState::Paused,
            StateChange::PlayingToPaused => PipelineState::Playing,
            StateChange::PausedToReady => PipelineState::Paused,
            StateChange::ReadyToNull => PipelineState::Ready,
        }
    }

    pub fn to_state(&self) -> PipelineState {
        match self {
            StateChange::NullToReady => PipelineState::Ready,
            StateChange::ReadyToPaused => PipelineState::Paused,
            StateChange::PausedToPlaying => PipelineState::Playing,
            StateChange::PlayingToPaused => PipelineState::Paused,
            StateChange::PausedToReady => PipelineState::Ready,
            StateChange::ReadyToNull => PipelineState::Null,
        }
    }

    /// Whether the step moves towards `Playing`
    pub fn is_upward(&self) -> bool {
        self.to_state() > self.from_state()
    }
}

impl std::fmt::Display for StateChange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -> {}", self.from_state(), self.to_state())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_transitions() {
        use PipelineState::*;

        assert!(Null.can_transition_to(&Ready));
        assert!(Ready.can_transition_to(&Paused));
        assert!(Paused.can_transition_to(&Playing));
        assert!(Playing.can_transition_to(&Paused));
        assert!(Paused.can_transition_to(&Ready));
        assert!(Ready.can_transition_to(&Null));
    }

    #[test]
    fn test_invalid_transitions() {
        use PipelineState::*;

        // Must step through every intermediate state
        assert!(!Null.can_transition_to(&Playing));
        assert!(!Null.can_transition_to(&Paused));
        assert!(!Playing.can_transition_to(&Null));
        assert!(!Playing.can_transition_to(&Playing));
    }

    #[test]
    fn test_state_paths() {
        use PipelineState::*;

        assert_eq!(
            Null.path_to(Playing),
            vec![
                StateChange::NullToReady,
                StateChange::ReadyToPaused,
                StateChange::PausedToPlaying
            ]
        );
        assert_eq!(
            Playing.path_to(Null),
            vec![
                StateChange::PlayingToPaused,
                StateChange::PausedToReady,
                StateChange::ReadyToNull
            ]
        );
        assert_eq!(Ready.path_to(Null), vec![StateChange::ReadyToNull]);
        assert!(Paused.path_to(Paused).is_empty());
    }

    #[test]
    fn test_state_checks() {
        assert!(PipelineState::Playing.is_running());
        assert!(!PipelineState::Paused.is_running());
        assert!(StateChange::ReadyToPaused.is_upward());
        assert!(!StateChange::PlayingToPaused.is_upward());
        assert_eq!(StateChange::PausedToPlaying.to_string(), "Paused -> Playing");
    }
}
