//! Unit state machine.
//!
//! `next_state` is the only place that decides which `UnitState` follows
//! which event. The supervisor feeds it triggers while holding the unit's
//! lock and commits whatever it returns; `None` means the trigger does not
//! apply in the current state and must be ignored.

use keeper_core::UnitState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// An explicit start or an automatic restart begins.
    StartRequested,
    /// The launcher produced a process.
    Launched,
    /// The launcher could not produce a process.
    LaunchFailed,
    LivenessAlive,
    LivenessDead,
    /// The process probe found the process gone.
    ProcessDead,
    /// An operator asked for the unit to stop.
    StopRequested,
    /// The process has been reaped.
    Terminated,
}

pub fn next_state(state: UnitState, trigger: Trigger) -> Option<UnitState> {
    use Trigger::*;
    use keeper_core::UnitState::*;

    match (state, trigger) {
        (Stopped, StartRequested) => Some(Starting),
        (Stopped, _) => None,

        (Starting, Launched) => Some(Running),
        (Starting, LaunchFailed) => Some(Stopped),
        (Starting, _) => None,

        (Running | RunningButDegraded, LivenessAlive) => Some(RunningAndHealthy),
        (RunningAndHealthy, LivenessDead) => Some(RunningButDegraded),
        // No liveness verdict has ever confirmed health; stay plain Running.
        (Running, LivenessDead) => None,
        (RunningAndHealthy, LivenessAlive) | (RunningButDegraded, LivenessDead) => None,

        (Running, ProcessDead) => Some(Stopped),
        (RunningAndHealthy | RunningButDegraded, ProcessDead) => Some(Stopping),

        (Running | RunningAndHealthy | RunningButDegraded, StopRequested) => Some(Stopping),
        (Running | RunningAndHealthy | RunningButDegraded, StartRequested) => None,
        (Running | RunningAndHealthy | RunningButDegraded, Launched | LaunchFailed) => None,
        (Running | RunningAndHealthy | RunningButDegraded, Terminated) => None,

        (Stopping, Terminated) => Some(Stopped),
        (Stopping, _) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use keeper_core::UnitState::*;

    #[rstest]
    #[case(Stopped, Trigger::StartRequested, Some(Starting))]
    #[case(Starting, Trigger::Launched, Some(Running))]
    #[case(Starting, Trigger::LaunchFailed, Some(Stopped))]
    #[case(Running, Trigger::LivenessAlive, Some(RunningAndHealthy))]
    #[case(RunningAndHealthy, Trigger::LivenessDead, Some(RunningButDegraded))]
    #[case(RunningButDegraded, Trigger::LivenessAlive, Some(RunningAndHealthy))]
    #[case(Running, Trigger::ProcessDead, Some(Stopped))]
    #[case(RunningAndHealthy, Trigger::ProcessDead, Some(Stopping))]
    #[case(RunningButDegraded, Trigger::ProcessDead, Some(Stopping))]
    #[case(RunningAndHealthy, Trigger::StopRequested, Some(Stopping))]
    #[case(Stopping, Trigger::Terminated, Some(Stopped))]
    fn legal_transitions(
        #[case] from: UnitState,
        #[case] trigger: Trigger,
        #[case] to: Option<UnitState>,
    ) {
        assert_eq!(next_state(from, trigger), to);
    }

    #[rstest]
    #[case(Running, Trigger::LivenessDead)]
    #[case(Stopped, Trigger::ProcessDead)]
    #[case(Stopped, Trigger::StopRequested)]
    #[case(Stopping, Trigger::StartRequested)]
    #[case(Stopping, Trigger::ProcessDead)]
    #[case(Running, Trigger::StartRequested)]
    fn ignored_triggers(#[case] from: UnitState, #[case] trigger: Trigger) {
        assert_eq!(next_state(from, trigger), None);
    }

    #[test]
    fn healthy_units_pass_through_stopping_after_a_crash() {
        let stopping = next_state(RunningAndHealthy, Trigger::ProcessDead).expect("stopping");
        assert_eq!(next_state(stopping, Trigger::Terminated), Some(Stopped));
    }
}
