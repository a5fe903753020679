//! HA state machine.
//!
//! ```text
//!            LeaseAcquired / StoreUnreachable (policy allows)
//!  Standby ─────────────────────────────────────────▶ Activating
//!     ▲  LeaseHeldElsewhere / StoreUnreachable (denied)   │
//!     └──────────────┘                                    │ PreSwitchDone
//!                                                         ▼
//!  Fatal ◀── LeaseLost / RenewFailed(limit) / ──────── Active ◀┐
//!            PreSwitchFailed (from Activating)             └───┘ Renewed,
//!                                                               RenewFailed
//! ```
//!
//! `Disabled` is terminal and only reachable by constructing a manager
//! without a lease store.

use std::fmt;

/// Current HA state of this instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HaState {
    /// HA is off; the instance is unconditionally active.
    Disabled,
    Standby,
    /// PreSwitch hooks are running. Not yet active.
    Activating,
    Active,
    /// Exclusivity can no longer be guaranteed.
    Fatal,
}

impl HaState {
    /// Whether this instance may mutate infrastructure.
    pub fn is_active(&self) -> bool {
        matches!(self, HaState::Active | HaState::Disabled)
    }
}

impl fmt::Display for HaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HaState::Disabled => "disabled",
            HaState::Standby => "standby",
            HaState::Activating => "activating",
            HaState::Active => "active",
            HaState::Fatal => "fatal",
        };
        f.write_str(s)
    }
}

/// Inputs to the state machine, produced by one poll cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaEvent {
    LeaseAcquired,
    LeaseHeldElsewhere,
    StoreUnreachable { degraded_allowed: bool },
    PreSwitchDone,
    PreSwitchFailed,
    Renewed,
    LeaseLost,
    RenewFailed { limit_reached: bool },
}

/// Side effect to run when entering the target state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hook {
    None,
    /// Run the PreSwitch hook, then feed back its outcome.
    PreSwitch,
    /// Publish the active flag, then run PostSwitch.
    PublishActive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub to: HaState,
    pub hook: Hook,
}

const fn to(state: HaState, hook: Hook) -> Option<Transition> {
    Some(Transition { to: state, hook })
}

/// The transition table. `None` means the event is not valid in `from`.
pub fn transition(from: HaState, event: HaEvent) -> Option<Transition> {
    use HaEvent::*;
    use HaState::*;

    match (from, event) {
        (Standby, LeaseAcquired) => to(Activating, Hook::PreSwitch),
        (Standby, StoreUnreachable { degraded_allowed: true }) => to(Activating, Hook::PreSwitch),
        (Standby, StoreUnreachable { degraded_allowed: false }) => to(Standby, Hook::None),
        (Standby, LeaseHeldElsewhere) => to(Standby, Hook::None),

        (Activating, PreSwitchDone) => to(Active, Hook::PublishActive),
        (Activating, PreSwitchFailed) => to(Fatal, Hook::None),

        (Active, Renewed) => to(Active, Hook::None),
        // Degraded: still active while the store is down.
        (Active, StoreUnreachable { .. }) => to(Active, Hook::None),
        (Active, RenewFailed { limit_reached: false }) => to(Active, Hook::None),
        (Active, RenewFailed { limit_reached: true }) => to(Fatal, Hook::None),
        (Active, LeaseLost) => to(Fatal, Hook::None),
        (Active, LeaseHeldElsewhere) => to(Fatal, Hook::None),

        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standby_activates_through_pre_switch() {
        let t = transition(HaState::Standby, HaEvent::LeaseAcquired).unwrap();
        assert_eq!(t.to, HaState::Activating);
        assert_eq!(t.hook, Hook::PreSwitch);

        let t = transition(HaState::Activating, HaEvent::PreSwitchDone).unwrap();
        assert_eq!(t.to, HaState::Active);
        assert_eq!(t.hook, Hook::PublishActive);
    }

    #[test]
    fn degraded_policy_decides_unreachable_store() {
        let allowed = HaEvent::StoreUnreachable {
            degraded_allowed: true,
        };
        let denied = HaEvent::StoreUnreachable {
            degraded_allowed: false,
        };
        assert_eq!(transition(HaState::Standby, allowed).unwrap().to, HaState::Activating);
        assert_eq!(transition(HaState::Standby, denied).unwrap().to, HaState::Standby);
    }

    #[test]
    fn losing_a_held_lease_is_fatal() {
        for event in [
            HaEvent::LeaseLost,
            HaEvent::LeaseHeldElsewhere,
            HaEvent::RenewFailed {
                limit_reached: true,
            },
        ] {
            assert_eq!(transition(HaState::Active, event).unwrap().to, HaState::Fatal);
        }
        assert_eq!(
            transition(
                HaState::Active,
                HaEvent::RenewFailed {
                    limit_reached: false
                }
            )
            .unwrap()
            .to,
            HaState::Active
        );
    }

    #[test]
    fn failed_pre_switch_is_fatal() {
        let t = transition(HaState::Activating, HaEvent::PreSwitchFailed).unwrap();
        assert_eq!(t.to, HaState::Fatal);
    }

    #[test]
    fn terminal_states_accept_nothing() {
        for state in [HaState::Fatal, HaState::Disabled] {
            assert!(transition(state, HaEvent::LeaseAcquired).is_none());
            assert!(transition(state, HaEvent::Renewed).is_none());
        }
        assert!(transition(HaState::Standby, HaEvent::Renewed).is_none());
    }

    #[test]
    fn only_active_and_disabled_may_mutate() {
        assert!(HaState::Active.is_active());
        assert!(HaState::Disabled.is_active());
        assert!(!HaState::Activating.is_active());
        assert!(!HaState::Standby.is_active());
        assert!(!HaState::Fatal.is_active());
    }
}
