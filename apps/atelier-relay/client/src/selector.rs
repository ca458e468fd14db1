use chrono::Utc;
use serde::Serialize;

use crate::transport::{TransportKind, TransportState, TransportStatus};

/// Transport whose events currently reach the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CurrentMethod {
    None,
    Subscription,
    PushChannel,
    Polling,
}

impl From<TransportKind> for CurrentMethod {
    fn from(kind: TransportKind) -> Self {
        match kind {
            TransportKind::Subscription => CurrentMethod::Subscription,
            TransportKind::PushChannel => CurrentMethod::PushChannel,
            TransportKind::Polling => CurrentMethod::Polling,
        }
    }
}

/// Picks the delivery method from the transports' reported states.
///
/// Priority is subscription, then push channel, then polling. Polling
/// counts as available whenever it is enabled, whatever it last reported.
pub fn select_method<'a>(
    states: impl IntoIterator<Item = &'a TransportState>,
    polling_enabled: bool,
) -> CurrentMethod {
    let mut subscription = false;
    let mut push_channel = false;
    for state in states {
        if state.status != TransportStatus::Connected {
            continue;
        }
        match state.kind {
            TransportKind::Subscription => subscription = true,
            TransportKind::PushChannel => push_channel = true,
            TransportKind::Polling => {}
        }
    }

    if subscription {
        CurrentMethod::Subscription
    } else if push_channel {
        CurrentMethod::PushChannel
    } else if polling_enabled {
        CurrentMethod::Polling
    } else {
        CurrentMethod::None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodChange {
    pub from: CurrentMethod,
    pub to: CurrentMethod,
}

/// Tracks every enabled transport and the method derived from them.
#[derive(Debug)]
pub struct TransportSelector {
    states: Vec<TransportState>,
    polling_enabled: bool,
    current: CurrentMethod,
}

impl TransportSelector {
    pub fn new(kinds: impl IntoIterator<Item = TransportKind>) -> Self {
        let mut states: Vec<TransportState> = kinds.into_iter().map(TransportState::new).collect();
        states.sort_by_key(|state| state.kind);
        states.dedup_by_key(|state| state.kind);
        let polling_enabled = states
            .iter()
            .any(|state| state.kind == TransportKind::Polling);
        let current = select_method(&states, polling_enabled);
        Self {
            states,
            polling_enabled,
            current,
        }
    }

    pub fn current(&self) -> CurrentMethod {
        self.current
    }

    pub fn states(&self) -> &[TransportState] {
        &self.states
    }

    /// Records a status report and re-evaluates the method.
    /// Returns the transition when the method changed.
    pub fn apply(
        &mut self,
        kind: TransportKind,
        status: TransportStatus,
        error: Option<String>,
    ) -> Option<MethodChange> {
        let state = self.states.iter_mut().find(|state| state.kind == kind)?;
        state.status = status;
        state.last_update = Some(Utc::now());
        if error.is_some() || status == TransportStatus::Connected {
            state.last_error = error;
        }

        let next = select_method(&self.states, self.polling_enabled);
        if next == self.current {
            return None;
        }
        let change = MethodChange {
            from: self.current,
            to: next,
        };
        self.current = next;
        Some(change)
    }

    pub fn record_activity(&mut self, kind: TransportKind) {
        if let Some(state) = self.states.iter_mut().find(|state| state.kind == kind) {
            state.last_update = Some(Utc::now());
        }
    }

    pub fn is_active(&self, kind: TransportKind) -> bool {
        self.current == CurrentMethod::from(kind)
    }

    /// Forces the method to `None`, used on shutdown.
    pub fn reset(&mut self) -> Option<MethodChange> {
        for state in &mut self.states {
            state.status = TransportStatus::Disconnected;
        }
        self.polling_enabled = false;
        let from = self.current;
        self.current = CurrentMethod::None;
        (from != CurrentMethod::None).then_some(MethodChange {
            from,
            to: CurrentMethod::None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(kind: TransportKind, status: TransportStatus) -> TransportState {
        TransportState {
            status,
            ..TransportState::new(kind)
        }
    }

    #[test]
    fn select_method_follows_priority() {
        use TransportKind::*;
        use TransportStatus::*;

        let all_up = [
            state(Subscription, Connected),
            state(PushChannel, Connected),
            state(Polling, Connected),
        ];
        assert_eq!(select_method(&all_up, true), CurrentMethod::Subscription);

        let sub_down = [state(Subscription, Error), state(PushChannel, Connected)];
        assert_eq!(select_method(&sub_down, true), CurrentMethod::PushChannel);

        let only_connecting = [state(Subscription, Connecting), state(PushChannel, Disconnected)];
        assert_eq!(select_method(&only_connecting, true), CurrentMethod::Polling);
        assert_eq!(select_method(&only_connecting, false), CurrentMethod::None);
    }

    #[test]
    fn selector_upgrades_and_downgrades_on_reports() {
        use TransportKind::*;
        let mut selector = TransportSelector::new([Subscription, PushChannel, Polling]);
        assert_eq!(selector.current(), CurrentMethod::Polling);

        let change = selector.apply(PushChannel, TransportStatus::Connected, None);
        assert_eq!(
            change,
            Some(MethodChange {
                from: CurrentMethod::Polling,
                to: CurrentMethod::PushChannel,
            })
        );

        selector.apply(Subscription, TransportStatus::Connected, None);
        assert!(selector.is_active(Subscription));
        assert!(!selector.is_active(PushChannel));

        let change = selector.apply(Subscription, TransportStatus::Error, Some("socket reset".into()));
        assert_eq!(change.map(|c| c.to), Some(CurrentMethod::PushChannel));
        assert_eq!(
            selector.states()[0].last_error.as_deref(),
            Some("socket reset")
        );

        // Repeating the same report is not a transition.
        assert!(selector.apply(Subscription, TransportStatus::Error, None).is_none());

        selector.apply(PushChannel, TransportStatus::Disconnected, None);
        assert_eq!(selector.current(), CurrentMethod::Polling);
    }

    #[test]
    fn selector_without_transports_stays_none() {
        let mut selector = TransportSelector::new([TransportKind::PushChannel]);
        assert_eq!(selector.current(), CurrentMethod::None);
        assert!(selector
            .apply(TransportKind::Subscription, TransportStatus::Connected, None)
            .is_none());

        selector.apply(TransportKind::PushChannel, TransportStatus::Connected, None);
        assert_eq!(
            selector.reset().map(|c| c.to),
            Some(CurrentMethod::None)
        );
        assert!(selector.reset().is_none());
    }
}
