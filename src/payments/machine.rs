//! View state machine shared by every flow kind.

use std::fmt;

use serde::Serialize;

use crate::error::FlowError;

/// Screen a flow is on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowView {
    #[default]
    Initial,
    Confirm,
    Status,
    /// Charge was already paid when it was loaded.
    Receipt,
}

impl FlowView {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initial => "INITIAL",
            Self::Confirm => "CONFIRM",
            Self::Status => "STATUS",
            Self::Receipt => "RECEIPT",
        }
    }

    /// Success views: nothing left to submit.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Status | Self::Receipt)
    }
}

impl fmt::Display for FlowView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowTransition {
    /// Leave INITIAL, through CONFIRM or straight to STATUS.
    Proceed { confirm: bool },
    /// Payment recorded from CONFIRM.
    Settled,
    Back,
    AlreadyPaid,
    Reset,
}

impl FlowTransition {
    pub fn name(self) -> &'static str {
        match self {
            Self::Proceed { confirm: true } => "proceed(confirm)",
            Self::Proceed { confirm: false } => "proceed(direct)",
            Self::Settled => "settled",
            Self::Back => "back",
            Self::AlreadyPaid => "already_paid",
            Self::Reset => "reset",
        }
    }
}

/// Apply `transition` to `from`. Pairs outside the table are rejected.
pub fn next_view(from: FlowView, transition: FlowTransition) -> Result<FlowView, FlowError> {
    use FlowTransition as T;
    use FlowView as V;

    match (from, transition) {
        (_, T::Reset) => Ok(V::Initial),
        (V::Initial, T::Proceed { confirm: true }) => Ok(V::Confirm),
        (V::Initial, T::Proceed { confirm: false }) => Ok(V::Status),
        (V::Confirm, T::Settled) => Ok(V::Status),
        (V::Confirm | V::Status, T::Back) => Ok(V::Initial),
        (V::Initial | V::Confirm, T::AlreadyPaid) => Ok(V::Receipt),
        (from, transition) => Err(FlowError::InvalidTransition {
            from,
            transition: transition.name(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_VIEWS: [FlowView; 4] = [
        FlowView::Initial,
        FlowView::Confirm,
        FlowView::Status,
        FlowView::Receipt,
    ];

    #[test]
    fn happy_paths() {
        let confirm = next_view(FlowView::Initial, FlowTransition::Proceed { confirm: true });
        assert_eq!(confirm.unwrap(), FlowView::Confirm);
        assert_eq!(
            next_view(FlowView::Confirm, FlowTransition::Settled).unwrap(),
            FlowView::Status
        );
        assert_eq!(
            next_view(FlowView::Initial, FlowTransition::Proceed { confirm: false }).unwrap(),
            FlowView::Status
        );
    }

    #[test]
    fn back_returns_to_initial() {
        assert_eq!(
            next_view(FlowView::Confirm, FlowTransition::Back).unwrap(),
            FlowView::Initial
        );
        assert_eq!(
            next_view(FlowView::Status, FlowTransition::Back).unwrap(),
            FlowView::Initial
        );
        assert!(next_view(FlowView::Initial, FlowTransition::Back).is_err());
        assert!(next_view(FlowView::Receipt, FlowTransition::Back).is_err());
    }

    #[test]
    fn reset_is_accepted_everywhere() {
        for view in ALL_VIEWS {
            assert_eq!(
                next_view(view, FlowTransition::Reset).unwrap(),
                FlowView::Initial
            );
        }
    }

    #[test]
    fn already_paid_only_before_status() {
        assert_eq!(
            next_view(FlowView::Initial, FlowTransition::AlreadyPaid).unwrap(),
            FlowView::Receipt
        );
        assert_eq!(
            next_view(FlowView::Confirm, FlowTransition::AlreadyPaid).unwrap(),
            FlowView::Receipt
        );
        assert!(next_view(FlowView::Status, FlowTransition::AlreadyPaid).is_err());
    }

    #[test]
    fn terminal_views_reject_progress() {
        for view in [FlowView::Status, FlowView::Receipt] {
            assert!(view.is_terminal());
            for transition in [
                FlowTransition::Proceed { confirm: true },
                FlowTransition::Proceed { confirm: false },
                FlowTransition::Settled,
            ] {
                match next_view(view, transition) {
                    Err(FlowError::InvalidTransition { from, .. }) => assert_eq!(from, view),
                    other => panic!("expected InvalidTransition, got {other:?}"),
                }
            }
        }
    }

    #[test]
    fn settled_requires_confirm() {
        assert!(next_view(FlowView::Initial, FlowTransition::Settled).is_err());
    }
}
