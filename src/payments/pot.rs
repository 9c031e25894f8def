//! Suggested contribution for a shared pot.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;

/// Default amount pre-filled in the contribution input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ContributionSuggestion {
    /// Share of the pot total, 0..=100.
    pub percentage: Decimal,
    pub amount: Decimal,
}

impl ContributionSuggestion {
    const NONE: Self = Self {
        percentage: Decimal::ZERO,
        amount: Decimal::ZERO,
    };
}

/// Collected share strictly within this many percentage points of a third
/// snaps the suggestion to a third of the total.
const THIRDS_TOLERANCE: Decimal = dec!(2);

pub fn suggest_contribution(
    total: Decimal,
    collected: Decimal,
    contributions: &[Decimal],
) -> ContributionSuggestion {
    if total <= Decimal::ZERO {
        return ContributionSuggestion::NONE;
    }

    if contributions.is_empty() {
        return ContributionSuggestion {
            percentage: dec!(100),
            amount: total,
        };
    }

    let mut positive: Vec<Decimal> = contributions
        .iter()
        .copied()
        .filter(|amount| *amount > Decimal::ZERO)
        .collect();
    if positive.is_empty() {
        return ContributionSuggestion::NONE;
    }

    let hundred = dec!(100);
    let collected_pct = collected / total * hundred;
    let one_third = hundred / dec!(3);
    let two_thirds = one_third * dec!(2);

    if (collected_pct - one_third).abs() < THIRDS_TOLERANCE
        || (collected_pct - two_thirds).abs() < THIRDS_TOLERANCE
    {
        let amount = (total / dec!(3)).round_dp(2);
        return ContributionSuggestion {
            percentage: one_third.round_dp(2),
            amount,
        };
    }

    positive.sort();
    let mid = positive.len() / 2;
    let median = if positive.len() % 2 == 0 {
        (positive[mid - 1] + positive[mid]) / dec!(2)
    } else {
        positive[mid]
    };

    ContributionSuggestion {
        percentage: (median / total * hundred).min(hundred).round_dp(2),
        amount: median,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_pot_suggests_nothing() {
        assert_eq!(
            suggest_contribution(Decimal::ZERO, Decimal::ZERO, &[]),
            ContributionSuggestion::NONE
        );
        assert_eq!(
            suggest_contribution(dec!(-5), Decimal::ZERO, &[dec!(1)]),
            ContributionSuggestion::NONE
        );
    }

    #[test]
    fn first_contributor_covers_everything() {
        let s = suggest_contribution(dec!(90), Decimal::ZERO, &[]);
        assert_eq!(s.percentage, dec!(100));
        assert_eq!(s.amount, dec!(90));

        let zeros = suggest_contribution(dec!(90), Decimal::ZERO, &[Decimal::ZERO]);
        assert_eq!(zeros, ContributionSuggestion::NONE);
    }

    #[test]
    fn snaps_to_thirds() {
        let s = suggest_contribution(dec!(90), dec!(30), &[dec!(30)]);
        assert_eq!(s.amount, dec!(30));
        assert_eq!(s.percentage, dec!(33.33));

        let near_two_thirds = suggest_contribution(dec!(90), dec!(61), &[dec!(31), dec!(30)]);
        assert_eq!(near_two_thirds.amount, dec!(30));
    }

    #[test]
    fn uses_median_contribution() {
        let s = suggest_contribution(dec!(100), dec!(17), &[dec!(5), dec!(10), dec!(2)]);
        assert_eq!(s.amount, dec!(5));
        assert_eq!(s.percentage, dec!(5));

        let even = suggest_contribution(dec!(100), dec!(20), &[dec!(4), dec!(16)]);
        assert_eq!(even.amount, dec!(10));
    }

    #[test]
    fn median_percentage_is_capped() {
        let s = suggest_contribution(dec!(10), dec!(250), &[dec!(250)]);
        assert_eq!(s.amount, dec!(250));
        assert_eq!(s.percentage, dec!(100));
    }
}
