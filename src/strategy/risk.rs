//! Risk sizing
//!
//! Pure functions: signal strength plus a snapshot of account state in,
//! a USD amount (and unit count) or a `RiskRejection` out. The ledger calls
//! these inside its critical section so the snapshot cannot go stale between
//! the check and the reservation.

use chrono::{NaiveDate, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::config::RiskConfig;
use crate::error::RiskRejection;

/// Account-level risk counters owned by the ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskState {
    pub account_balance: Decimal,
    pub open_position_count: u32,
    /// Risk reserved by entries since the start of `day`
    pub risk_used_today: Decimal,
    pub day: NaiveDate,
}

impl RiskState {
    pub fn new(account_balance: Decimal) -> Self {
        Self {
            account_balance,
            open_position_count: 0,
            risk_used_today: Decimal::ZERO,
            day: Utc::now().date_naive(),
        }
    }

    /// Reset the daily budget when the date rolls over; returns true on reset
    pub fn roll_day(&mut self, today: NaiveDate) -> bool {
        if self.day != today {
            self.day = today;
            self.risk_used_today = Decimal::ZERO;
            return true;
        }
        false
    }
}

/// Size a trade in USD.
///
/// `risk_amount = balance x max_portfolio_risk_percent`, capped at
/// `max_position_size`, scaled by `strength`. Rejects when the position count is
/// at its limit or when the amount would overrun the remaining daily budget.
pub fn size(
    strength: Decimal,
    open_position_count: u32,
    account_balance: Decimal,
    risk_used_today: Decimal,
    config: &RiskConfig,
) -> Result<Decimal, RiskRejection> {
    if open_position_count >= config.max_open_positions {
        return Err(RiskRejection::MaxOpenPositions {
            open: open_position_count,
            max: config.max_open_positions,
        });
    }

    let strength = strength.clamp(Decimal::ZERO, Decimal::ONE);
    let risk_amount = config.daily_budget(account_balance);
    let amount = risk_amount.min(config.max_position_size) * strength;

    if amount > account_balance {
        return Err(RiskRejection::ExceedsBalance {
            requested: amount,
            balance: account_balance,
        });
    }

    if risk_used_today + amount > risk_amount {
        return Err(RiskRejection::DailyBudgetExhausted {
            used: risk_used_today,
            requested: amount,
            budget: risk_amount,
        });
    }

    Ok(amount)
}

/// Convenience wrapper over [`size`] for a ledger snapshot
pub fn size_for(strength: Decimal, state: &RiskState, config: &RiskConfig) -> Result<Decimal, RiskRejection> {
    size(
        strength,
        state.open_position_count,
        state.account_balance,
        state.risk_used_today,
        config,
    )
}

/// Whole units affordable with `amount` at `unit_cost`, optionally capped by a proposed quantity
pub fn units_for(
    amount: Decimal,
    unit_cost: Decimal,
    proposed: Option<u64>,
) -> Result<u64, RiskRejection> {
    let affordable = if unit_cost > Decimal::ZERO {
        (amount / unit_cost).floor().to_u64().unwrap_or(0)
    } else {
        0
    };

    let units = match proposed {
        Some(q) => q.min(affordable),
        None => affordable,
    };

    if units == 0 {
        return Err(RiskRejection::BelowMinimumSize { amount, unit_cost });
    }
    Ok(units)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn test_config() -> RiskConfig {
        RiskConfig {
            max_open_positions: 5,
            max_position_size: dec!(10000),
            max_portfolio_risk_percent: dec!(5),
        }
    }

    #[test]
    fn test_size_scales_capped_budget_by_strength() {
        // min(100000 * 5%, 10000) * 0.8 = 4000
        let amount = size(dec!(0.8), 0, dec!(100000), dec!(0), &test_config()).unwrap();
        assert_eq!(amount, dec!(4000));
    }

    #[test]
    fn test_size_caps_at_max_position_size() {
        let config = RiskConfig {
            max_portfolio_risk_percent: dec!(50),
            ..test_config()
        };
        // min(50000, 10000) * 1.0
        let amount = size(dec!(1), 0, dec!(100000), dec!(0), &config).unwrap();
        assert_eq!(amount, dec!(10000));
    }

    #[test]
    fn test_rejects_at_max_open_positions() {
        let result = size(dec!(0.8), 5, dec!(100000), dec!(0), &test_config());
        assert_eq!(
            result,
            Err(RiskRejection::MaxOpenPositions { open: 5, max: 5 })
        );
    }

    #[test]
    fn test_rejects_when_daily_budget_exhausted() {
        // 4000 already used, 4000 more would exceed the 5000 budget
        let result = size(dec!(0.8), 1, dec!(100000), dec!(4000), &test_config());
        assert!(matches!(
            result,
            Err(RiskRejection::DailyBudgetExhausted { .. })
        ));

        // 1000 still fits
        let amount = size(dec!(0.2), 1, dec!(100000), dec!(4000), &test_config()).unwrap();
        assert_eq!(amount, dec!(1000));
    }

    #[test]
    fn test_strength_is_clamped() {
        let amount = size(dec!(1.7), 0, dec!(100000), dec!(0), &test_config()).unwrap();
        assert_eq!(amount, dec!(5000));
    }

    #[test]
    fn test_units_for_options_and_stock() {
        // $4000 of a $3.50 premium option (x100 multiplier) = 11 contracts
        assert_eq!(units_for(dec!(4000), dec!(350), None).unwrap(), 11);
        // Source proposed 1 contract
        assert_eq!(units_for(dec!(4000), dec!(350), Some(1)).unwrap(), 1);
        // Too expensive for one share
        assert!(matches!(
            units_for(dec!(100), dec!(500), None),
            Err(RiskRejection::BelowMinimumSize { .. })
        ));
    }

    #[test]
    fn test_roll_day_resets_budget() {
        let mut state = RiskState::new(dec!(100000));
        state.risk_used_today = dec!(3000);
        let tomorrow = state.day.succ_opt().unwrap();

        assert!(!state.roll_day(state.day));
        assert!(state.roll_day(tomorrow));
        assert_eq!(state.risk_used_today, Decimal::ZERO);
    }
}
