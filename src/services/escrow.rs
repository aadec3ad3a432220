// services/escrow.rs
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::info;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SplitError {
    #[error("commission rate {0} is outside [0, 1)")]
    RateOutOfRange(Decimal),

    #[error("amount {0} must not be negative")]
    NegativeAmount(i64),

    #[error("split of {0} overflowed")]
    Overflow(i64),
}

/// A platform commission rate, always in `[0, 1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CommissionRate(Decimal);

impl CommissionRate {
    pub fn new(rate: Decimal) -> Result<Self, SplitError> {
        if rate < Decimal::ZERO || rate >= Decimal::ONE {
            return Err(SplitError::RateOutOfRange(rate));
        }
        Ok(CommissionRate(rate))
    }

    pub fn value(&self) -> Decimal {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Split {
    pub landlord_net: i64,
    pub commission: i64,
}

/// `commission = round_half_up(amount * rate)`, and the landlord gets the rest.
/// The two parts always add back up to `amount`.
pub fn compute_split(amount: i64, rate: CommissionRate) -> Result<Split, SplitError> {
    if amount < 0 {
        return Err(SplitError::NegativeAmount(amount));
    }

    let commission = (Decimal::from(amount) * rate.value())
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
        .ok_or(SplitError::Overflow(amount))?;

    Ok(Split {
        landlord_net: amount - commission,
        commission,
    })
}

/// The rate applied at release time. Updates only affect later releases.
#[derive(Debug)]
pub struct CommissionPolicy {
    rate: RwLock<CommissionRate>,
}

impl CommissionPolicy {
    pub fn new(rate: CommissionRate) -> Self {
        CommissionPolicy {
            rate: RwLock::new(rate),
        }
    }

    pub async fn current(&self) -> CommissionRate {
        *self.rate.read().await
    }

    pub async fn set_rate(&self, rate: Decimal) -> Result<CommissionRate, SplitError> {
        let rate = CommissionRate::new(rate)?;
        let mut current = self.rate.write().await;
        info!(old = %current.value(), new = %rate.value(), "💱 Commission rate updated");
        *current = rate;
        Ok(rate)
    }
}
