use crate::{errors::ServiceError, models::fee_config};
use chrono::Utc;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::instrument;
use validator::{Validate, ValidationError};

use super::fee_config_store::FeeConfigStore;

const BPS_SCALE: u32 = 4;

fn validate_rate(rate: &Decimal) -> Result<(), ValidationError> {
    if *rate < Decimal::ZERO || *rate > Decimal::ONE {
        let mut err = ValidationError::new("range");
        err.message = Some("Rate must be between 0 and 1".into());
        return Err(err);
    }
    if !(*rate * dec!(10000)).fract().is_zero() {
        let mut err = ValidationError::new("precision");
        err.message = Some("Rate must be a whole number of basis points".into());
        return Err(err);
    }
    Ok(())
}

fn validate_fee_bounds(config: &FeeConfig) -> Result<(), ValidationError> {
    if config.platform_maximum_fee > 0 && config.platform_maximum_fee < config.platform_minimum_fee {
        let mut err = ValidationError::new("fee_bounds");
        err.message = Some("Maximum fee must be at least the minimum fee".into());
        return Err(err);
    }
    Ok(())
}

/// Fee parameters in effect for a calculation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[validate(schema(function = "validate_fee_bounds"))]
pub struct FeeConfig {
    /// Informational; used to estimate the processor's cut for settlements
    #[validate(custom = "validate_rate")]
    pub processor_rate: Decimal,
    #[validate(range(min = 0))]
    pub processor_fixed_fee: i64,
    #[validate(custom = "validate_rate")]
    pub platform_rate: Decimal,
    #[validate(range(min = 0))]
    pub platform_fixed_fee: i64,
    #[validate(range(min = 0))]
    pub platform_minimum_fee: i64,
    /// 0 means unbounded
    #[validate(range(min = 0))]
    pub platform_maximum_fee: i64,
    #[validate(range(min = 0))]
    pub minimum_payout_amount: i64,
}

impl From<fee_config::Model> for FeeConfig {
    fn from(row: fee_config::Model) -> Self {
        Self {
            processor_rate: Decimal::new(row.processor_rate_bps.into(), BPS_SCALE),
            processor_fixed_fee: row.processor_fixed_fee,
            platform_rate: Decimal::new(row.platform_rate_bps.into(), BPS_SCALE),
            platform_fixed_fee: row.platform_fixed_fee,
            platform_minimum_fee: row.platform_minimum_fee,
            platform_maximum_fee: row.platform_maximum_fee,
            minimum_payout_amount: row.minimum_payout_amount,
        }
    }
}

impl FeeConfig {
    /// Storage row for this config. Callers validate first so rates fit in basis points.
    pub fn to_row(&self) -> fee_config::Model {
        let bps = |rate: Decimal| (rate * dec!(10000)).round().to_i32().unwrap_or_default();
        fee_config::Model {
            id: fee_config::SINGLETON_ID,
            processor_rate_bps: bps(self.processor_rate),
            processor_fixed_fee: self.processor_fixed_fee,
            platform_rate_bps: bps(self.platform_rate),
            platform_fixed_fee: self.platform_fixed_fee,
            platform_minimum_fee: self.platform_minimum_fee,
            platform_maximum_fee: self.platform_maximum_fee,
            minimum_payout_amount: self.minimum_payout_amount,
            updated_at: Utc::now(),
        }
    }
}

/// How the platform fee for one amount was derived.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeBreakdown {
    pub amount: i64,
    pub platform_fee: i64,
    pub rate_fee: i64,
    pub fixed_fee: i64,
    pub raw_fee: i64,
    pub minimum_applied: bool,
    pub maximum_applied: bool,
    /// The fee was cut down to the transaction amount
    pub amount_capped: bool,
    pub processor_fee_estimate: i64,
}

/// Rounds half-up to whole minor units.
fn round_minor_units(value: Decimal) -> i64 {
    value
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
        .unwrap_or(i64::MAX)
}

/// Platform fee for `amount` under `config`, clipped to `[0, amount]`.
pub fn calculate_fee(amount: i64, config: &FeeConfig) -> Result<FeeBreakdown, ServiceError> {
    if amount <= 0 {
        return Err(ServiceError::ValidationError(format!(
            "Amount must be a positive number of minor units, got {amount}"
        )));
    }

    let rate_fee = round_minor_units(Decimal::from(amount) * config.platform_rate);
    let raw_fee = rate_fee.saturating_add(config.platform_fixed_fee);
    let clamped_low = raw_fee.max(config.platform_minimum_fee);
    let clamped_high = if config.platform_maximum_fee > 0 {
        clamped_low.min(config.platform_maximum_fee)
    } else {
        clamped_low
    };
    let platform_fee = clamped_high.min(amount).max(0);

    let processor_fee_estimate = round_minor_units(Decimal::from(amount) * config.processor_rate)
        .saturating_add(config.processor_fixed_fee)
        .min(amount);

    Ok(FeeBreakdown {
        amount,
        platform_fee,
        rate_fee,
        fixed_fee: config.platform_fixed_fee,
        raw_fee,
        minimum_applied: clamped_low > raw_fee,
        maximum_applied: clamped_high < clamped_low,
        amount_capped: clamped_high > amount,
        processor_fee_estimate,
    })
}

/// Fee calculation against the live fee configuration.
#[derive(Clone)]
pub struct FeeCalculator {
    store: Arc<FeeConfigStore>,
}

impl FeeCalculator {
    pub fn new(store: Arc<FeeConfigStore>) -> Self {
        Self { store }
    }

    pub async fn calculate(&self, amount: i64) -> Result<FeeBreakdown, ServiceError> {
        let config = self.store.get_config(false).await?;
        calculate_fee(amount, &config)
    }

    /// Fetches the config once and prices every amount against it.
    #[instrument(skip(self, amounts), fields(count = amounts.len()))]
    pub async fn calculate_batch(&self, amounts: &[i64]) -> Result<Vec<FeeBreakdown>, ServiceError> {
        let config = self.store.get_config(false).await?;
        amounts
            .iter()
            .map(|amount| calculate_fee(*amount, &config))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample_config() -> FeeConfig {
        FeeConfig {
            processor_rate: dec!(0.036),
            processor_fixed_fee: 0,
            platform_rate: dec!(0.03),
            platform_fixed_fee: 30,
            platform_minimum_fee: 50,
            platform_maximum_fee: 500,
            minimum_payout_amount: 100,
        }
    }

    #[test]
    fn fee_for_typical_amount_adds_rate_and_fixed_part() {
        let breakdown = calculate_fee(999, &sample_config()).unwrap();
        assert_eq!(breakdown.rate_fee, 30);
        assert_eq!(breakdown.raw_fee, 60);
        assert_eq!(breakdown.platform_fee, 60);
        assert!(!breakdown.minimum_applied);
        assert!(!breakdown.maximum_applied);
    }

    #[test]
    fn fee_never_exceeds_tiny_amount() {
        let breakdown = calculate_fee(1, &sample_config()).unwrap();
        assert_eq!(breakdown.platform_fee, 1);
        assert!(breakdown.minimum_applied);
        assert!(breakdown.amount_capped);
    }

    #[test]
    fn maximum_clamp_applies_to_large_amounts() {
        let breakdown = calculate_fee(1_000_000, &sample_config()).unwrap();
        assert_eq!(breakdown.platform_fee, 500);
        assert!(breakdown.maximum_applied);
    }

    #[test]
    fn zero_maximum_means_unbounded() {
        let mut config = sample_config();
        config.platform_maximum_fee = 0;
        let breakdown = calculate_fee(1_000_000, &config).unwrap();
        assert_eq!(breakdown.platform_fee, 30_030);
    }

    #[test]
    fn rate_fee_rounds_half_up() {
        let mut config = sample_config();
        config.platform_fixed_fee = 0;
        config.platform_minimum_fee = 0;
        config.platform_maximum_fee = 0;
        config.platform_rate = dec!(0.05);
        // 10 * 0.05 = 0.5 -> 1
        assert_eq!(calculate_fee(10, &config).unwrap().rate_fee, 1);
        // 9 * 0.05 = 0.45 -> 0
        assert_eq!(calculate_fee(9, &config).unwrap().rate_fee, 0);
    }

    #[test]
    fn processor_estimate_is_informational() {
        let breakdown = calculate_fee(2500, &sample_config()).unwrap();
        assert_eq!(breakdown.processor_fee_estimate, 90);
    }

    #[test]
    fn non_positive_amounts_are_rejected() {
        assert!(matches!(
            calculate_fee(0, &sample_config()),
            Err(ServiceError::ValidationError(_))
        ));
        assert!(matches!(
            calculate_fee(-5, &sample_config()),
            Err(ServiceError::ValidationError(_))
        ));
    }

    #[test]
    fn config_validation_rejects_inverted_bounds_and_bad_rates() {
        assert!(sample_config().validate().is_ok());

        let mut inverted = sample_config();
        inverted.platform_maximum_fee = 10;
        assert!(inverted.validate().is_err());

        let mut too_high = sample_config();
        too_high.platform_rate = dec!(1.5);
        assert!(too_high.validate().is_err());

        let mut too_precise = sample_config();
        too_precise.platform_rate = dec!(0.00001);
        assert!(too_precise.validate().is_err());
    }

    #[test]
    fn basis_point_storage_preserves_rates() {
        let config = sample_config();
        let restored = FeeConfig::from(config.to_row());
        assert_eq!(restored, config);
    }

    fn arb_config() -> impl Strategy<Value = FeeConfig> {
        (0i64..=10_000, 0i64..=1_000, 0i64..=1_000, 0i64..=5_000).prop_map(
            |(bps, fixed, minimum, extra)| FeeConfig {
                processor_rate: dec!(0.029),
                processor_fixed_fee: 30,
                platform_rate: Decimal::new(bps, BPS_SCALE),
                platform_fixed_fee: fixed,
                platform_minimum_fee: minimum,
                platform_maximum_fee: if extra == 0 { 0 } else { minimum + extra },
                minimum_payout_amount: 0,
            },
        )
    }

    proptest! {
        #[test]
        fn fee_is_within_zero_and_amount(amount in 1i64..=10_000_000, config in arb_config()) {
            let fee = calculate_fee(amount, &config).unwrap().platform_fee;
            prop_assert!(fee >= 0);
            prop_assert!(fee <= amount);
        }

        #[test]
        fn fee_is_deterministic(amount in 1i64..=10_000_000, config in arb_config()) {
            prop_assert_eq!(
                calculate_fee(amount, &config).unwrap(),
                calculate_fee(amount, &config).unwrap()
            );
        }

        #[test]
        fn fee_is_monotonic_in_amount(
            a in 1i64..=5_000_000,
            delta in 0i64..=5_000_000,
            config in arb_config(),
        ) {
            let low = calculate_fee(a, &config).unwrap().platform_fee;
            let high = calculate_fee(a + delta, &config).unwrap().platform_fee;
            prop_assert!(low <= high);
        }
    }
}
