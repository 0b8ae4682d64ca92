//! Property-based tests for the derived-field calculator and the monthly fold
//!
//! Derivation is pure arithmetic over raw fields, so these properties pin
//! the formulas themselves: identities that must hold for every input, the
//! zero-denominator policy, and the averaging rule of the monthly summary.

use chrono::NaiveDate;
use fuel_reconciliation::aggregate::aggregate;
use fuel_reconciliation::calculator::derive;
use fuel_reconciliation::{DailyReport, Product, ProductFields};
use proptest::prelude::*;
use rust_decimal::Decimal;

// PROPERTY TEST STRATEGIES

/// Strategy to generate non-negative volumes with up to three decimals
fn volume_strategy() -> impl Strategy<Value = Decimal> + Clone {
    (0i64..=5_000_000, 0u32..=3).prop_map(|(mantissa, scale)| Decimal::new(mantissa, scale))
}

/// Strategy to generate any non-negative Decimal, up to `Decimal::MAX`
fn any_magnitude_strategy() -> impl Strategy<Value = Decimal> + Clone {
    (any::<u32>(), any::<u32>(), any::<u32>(), 0u32..=28)
        .prop_map(|(lo, mid, hi, scale)| Decimal::from_parts(lo, mid, hi, false, scale))
}

/// Strategy to generate a full set of raw fields for one product-day
fn fields_strategy() -> impl Strategy<Value = ProductFields> {
    fields_from(volume_strategy())
}

fn fields_from(
    values: impl Strategy<Value = Decimal> + Clone,
) -> impl Strategy<Value = ProductFields> {
    (
        (values.clone(), values.clone(), values.clone()),
        (values.clone(), values.clone(), values.clone()),
        (values.clone(), values.clone(), values),
    )
        .prop_map(
            |(
                (price, volume_sold, shrinkage_volume),
                (shrinkage_amount, opening, purchases),
                (per_control_doc, discounted, closing),
            )| {
                ProductFields::new()
                    .set_price(price)
                    .set_volume_sold(volume_sold)
                    .set_shrinkage_volume(shrinkage_volume)
                    .set_shrinkage_amount(shrinkage_amount)
                    .set_opening_inventory(opening)
                    .set_purchases(purchases)
                    .set_purchases_per_control_doc(per_control_doc)
                    .set_discounted_sales(discounted)
                    .set_closing_inventory_measured(closing)
            },
        )
}

fn report(day: u32, fields: ProductFields) -> DailyReport {
    let date = NaiveDate::from_ymd_opt(2024, 3, day).unwrap();
    DailyReport::new_manual(format!("report_{day}"), "ST-001", date)
        .set_product(Product::Premium, fields)
}

// PROPERTY TESTS
proptest! {
    /// Property: derive() is pure
    ///
    /// Two calls on the same raw fields give the same output, and the raw
    /// fields are left as they were.
    #[test]
    fn prop_derive_is_pure(fields in fields_strategy()) {
        let copy = fields.clone();
        let first = derive(&fields);
        let second = derive(&fields);

        prop_assert_eq!(first, second);
        prop_assert_eq!(fields, copy);
    }

    /// Property: Derived quantities follow their defining identities
    #[test]
    fn prop_derived_identities(fields in fields_strategy()) {
        let derived = derive(&fields);

        prop_assert_eq!(
            derived.closing_inventory_calculated,
            fields.opening_inventory + fields.purchases_per_control_doc - fields.volume_sold
        );
        prop_assert_eq!(
            derived.real_efficiency,
            fields.closing_inventory_measured - derived.closing_inventory_calculated
        );
        prop_assert_eq!(derived.surplus, derived.real_efficiency - fields.shrinkage_volume);
        prop_assert_eq!(
            derived.purchase_variance + derived.discount_variance,
            fields.discounted_sales,
            "the two variances always add up to the discounted sales"
        );
        prop_assert_eq!(derived.is_shortfall(), derived.surplus < Decimal::ZERO);
    }

    /// Property: A zero denominator yields exactly zero percent
    ///
    /// With nothing sold and no shrinkage both denominators vanish; with
    /// sales equal to shrinkage only the surplus denominator does.
    #[test]
    fn prop_zero_denominators_give_zero(
        fields in fields_strategy(),
        shrinkage in volume_strategy(),
    ) {
        let idle = fields
            .clone()
            .set_volume_sold(Decimal::ZERO)
            .set_shrinkage_volume(Decimal::ZERO);
        let derived = derive(&idle);
        prop_assert_eq!(derived.real_efficiency_pct, Decimal::ZERO);
        prop_assert_eq!(derived.surplus_pct, Decimal::ZERO);

        let all_shrinkage = fields
            .set_volume_sold(shrinkage)
            .set_shrinkage_volume(shrinkage);
        let derived = derive(&all_shrinkage);
        prop_assert_eq!(derived.net_volume, Decimal::ZERO);
        prop_assert_eq!(derived.surplus_pct, Decimal::ZERO);
    }

    /// Property: The monthly percentage is the mean of the daily percentages
    ///
    /// It is compared against an independent fold of the per-day values,
    /// never against sum(realEfficiency) / sum(denominator).
    #[test]
    fn prop_summary_averages_daily_percentages(
        days in prop::collection::vec(fields_strategy(), 1..12),
    ) {
        let reports: Vec<_> = days
            .iter()
            .cloned()
            .enumerate()
            .map(|(i, fields)| report(i as u32 + 1, fields))
            .collect();

        let summary = aggregate(&reports);
        let premium = summary.product(Product::Premium).unwrap();

        let count = Decimal::from(days.len() as u32);
        let pct_sum: Decimal = days.iter().map(|f| derive(f).real_efficiency_pct).sum();
        let surplus_sum: Decimal = days.iter().map(|f| derive(f).surplus_pct).sum();
        let er_sum: Decimal = days.iter().map(|f| derive(f).real_efficiency).sum();

        prop_assert_eq!(premium.days, days.len() as u32);
        prop_assert_eq!(premium.real_efficiency_pct_avg, pct_sum / count);
        prop_assert_eq!(premium.surplus_pct_avg, surplus_sum / count);
        prop_assert_eq!(premium.real_efficiency_sum, er_sum);
        prop_assert!(summary.product(Product::Diesel).is_none());
    }

    /// Property: Derivation and the monthly fold are total
    ///
    /// Stored values are bounded on input, but nothing read back from a
    /// store may make either of them panic, whatever its magnitude.
    #[test]
    fn prop_extreme_magnitudes_never_panic(
        days in prop::collection::vec(fields_from(any_magnitude_strategy()), 1..6),
    ) {
        for fields in &days {
            let derived = derive(fields);
            prop_assert_eq!(derived.is_shortfall(), derived.surplus < Decimal::ZERO);
        }

        let reports: Vec<_> = days
            .into_iter()
            .enumerate()
            .map(|(i, fields)| report(i as u32 + 1, fields))
            .collect();
        let summary = aggregate(&reports);
        prop_assert_eq!(summary.reports as usize, reports.len());
    }
}
