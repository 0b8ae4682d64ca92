//! Derived fields of a product-day. Pure, total and free of I/O.
//!
//! Every read and every write path goes through [`derive`]; derived values
//! are never persisted, so there is no cache to go stale.
use super::report::ProductFields;
use rust_decimal::Decimal;

const ONE_HUNDRED: Decimal = Decimal::ONE_HUNDRED;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProductFieldsDerived {
    pub purchase_variance: Decimal,            // DC = C - CCT
    pub discount_variance: Decimal,            // DifV.DSC = (CCT + V.DSC) - C
    pub net_volume: Decimal,                   // V = volumeSold - shrinkageVolume
    pub closing_inventory_calculated: Decimal, // IF = (IIB + CCT) - volumeSold
    pub real_efficiency: Decimal,              // ER = IFFB - IF
    pub real_efficiency_pct: Decimal,
    pub surplus: Decimal,
    pub surplus_pct: Decimal,
}

impl ProductFieldsDerived {
    /// A negative surplus is an inventory shortfall.
    pub fn is_shortfall(&self) -> bool {
        self.surplus < Decimal::ZERO
    }
}

/// Saturating arithmetic keeps this total: a sum or difference beyond the
/// range of `Decimal` sticks at `Decimal::MAX` or `Decimal::MIN`. Accepted
/// input is bounded well below that, see [`MAX_RAW_VALUE`].
///
/// [`MAX_RAW_VALUE`]: crate::report::MAX_RAW_VALUE
pub fn derive(raw: &ProductFields) -> ProductFieldsDerived {
    let purchase_variance = raw.purchases.saturating_sub(raw.purchases_per_control_doc);
    let discount_variance = raw
        .purchases_per_control_doc
        .saturating_add(raw.discounted_sales)
        .saturating_sub(raw.purchases);
    let net_volume = raw.volume_sold.saturating_sub(raw.shrinkage_volume);
    let closing_inventory_calculated = raw
        .opening_inventory
        .saturating_add(raw.purchases_per_control_doc)
        .saturating_sub(raw.volume_sold);
    let real_efficiency = raw
        .closing_inventory_measured
        .saturating_sub(closing_inventory_calculated);
    let surplus = real_efficiency.saturating_sub(raw.shrinkage_volume);

    ProductFieldsDerived {
        purchase_variance,
        discount_variance,
        net_volume,
        closing_inventory_calculated,
        real_efficiency,
        real_efficiency_pct: percent(
            real_efficiency,
            net_volume.saturating_add(raw.shrinkage_volume),
        ),
        surplus,
        surplus_pct: percent(surplus, net_volume),
    }
}

/// `numerator / denominator * 100`, or zero when the denominator is zero.
/// A ratio too large for `Decimal` also collapses to zero.
pub fn percent(numerator: Decimal, denominator: Decimal) -> Decimal {
    if denominator.is_zero() {
        return Decimal::ZERO;
    }
    numerator
        .checked_div(denominator)
        .and_then(|ratio| ratio.checked_mul(ONE_HUNDRED))
        .unwrap_or(Decimal::ZERO)
}
