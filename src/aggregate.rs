//! Month-level totals folded from per-day derived fields
use super::calculator;
use super::report::{DailyReport, Product};
use rust_decimal::Decimal;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProductSummary {
    pub days: u32,
    pub real_efficiency_sum: Decimal,
    pub shrinkage_volume_sum: Decimal,
    pub shrinkage_amount_sum: Decimal,
    pub net_volume_sum: Decimal,
    pub volume_sold_sum: Decimal,
    pub purchases_sum: Decimal,
    pub surplus_sum: Decimal,
    /// Mean of each day's percentage, not a ratio of the sums.
    pub real_efficiency_pct_avg: Decimal,
    pub surplus_pct_avg: Decimal,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MonthlySummary {
    pub reports: u32,
    pub oils_amount_sum: Decimal,
    pub products: BTreeMap<Product, ProductSummary>,
}

impl MonthlySummary {
    pub fn product(&self, product: Product) -> Option<&ProductSummary> {
        self.products.get(&product)
    }
}

#[derive(Default)]
struct Accumulator {
    summary: ProductSummary,
    real_efficiency_pct_sum: Decimal,
    surplus_pct_sum: Decimal,
}

fn accumulate(total: &mut Decimal, value: Decimal) {
    *total = total.saturating_add(value);
}

/// Folds every non-rejected report. Products without any day are absent
/// from the result. Sums saturate at the bounds of `Decimal`.
pub fn aggregate(reports: &[DailyReport]) -> MonthlySummary {
    let mut summary = MonthlySummary::default();
    let mut acc: BTreeMap<Product, Accumulator> = BTreeMap::new();

    for report in reports.iter().filter(|r| !r.is_rejected()) {
        summary.reports += 1;
        accumulate(&mut summary.oils_amount_sum, report.oils_amount);

        for (product, raw) in report.products() {
            let derived = calculator::derive(raw);
            let entry = acc.entry(product).or_default();
            let s = &mut entry.summary;

            s.days += 1;
            accumulate(&mut s.real_efficiency_sum, derived.real_efficiency);
            accumulate(&mut s.shrinkage_volume_sum, raw.shrinkage_volume);
            accumulate(&mut s.shrinkage_amount_sum, raw.shrinkage_amount);
            accumulate(&mut s.net_volume_sum, derived.net_volume);
            accumulate(&mut s.volume_sold_sum, raw.volume_sold);
            accumulate(&mut s.purchases_sum, raw.purchases);
            accumulate(&mut s.surplus_sum, derived.surplus);
            accumulate(&mut entry.real_efficiency_pct_sum, derived.real_efficiency_pct);
            accumulate(&mut entry.surplus_pct_sum, derived.surplus_pct);
        }
    }

    for (product, entry) in acc {
        let mut s = entry.summary;
        let days = Decimal::from(s.days);
        s.real_efficiency_pct_avg = entry.real_efficiency_pct_sum / days;
        s.surplus_pct_avg = entry.surplus_pct_sum / days;
        summary.products.insert(product, s);
    }

    summary
}
