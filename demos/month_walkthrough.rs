//! Walks one station through three days: entry, approval, and a correction
//! of an approved day that cascades into the rest of the month.
//!
//! Run with `RUST_LOG=info cargo run --example month_walkthrough`.
use anyhow::Context;
use chrono::NaiveDate;
use fuel_reconciliation::{
    Actor, Decision, Product, ProductPatch, ReconciliationService, ReportPatch, Role,
    config::EngineConfig, witness,
};
use rust_decimal_macros::dec;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let temp_dir = tempfile::tempdir()?;
    let config = EngineConfig::from_env()?.with_db_path(temp_dir.path().join("walkthrough.db"));
    let service = ReconciliationService::open(&config)?;

    let station = Actor::new("user_station", Role::StationManager);
    let zone = Actor::new("user_zone", Role::ZoneManager);

    let mut ids = vec![];
    for (day, opening, sold, closing) in [
        (1, dec!(1000), dec!(1200), dec!(280)),
        (2, dec!(280), dec!(150), dec!(120)),
        (3, dec!(120), dec!(100), dec!(25)),
    ] {
        let date = NaiveDate::from_ymd_opt(2024, 3, day).context("bad date")?;
        let report = service.create_manual_report(&station, "ST-001", date)?;
        let mut fields = ProductPatch::new()
            .set_volume_sold(sold)
            .set_closing_inventory_measured(closing);
        if day == 1 {
            fields = fields
                .set_opening_inventory(opening)
                .set_purchases_per_control_doc(dec!(500));
        }
        service.update_report(
            &station,
            &report.id,
            &ReportPatch::new().product(Product::Diesel, fields),
        )?;
        service.set_approval(&station, &report.id, Decision::Approve)?;
        ids.push(report.id);
    }

    // day 1 was dipped again: 300 litres, not 280
    let outcome = service.update_report(
        &zone,
        &ids[0],
        &ReportPatch::new().product(
            Product::Diesel,
            ProductPatch::new().set_closing_inventory_measured(dec!(300)),
        ),
    )?;
    for cascade in &outcome.cascades {
        println!(
            "{}: updated {:?}, skipped {:?}",
            cascade.key, cascade.updated, cascade.skipped
        );
    }

    for report in service.get_reports_for_month("ST-001", 2024, 3)? {
        let derived = report.derived(Product::Diesel).context("diesel missing")?;
        println!(
            "{} opening={} ER={} ER%={} surplus={}",
            report.date,
            report.diesel.as_ref().map(|f| f.opening_inventory).unwrap_or_default(),
            derived.real_efficiency,
            derived.real_efficiency_pct.round_dp(2),
            derived.surplus,
        );
        for line in witness::history_lines(&report) {
            println!("    {line}");
        }
    }

    let summary = service.monthly_summary("ST-001", 2024, 3)?;
    if let Some(diesel) = summary.product(Product::Diesel) {
        println!(
            "month: ER sum={} mean ER%={}",
            diesel.real_efficiency_sum,
            diesel.real_efficiency_pct_avg.round_dp(2)
        );
    }

    Ok(())
}
