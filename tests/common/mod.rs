//! Shared helpers for integration tests.
//!
//! `MemoryReportStore` mirrors the sled store's contract in memory. It can be
//! told to fail the write of a given day, or to hold month reads at a
//! barrier so that concurrent writers plan on the same snapshot. The sled
//! store can't be made to do either on demand.
#![allow(dead_code)]

use chrono::NaiveDate;
use fuel_reconciliation::cascade::CascadeFault;
use fuel_reconciliation::config::EngineConfig;
use fuel_reconciliation::error::StoreError;
use fuel_reconciliation::lock::CorrectionKey;
use fuel_reconciliation::report::StationMonth;
use fuel_reconciliation::store::ReportStore;
use fuel_reconciliation::{
    Actor, DailyReport, Decision, Product, ProductPatch, ReconciliationService, ReportPatch, Role,
};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Barrier, Mutex};

#[derive(Default)]
struct Inner {
    reports: HashMap<String, DailyReport>,
    live: BTreeMap<(String, NaiveDate), String>,
    faults: BTreeMap<String, CascadeFault>,
}

#[derive(Default)]
pub struct MemoryReportStore {
    inner: Mutex<Inner>,
    fail_on: Mutex<Option<NaiveDate>>,
    gate: Mutex<Option<(usize, Arc<Barrier>)>>,
}

impl MemoryReportStore {
    /// Makes every commit touching `date` fail until cleared.
    pub fn fail_on(&self, date: Option<NaiveDate>) {
        *self.fail_on.lock().unwrap() = date;
    }

    /// Holds the next `reads` month reads until all of them have arrived.
    pub fn gate_month_reads(&self, reads: usize) {
        *self.gate.lock().unwrap() = Some((reads, Arc::new(Barrier::new(reads))));
    }

    fn wait_at_gate(&self) {
        let barrier = match self.gate.lock().unwrap().as_mut() {
            Some((left, barrier)) if *left > 0 => {
                *left -= 1;
                Some(Arc::clone(barrier))
            }
            _ => None,
        };
        if let Some(barrier) = barrier {
            barrier.wait();
        }
    }
}

impl ReportStore for MemoryReportStore {
    fn load(&self, report_id: &str) -> Result<Option<DailyReport>, StoreError> {
        Ok(self.inner.lock().unwrap().reports.get(report_id).cloned())
    }

    fn find(&self, station_id: &str, date: NaiveDate) -> Result<Option<DailyReport>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .live
            .get(&(station_id.to_string(), date))
            .and_then(|id| inner.reports.get(id))
            .cloned())
    }

    fn load_month(&self, station_month: &StationMonth) -> Result<Vec<DailyReport>, StoreError> {
        self.wait_at_gate();
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .live
            .iter()
            .filter(|((station, date), _)| {
                station == &station_month.station_id && station_month.contains(*date)
            })
            .filter_map(|(_, id)| inner.reports.get(id).cloned())
            .collect())
    }

    fn insert_new(&self, report: &DailyReport) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let slot = (report.station_id.clone(), report.date);
        if let Some(current) = inner.live.get(&slot).and_then(|id| inner.reports.get(id)) {
            if !current.is_rejected() {
                return Err(StoreError::Occupied {
                    station_id: report.station_id.clone(),
                    date: report.date,
                });
            }
        }
        inner.reports.insert(report.id.clone(), report.clone());
        inner.live.insert(slot, report.id.clone());
        Ok(())
    }

    fn commit(&self, writes: &[DailyReport]) -> Result<(), StoreError> {
        let fail_on = *self.fail_on.lock().unwrap();
        let mut inner = self.inner.lock().unwrap();
        let mut staged = inner.reports.clone();

        for report in writes {
            if Some(report.date) == fail_on {
                return Err(StoreError::WriteFailed {
                    report_id: report.id.clone(),
                    reason: "injected failure".into(),
                });
            }
            let stored = staged
                .get(&report.id)
                .ok_or_else(|| StoreError::Missing(report.id.clone()))?;
            if stored.version + 1 != report.version {
                return Err(StoreError::VersionConflict {
                    report_id: report.id.clone(),
                    expected: report.version - 1,
                    found: stored.version,
                });
            }
            staged.insert(report.id.clone(), report.clone());
        }

        inner.reports = staged;
        Ok(())
    }

    fn fault(&self, key: &CorrectionKey) -> Result<Option<CascadeFault>, StoreError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .faults
            .get(&key.to_string())
            .cloned())
    }

    fn faults_for_month(
        &self,
        station_month: &StationMonth,
    ) -> Result<Vec<CascadeFault>, StoreError> {
        let prefix = format!("{}/", station_month.key());
        Ok(self
            .inner
            .lock()
            .unwrap()
            .faults
            .iter()
            .filter(|(key, _)| key.starts_with(&prefix))
            .map(|(_, fault)| fault.clone())
            .collect())
    }

    fn record_fault(&self, fault: &CascadeFault) -> Result<(), StoreError> {
        self.inner
            .lock()
            .unwrap()
            .faults
            .insert(fault.correction_key().to_string(), fault.clone());
        Ok(())
    }

    fn clear_fault(&self, key: &CorrectionKey) -> Result<(), StoreError> {
        self.inner.lock().unwrap().faults.remove(&key.to_string());
        Ok(())
    }
}

pub const STATION: &str = "ST-001";

pub fn station() -> Actor {
    Actor::new("user_station", Role::StationManager)
}

pub fn zone() -> Actor {
    Actor::new("user_zone", Role::ZoneManager)
}

pub fn march(day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 3, day).unwrap()
}

pub fn march_month() -> StationMonth {
    StationMonth::new(STATION, 2024, 3).unwrap()
}

pub fn memory_service() -> ReconciliationService<MemoryReportStore> {
    ReconciliationService::with_store(MemoryReportStore::default(), EngineConfig::default())
}

pub fn diesel(patch: ProductPatch) -> ReportPatch {
    ReportPatch::new().product(Product::Diesel, patch)
}

/// Creates a diesel report for `day`. Only the first day of the chain gets
/// an explicit opening inventory; later days are seeded from the chain.
pub fn enter_day<S: ReportStore>(
    service: &ReconciliationService<S>,
    day: u32,
    opening: Option<Decimal>,
    sold: Decimal,
    closing: Decimal,
) -> fuel_reconciliation::Result<DailyReport> {
    let report = service.create_manual_report(&station(), STATION, march(day))?;
    let mut patch = ProductPatch::new()
        .set_volume_sold(sold)
        .set_closing_inventory_measured(closing);
    if let Some(opening) = opening {
        patch = patch.set_opening_inventory(opening);
    }
    Ok(service
        .update_report(&station(), &report.id, &diesel(patch))?
        .report)
}

pub fn approve<S: ReportStore>(
    service: &ReconciliationService<S>,
    report_id: &str,
) -> fuel_reconciliation::Result<DailyReport> {
    service.set_approval(&station(), report_id, Decision::Approve)
}

/// `opening[D] == closingMeasured[D-1]` for every pair of live diesel days.
pub fn assert_chain_holds(month: &[DailyReport]) {
    let live: Vec<_> = month
        .iter()
        .filter(|r| !r.is_rejected())
        .filter_map(|r| r.diesel.as_ref().map(|f| (r.date, f)))
        .collect();
    for pair in live.windows(2) {
        let (_, prev) = pair[0];
        let (date, next) = pair[1];
        assert_eq!(
            next.opening_inventory, prev.closing_inventory_measured,
            "chain broken at {date}"
        );
    }
}
