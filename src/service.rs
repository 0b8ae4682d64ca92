//! Service layer API for daily report reconciliation
use super::aggregate::{self, MonthlySummary};
use super::approval::{self, Actor, Decision};
use super::cascade::{self, CascadeCorrector, CascadeOutcome, ChainBreak, UpdateOutcome};
use super::config::EngineConfig;
use super::error::{EngineError, Result, StoreError};
use super::lock::CorrectionLocks;
use super::report::{DailyReport, Product, ReportPatch, ReportState, StationMonth};
use super::store::{ReportStore, SledReportStore};
use super::utils;
use super::witness::{Witness, WitnessKind};
use chrono::NaiveDate;
use std::sync::Arc;
use tracing::{info, warn};

pub struct ReconciliationService<S: ReportStore = SledReportStore> {
    store: S,
    locks: CorrectionLocks,
    config: EngineConfig,
}

impl ReconciliationService<SledReportStore> {
    pub fn new(instance: Arc<sled::Db>) -> Result<Self> {
        Ok(Self::with_store(
            SledReportStore::new(instance)?,
            EngineConfig::default(),
        ))
    }

    /// Opens (or creates) the database at `config.db_path`.
    pub fn open(config: &EngineConfig) -> Result<Self> {
        let store = SledReportStore::open(&config.db_path)?;
        Ok(Self::with_store(store, config.clone()))
    }
}

impl<S: ReportStore> ReconciliationService<S> {
    pub fn with_store(store: S, config: EngineConfig) -> Self {
        Self {
            store,
            locks: CorrectionLocks::new(config.lock_policy),
            config,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn correction_locks(&self) -> &CorrectionLocks {
        &self.locks
    }

    fn corrector(&self) -> CascadeCorrector<'_, S> {
        CascadeCorrector::new(&self.store, &self.locks, self.config.audit_before_cascade)
    }

    fn load_report(&self, report_id: &str) -> Result<DailyReport> {
        self.store
            .load(report_id)?
            .ok_or_else(|| EngineError::NotFound(report_id.to_string()))
    }

    pub fn get_report(&self, report_id: &str) -> Result<DailyReport> {
        self.load_report(report_id)
    }

    /// Live reports of a station-month, ordered by date.
    pub fn get_reports_for_month(
        &self,
        station_id: &str,
        year: i32,
        month: u32,
    ) -> Result<Vec<DailyReport>> {
        let station_month = StationMonth::new(station_id, year, month)?;
        Ok(self.store.load_month(&station_month)?)
    }

    /// Applies raw-field edits. Edits of approved reports are corrections
    /// and need a zone-level actor; either way every later day of the month
    /// is walked so the opening/closing chain stays intact.
    pub fn update_report(
        &self,
        actor: &Actor,
        report_id: &str,
        patch: &ReportPatch,
    ) -> Result<UpdateOutcome> {
        self.corrector().apply(actor, report_id, patch)
    }

    /// Approves or rejects a report. A commit that loses a race with a
    /// concurrent write to the same report is retried on fresh state.
    pub fn set_approval(
        &self,
        actor: &Actor,
        report_id: &str,
        decision: Decision,
    ) -> Result<DailyReport> {
        let station_month = self.load_report(report_id)?.station_month();

        for attempt in 1..=cascade::PLAN_ATTEMPTS {
            let loaded = self.load_report(report_id)?;
            let month = self.store.load_month(&station_month)?;
            let mut report = month
                .iter()
                .find(|r| r.id == report_id)
                .cloned()
                .unwrap_or(loaded);

            if decision == Decision::Approve && report.state == ReportState::Pending {
                if let Some(fault) = self
                    .store
                    .faults_for_month(&station_month)?
                    .into_iter()
                    .filter(|f| f.blocks(report.date))
                    .min_by_key(|f| f.from_date)
                {
                    return Err(EngineError::ChainFaulted {
                        key: fault.correction_key().to_string(),
                        since: fault.from_date,
                        date: report.date,
                    });
                }
            }

            approval::transition(&mut report, decision, actor, &month)?;
            report.version += 1;
            match self.store.commit(std::slice::from_ref(&report)) {
                Ok(()) => return Ok(report),
                Err(err @ StoreError::VersionConflict { .. }) => {
                    warn!(
                        report_id,
                        attempt,
                        reason = %err,
                        "Report changed during approval, retrying"
                    );
                }
                Err(err) => return Err(err.into()),
            }
        }

        Err(EngineError::LockContention {
            key: report_id.to_string(),
        })
    }

    /// Creates an empty pending report for a date that has none, or whose
    /// report was rejected.
    pub fn create_manual_report(
        &self,
        actor: &Actor,
        station_id: &str,
        date: NaiveDate,
    ) -> Result<DailyReport> {
        if !approval::can_edit(actor.role, ReportState::Pending) {
            return Err(EngineError::Unauthorized {
                role: actor.role,
                state: ReportState::Pending,
                action: "create",
            });
        }

        let mut report = DailyReport::new_manual(utils::new_report_id()?, station_id, date);
        report.insert_witness(Witness::new(&actor.user_id, WitnessKind::Created));

        self.store.insert_new(&report).map_err(|e| match e {
            StoreError::Occupied { station_id, date } => {
                EngineError::ReportExists { station_id, date }
            }
            other => other.into(),
        })?;

        info!(report_id = %report.id, station = %station_id, date = %date, "Manual report created");
        Ok(report)
    }

    pub fn monthly_summary(
        &self,
        station_id: &str,
        year: i32,
        month: u32,
    ) -> Result<MonthlySummary> {
        let reports = self.get_reports_for_month(station_id, year, month)?;
        Ok(aggregate::aggregate(&reports))
    }

    /// Re-walks one product's chain for the whole month and lifts any
    /// cascade fault on it.
    pub fn repair_chain(
        &self,
        actor: &Actor,
        station_month: &StationMonth,
        product: Product,
    ) -> Result<CascadeOutcome> {
        self.corrector().repair(actor, station_month, product)
    }

    /// Current chain breaks of every product, without changing anything.
    pub fn audit_chain(&self, station_month: &StationMonth) -> Result<Vec<ChainBreak>> {
        let month = self.store.load_month(station_month)?;
        Ok(Product::ALL
            .into_iter()
            .flat_map(|product| cascade::chain_breaks(&month, product))
            .collect())
    }
}
