//! Correction of a day's raw fields and the forward walk that keeps every
//! later day's opening inventory equal to its predecessor's measured closing.
//!
//! The walk runs on in-memory copies of the station-month and is persisted
//! with a single [`ReportStore::commit`], so the month is either fully
//! cascaded or left exactly as it was. A failed commit leaves a
//! [`CascadeFault`] behind that blocks approvals until the chain is repaired.
use super::approval::{self, Actor};
use super::error::{EngineError, Result, StoreError, ValidationError};
use super::lock::{CorrectionKey, CorrectionLocks};
use super::report::{
    DailyReport, Product, ProductFields, ReportPatch, ReportState, StationMonth, cbor_date,
};
use super::store::ReportStore;
use super::witness::{self, TimeStamp, Witness, WitnessKind};
use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use std::collections::BTreeSet;
use tracing::{error, info, warn};

/// A day whose opening inventory disagrees with the measured closing of the
/// previous live day carrying the same product.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainBreak {
    pub date: NaiveDate,
    pub product: Product,
    pub expected_opening: Decimal,
    pub found_opening: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NoReport,
    Rejected,
    ProductAbsent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedDay {
    pub date: NaiveDate,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CascadeOutcome {
    pub key: CorrectionKey,
    pub source_date: NaiveDate,
    /// Days whose opening inventory was rewritten, in walk order.
    pub updated: Vec<NaiveDate>,
    /// Days that already carried the right opening inventory.
    pub unchanged: Vec<NaiveDate>,
    pub skipped: Vec<SkippedDay>,
    /// Breaks that existed before this walk started.
    pub pre_existing_breaks: Vec<ChainBreak>,
}

impl CascadeOutcome {
    fn new(key: CorrectionKey, source_date: NaiveDate) -> Self {
        Self {
            key,
            source_date,
            updated: vec![],
            unchanged: vec![],
            skipped: vec![],
            pre_existing_breaks: vec![],
        }
    }

    pub fn is_noop(&self) -> bool {
        self.updated.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateOutcome {
    pub report: DailyReport,
    pub cascades: Vec<CascadeOutcome>,
}

/// Left behind by a cascade whose commit failed. Approvals of days on or
/// after `from_date` stay blocked until a walk from `from_date` or earlier
/// succeeds.
#[derive(Debug, Clone, PartialEq, minicbor::Encode, minicbor::Decode)]
pub struct CascadeFault {
    #[n(0)]
    pub station_id: String,
    #[n(1)]
    pub year: i32,
    #[n(2)]
    pub month: u32,
    #[n(3)]
    pub product: Product,
    #[n(4)]
    #[cbor(with = "cbor_date")]
    pub from_date: NaiveDate,
    #[n(5)]
    #[cbor(with = "cbor_date")]
    pub failed_date: NaiveDate,
    #[n(6)]
    pub reason: String,
    #[n(7)]
    pub recorded_at: TimeStamp<Utc>,
}

impl CascadeFault {
    pub fn correction_key(&self) -> CorrectionKey {
        CorrectionKey::new(
            StationMonth {
                station_id: self.station_id.clone(),
                year: self.year,
                month: self.month,
            },
            self.product,
        )
    }

    pub fn blocks(&self, date: NaiveDate) -> bool {
        date >= self.from_date
    }
}

/// Every break in the live chain of `product`. `month` must be sorted by date.
pub fn chain_breaks(month: &[DailyReport], product: Product) -> Vec<ChainBreak> {
    let mut breaks = vec![];
    let mut carry: Option<Decimal> = None;

    for report in month.iter().filter(|r| !r.is_rejected()) {
        let Some(fields) = report.product(product) else {
            continue;
        };
        if let Some(expected) = carry {
            if fields.opening_inventory != expected {
                breaks.push(ChainBreak {
                    date: report.date,
                    product,
                    expected_opening: expected,
                    found_opening: fields.opening_inventory,
                });
            }
        }
        carry = Some(fields.closing_inventory_measured);
    }
    breaks
}

// Closing of the last live day before `idx` that carries `product`.
fn carry_before(month: &[DailyReport], idx: usize, product: Product) -> Option<Decimal> {
    month[..idx]
        .iter()
        .rev()
        .filter(|r| !r.is_rejected())
        .find_map(|r| r.product(product))
        .map(|fields| fields.closing_inventory_measured)
}

fn dates_between(after: NaiveDate, before: NaiveDate) -> impl Iterator<Item = NaiveDate> {
    after
        .iter_days()
        .skip(1)
        .take_while(move |date| *date < before)
}

/// Rewrites the opening inventory of every live day after `source_idx`,
/// strictly in date order. Indices of rewritten reports land in `dirty`.
fn propagate(
    month: &mut [DailyReport],
    source_idx: usize,
    product: Product,
    actor: &Actor,
    dirty: &mut BTreeSet<usize>,
    outcome: &mut CascadeOutcome,
) {
    let source_date = month[source_idx].date;
    let Some(mut carry) = month[source_idx]
        .product(product)
        .map(|fields| fields.closing_inventory_measured)
    else {
        return;
    };
    let mut previous = source_date;

    for idx in source_idx + 1..month.len() {
        let report = &mut month[idx];
        let date = report.date;
        outcome
            .skipped
            .extend(dates_between(previous, date).map(|date| SkippedDay {
                date,
                reason: SkipReason::NoReport,
            }));
        previous = date;

        if report.is_rejected() {
            warn!(report_id = %report.id, date = %date, product = %product, "Skipping rejected day in cascade");
            outcome.skipped.push(SkippedDay {
                date,
                reason: SkipReason::Rejected,
            });
            continue;
        }
        let Some(fields) = report.product_mut(product).as_mut() else {
            outcome.skipped.push(SkippedDay {
                date,
                reason: SkipReason::ProductAbsent,
            });
            continue;
        };

        let changed = fields.opening_inventory != carry;
        fields.opening_inventory = carry;
        // the measured closing is ground truth and is never re-derived here
        let closing = fields.closing_inventory_measured;

        if changed {
            report.insert_witness(Witness::new(
                &actor.user_id,
                WitnessKind::Cascaded {
                    source_date,
                    product,
                    opening: carry,
                },
            ));
            dirty.insert(idx);
            outcome.updated.push(date);
        } else {
            outcome.unchanged.push(date);
        }
        carry = closing;
    }
}

/// Commits tried per correction before giving up on a month that keeps
/// changing underneath it.
pub const PLAN_ATTEMPTS: usize = 3;

enum Committed {
    Written,
    Stale(StoreError),
}

struct Plan {
    month: Vec<DailyReport>,
    idx: usize,
    dirty: BTreeSet<usize>,
    outcomes: Vec<CascadeOutcome>,
}

fn contention_key(station_month: &StationMonth, keys: &[CorrectionKey]) -> String {
    if keys.is_empty() {
        return station_month.key();
    }
    keys.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

pub struct CascadeCorrector<'a, S: ReportStore + ?Sized> {
    store: &'a S,
    locks: &'a CorrectionLocks,
    audit_before_cascade: bool,
}

impl<'a, S: ReportStore + ?Sized> CascadeCorrector<'a, S> {
    pub fn new(store: &'a S, locks: &'a CorrectionLocks, audit_before_cascade: bool) -> Self {
        Self {
            store,
            locks,
            audit_before_cascade,
        }
    }

    /// Applies `patch` to a report and walks every touched product forward.
    ///
    /// Pending reports take the same path as corrections of approved ones;
    /// a walk over an already consistent month writes nothing. When another
    /// writer commits to the month between planning and commit, the walk is
    /// planned again under the same locks, at most [`PLAN_ATTEMPTS`] times.
    pub fn apply(
        &self,
        actor: &Actor,
        report_id: &str,
        patch: &ReportPatch,
    ) -> Result<UpdateOutcome> {
        let current = self
            .store
            .load(report_id)?
            .ok_or_else(|| EngineError::NotFound(report_id.to_string()))?;
        approval::ensure_editable(actor, &current)?;
        patch.validate(current.date)?;

        let station_month = current.station_month();
        let products = patch.touched_products();
        let keys: Vec<_> = products
            .iter()
            .map(|p| CorrectionKey::new(station_month.clone(), *p))
            .collect();
        let _guards = self.locks.acquire_all(&keys)?;

        for attempt in 1..=PLAN_ATTEMPTS {
            let mut plan = self.plan_update(actor, report_id, patch, &station_month, &keys)?;
            let source_date = plan.month[plan.idx].date;

            if let Committed::Stale(err) =
                self.commit(&mut plan.month, &plan.dirty, source_date, &products)?
            {
                warn!(
                    report_id,
                    attempt,
                    reason = %err,
                    "Month changed during cascade, planning again"
                );
                continue;
            }

            for outcome in &plan.outcomes {
                info!(
                    key = %outcome.key,
                    source_date = %source_date,
                    updated = outcome.updated.len(),
                    skipped = outcome.skipped.len(),
                    "Cascade applied"
                );
            }
            return Ok(UpdateOutcome {
                report: plan.month.swap_remove(plan.idx),
                cascades: plan.outcomes,
            });
        }

        Err(EngineError::LockContention {
            key: contention_key(&station_month, &keys),
        })
    }

    // Re-reads the month under the held locks, applies the patch to the
    // working copy and walks each key's product forward from the edited day.
    fn plan_update(
        &self,
        actor: &Actor,
        report_id: &str,
        patch: &ReportPatch,
        station_month: &StationMonth,
        keys: &[CorrectionKey],
    ) -> Result<Plan> {
        let mut month = self.store.load_month(station_month)?;
        let idx = month
            .iter()
            .position(|r| r.id == report_id)
            .ok_or_else(|| EngineError::NotFound(report_id.to_string()))?;
        approval::ensure_editable(actor, &month[idx])?;
        let source_date = month[idx].date;

        let mut outcomes: Vec<_> = keys
            .iter()
            .map(|key| {
                let mut outcome = CascadeOutcome::new(key.clone(), source_date);
                if self.audit_before_cascade {
                    outcome.pre_existing_breaks = chain_breaks(&month, key.product)
                        .into_iter()
                        .filter(|b| b.date > source_date)
                        .collect();
                    for b in &outcome.pre_existing_breaks {
                        warn!(
                            key = %key,
                            date = %b.date,
                            expected = %b.expected_opening,
                            found = %b.found_opening,
                            "Chain already broken before cascade"
                        );
                    }
                }
                outcome
            })
            .collect();

        let mut dirty = BTreeSet::new();
        if self.apply_patch(&mut month, idx, patch)? {
            let digest = witness::raw_digest(&month[idx])?;
            let kind = match month[idx].state {
                ReportState::Approved => WitnessKind::Corrected { digest },
                _ => WitnessKind::Edited { digest },
            };
            month[idx].insert_witness(Witness::new(&actor.user_id, kind));
            dirty.insert(idx);
        }

        for outcome in outcomes.iter_mut() {
            propagate(
                &mut month,
                idx,
                outcome.key.product,
                actor,
                &mut dirty,
                outcome,
            );
        }

        Ok(Plan {
            month,
            idx,
            dirty,
            outcomes,
        })
    }

    // Applies the patch to the working copy at `idx`. Returns whether any raw
    // field actually changed.
    fn apply_patch(
        &self,
        month: &mut [DailyReport],
        idx: usize,
        patch: &ReportPatch,
    ) -> Result<bool> {
        let before = month[idx].raw_fields();
        let date = month[idx].date;

        for (product, product_patch) in patch.products.iter().filter(|(_, p)| !p.is_empty()) {
            let carry = carry_before(month, idx, *product);
            if let (Some(opening), Some(carry)) = (product_patch.opening_inventory, carry) {
                if opening != carry {
                    return Err(ValidationError::ChainManaged {
                        date,
                        product: *product,
                    }
                    .into());
                }
            }

            let slot = month[idx].product_mut(*product);
            if slot.is_none() {
                // a product new to this day starts from the previous closing
                *slot = Some(ProductFields::new().set_opening_inventory(carry.unwrap_or_default()));
            }
            if let Some(fields) = slot.as_mut() {
                product_patch.apply(fields);
            }
        }
        if let Some(oils_amount) = patch.oils_amount {
            month[idx].oils_amount = oils_amount;
        }

        Ok(month[idx].raw_fields() != before)
    }

    /// Re-walks `product` across the whole station-month from its first live
    /// day, then clears any fault left by an earlier failed cascade.
    pub fn repair(
        &self,
        actor: &Actor,
        station_month: &StationMonth,
        product: Product,
    ) -> Result<CascadeOutcome> {
        if !approval::can_edit(actor.role, ReportState::Approved) {
            return Err(EngineError::Unauthorized {
                role: actor.role,
                state: ReportState::Approved,
                action: "repair",
            });
        }
        let key = CorrectionKey::new(station_month.clone(), product);
        let _guard = self.locks.acquire(&key)?;

        for attempt in 1..=PLAN_ATTEMPTS {
            let mut month = self.store.load_month(station_month)?;
            let Some(idx) = month
                .iter()
                .position(|r| !r.is_rejected() && r.product(product).is_some())
            else {
                self.store.clear_fault(&key)?;
                return Ok(CascadeOutcome::new(key, station_month.first_day()?));
            };

            let mut outcome = CascadeOutcome::new(key.clone(), month[idx].date);
            outcome.pre_existing_breaks = chain_breaks(&month, product);
            let mut dirty = BTreeSet::new();
            propagate(&mut month, idx, product, actor, &mut dirty, &mut outcome);

            if let Committed::Stale(err) =
                self.commit(&mut month, &dirty, outcome.source_date, &[product])?
            {
                warn!(
                    key = %key,
                    attempt,
                    reason = %err,
                    "Month changed during repair, planning again"
                );
                continue;
            }
            self.store.clear_fault(&key)?;

            info!(
                key = %key,
                updated = outcome.updated.len(),
                breaks = outcome.pre_existing_breaks.len(),
                "Chain repaired"
            );
            return Ok(outcome);
        }

        Err(EngineError::LockContention {
            key: key.to_string(),
        })
    }

    // Persists every dirty report in one call. A version conflict means the
    // plan was built on a stale month and is handed back for re-planning.
    // Any other failure keeps nothing and records a fault for each product
    // of the walk.
    fn commit(
        &self,
        month: &mut [DailyReport],
        dirty: &BTreeSet<usize>,
        source_date: NaiveDate,
        products: &[Product],
    ) -> Result<Committed> {
        let writes: Vec<DailyReport> = dirty
            .iter()
            .map(|&i| {
                month[i].version += 1;
                month[i].clone()
            })
            .collect();
        if !writes.is_empty() {
            match self.store.commit(&writes) {
                Ok(()) => {}
                Err(err @ StoreError::VersionConflict { .. }) => {
                    return Ok(Committed::Stale(err));
                }
                Err(err) => {
                    return Err(self.record_failure(month, &writes, source_date, products, err));
                }
            }
        }
        self.clear_resolved_faults(month, source_date, products)?;
        Ok(Committed::Written)
    }

    fn record_failure(
        &self,
        month: &[DailyReport],
        writes: &[DailyReport],
        source_date: NaiveDate,
        products: &[Product],
        err: StoreError,
    ) -> EngineError {
        let failed_date = err
            .report_id()
            .and_then(|id| writes.iter().find(|r| r.id == id))
            .map(|r| r.date)
            .unwrap_or(source_date);
        let Some(&product) = products.first() else {
            return err.into();
        };
        let reason = err.to_string();
        error!(
            station = %month[0].station_id,
            source_date = %source_date,
            failed_date = %failed_date,
            reason = %reason,
            "Cascade commit failed, month left unchanged"
        );

        let station_month = month[0].station_month();
        for product in products {
            let fault = CascadeFault {
                station_id: station_month.station_id.clone(),
                year: station_month.year,
                month: station_month.month,
                product: *product,
                from_date: source_date,
                failed_date,
                reason: reason.clone(),
                recorded_at: TimeStamp::new(),
            };
            if let Err(e) = self.store.record_fault(&fault) {
                error!(key = %fault.correction_key(), error = %e, "Failed to record cascade fault");
            }
        }

        EngineError::CascadeFailure {
            date: failed_date,
            product,
            reason,
        }
    }

    fn clear_resolved_faults(
        &self,
        month: &[DailyReport],
        source_date: NaiveDate,
        products: &[Product],
    ) -> Result<()> {
        let Some(first) = month.first() else {
            return Ok(());
        };
        for product in products {
            let key = CorrectionKey::new(first.station_month(), *product);
            if let Some(fault) = self.store.fault(&key)? {
                if source_date <= fault.from_date {
                    self.store.clear_fault(&key)?;
                    info!(key = %key, "Cascade fault resolved");
                }
            }
        }
        Ok(())
    }
}
