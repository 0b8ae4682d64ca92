//! Persistence for daily reports.
//!
//! Reports are addressed by id and indexed per station-month by date. Writes
//! carry a version: a record is only replaced when the stored version is
//! exactly one behind the incoming one. Multi-record writes are all or
//! nothing, and month reads observe a single consistent snapshot.
use super::cascade::CascadeFault;
use super::error::StoreError;
use super::lock::CorrectionKey;
use super::report::{DailyReport, StationMonth, cbor_date};
use chrono::NaiveDate;
use sled::Transactional;
use sled::transaction::{ConflictableTransactionError, TransactionError, TransactionalTree};
use std::path::Path;
use std::sync::Arc;

pub trait ReportStore: Send + Sync {
    fn load(&self, report_id: &str) -> Result<Option<DailyReport>, StoreError>;

    /// The live report for a station on a date. Rejected reports stay live
    /// until a replacement is created.
    fn find(&self, station_id: &str, date: NaiveDate) -> Result<Option<DailyReport>, StoreError>;

    /// Live reports of a station-month in ascending date order.
    fn load_month(&self, station_month: &StationMonth) -> Result<Vec<DailyReport>, StoreError>;

    /// Stores a brand new report and makes it the live report for its date.
    /// Fails with [`StoreError::Occupied`] unless the date is free or its
    /// live report is rejected.
    fn insert_new(&self, report: &DailyReport) -> Result<(), StoreError>;

    /// Replaces every report in `writes` atomically.
    fn commit(&self, writes: &[DailyReport]) -> Result<(), StoreError>;

    fn fault(&self, key: &CorrectionKey) -> Result<Option<CascadeFault>, StoreError>;
    fn faults_for_month(
        &self,
        station_month: &StationMonth,
    ) -> Result<Vec<CascadeFault>, StoreError>;
    fn record_fault(&self, fault: &CascadeFault) -> Result<(), StoreError>;
    fn clear_fault(&self, key: &CorrectionKey) -> Result<(), StoreError>;
}

#[derive(Debug, Default, Clone, PartialEq, minicbor::Encode, minicbor::Decode)]
struct MonthIndex {
    #[n(0)]
    entries: Vec<IndexEntry>, // sorted by date
}

#[derive(Debug, Clone, PartialEq, minicbor::Encode, minicbor::Decode)]
struct IndexEntry {
    #[n(0)]
    #[cbor(with = "cbor_date")]
    date: NaiveDate,
    #[n(1)]
    report_id: String,
}

impl MonthIndex {
    fn get(&self, date: NaiveDate) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.date == date)
            .map(|e| e.report_id.as_str())
    }

    fn set(&mut self, date: NaiveDate, report_id: &str) {
        match self.entries.binary_search_by_key(&date, |e| e.date) {
            Ok(pos) => self.entries[pos].report_id = report_id.to_string(),
            Err(pos) => self.entries.insert(
                pos,
                IndexEntry {
                    date,
                    report_id: report_id.to_string(),
                },
            ),
        }
    }
}

pub struct SledReportStore {
    instance: Arc<sled::Db>,
    reports: sled::Tree,
    months: sled::Tree,
    faults: sled::Tree,
}

type TxResult<T> = Result<T, ConflictableTransactionError<StoreError>>;

fn encode<T: minicbor::Encode<()>>(value: &T) -> Result<Vec<u8>, StoreError> {
    minicbor::to_vec(value).map_err(|e| StoreError::Encode(e.to_string()))
}

fn decode<T: for<'b> minicbor::Decode<'b, ()>>(key: &str, bytes: &[u8]) -> Result<T, StoreError> {
    minicbor::decode(bytes).map_err(|e| StoreError::Decode {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

fn abort<T>(err: StoreError) -> TxResult<T> {
    Err(ConflictableTransactionError::Abort(err))
}

fn flatten(err: TransactionError<StoreError>) -> StoreError {
    match err {
        TransactionError::Abort(e) => e,
        TransactionError::Storage(e) => StoreError::Sled(e),
    }
}

fn month_key(report: &DailyReport) -> String {
    report.station_month().key()
}

fn tx_index(months: &TransactionalTree, key: &str) -> TxResult<MonthIndex> {
    match months.get(key.as_bytes())? {
        Some(bytes) => decode(key, &bytes).or_else(abort),
        None => Ok(MonthIndex::default()),
    }
}

fn tx_report(reports: &TransactionalTree, report_id: &str) -> TxResult<Option<DailyReport>> {
    match reports.get(report_id.as_bytes())? {
        Some(bytes) => decode(report_id, &bytes).map(Some).or_else(abort),
        None => Ok(None),
    }
}

impl SledReportStore {
    pub fn new(instance: Arc<sled::Db>) -> Result<Self, StoreError> {
        Ok(Self {
            reports: instance.open_tree("reports")?,
            months: instance.open_tree("months")?,
            faults: instance.open_tree("faults")?,
            instance,
        })
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::new(Arc::new(sled::open(path)?))
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.instance.flush()?;
        Ok(())
    }
}

impl ReportStore for SledReportStore {
    fn load(&self, report_id: &str) -> Result<Option<DailyReport>, StoreError> {
        match self.reports.get(report_id.as_bytes())? {
            Some(bytes) => decode(report_id, &bytes).map(Some),
            None => Ok(None),
        }
    }

    fn find(&self, station_id: &str, date: NaiveDate) -> Result<Option<DailyReport>, StoreError> {
        let key = StationMonth::of(station_id, date).key();
        (&self.reports, &self.months)
            .transaction(|(reports, months)| {
                let index = tx_index(months, &key)?;
                match index.get(date) {
                    Some(report_id) => tx_report(reports, report_id),
                    None => Ok(None),
                }
            })
            .map_err(flatten)
    }

    fn load_month(&self, station_month: &StationMonth) -> Result<Vec<DailyReport>, StoreError> {
        let key = station_month.key();
        (&self.reports, &self.months)
            .transaction(|(reports, months)| {
                let index = tx_index(months, &key)?;
                let mut month = Vec::with_capacity(index.entries.len());
                for entry in &index.entries {
                    match tx_report(reports, &entry.report_id)? {
                        Some(report) => month.push(report),
                        None => return abort(StoreError::Missing(entry.report_id.clone())),
                    }
                }
                Ok(month)
            })
            .map_err(flatten)
    }

    fn insert_new(&self, report: &DailyReport) -> Result<(), StoreError> {
        let key = month_key(report);
        let bytes = encode(report)?;
        (&self.reports, &self.months)
            .transaction(|(reports, months)| {
                let mut index = tx_index(months, &key)?;
                if let Some(current) = index.get(report.date) {
                    let live = tx_report(reports, current)?;
                    if live.is_some_and(|r| !r.is_rejected()) {
                        return abort(StoreError::Occupied {
                            station_id: report.station_id.clone(),
                            date: report.date,
                        });
                    }
                }
                index.set(report.date, &report.id);
                reports.insert(report.id.as_bytes(), bytes.clone())?;
                months.insert(key.as_bytes(), encode(&index).or_else(abort)?)?;
                Ok(())
            })
            .map_err(flatten)
    }

    fn commit(&self, writes: &[DailyReport]) -> Result<(), StoreError> {
        let encoded = writes
            .iter()
            .map(|r| encode(r).map(|bytes| (r, bytes)))
            .collect::<Result<Vec<_>, _>>()?;

        self.reports
            .transaction(|reports| {
                for (report, bytes) in &encoded {
                    let stored = match tx_report(reports, &report.id)? {
                        Some(stored) => stored,
                        None => return abort(StoreError::Missing(report.id.clone())),
                    };
                    if stored.version + 1 != report.version {
                        return abort(StoreError::VersionConflict {
                            report_id: report.id.clone(),
                            expected: report.version.saturating_sub(1),
                            found: stored.version,
                        });
                    }
                    reports.insert(report.id.as_bytes(), bytes.clone())?;
                }
                Ok(())
            })
            .map_err(flatten)
    }

    fn fault(&self, key: &CorrectionKey) -> Result<Option<CascadeFault>, StoreError> {
        let key = key.to_string();
        match self.faults.get(key.as_bytes())? {
            Some(bytes) => decode(&key, &bytes).map(Some),
            None => Ok(None),
        }
    }

    fn faults_for_month(
        &self,
        station_month: &StationMonth,
    ) -> Result<Vec<CascadeFault>, StoreError> {
        let prefix = format!("{}/", station_month.key());
        self.faults
            .scan_prefix(prefix.as_bytes())
            .map(|entry| {
                let (key, bytes) = entry?;
                decode(&String::from_utf8_lossy(&key), &bytes)
            })
            .collect()
    }

    fn record_fault(&self, fault: &CascadeFault) -> Result<(), StoreError> {
        let key = fault.correction_key().to_string();
        self.faults.insert(key.as_bytes(), encode(fault)?)?;
        self.faults.flush()?;
        Ok(())
    }

    fn clear_fault(&self, key: &CorrectionKey) -> Result<(), StoreError> {
        self.faults.remove(key.to_string().as_bytes())?;
        Ok(())
    }
}
