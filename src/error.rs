use super::approval::{Decision, Role};
use super::report::{Product, ReportState};
use chrono::NaiveDate;
use rust_decimal::Decimal;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Field `{field}` is not numeric: {value:?}")]
    NotNumeric { field: String, value: String },
    #[error("Field `{field}` is missing a value")]
    Missing { field: String },
    #[error("Unknown raw field `{0}`")]
    UnknownField(String),
    #[error("Field `{field}` on {date} must not be negative, got {value}")]
    Negative {
        date: NaiveDate,
        product: Option<Product>,
        field: &'static str,
        value: Decimal,
    },
    #[error("Field `{field}` on {date} exceeds {max}, got {value}")]
    TooLarge {
        date: NaiveDate,
        product: Option<Product>,
        field: &'static str,
        value: Decimal,
        max: Decimal,
    },
    #[error("Opening inventory of {product} on {date} is carried from the previous day")]
    ChainManaged { date: NaiveDate, product: Product },
    #[error("Patch for {date} changes nothing")]
    EmptyPatch { date: NaiveDate },
    #[error("{year}-{month} is not a calendar month")]
    InvalidMonth { year: i32, month: u32 },
}

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("Sled error: {0}")]
    Sled(#[from] sled::Error),
    #[error("Failed to encode record: {0}")]
    Encode(String),
    #[error("Failed to decode record `{key}`: {reason}")]
    Decode { key: String, reason: String },
    #[error("Report `{report_id}` was written concurrently (expected version {expected}, found {found})")]
    VersionConflict {
        report_id: String,
        expected: u64,
        found: u64,
    },
    #[error("Report `{0}` does not exist")]
    Missing(String),
    #[error("A live report already exists for {station_id} on {date}")]
    Occupied { station_id: String, date: NaiveDate },
    #[error("Write of report `{report_id}` failed: {reason}")]
    WriteFailed { report_id: String, reason: String },
}

impl StoreError {
    /// The report a failed write was about, when the store knows it.
    pub fn report_id(&self) -> Option<&str> {
        match self {
            StoreError::VersionConflict { report_id, .. }
            | StoreError::WriteFailed { report_id, .. }
            | StoreError::Missing(report_id) => Some(report_id),
            _ => None,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    #[error("Invalid input: {0}")]
    Validation(#[from] ValidationError),
    #[error("Cannot approve {date}: {blocking_date} is still {blocking_state:?}")]
    SequenceViolation {
        date: NaiveDate,
        blocking_date: NaiveDate,
        blocking_state: ReportState,
    },
    #[error("Correction of {key} is already in progress")]
    LockContention { key: String },
    #[error("Cascade for {product} failed at {date}; no changes were kept: {reason}")]
    CascadeFailure {
        date: NaiveDate,
        product: Product,
        reason: String,
    },
    #[error("Chain for {key} is faulted since {since}; repair it before approving {date}")]
    ChainFaulted {
        key: String,
        since: NaiveDate,
        date: NaiveDate,
    },
    #[error("{role:?} may not {action} a {state:?} report")]
    Unauthorized {
        role: Role,
        state: ReportState,
        action: &'static str,
    },
    #[error("Report `{report_id}` is {from:?}; {decision:?} is only allowed on pending reports")]
    InvalidTransition {
        report_id: String,
        from: ReportState,
        decision: Decision,
    },
    #[error("Report `{0}` not found")]
    NotFound(String),
    #[error("A report for {station_id} on {date} already exists")]
    ReportExists { station_id: String, date: NaiveDate },
    #[error("Storage failure: {0}")]
    Store(#[from] StoreError),
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Failed to generate identifier: {0}")]
    Identifier(String),
}
