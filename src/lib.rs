pub mod aggregate;
pub mod approval;
pub mod calculator;
pub mod cascade;
pub mod config;
pub mod error;
pub mod lock;
pub mod report;
pub mod service;
pub mod store;
pub mod utils;
pub mod witness;

pub use approval::{Actor, Decision, Role};
pub use error::{EngineError, Result, ValidationError};
pub use report::{DailyReport, Product, ProductFields, ProductPatch, ReportPatch, ReportState};
pub use service::ReconciliationService;
