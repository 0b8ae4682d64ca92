//! Identifier helpers

use super::error::{EngineError, Result};
use bech32::Bech32m;
use uuid7::uuid7;

pub const REPORT_HRP: &str = "report_";

// construct a unique id then encode using bech32
pub fn new_uuid_to_bech32(hrp: &str) -> Result<String> {
    let hrp = bech32::Hrp::parse(hrp).map_err(|e| EngineError::Identifier(e.to_string()))?;
    bech32::encode::<Bech32m>(hrp, uuid7().as_bytes())
        .map_err(|e| EngineError::Identifier(e.to_string()))
}

pub fn new_report_id() -> Result<String> {
    new_uuid_to_bech32(REPORT_HRP)
}
