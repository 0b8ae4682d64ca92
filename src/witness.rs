//! Append-only audit trail carried by every daily report
use super::error::StoreError;
use super::report::{DailyReport, Product, cbor_date, cbor_decimal};
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use rust_decimal::Decimal;

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone)]
pub struct TimeStamp<T: TimeZone>(DateTime<T>);

impl TimeStamp<Utc> {
    pub fn new() -> Self {
        Self(Utc::now())
    }
    pub fn to_datetime_utc(&self) -> DateTime<Utc> {
        self.0
    }
}

impl Default for TimeStamp<Utc> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> minicbor::Encode<C> for TimeStamp<Utc> {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        if let Some(nsec) = self.0.timestamp_nanos_opt() {
            return e.i64(nsec)?.ok();
        }

        Err(minicbor::encode::Error::message(
            "failed to encode timestamp. timestamp_nanos_opt returned None",
        ))
    }
}

impl<'b, C> minicbor::Decode<'b, C> for TimeStamp<Utc> {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let nsecs = d.i64()?;

        Ok(TimeStamp(DateTime::from_timestamp_nanos(nsecs)))
    }
}

#[derive(Debug, PartialEq, Eq, minicbor::Encode, minicbor::Decode, Clone)]
pub struct Witness {
    #[n(0)]
    pub user_id: String,
    #[n(1)]
    pub timestamp: TimeStamp<Utc>,
    #[n(2)]
    pub kind: WitnessKind,
}

#[derive(Debug, PartialEq, Eq, minicbor::Encode, minicbor::Decode, Clone)]
pub enum WitnessKind {
    #[n(0)]
    Created,
    #[n(1)]
    Edited {
        #[n(0)]
        digest: String, // sha256 of the raw fields after the edit
    },
    #[n(2)]
    Approved,
    #[n(3)]
    Rejected,
    #[n(4)]
    Corrected {
        #[n(0)]
        digest: String,
    },
    #[n(5)]
    Cascaded {
        #[n(0)]
        #[cbor(with = "cbor_date")]
        source_date: NaiveDate,
        #[n(1)]
        product: Product,
        #[n(2)]
        #[cbor(with = "cbor_decimal")]
        opening: Decimal,
    },
}

impl Witness {
    pub fn new(user_id: &str, kind: WitnessKind) -> Self {
        Self {
            user_id: user_id.to_string(),
            timestamp: TimeStamp::new(),
            kind,
        }
    }

    pub fn describe(&self) -> String {
        let at = self.timestamp.to_datetime_utc().format("%Y-%m-%d %H:%M:%S");
        let what = match &self.kind {
            WitnessKind::Created => "created".to_string(),
            WitnessKind::Edited { digest } => format!("edited ({})", short(digest)),
            WitnessKind::Approved => "approved".to_string(),
            WitnessKind::Rejected => "rejected".to_string(),
            WitnessKind::Corrected { digest } => format!("corrected ({})", short(digest)),
            WitnessKind::Cascaded {
                source_date,
                product,
                opening,
            } => format!("{product} opening set to {opening} by correction of {source_date}"),
        };
        format!("{at} {} {what}", self.user_id)
    }
}

fn short(digest: &str) -> &str {
    digest.get(..12).unwrap_or(digest)
}

/// sha256 over the CBOR encoding of the report's raw fields.
pub fn raw_digest(report: &DailyReport) -> Result<String, StoreError> {
    let cbor =
        minicbor::to_vec(report.raw_fields()).map_err(|e| StoreError::Encode(e.to_string()))?;
    Ok(sha256::digest(&cbor))
}

pub fn history_lines(report: &DailyReport) -> Vec<String> {
    report.witnesses.iter().map(Witness::describe).collect()
}
