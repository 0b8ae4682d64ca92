//! Daily report records, fuel products and raw-field patches
use super::calculator::{self, ProductFieldsDerived};
use super::error::ValidationError;
use super::witness::Witness;
use chrono::{Datelike, NaiveDate};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

#[derive(
    minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
pub enum Product {
    #[n(0)]
    Premium,
    #[n(1)]
    Regular,
    #[n(2)]
    Diesel,
}

impl Product {
    pub const ALL: [Product; 3] = [Product::Premium, Product::Regular, Product::Diesel];

    pub fn as_str(&self) -> &'static str {
        match self {
            Product::Premium => "premium",
            Product::Regular => "regular",
            Product::Diesel => "diesel",
        }
    }
}

impl fmt::Display for Product {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportState {
    #[n(0)]
    Pending,
    #[n(1)]
    Approved,
    #[n(2)]
    Rejected,
}

/// One station over one calendar month. The scope of chain continuity,
/// approval ordering and correction locking.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StationMonth {
    pub station_id: String,
    pub year: i32,
    pub month: u32,
}

impl StationMonth {
    pub fn new(station_id: &str, year: i32, month: u32) -> Result<Self, ValidationError> {
        if NaiveDate::from_ymd_opt(year, month, 1).is_none() {
            return Err(ValidationError::InvalidMonth { year, month });
        }
        Ok(Self {
            station_id: station_id.to_string(),
            year,
            month,
        })
    }

    pub fn of(station_id: &str, date: NaiveDate) -> Self {
        Self {
            station_id: station_id.to_string(),
            year: date.year(),
            month: date.month(),
        }
    }

    pub fn first_day(&self) -> Result<NaiveDate, ValidationError> {
        NaiveDate::from_ymd_opt(self.year, self.month, 1).ok_or(ValidationError::InvalidMonth {
            year: self.year,
            month: self.month,
        })
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date.year() == self.year && date.month() == self.month
    }

    /// Storage key, e.g. `ST-001/2024-03`
    pub fn key(&self) -> String {
        format!("{}/{:04}-{:02}", self.station_id, self.year, self.month)
    }
}

impl fmt::Display for StationMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// Raw, editable fields of one fuel grade on one day. Derived values are
/// never stored here; see [`calculator::derive`].
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Default, PartialEq, Eq)]
pub struct ProductFields {
    #[n(0)]
    #[cbor(with = "cbor_decimal")]
    pub price: Decimal,
    #[n(1)]
    #[cbor(with = "cbor_decimal")]
    pub volume_sold: Decimal,
    #[n(2)]
    #[cbor(with = "cbor_decimal")]
    pub shrinkage_volume: Decimal,
    #[n(3)]
    #[cbor(with = "cbor_decimal")]
    pub shrinkage_amount: Decimal,
    #[n(4)]
    #[cbor(with = "cbor_decimal")]
    pub opening_inventory: Decimal, // IIB
    #[n(5)]
    #[cbor(with = "cbor_decimal")]
    pub purchases: Decimal, // C
    #[n(6)]
    #[cbor(with = "cbor_decimal")]
    pub purchases_per_control_doc: Decimal, // CCT
    #[n(7)]
    #[cbor(with = "cbor_decimal")]
    pub discounted_sales: Decimal, // V.DSC
    #[n(8)]
    #[cbor(with = "cbor_decimal")]
    pub closing_inventory_measured: Decimal, // IFFB
}

impl ProductFields {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn set_price(mut self, value: Decimal) -> Self {
        self.price = value;
        self
    }
    pub fn set_volume_sold(mut self, value: Decimal) -> Self {
        self.volume_sold = value;
        self
    }
    pub fn set_shrinkage_volume(mut self, value: Decimal) -> Self {
        self.shrinkage_volume = value;
        self
    }
    pub fn set_shrinkage_amount(mut self, value: Decimal) -> Self {
        self.shrinkage_amount = value;
        self
    }
    pub fn set_opening_inventory(mut self, value: Decimal) -> Self {
        self.opening_inventory = value;
        self
    }
    pub fn set_purchases(mut self, value: Decimal) -> Self {
        self.purchases = value;
        self
    }
    pub fn set_purchases_per_control_doc(mut self, value: Decimal) -> Self {
        self.purchases_per_control_doc = value;
        self
    }
    pub fn set_discounted_sales(mut self, value: Decimal) -> Self {
        self.discounted_sales = value;
        self
    }
    pub fn set_closing_inventory_measured(mut self, value: Decimal) -> Self {
        self.closing_inventory_measured = value;
        self
    }
    pub fn derive(&self) -> ProductFieldsDerived {
        calculator::derive(self)
    }
}

/// One station's report for one day.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub struct DailyReport {
    #[n(0)]
    pub id: String, // bech32, hrp `report_`
    #[n(1)]
    pub station_id: String,
    #[n(2)]
    #[cbor(with = "cbor_date")]
    pub date: NaiveDate,
    #[n(3)]
    pub premium: Option<ProductFields>,
    #[n(4)]
    pub regular: Option<ProductFields>,
    #[n(5)]
    pub diesel: Option<ProductFields>,
    #[n(6)]
    #[cbor(with = "cbor_decimal")]
    pub oils_amount: Decimal,
    #[n(7)]
    pub state: ReportState,
    #[n(8)]
    pub version: u64, // bumped on every persisted write
    #[n(9)]
    pub witnesses: Vec<Witness>,
}

/// The raw half of a report, used to fingerprint edits in the audit trail.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub struct RawFields {
    #[n(0)]
    pub premium: Option<ProductFields>,
    #[n(1)]
    pub regular: Option<ProductFields>,
    #[n(2)]
    pub diesel: Option<ProductFields>,
    #[n(3)]
    #[cbor(with = "cbor_decimal")]
    pub oils_amount: Decimal,
}

impl DailyReport {
    /// A zero-valued pending report with no product entries.
    pub fn new_manual(id: String, station_id: &str, date: NaiveDate) -> Self {
        Self {
            id,
            station_id: station_id.to_string(),
            date,
            premium: None,
            regular: None,
            diesel: None,
            oils_amount: Decimal::ZERO,
            state: ReportState::Pending,
            version: 1,
            witnesses: vec![],
        }
    }

    pub fn station_month(&self) -> StationMonth {
        StationMonth::of(&self.station_id, self.date)
    }

    pub fn product(&self, product: Product) -> Option<&ProductFields> {
        match product {
            Product::Premium => self.premium.as_ref(),
            Product::Regular => self.regular.as_ref(),
            Product::Diesel => self.diesel.as_ref(),
        }
    }

    pub fn product_mut(&mut self, product: Product) -> &mut Option<ProductFields> {
        match product {
            Product::Premium => &mut self.premium,
            Product::Regular => &mut self.regular,
            Product::Diesel => &mut self.diesel,
        }
    }

    pub fn set_product(mut self, product: Product, fields: ProductFields) -> Self {
        *self.product_mut(product) = Some(fields);
        self
    }

    /// Derived fields for one product, recomputed on every call.
    pub fn derived(&self, product: Product) -> Option<ProductFieldsDerived> {
        self.product(product).map(calculator::derive)
    }

    pub fn products(&self) -> impl Iterator<Item = (Product, &ProductFields)> {
        Product::ALL
            .into_iter()
            .filter_map(|p| self.product(p).map(|fields| (p, fields)))
    }

    pub fn raw_fields(&self) -> RawFields {
        RawFields {
            premium: self.premium.clone(),
            regular: self.regular.clone(),
            diesel: self.diesel.clone(),
            oils_amount: self.oils_amount,
        }
    }

    pub fn is_approved(&self) -> bool {
        self.state == ReportState::Approved
    }

    pub fn is_rejected(&self) -> bool {
        self.state == ReportState::Rejected
    }

    pub fn insert_witness(&mut self, witness: Witness) {
        self.witnesses.push(witness);
    }
}

/// Field edits for one product. `None` leaves the stored value untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProductPatch {
    pub price: Option<Decimal>,
    pub volume_sold: Option<Decimal>,
    pub shrinkage_volume: Option<Decimal>,
    pub shrinkage_amount: Option<Decimal>,
    pub opening_inventory: Option<Decimal>,
    pub purchases: Option<Decimal>,
    pub purchases_per_control_doc: Option<Decimal>,
    pub discounted_sales: Option<Decimal>,
    pub closing_inventory_measured: Option<Decimal>,
}

impl ProductPatch {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn set_price(mut self, value: Decimal) -> Self {
        self.price = Some(value);
        self
    }
    pub fn set_volume_sold(mut self, value: Decimal) -> Self {
        self.volume_sold = Some(value);
        self
    }
    pub fn set_shrinkage_volume(mut self, value: Decimal) -> Self {
        self.shrinkage_volume = Some(value);
        self
    }
    pub fn set_shrinkage_amount(mut self, value: Decimal) -> Self {
        self.shrinkage_amount = Some(value);
        self
    }
    pub fn set_opening_inventory(mut self, value: Decimal) -> Self {
        self.opening_inventory = Some(value);
        self
    }
    pub fn set_purchases(mut self, value: Decimal) -> Self {
        self.purchases = Some(value);
        self
    }
    pub fn set_purchases_per_control_doc(mut self, value: Decimal) -> Self {
        self.purchases_per_control_doc = Some(value);
        self
    }
    pub fn set_discounted_sales(mut self, value: Decimal) -> Self {
        self.discounted_sales = Some(value);
        self
    }
    pub fn set_closing_inventory_measured(mut self, value: Decimal) -> Self {
        self.closing_inventory_measured = Some(value);
        self
    }

    /// Sets a field from user input. Accepts both `camelCase` and
    /// `snake_case` field names.
    pub fn parse_field(mut self, field: &str, value: &str) -> Result<Self, ValidationError> {
        let slot = match field {
            "price" => &mut self.price,
            "volumeSold" | "volume_sold" => &mut self.volume_sold,
            "shrinkageVolume" | "shrinkage_volume" => &mut self.shrinkage_volume,
            "shrinkageAmount" | "shrinkage_amount" => &mut self.shrinkage_amount,
            "openingInventory" | "opening_inventory" => &mut self.opening_inventory,
            "purchases" => &mut self.purchases,
            "purchasesPerControlDoc" | "purchases_per_control_doc" => {
                &mut self.purchases_per_control_doc
            }
            "discountedSales" | "discounted_sales" => &mut self.discounted_sales,
            "closingInventoryMeasured" | "closing_inventory_measured" => {
                &mut self.closing_inventory_measured
            }
            other => return Err(ValidationError::UnknownField(other.to_string())),
        };
        *slot = Some(parse_decimal(field, value)?);
        Ok(self)
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    fn entries(&self) -> [(&'static str, Option<Decimal>); 9] {
        [
            ("price", self.price),
            ("volumeSold", self.volume_sold),
            ("shrinkageVolume", self.shrinkage_volume),
            ("shrinkageAmount", self.shrinkage_amount),
            ("openingInventory", self.opening_inventory),
            ("purchases", self.purchases),
            ("purchasesPerControlDoc", self.purchases_per_control_doc),
            ("discountedSales", self.discounted_sales),
            ("closingInventoryMeasured", self.closing_inventory_measured),
        ]
    }

    pub fn validate(&self, date: NaiveDate, product: Product) -> Result<(), ValidationError> {
        for (field, value) in self.entries() {
            if let Some(value) = value {
                check_raw_value(date, Some(product), field, value)?;
            }
        }
        Ok(())
    }

    pub fn apply(&self, fields: &mut ProductFields) {
        let pairs = [
            (self.price, &mut fields.price),
            (self.volume_sold, &mut fields.volume_sold),
            (self.shrinkage_volume, &mut fields.shrinkage_volume),
            (self.shrinkage_amount, &mut fields.shrinkage_amount),
            (self.opening_inventory, &mut fields.opening_inventory),
            (self.purchases, &mut fields.purchases),
            (
                self.purchases_per_control_doc,
                &mut fields.purchases_per_control_doc,
            ),
            (self.discounted_sales, &mut fields.discounted_sales),
            (
                self.closing_inventory_measured,
                &mut fields.closing_inventory_measured,
            ),
        ];
        for (value, slot) in pairs {
            if let Some(value) = value {
                *slot = value;
            }
        }
    }
}

/// A partial edit of a report's raw fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReportPatch {
    pub products: BTreeMap<Product, ProductPatch>,
    pub oils_amount: Option<Decimal>,
}

impl ReportPatch {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn product(mut self, product: Product, patch: ProductPatch) -> Self {
        self.products.insert(product, patch);
        self
    }
    pub fn set_oils_amount(mut self, value: Decimal) -> Self {
        self.oils_amount = Some(value);
        self
    }
    pub fn parse_oils_amount(mut self, value: &str) -> Result<Self, ValidationError> {
        self.oils_amount = Some(parse_decimal("oilsAmount", value)?);
        Ok(self)
    }

    /// Products with at least one field edit, in product order.
    pub fn touched_products(&self) -> Vec<Product> {
        self.products
            .iter()
            .filter(|(_, patch)| !patch.is_empty())
            .map(|(product, _)| *product)
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.oils_amount.is_none() && self.touched_products().is_empty()
    }

    pub fn validate(&self, date: NaiveDate) -> Result<(), ValidationError> {
        if self.is_empty() {
            return Err(ValidationError::EmptyPatch { date });
        }
        if let Some(value) = self.oils_amount {
            check_raw_value(date, None, "oilsAmount", value)?;
        }
        for (product, patch) in &self.products {
            patch.validate(date, *product)?;
        }
        Ok(())
    }
}

/// Upper bound for any raw quantity or amount. Far above a station's daily
/// figures, and far enough below `Decimal::MAX` that derivation and monthly
/// sums stay exact.
pub const MAX_RAW_VALUE: Decimal = Decimal::from_parts(0xD4A5_1000, 0xE8, 0, false, 0); // 10^12

fn check_raw_value(
    date: NaiveDate,
    product: Option<Product>,
    field: &'static str,
    value: Decimal,
) -> Result<(), ValidationError> {
    if value < Decimal::ZERO {
        return Err(ValidationError::Negative {
            date,
            product,
            field,
            value,
        });
    }
    if value > MAX_RAW_VALUE {
        return Err(ValidationError::TooLarge {
            date,
            product,
            field,
            value,
            max: MAX_RAW_VALUE,
        });
    }
    Ok(())
}

fn parse_decimal(field: &str, value: &str) -> Result<Decimal, ValidationError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::Missing {
            field: field.to_string(),
        });
    }
    Decimal::from_str(trimmed).map_err(|_| ValidationError::NotNumeric {
        field: field.to_string(),
        value: value.to_string(),
    })
}

// Decimal is stored as its 16-byte canonical form.
pub(crate) mod cbor_decimal {
    use rust_decimal::Decimal;

    pub fn encode<Ctx, W: minicbor::encode::Write>(
        value: &Decimal,
        e: &mut minicbor::Encoder<W>,
        _: &mut Ctx,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        e.bytes(&value.serialize())?.ok()
    }

    pub fn decode<'b, Ctx>(
        d: &mut minicbor::Decoder<'b>,
        _: &mut Ctx,
    ) -> Result<Decimal, minicbor::decode::Error> {
        let bytes: [u8; 16] = d
            .bytes()?
            .try_into()
            .map_err(|_| minicbor::decode::Error::message("decimal must be 16 bytes"))?;
        // flags: two unused bytes, the scale, then the sign bit
        if bytes[0] != 0 || bytes[1] != 0 || bytes[2] > 28 || bytes[3] & 0x7F != 0 {
            return Err(minicbor::decode::Error::message("decimal flags out of range"));
        }
        Ok(Decimal::deserialize(bytes))
    }
}

// Dates are stored as days from the common era.
pub(crate) mod cbor_date {
    use chrono::{Datelike, NaiveDate};

    pub fn encode<Ctx, W: minicbor::encode::Write>(
        value: &NaiveDate,
        e: &mut minicbor::Encoder<W>,
        _: &mut Ctx,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        e.i32(value.num_days_from_ce())?.ok()
    }

    pub fn decode<'b, Ctx>(
        d: &mut minicbor::Decoder<'b>,
        _: &mut Ctx,
    ) -> Result<NaiveDate, minicbor::decode::Error> {
        let days = d.i32()?;
        NaiveDate::from_num_days_from_ce_opt(days)
            .ok_or(minicbor::decode::Error::message("date out of range"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn report_encoding() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 5).unwrap();
        let original = DailyReport::new_manual("report_test".into(), "ST-001", date).set_product(
            Product::Diesel,
            ProductFields::new()
                .set_opening_inventory(dec!(1000.50))
                .set_closing_inventory_measured(dec!(-3.25)),
        );

        let encoding = minicbor::to_vec(&original).unwrap();
        let decode: DailyReport = minicbor::decode(&encoding).unwrap();

        assert_eq!(original, decode);
    }

    #[test]
    fn parse_field_accepts_both_spellings() {
        let patch = ProductPatch::new()
            .parse_field("closingInventoryMeasured", "300")
            .unwrap()
            .parse_field("volume_sold", " 12.5 ")
            .unwrap();

        assert_eq!(patch.closing_inventory_measured, Some(dec!(300)));
        assert_eq!(patch.volume_sold, Some(dec!(12.5)));
    }

    #[test]
    fn parse_field_rejects_garbage() {
        let err = ProductPatch::new().parse_field("price", "abc").unwrap_err();
        assert!(matches!(err, ValidationError::NotNumeric { .. }));

        let err = ProductPatch::new().parse_field("price", "  ").unwrap_err();
        assert!(matches!(err, ValidationError::Missing { .. }));

        let err = ProductPatch::new().parse_field("octane", "95").unwrap_err();
        assert!(matches!(err, ValidationError::UnknownField(_)));
    }

    #[test]
    fn station_month_rejects_bad_month() {
        assert!(StationMonth::new("ST-001", 2024, 13).is_err());
        assert_eq!(
            StationMonth::new("ST-001", 2024, 3).unwrap().key(),
            "ST-001/2024-03"
        );
    }

    fn decode_raw_decimal(bytes: [u8; 16]) -> Result<Decimal, minicbor::decode::Error> {
        let mut buffer = Vec::new();
        minicbor::Encoder::new(&mut buffer).bytes(&bytes).unwrap();
        cbor_decimal::decode(&mut minicbor::Decoder::new(&buffer), &mut ())
    }

    #[test]
    fn decimal_with_scale_past_28_fails_to_decode() {
        let mut bytes = dec!(1.5).serialize();
        assert_eq!(decode_raw_decimal(bytes).unwrap(), dec!(1.5));

        bytes[2] = 28;
        assert!(decode_raw_decimal(bytes).is_ok());

        bytes[2] = 29;
        assert!(decode_raw_decimal(bytes).is_err());
    }

    #[test]
    fn values_beyond_the_raw_bound_are_refused() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let patch = ProductPatch::new()
            .parse_field("openingInventory", "79228162514264337593543950335")
            .unwrap();

        let err = patch.validate(date, Product::Diesel).unwrap_err();
        assert!(matches!(
            err,
            ValidationError::TooLarge { field: "openingInventory", .. }
        ));

        let at_bound = ProductPatch::new().set_purchases(MAX_RAW_VALUE);
        assert!(at_bound.validate(date, Product::Diesel).is_ok());

        let oils = ReportPatch::new().set_oils_amount(MAX_RAW_VALUE + Decimal::ONE);
        assert!(matches!(
            oils.validate(date),
            Err(ValidationError::TooLarge { product: None, .. })
        ));
    }
}
