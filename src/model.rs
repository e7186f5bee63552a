//! Core identity types for the conformed, dimension and fact layers.
//!
//! Every row in the warehouse is addressed two ways:
//! - a [`SurrogateKey`]: meaningless, immutable, assigned once on insert
//! - a [`RecordIdentity`]: the business identity supplied by a source
//!   (natural key plus the source system and source entity it came from)
//!
//! The sentinel values used for unresolved references live here and are
//! shared by every component.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Surrogate key reserved for the "unknown member" row of every table.
pub const UNKNOWN_MEMBER_KEY: SurrogateKey = SurrogateKey(-1);

/// Label stored in text attributes of unknown-member rows and treated as
/// "no value" when it appears as a staged reference.
pub const UNASSIGNED_LABEL: &str = "n.a.";

/// Source label carried by rows that the warehouse creates itself.
pub const MANUAL_SOURCE: &str = "MANUAL";

/// Seconds since the epoch of 9999-12-31T00:00:00Z.
const OPEN_ENDED_VALIDITY_SECS: i64 = 253_402_214_400;

/// Upper bound of the validity window of an active version.
#[must_use]
pub fn open_ended_validity() -> DateTime<Utc> {
    Utc.timestamp_opt(OPEN_ENDED_VALIDITY_SECS, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Internally generated row identifier.
///
/// # Examples
///
/// ```
/// use starmerge::{SurrogateKey, UNKNOWN_MEMBER_KEY};
///
/// assert!(UNKNOWN_MEMBER_KEY.is_unknown());
/// assert!(!SurrogateKey::new(1).is_unknown());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SurrogateKey(i64);

impl SurrogateKey {
    /// Wraps a raw key value.
    #[must_use]
    pub const fn new(value: i64) -> Self {
        Self(value)
    }

    /// Returns the raw key value.
    #[must_use]
    pub const fn get(self) -> i64 {
        self.0
    }

    /// Returns true for the unknown-member sentinel.
    #[must_use]
    pub const fn is_unknown(self) -> bool {
        self.0 == UNKNOWN_MEMBER_KEY.0
    }
}

impl fmt::Display for SurrogateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Business identity of a conformed row.
///
/// Field order matters: the derived `Ord` is the deterministic tie-break
/// used whenever several identities compete for one natural key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordIdentity {
    /// Source-provided business identifier.
    pub natural_key: String,
    /// Source system label (e.g. "crm", "webshop").
    pub source_system: String,
    /// Source entity label within that system (e.g. "customers").
    pub source_entity: String,
}

impl RecordIdentity {
    /// Creates an identity.
    pub fn new(
        natural_key: impl Into<String>,
        source_system: impl Into<String>,
        source_entity: impl Into<String>,
    ) -> Self {
        Self {
            natural_key: natural_key.into(),
            source_system: source_system.into(),
            source_entity: source_entity.into(),
        }
    }

    /// Identity of the unknown-member row.
    #[must_use]
    pub fn unknown_member() -> Self {
        Self::new(UNASSIGNED_LABEL, MANUAL_SOURCE, MANUAL_SOURCE)
    }

    /// Returns true for the unknown-member identity.
    #[must_use]
    pub fn is_unknown_member(&self) -> bool {
        self.natural_key == UNASSIGNED_LABEL
            && self.source_system == MANUAL_SOURCE
            && self.source_entity == MANUAL_SOURCE
    }
}

impl fmt::Display for RecordIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}/{}", self.natural_key, self.source_system, self.source_entity)
    }
}

/// Business concepts of the conformed layer.
///
/// [`EntityKind::ALL`] lists them in load dependency order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// Country (geography root).
    Country,
    /// City, references a country.
    City,
    /// Postal address, references a city.
    Address,
    /// Individual or company customer, references an address.
    Customer,
    /// Product with tracked price history.
    Product,
    /// Discount scheme.
    Discount,
    /// Order line, references customer, product and discount.
    Order,
    /// Payment, references an order line.
    Payment,
}

impl EntityKind {
    /// All entities in load dependency order.
    pub const ALL: [Self; 8] = [
        Self::Country,
        Self::City,
        Self::Address,
        Self::Customer,
        Self::Product,
        Self::Discount,
        Self::Order,
        Self::Payment,
    ];

    /// Stable lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Country => "country",
            Self::City => "city",
            Self::Address => "address",
            Self::Customer => "customer",
            Self::Product => "product",
            Self::Discount => "discount",
            Self::Order => "order",
            Self::Payment => "payment",
        }
    }

    /// Name of the conformed table.
    #[must_use]
    pub const fn table_name(self) -> &'static str {
        match self {
            Self::Country => "ce_countries",
            Self::City => "ce_cities",
            Self::Address => "ce_addresses",
            Self::Customer => "ce_customers",
            Self::Product => "ce_products_scd",
            Self::Discount => "ce_discounts",
            Self::Order => "ce_orders",
            Self::Payment => "ce_payments",
        }
    }

    /// Entities that must be loaded before this one within a run.
    #[must_use]
    pub const fn dependencies(self) -> &'static [Self] {
        match self {
            Self::Country => &[],
            Self::City => &[Self::Country],
            Self::Address => &[Self::City],
            Self::Customer => &[Self::Address],
            Self::Product | Self::Discount => &[Self::Address],
            Self::Order => &[Self::Customer, Self::Product, Self::Discount],
            Self::Payment => &[Self::Order],
        }
    }

    const fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown entity '{s}'"))
    }
}

/// Dimension projections built from the conformed layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DimensionKind {
    /// Customers with resolved address text.
    Customer,
    /// Versioned products.
    Product,
    /// Discounts.
    Discount,
    /// Payments.
    Payment,
}

impl DimensionKind {
    /// All dimensions in projection order.
    pub const ALL: [Self; 4] = [Self::Customer, Self::Product, Self::Discount, Self::Payment];

    /// Name of the dimension table.
    #[must_use]
    pub const fn table_name(self) -> &'static str {
        match self {
            Self::Customer => "dim_customers",
            Self::Product => "dim_products_scd",
            Self::Discount => "dim_discounts",
            Self::Payment => "dim_payments",
        }
    }

    /// Conformed entities the projection reads.
    #[must_use]
    pub const fn sources(self) -> &'static [EntityKind] {
        match self {
            Self::Customer => &[
                EntityKind::Customer,
                EntityKind::Address,
                EntityKind::City,
                EntityKind::Country,
            ],
            Self::Product => &[EntityKind::Product],
            Self::Discount => &[EntityKind::Discount],
            Self::Payment => &[EntityKind::Payment],
        }
    }

    const fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for DimensionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table_name())
    }
}

/// Addresses one table of the warehouse.
///
/// Serialized as its table name so it can key JSON maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TableId {
    /// Conformed (normalized, source-reconciled) table.
    Conformed(EntityKind),
    /// Dimension projection.
    Dimension(DimensionKind),
    /// The date-partitioned sales fact.
    Facts,
}

/// Name of the fact table.
pub const FACT_TABLE_NAME: &str = "fact_sales";

impl TableId {
    /// Number of tables in the warehouse.
    pub const COUNT: usize = EntityKind::ALL.len() + DimensionKind::ALL.len() + 1;

    /// Every table: conformed first, then dimensions, then facts.
    #[must_use]
    pub fn all() -> Vec<Self> {
        EntityKind::ALL
            .into_iter()
            .map(Self::Conformed)
            .chain(DimensionKind::ALL.into_iter().map(Self::Dimension))
            .chain(std::iter::once(Self::Facts))
            .collect()
    }

    /// Physical table name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Conformed(kind) => kind.table_name(),
            Self::Dimension(kind) => kind.table_name(),
            Self::Facts => FACT_TABLE_NAME,
        }
    }

    /// Dense index in `0..TableId::COUNT`.
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::Conformed(kind) => kind.index(),
            Self::Dimension(kind) => EntityKind::ALL.len() + kind.index(),
            Self::Facts => Self::COUNT - 1,
        }
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl TryFrom<String> for TableId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::all()
            .into_iter()
            .find(|id| id.name() == value)
            .ok_or_else(|| format!("unknown table '{value}'"))
    }
}

impl From<TableId> for String {
    fn from(id: TableId) -> Self {
        id.name().to_string()
    }
}

/// How a table reacts to a changed comparison attribute set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    /// Type-1: overwrite in place, no history.
    Overwrite,
    /// Type-2: retire the active version and open a new one.
    Versioned,
}

/// Which fields make a conformed row unique.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityScope {
    /// (natural key, source system, source entity).
    #[default]
    PerSource,
    /// Natural key alone; competing sources are tie-broken by label.
    Global,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_member_identity_is_recognized() {
        assert!(RecordIdentity::unknown_member().is_unknown_member());
        assert!(!RecordIdentity::new("n.a.", "crm", "customers").is_unknown_member());
    }

    #[test]
    fn identity_order_prefers_smallest_source_label() {
        let a = RecordIdentity::new("DE", "erp", "countries");
        let b = RecordIdentity::new("DE", "crm", "countries");
        assert!(b < a);
    }

    #[test]
    fn table_ids_are_dense_and_roundtrip_through_names() {
        let all = TableId::all();
        assert_eq!(all.len(), TableId::COUNT);
        for (idx, id) in all.iter().enumerate() {
            assert_eq!(id.index(), idx);
            assert_eq!(TableId::try_from(id.name().to_string()).unwrap(), *id);
        }
        assert!(TableId::try_from("nope".to_string()).is_err());
    }

    #[test]
    fn dependencies_point_backwards_in_load_order() {
        for (pos, kind) in EntityKind::ALL.iter().enumerate() {
            for dep in kind.dependencies() {
                let dep_pos = EntityKind::ALL.iter().position(|k| k == dep).unwrap();
                assert!(dep_pos < pos, "{kind} depends on later {dep}");
            }
        }
    }

    #[test]
    fn open_ended_validity_is_far_future() {
        let end = open_ended_validity();
        assert_eq!(end.format("%Y-%m-%d").to_string(), "9999-12-31");
    }

    #[test]
    fn entity_kind_parses_case_insensitively() {
        assert_eq!("Product".parse::<EntityKind>().unwrap(), EntityKind::Product);
        assert!("widget".parse::<EntityKind>().is_err());
    }
}
