//! Staged input rows and their preparation for change detection.
//!
//! The staging loader is an external collaborator; it hands over one
//! [`StagedBatch`] per entity with raw text attributes. [`prepare`]
//! validates and types a row against its [`EntitySchema`], resolves
//! reference attributes, and computes the comparison digest. Rows that
//! fail are returned as [`RejectedRow`]s and never abort the batch.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::digest::RowDigest;
use crate::error::ClassificationError;
use crate::model::{EntityKind, RecordIdentity, TableId};
use crate::resolve::{ReferenceResolver, ResolutionStats};
use crate::schema::EntitySchema;
use crate::value::{AttributeType, Attributes, Value};

/// One raw row produced by the staging loader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedRow {
    pub natural_key: String,
    #[serde(default)]
    pub comparison_attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub display_attributes: BTreeMap<String, String>,
    pub source_system: String,
    pub source_entity: String,
    pub observed_at: DateTime<Utc>,
}

impl StagedRow {
    /// Starts a row with no attributes.
    pub fn new(
        natural_key: impl Into<String>,
        source_system: impl Into<String>,
        source_entity: impl Into<String>,
        observed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            natural_key: natural_key.into(),
            comparison_attributes: BTreeMap::new(),
            display_attributes: BTreeMap::new(),
            source_system: source_system.into(),
            source_entity: source_entity.into(),
            observed_at,
        }
    }

    /// Adds a comparison attribute.
    #[must_use]
    pub fn compare(mut self, name: &str, raw: impl Into<String>) -> Self {
        self.comparison_attributes.insert(name.to_string(), raw.into());
        self
    }

    /// Adds a display attribute.
    #[must_use]
    pub fn display(mut self, name: &str, raw: impl Into<String>) -> Self {
        self.display_attributes.insert(name.to_string(), raw.into());
        self
    }

    /// Identity as supplied, before validation.
    #[must_use]
    pub fn identity(&self) -> RecordIdentity {
        RecordIdentity::new(
            self.natural_key.trim(),
            self.source_system.trim(),
            self.source_entity.trim(),
        )
    }

    fn raw(&self, name: &str) -> Option<&str> {
        self.comparison_attributes
            .get(name)
            .or_else(|| self.display_attributes.get(name))
            .map(String::as_str)
    }
}

/// All staged rows of one entity for one merge invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedBatch {
    pub entity: EntityKind,
    pub rows: Vec<StagedRow>,
}

impl StagedBatch {
    #[must_use]
    pub fn new(entity: EntityKind, rows: Vec<StagedRow>) -> Self {
        Self { entity, rows }
    }
}

/// A validated, typed row ready for classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedRow {
    pub identity: RecordIdentity,
    pub attributes: Attributes,
    pub digest: RowDigest,
    pub observed_at: DateTime<Utc>,
}

impl PreparedRow {
    /// Builds a row from already-typed attributes, digesting `comparison`.
    pub fn from_attributes<'a>(
        identity: RecordIdentity,
        attributes: Attributes,
        comparison: impl IntoIterator<Item = &'a str>,
        observed_at: DateTime<Utc>,
    ) -> Self {
        let digest = RowDigest::of(&attributes, comparison);
        Self {
            identity,
            attributes,
            digest,
            observed_at,
        }
    }
}

/// A staged row excluded from the batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedRow {
    pub identity: RecordIdentity,
    pub error: ClassificationError,
}

/// Validates and types one staged row.
///
/// Reference attributes are resolved through `resolver`, preferring rows
/// from the same source system; misses become the unknown member and are
/// counted in `stats`.
///
/// # Errors
///
/// Returns a `ClassificationError` describing the first problem found.
pub fn prepare(
    schema: &EntitySchema,
    row: &StagedRow,
    resolver: &ReferenceResolver<'_>,
    stats: &mut ResolutionStats,
) -> Result<PreparedRow, ClassificationError> {
    let identity = row.identity();
    schema.check_natural_key(&identity.natural_key)?;
    if identity.source_system.is_empty() || identity.source_entity.is_empty() {
        return Err(ClassificationError::EmptySourceLabel);
    }

    if let Some(name) = row
        .comparison_attributes
        .keys()
        .chain(row.display_attributes.keys())
        .find(|name| schema.attribute(name).is_none())
    {
        return Err(ClassificationError::UnknownAttribute {
            entity: schema.entity(),
            name: name.clone(),
        });
    }

    let mut pending = Vec::new();
    let mut attributes = Attributes::new();
    for def in schema.attributes() {
        let value = match row.raw(&def.name) {
            Some(raw) => def.kind.parse(&def.name, raw)?,
            None => Value::Null,
        };
        if def.required && value.is_null() {
            return Err(ClassificationError::MissingAttribute {
                name: def.name.clone(),
            });
        }
        match (def.kind, value) {
            (AttributeType::Reference(target), Value::Text(natural_key)) => {
                pending.push((def.name.as_str(), target, natural_key));
            }
            (AttributeType::Reference(target), _) => {
                pending.push((def.name.as_str(), target, String::new()));
            }
            (_, value) => attributes.insert(def.name.clone(), value),
        }
    }

    // Resolve only once the row is known to be valid so rejected rows do
    // not skew the statistics.
    for (name, target, natural_key) in pending {
        let resolution = resolver.resolve(
            TableId::Conformed(target),
            &natural_key,
            Some(&identity.source_system),
        );
        stats.record(&format!("{}.{name}", schema.entity()), resolution);
        attributes.insert(name, Value::Key(resolution.key()));
    }

    Ok(PreparedRow::from_attributes(
        identity,
        attributes,
        schema.comparison_names(),
        row.observed_at,
    ))
}

/// Prepares every row of a batch, splitting accepted from rejected.
#[must_use]
pub fn prepare_batch(
    schema: &EntitySchema,
    rows: &[StagedRow],
    resolver: &ReferenceResolver<'_>,
) -> (Vec<PreparedRow>, Vec<RejectedRow>, ResolutionStats) {
    let mut stats = ResolutionStats::default();
    let mut accepted = Vec::with_capacity(rows.len());
    let mut rejected = Vec::new();
    for row in rows {
        match prepare(schema, row, resolver, &mut stats) {
            Ok(prepared) => accepted.push(prepared),
            Err(error) => rejected.push(RejectedRow {
                identity: row.identity(),
                error,
            }),
        }
    }
    (accepted, rejected, stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SurrogateKey;
    use crate::schema::SalesSchema;

    fn product(nk: &str, price: &str) -> StagedRow {
        StagedRow::new(nk, "erp", "products", Utc::now())
            .compare("price", price)
            .compare("cost", "4.00")
            .display("product_name", "Desk lamp")
    }

    #[test]
    fn prepares_typed_product() {
        let schema = SalesSchema::standard().unwrap();
        let resolver = ReferenceResolver::new();
        let mut stats = ResolutionStats::default();
        let products = schema.get(EntityKind::Product);
        let row = prepare(products, &product("P1", "10.00"), &resolver, &mut stats).unwrap();
        assert_eq!(row.attributes.decimal("price"), Value::decimal("10").unwrap().as_decimal());
        assert_eq!(row.attributes.text_or_unassigned("product_name"), "Desk lamp");
        assert!(row.attributes.get("category").unwrap().is_null());
    }

    #[test]
    fn malformed_price_is_rejected_not_fatal() {
        let schema = SalesSchema::standard().unwrap();
        let resolver = ReferenceResolver::new();
        let rows = vec![product("P1", "10.00"), product("P2", "ten")];
        let (accepted, rejected, _) =
            prepare_batch(schema.get(EntityKind::Product), &rows, &resolver);
        assert_eq!(accepted.len(), 1);
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].identity.natural_key, "P2");
    }

    #[test]
    fn unknown_attribute_is_rejected() {
        let schema = SalesSchema::standard().unwrap();
        let resolver = ReferenceResolver::new();
        let mut stats = ResolutionStats::default();
        let row = product("P1", "1").display("colour", "red");
        let err =
            prepare(schema.get(EntityKind::Product), &row, &resolver, &mut stats).unwrap_err();
        assert!(matches!(err, ClassificationError::UnknownAttribute { .. }));
    }

    #[test]
    fn missing_required_attribute_is_rejected() {
        let schema = SalesSchema::standard().unwrap();
        let resolver = ReferenceResolver::new();
        let mut stats = ResolutionStats::default();
        let row = StagedRow::new("P1", "erp", "products", Utc::now()).compare("price", "1");
        let err =
            prepare(schema.get(EntityKind::Product), &row, &resolver, &mut stats).unwrap_err();
        assert_eq!(err, ClassificationError::MissingAttribute { name: "cost".to_string() });
    }

    #[test]
    fn unresolved_reference_becomes_unknown_member() {
        let schema = SalesSchema::standard().unwrap();
        let resolver = ReferenceResolver::new();
        let mut stats = ResolutionStats::default();
        let row = StagedRow::new("BER", "erp", "cities", Utc::now())
            .compare("city_name", "Berlin")
            .compare("country_id", "DE");
        let prepared = prepare(schema.get(EntityKind::City), &row, &resolver, &mut stats).unwrap();
        assert_eq!(prepared.attributes.key("country_id"), SurrogateKey::new(-1));
        assert_eq!(stats.misses.get("city.country_id"), Some(&1));
    }

    #[test]
    fn staged_batch_deserializes_from_json() {
        let json = r#"{
            "entity": "country",
            "rows": [{
                "natural_key": "DE",
                "comparison_attributes": {"country_name": "Germany"},
                "source_system": "erp",
                "source_entity": "countries",
                "observed_at": "2024-01-01T00:00:00Z"
            }]
        }"#;
        let batch: StagedBatch = serde_json::from_str(json).unwrap();
        assert_eq!(batch.entity, EntityKind::Country);
        assert!(batch.rows[0].display_attributes.is_empty());
    }
}
