//! Entity schemas: attribute types, comparison sets and merge policy.
//!
//! The comparison set of an entity is the subset of attributes whose
//! change matters. A row whose comparison set is unchanged is left alone
//! even if its display attributes differ.

use regex::Regex;

use crate::error::{ClassificationError, ValidationError};
use crate::model::{EntityKind, IdentityScope, MergePolicy, UNASSIGNED_LABEL, UNKNOWN_MEMBER_KEY};
use crate::value::{AttributeType, Attributes, Value};

/// Whether an attribute participates in change detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeRole {
    /// Part of the comparison set.
    Comparison,
    /// Carried along but never triggers a change.
    Display,
}

/// One attribute of an entity.
#[derive(Debug, Clone)]
pub struct AttributeDef {
    pub name: String,
    pub kind: AttributeType,
    pub role: AttributeRole,
    pub required: bool,
}

impl AttributeDef {
    fn new(name: &str, kind: AttributeType, role: AttributeRole, required: bool) -> Self {
        Self {
            name: name.to_string(),
            kind,
            role,
            required,
        }
    }

    /// Optional comparison attribute.
    #[must_use]
    pub fn compare(name: &str, kind: AttributeType) -> Self {
        Self::new(name, kind, AttributeRole::Comparison, false)
    }

    /// Required comparison attribute.
    #[must_use]
    pub fn compare_required(name: &str, kind: AttributeType) -> Self {
        Self::new(name, kind, AttributeRole::Comparison, true)
    }

    /// Optional display attribute.
    #[must_use]
    pub fn display(name: &str, kind: AttributeType) -> Self {
        Self::new(name, kind, AttributeRole::Display, false)
    }

    /// Referenced entity, if this is a reference attribute.
    #[must_use]
    pub const fn reference(&self) -> Option<EntityKind> {
        match self.kind {
            AttributeType::Reference(target) => Some(target),
            _ => None,
        }
    }
}

/// Schema of one conformed entity.
#[derive(Debug, Clone)]
pub struct EntitySchema {
    entity: EntityKind,
    policy: MergePolicy,
    scope: IdentityScope,
    key_pattern: Option<Regex>,
    attributes: Vec<AttributeDef>,
}

impl EntitySchema {
    /// Creates a schema.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::InconsistentSchema` when attribute names
    /// repeat or the comparison set is empty.
    pub fn new(
        entity: EntityKind,
        policy: MergePolicy,
        attributes: Vec<AttributeDef>,
    ) -> Result<Self, ValidationError> {
        for (idx, attr) in attributes.iter().enumerate() {
            if attributes[..idx].iter().any(|a| a.name == attr.name) {
                return Err(ValidationError::InconsistentSchema {
                    entity,
                    reason: format!("attribute '{}' declared twice", attr.name),
                });
            }
        }
        if !attributes.iter().any(|a| a.role == AttributeRole::Comparison) {
            return Err(ValidationError::InconsistentSchema {
                entity,
                reason: "comparison attribute set is empty".to_string(),
            });
        }
        Ok(Self {
            entity,
            policy,
            scope: IdentityScope::PerSource,
            key_pattern: None,
            attributes,
        })
    }

    /// Sets the identity scope.
    #[must_use]
    pub fn with_scope(mut self, scope: IdentityScope) -> Self {
        self.scope = scope;
        self
    }

    /// Requires natural keys to match `pattern`.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::InvalidKeyPattern` if the regex does not compile.
    pub fn with_key_pattern(mut self, pattern: &str) -> Result<Self, ValidationError> {
        let re = Regex::new(pattern).map_err(|e| ValidationError::InvalidKeyPattern {
            entity: self.entity,
            reason: e.to_string(),
        })?;
        self.key_pattern = Some(re);
        Ok(self)
    }

    #[must_use]
    pub const fn entity(&self) -> EntityKind {
        self.entity
    }

    #[must_use]
    pub const fn policy(&self) -> MergePolicy {
        self.policy
    }

    #[must_use]
    pub const fn scope(&self) -> IdentityScope {
        self.scope
    }

    #[must_use]
    pub fn attributes(&self) -> &[AttributeDef] {
        &self.attributes
    }

    #[must_use]
    pub fn attribute(&self, name: &str) -> Option<&AttributeDef> {
        self.attributes.iter().find(|a| a.name == name)
    }

    /// Comparison attribute names in declaration order.
    pub fn comparison_names(&self) -> impl Iterator<Item = &str> {
        self.attributes
            .iter()
            .filter(|a| a.role == AttributeRole::Comparison)
            .map(|a| a.name.as_str())
    }

    /// Attributes of the unknown-member row: the unassigned label for
    /// text, the unknown member for references, null otherwise.
    #[must_use]
    pub fn unknown_member_attributes(&self) -> Attributes {
        self.attributes
            .iter()
            .map(|a| {
                let value = match a.kind {
                    AttributeType::Text => Value::from(UNASSIGNED_LABEL),
                    AttributeType::Reference(_) => Value::Key(UNKNOWN_MEMBER_KEY),
                    AttributeType::Decimal | AttributeType::Integer | AttributeType::Date => {
                        Value::Null
                    }
                };
                (a.name.clone(), value)
            })
            .collect()
    }

    /// Reference attributes and their targets.
    pub fn references(&self) -> impl Iterator<Item = (&str, EntityKind)> {
        self.attributes
            .iter()
            .filter_map(|a| a.reference().map(|target| (a.name.as_str(), target)))
    }

    /// Validates a staged natural key.
    ///
    /// # Errors
    ///
    /// Empty, reserved or malformed keys are classification errors.
    pub fn check_natural_key(&self, natural_key: &str) -> Result<(), ClassificationError> {
        if natural_key.trim().is_empty() {
            return Err(ClassificationError::EmptyNaturalKey);
        }
        if natural_key.eq_ignore_ascii_case(UNASSIGNED_LABEL) {
            return Err(ClassificationError::ReservedNaturalKey {
                natural_key: natural_key.to_string(),
            });
        }
        if let Some(re) = &self.key_pattern {
            if !re.is_match(natural_key) {
                return Err(ClassificationError::MalformedNaturalKey {
                    natural_key: natural_key.to_string(),
                    pattern: re.as_str().to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Schemas for every conformed entity of the sales model.
#[derive(Debug, Clone)]
pub struct SalesSchema {
    entities: Vec<EntitySchema>,
}

impl SalesSchema {
    /// The standard sales model.
    ///
    /// # Errors
    ///
    /// Only fails if the built-in definitions are inconsistent.
    pub fn standard() -> Result<Self, ValidationError> {
        use AttributeDef as A;
        use AttributeType as T;

        let entities = vec![
            EntitySchema::new(
                EntityKind::Country,
                MergePolicy::Overwrite,
                vec![A::compare_required("country_name", T::Text)],
            )?
            .with_key_pattern(r"^[A-Z]{2,3}$")?,
            EntitySchema::new(
                EntityKind::City,
                MergePolicy::Overwrite,
                vec![
                    A::compare_required("city_name", T::Text),
                    A::compare("country_id", T::Reference(EntityKind::Country)),
                ],
            )?,
            EntitySchema::new(
                EntityKind::Address,
                MergePolicy::Overwrite,
                vec![
                    A::compare_required("address_line", T::Text),
                    A::compare("postal_code", T::Text),
                    A::compare("city_id", T::Reference(EntityKind::City)),
                ],
            )?,
            EntitySchema::new(
                EntityKind::Customer,
                MergePolicy::Overwrite,
                vec![
                    A::display("customer_type", T::Text),
                    A::display("first_name", T::Text),
                    A::compare("last_name", T::Text),
                    A::compare("company_name", T::Text),
                    A::compare("email", T::Text),
                    A::compare("address_id", T::Reference(EntityKind::Address)),
                ],
            )?,
            EntitySchema::new(
                EntityKind::Product,
                MergePolicy::Versioned,
                vec![
                    A::display("product_name", T::Text),
                    A::display("category", T::Text),
                    A::compare_required("price", T::Decimal),
                    A::compare_required("cost", T::Decimal),
                ],
            )?,
            EntitySchema::new(
                EntityKind::Discount,
                MergePolicy::Overwrite,
                vec![
                    A::display("discount_name", T::Text),
                    A::compare_required("discount_rate", T::Decimal),
                ],
            )?,
            EntitySchema::new(
                EntityKind::Order,
                MergePolicy::Overwrite,
                vec![
                    A::display("order_number", T::Text),
                    A::compare_required("order_date", T::Date),
                    A::compare_required("quantity", T::Integer),
                    A::compare("status", T::Text),
                    A::compare("customer_id", T::Reference(EntityKind::Customer)),
                    A::compare("product_id", T::Reference(EntityKind::Product)),
                    A::compare("discount_id", T::Reference(EntityKind::Discount)),
                ],
            )?,
            EntitySchema::new(
                EntityKind::Payment,
                MergePolicy::Overwrite,
                vec![
                    A::display("payment_date", T::Date),
                    A::compare("payment_method", T::Text),
                    A::compare_required("amount", T::Decimal),
                    A::compare("order_line_id", T::Reference(EntityKind::Order)),
                ],
            )?,
        ];

        Ok(Self { entities })
    }

    /// Schema of `entity`.
    #[must_use]
    pub fn get(&self, entity: EntityKind) -> &EntitySchema {
        // `entities` always holds one schema per kind in `EntityKind::ALL` order.
        &self.entities[EntityKind::ALL
            .iter()
            .position(|k| *k == entity)
            .unwrap_or_default()]
    }

    /// Replaces the schema of one entity.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::InconsistentSchema` if a reference
    /// attribute points at an entity that loads later.
    pub fn with_entity(mut self, schema: EntitySchema) -> Result<Self, ValidationError> {
        let pos = |kind: EntityKind| {
            EntityKind::ALL
                .iter()
                .position(|k| *k == kind)
                .unwrap_or_default()
        };
        let own = pos(schema.entity());
        for (name, target) in schema.references() {
            if pos(target) >= own {
                return Err(ValidationError::InconsistentSchema {
                    entity: schema.entity(),
                    reason: format!(
                        "reference '{name}' targets {target}, which does not load earlier"
                    ),
                });
            }
        }
        self.entities[own] = schema;
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_schema_covers_every_entity_in_order() {
        let schema = SalesSchema::standard().unwrap();
        for kind in EntityKind::ALL {
            assert_eq!(schema.get(kind).entity(), kind);
        }
        assert_eq!(schema.get(EntityKind::Product).policy(), MergePolicy::Versioned);
        assert_eq!(schema.get(EntityKind::Customer).policy(), MergePolicy::Overwrite);
    }

    #[test]
    fn product_comparison_set_is_price_and_cost() {
        let schema = SalesSchema::standard().unwrap();
        let names: Vec<_> = schema.get(EntityKind::Product).comparison_names().collect();
        assert_eq!(names, vec!["price", "cost"]);
    }

    #[test]
    fn references_point_at_earlier_entities() {
        let schema = SalesSchema::standard().unwrap();
        let refs: Vec<_> = schema.get(EntityKind::Order).references().collect();
        assert_eq!(
            refs,
            vec![
                ("customer_id", EntityKind::Customer),
                ("product_id", EntityKind::Product),
                ("discount_id", EntityKind::Discount),
            ]
        );
    }

    #[test]
    fn unknown_member_attributes_use_sentinels() {
        let schema = SalesSchema::standard().unwrap();
        let attrs = schema.get(EntityKind::City).unknown_member_attributes();
        assert_eq!(attrs.text_or_unassigned("city_name"), UNASSIGNED_LABEL);
        assert_eq!(attrs.key("country_id"), UNKNOWN_MEMBER_KEY);
        let product = schema.get(EntityKind::Product).unknown_member_attributes();
        assert!(product.get("price").unwrap().is_null());
    }

    #[test]
    fn duplicate_attribute_is_rejected() {
        let err = EntitySchema::new(
            EntityKind::Country,
            MergePolicy::Overwrite,
            vec![
                AttributeDef::compare("country_name", AttributeType::Text),
                AttributeDef::display("country_name", AttributeType::Text),
            ],
        )
        .unwrap_err();
        assert!(err.to_string().contains("declared twice"));
    }

    #[test]
    fn forward_reference_is_rejected() {
        let city = EntitySchema::new(
            EntityKind::City,
            MergePolicy::Overwrite,
            vec![AttributeDef::compare("order_id", AttributeType::Reference(EntityKind::Order))],
        )
        .unwrap();
        let err = SalesSchema::standard().unwrap().with_entity(city).unwrap_err();
        assert!(err.to_string().contains("does not load earlier"));
    }

    #[test]
    fn natural_key_checks() {
        let schema = SalesSchema::standard().unwrap();
        let country = schema.get(EntityKind::Country);
        assert!(country.check_natural_key("DE").is_ok());
        assert!(matches!(
            country.check_natural_key("germany"),
            Err(ClassificationError::MalformedNaturalKey { .. })
        ));
        assert!(matches!(
            country.check_natural_key(" "),
            Err(ClassificationError::EmptyNaturalKey)
        ));
        assert!(matches!(
            schema.get(EntityKind::City).check_natural_key("N.A."),
            Err(ClassificationError::ReservedNaturalKey { .. })
        ));
    }
}
