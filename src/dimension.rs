//! Dimension projections of the conformed layer.
//!
//! Each dimension is rebuilt from committed conformed snapshots as a batch
//! of [`PreparedRow`]s and then goes through the same change detection and
//! merge as a conformed load. Dimension rows carry the conformed identity
//! but live in their own key space.

use chrono::{Datelike, NaiveDate};

use crate::model::{DimensionKind, EntityKind, MergePolicy, TableId, UNASSIGNED_LABEL};
use crate::resolve::ReferenceResolver;
use crate::staging::PreparedRow;
use crate::table::Row;
use crate::value::{Attributes, Value};

/// Merge policy of a dimension table.
#[must_use]
pub const fn policy(kind: DimensionKind) -> MergePolicy {
    match kind {
        DimensionKind::Product => MergePolicy::Versioned,
        DimensionKind::Customer | DimensionKind::Discount | DimensionKind::Payment => {
            MergePolicy::Overwrite
        }
    }
}

/// Attributes whose change updates a dimension row.
#[must_use]
pub const fn comparison_names(kind: DimensionKind) -> &'static [&'static str] {
    match kind {
        DimensionKind::Customer => &[
            "customer_name",
            "customer_type",
            "email",
            "full_address",
            "city_name",
            "country_name",
        ],
        DimensionKind::Product => &["price", "cost"],
        DimensionKind::Discount => &["discount_name", "discount_rate"],
        DimensionKind::Payment => &["payment_method", "payment_date", "amount"],
    }
}

const fn text_columns(kind: DimensionKind) -> &'static [&'static str] {
    match kind {
        DimensionKind::Customer => &[
            "customer_name",
            "customer_type",
            "email",
            "full_address",
            "city_name",
            "country_name",
        ],
        DimensionKind::Product => &["product_name", "category"],
        DimensionKind::Discount => &["discount_name"],
        DimensionKind::Payment => &["payment_method"],
    }
}

/// Attributes of a dimension's unknown-member row.
#[must_use]
pub fn unknown_member_attributes(kind: DimensionKind) -> Attributes {
    let mut attributes: Attributes = text_columns(kind)
        .iter()
        .map(|name| ((*name).to_string(), Value::from(UNASSIGNED_LABEL)))
        .collect();
    for name in comparison_names(kind) {
        if attributes.get(name).is_none() {
            attributes.insert(*name, Value::Null);
        }
    }
    attributes
}

fn text(value: Option<&Value>) -> Option<&str> {
    value
        .and_then(Value::as_text)
        .filter(|s| !s.is_empty() && !s.eq_ignore_ascii_case(UNASSIGNED_LABEL))
}

fn text_value(value: Option<&str>) -> Value {
    Value::from(value.unwrap_or(UNASSIGNED_LABEL))
}

/// Builds the projected rows of `kind` from the conformed snapshots held
/// by `conformed`. Missing snapshots project to an empty batch.
#[must_use]
pub fn project(kind: DimensionKind, conformed: &ReferenceResolver<'_>) -> Vec<PreparedRow> {
    let Some(&primary) = kind.sources().first() else {
        return Vec::new();
    };
    let Some(source) = conformed.table(TableId::Conformed(primary)) else {
        tracing::warn!(dimension = %kind, "no conformed snapshot to project from");
        return Vec::new();
    };

    source
        .data_rows()
        .filter(|row| row.is_active())
        .map(|row| {
            let attributes = match kind {
                DimensionKind::Customer => customer(row, conformed),
                DimensionKind::Product => copy(row, &["product_name", "category", "price", "cost"]),
                DimensionKind::Discount => copy(row, &["discount_name", "discount_rate"]),
                DimensionKind::Payment => copy(row, &["payment_method", "payment_date", "amount"]),
            };
            PreparedRow::from_attributes(
                row.identity.clone(),
                attributes,
                comparison_names(kind).iter().copied(),
                row.update_dt,
            )
        })
        .collect()
}

fn copy(row: &Row, names: &[&str]) -> Attributes {
    names
        .iter()
        .map(|name| ((*name).to_string(), row.attributes.get(name).cloned().unwrap_or(Value::Null)))
        .collect()
}

fn customer(row: &Row, conformed: &ReferenceResolver<'_>) -> Attributes {
    let attrs = &row.attributes;
    let follow = move |entity: EntityKind, key| conformed.row(TableId::Conformed(entity), key);
    let address = follow(EntityKind::Address, attrs.key("address_id"));
    let city = address.and_then(|a| follow(EntityKind::City, a.attributes.key("city_id")));
    let country = city.and_then(|c| follow(EntityKind::Country, c.attributes.key("country_id")));

    let person = [text(attrs.get("first_name")), text(attrs.get("last_name"))]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join(" ");
    let customer_name =
        text(attrs.get("company_name")).or(Some(person.as_str()).filter(|p| !p.is_empty()));

    let address_line = address.and_then(|a| text(a.attributes.get("address_line")));
    let postal_code = address.and_then(|a| text(a.attributes.get("postal_code")));
    let city_name = city.and_then(|c| text(c.attributes.get("city_name")));
    let country_name = country.and_then(|c| text(c.attributes.get("country_name")));
    let full_address = format!(
        "{}, {} {}, {}",
        address_line.unwrap_or(UNASSIGNED_LABEL),
        postal_code.unwrap_or(UNASSIGNED_LABEL),
        city_name.unwrap_or(UNASSIGNED_LABEL),
        country_name.unwrap_or(UNASSIGNED_LABEL),
    );

    Attributes::new()
        .with("customer_name", text_value(customer_name))
        .with("customer_type", text_value(text(attrs.get("customer_type"))))
        .with("email", text_value(text(attrs.get("email"))))
        .with("full_address", Value::from(full_address))
        .with("city_name", text_value(city_name))
        .with("country_name", text_value(country_name))
}

/// `yyyymmdd` key of a calendar date.
#[must_use]
pub fn date_key(date: NaiveDate) -> i32 {
    date.year() * 10_000 + i32::try_from(date.month() * 100 + date.day()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::RowDigest;
    use crate::model::{RecordIdentity, SurrogateKey};
    use crate::table::{Table, VersionState};
    use crate::time::ValidityWindow;
    use chrono::Utc;

    fn insert(
        table: &mut Table,
        key: i64,
        nk: &str,
        attributes: Attributes,
        version: Option<VersionState>,
    ) {
        let now = Utc::now();
        table
            .insert(Row {
                key: SurrogateKey::new(key),
                identity: RecordIdentity::new(nk, "erp", "src"),
                digest: RowDigest::of(&attributes, []),
                attributes,
                version,
                insert_dt: now,
                update_dt: now,
            })
            .unwrap();
    }

    fn conformed(kind: EntityKind, policy: MergePolicy) -> Table {
        Table::new(TableId::Conformed(kind), policy)
    }

    #[test]
    fn customer_projection_denormalizes_geography() {
        let mut countries = conformed(EntityKind::Country, MergePolicy::Overwrite);
        insert(&mut countries, 1, "DE", Attributes::new().with("country_name", "Germany"), None);
        let mut cities = conformed(EntityKind::City, MergePolicy::Overwrite);
        insert(
            &mut cities,
            1,
            "BER",
            Attributes::new().with("city_name", "Berlin").with("country_id", SurrogateKey::new(1)),
            None,
        );
        let mut addresses = conformed(EntityKind::Address, MergePolicy::Overwrite);
        insert(
            &mut addresses,
            1,
            "A1",
            Attributes::new()
                .with("address_line", "Hauptstr. 1")
                .with("postal_code", "10115")
                .with("city_id", SurrogateKey::new(1)),
            None,
        );
        let mut customers = conformed(EntityKind::Customer, MergePolicy::Overwrite);
        insert(
            &mut customers,
            1,
            "C1",
            Attributes::new()
                .with("first_name", "Ada")
                .with("last_name", "Lovelace")
                .with("company_name", Value::Null)
                .with("address_id", SurrogateKey::new(1)),
            None,
        );
        insert(
            &mut customers,
            2,
            "C2",
            Attributes::new()
                .with("company_name", "ACME")
                .with("address_id", SurrogateKey::new(-1)),
            None,
        );

        let resolver = ReferenceResolver::new()
            .with_table(&countries)
            .with_table(&cities)
            .with_table(&addresses)
            .with_table(&customers);
        let rows = project(DimensionKind::Customer, &resolver);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].attributes.text_or_unassigned("customer_name"), "Ada Lovelace");
        assert_eq!(
            rows[0].attributes.text_or_unassigned("full_address"),
            "Hauptstr. 1, 10115 Berlin, Germany"
        );
        assert_eq!(rows[1].attributes.text_or_unassigned("customer_name"), "ACME");
        assert_eq!(rows[1].attributes.text_or_unassigned("full_address"), "n.a., n.a. n.a., n.a.");
        assert_eq!(rows[1].attributes.text_or_unassigned("country_name"), "n.a.");
    }

    #[test]
    fn product_projection_skips_retired_versions() {
        let mut products = conformed(EntityKind::Product, MergePolicy::Versioned);
        let now = Utc::now();
        let mut retired = ValidityWindow::open_at(now);
        retired.close_at(now).unwrap();
        insert(
            &mut products,
            1,
            "P1",
            Attributes::new().with("price", Value::decimal("10").unwrap()),
            Some(VersionState { is_active: false, window: retired }),
        );
        insert(
            &mut products,
            2,
            "P1",
            Attributes::new().with("price", Value::decimal("12").unwrap()),
            Some(VersionState { is_active: true, window: ValidityWindow::open_at(now) }),
        );
        let resolver = ReferenceResolver::new().with_table(&products);
        let rows = project(DimensionKind::Product, &resolver);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].attributes.decimal("price"), Value::decimal("12").unwrap().as_decimal());
        assert!(rows[0].attributes.get("cost").unwrap().is_null());
    }

    #[test]
    fn unknown_member_attributes_cover_comparison_set() {
        let attrs = unknown_member_attributes(DimensionKind::Payment);
        assert_eq!(attrs.text_or_unassigned("payment_method"), "n.a.");
        assert!(attrs.get("amount").unwrap().is_null());
        assert_eq!(policy(DimensionKind::Product), MergePolicy::Versioned);
    }

    #[test]
    fn date_key_is_yyyymmdd() {
        assert_eq!(date_key(NaiveDate::from_ymd_opt(2024, 3, 9).unwrap()), 20_240_309);
    }
}
