//! End-to-end pipeline tests: full runs, idempotence, Type-2 price
//! changes with fact repair, and source reconciliation.

use std::str::FromStr;
use std::sync::Arc;

use bigdecimal::BigDecimal;
use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};

use starmerge::invariants::check_warehouse;
use starmerge::schema::AttributeDef;
use starmerge::{
    AttributeType, AuditStatus, DimensionKind, EntityKind, EntitySchema, IdentityScope,
    ManualClock, MemoryAuditSink, MergePolicy, Pipeline, RecordIdentity, SalesSchema, StagedBatch,
    StagedRow, Step, StepOutcome, TableId, Warehouse, UNKNOWN_MEMBER_KEY,
};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 6, 0, 0).unwrap()
}

fn row(nk: &str, entity: &str) -> StagedRow {
    StagedRow::new(nk, "erp", entity, t0())
}

fn decimal(s: &str) -> BigDecimal {
    BigDecimal::from_str(s).unwrap()
}

/// A complete sales model with one order line for product `P1`.
fn batches(price: &str, order_product: &str) -> Vec<StagedBatch> {
    vec![
        StagedBatch::new(
            EntityKind::Country,
            vec![row("DE", "countries").compare("country_name", "Germany")],
        ),
        StagedBatch::new(
            EntityKind::City,
            vec![row("BER", "cities").compare("city_name", "Berlin").compare("country_id", "DE")],
        ),
        StagedBatch::new(
            EntityKind::Address,
            vec![row("A1", "addresses")
                .compare("address_line", "Hauptstrasse 1")
                .compare("postal_code", "10115")
                .compare("city_id", "BER")],
        ),
        StagedBatch::new(
            EntityKind::Customer,
            vec![row("C1", "customers")
                .display("customer_type", "individual")
                .display("first_name", "Ada")
                .compare("last_name", "Lovelace")
                .compare("email", "ada@example.com")
                .compare("address_id", "A1")],
        ),
        StagedBatch::new(
            EntityKind::Product,
            vec![row("P1", "products")
                .display("product_name", "Widget")
                .compare("price", price)
                .compare("cost", "4.00")],
        ),
        StagedBatch::new(
            EntityKind::Discount,
            vec![row("D1", "discounts")
                .display("discount_name", "Spring")
                .compare("discount_rate", "0.10")],
        ),
        StagedBatch::new(
            EntityKind::Order,
            vec![row("L1", "order_lines")
                .display("order_number", "SO-1")
                .compare("order_date", "2024-02-10")
                .compare("quantity", "3")
                .compare("customer_id", "C1")
                .compare("product_id", order_product)
                .compare("discount_id", "D1")],
        ),
        StagedBatch::new(
            EntityKind::Payment,
            vec![row("PAY1", "payments")
                .display("payment_date", "2024-02-12")
                .compare("payment_method", "card")
                .compare("amount", "27.00")
                .compare("order_line_id", "L1")],
        ),
    ]
}

fn warehouse() -> (Warehouse, Arc<ManualClock>, Arc<MemoryAuditSink>) {
    let clock = Arc::new(ManualClock::new(t0()));
    let audit = Arc::new(MemoryAuditSink::new());
    let warehouse = Warehouse::builder()
        .clock(clock.clone())
        .audit(audit.clone())
        .open()
        .unwrap();
    (warehouse, clock, audit)
}

#[test]
fn full_run_loads_every_layer() {
    let (wh, _, audit) = warehouse();
    let report = Pipeline::new(&wh).run(batches("10.00", "P1"));
    assert!(report.is_success(), "{:?}", report.steps);

    for step in Step::plan() {
        assert!(
            report.report(step).is_some_and(|r| r.inserted == 1),
            "{step} should insert exactly one row"
        );
    }
    assert_eq!(audit.entries().len(), 13);
    assert!(audit.entries().iter().all(|e| e.run_id == Some(report.run_id)));

    let facts = wh.facts().unwrap();
    assert_eq!(facts.len(), 1);
    let fact = facts.rows().next().unwrap();
    assert_eq!(fact.identity, RecordIdentity::new("L1", "erp", "order_lines"));
    assert_eq!(fact.date_key, 20_240_210);
    assert_eq!(fact.quantity, 3);
    assert_eq!(fact.price_each, decimal("10"));
    assert_eq!(fact.net_amount(), decimal("27"));
    assert_eq!(fact.margin(), decimal("18"));
    for (_, key) in fact.dimension_keys() {
        assert!(!key.is_unknown());
    }
    assert!(facts.partitions().locate(NaiveDate::from_ymd_opt(2024, 2, 10).unwrap()).is_some());

    let customers = wh.table(TableId::Dimension(DimensionKind::Customer)).unwrap();
    let ada = customers.data_rows().next().unwrap();
    assert_eq!(ada.attributes.get("customer_name").and_then(|v| v.as_text()), Some("Ada Lovelace"));
    assert_eq!(
        ada.attributes.get("full_address").and_then(|v| v.as_text()),
        Some("Hauptstrasse 1, 10115 Berlin, Germany")
    );

    check_warehouse(&wh).unwrap();
}

#[test]
fn rerun_on_unchanged_input_is_a_noop() {
    let (wh, _, _) = warehouse();
    let pipeline = Pipeline::new(&wh);
    pipeline.run(batches("10.00", "P1"));
    let revisions: Vec<u64> = TableId::all()
        .into_iter()
        .filter(|id| *id != TableId::Facts)
        .map(|id| wh.table(id).unwrap().revision())
        .collect();

    let second = pipeline.run(batches("10.00", "P1"));
    assert!(second.is_success());
    for (step, outcome) in &second.steps {
        let StepOutcome::Succeeded(report) = outcome else {
            panic!("{step} did not succeed: {outcome:?}");
        };
        assert_eq!((report.inserted, report.updated), (0, 0), "{step} changed on rerun");
    }

    let after: Vec<u64> = TableId::all()
        .into_iter()
        .filter(|id| *id != TableId::Facts)
        .map(|id| wh.table(id).unwrap().revision())
        .collect();
    assert_eq!(revisions, after);
}

#[test]
fn price_change_versions_product_and_repairs_fact() {
    let (wh, clock, _) = warehouse();
    let pipeline = Pipeline::new(&wh);
    pipeline.run(batches("10.00", "P1"));
    let before = wh.facts().unwrap().rows().next().unwrap().clone();

    clock.advance(Duration::days(1));
    let report = pipeline.run(batches("12.00", "P1"));
    assert!(report.is_success());

    let conformed = report.report(Step::Conformed(EntityKind::Product)).unwrap();
    assert_eq!((conformed.inserted, conformed.updated), (1, 1));
    let dim = report.report(Step::Dimension(DimensionKind::Product)).unwrap();
    assert_eq!((dim.inserted, dim.updated), (1, 1));
    let facts_report = report.report(Step::Facts).unwrap();
    assert_eq!((facts_report.inserted, facts_report.updated), (0, 1));

    let products = wh.table(TableId::Dimension(DimensionKind::Product)).unwrap();
    let p1 = RecordIdentity::new("P1", "erp", "products");
    let versions: Vec<_> = products.versions(&p1).collect();
    assert_eq!(versions.len(), 2);
    let active = products.current(&p1).unwrap().unwrap();
    assert_eq!(active.attributes.decimal("price"), Some(&decimal("12.00")));
    let retired = versions.iter().find(|r| !r.is_active()).unwrap();
    assert_eq!(retired.key, before.product_key);
    assert_eq!(
        retired.version.unwrap().window.valid_to,
        active.version.unwrap().window.valid_from
    );

    // The fact keeps its identity and insertion time.
    let after = wh.facts().unwrap().rows().next().unwrap().clone();
    assert_eq!(after.key, before.key);
    assert_eq!(after.identity, before.identity);
    assert_eq!(after.insert_dt, before.insert_dt);
    assert_eq!(after.product_key, active.key);
    assert_eq!(after.price_each, decimal("12"));
    assert!(after.update_dt > before.update_dt);

    check_warehouse(&wh).unwrap();
}

#[test]
fn unresolved_reference_points_at_unknown_member() {
    let (wh, _, audit) = warehouse();
    let report = Pipeline::new(&wh).run(batches("10.00", "P404"));
    assert!(report.is_success());

    let orders = report.report(Step::Conformed(EntityKind::Order)).unwrap();
    assert_eq!(orders.resolution.misses.get("order.product_id"), Some(&1));
    let fact = wh.facts().unwrap().rows().next().unwrap().clone();
    assert_eq!(fact.product_key, UNKNOWN_MEMBER_KEY);
    assert_eq!(fact.price_each, BigDecimal::from(0));

    let order_audit = audit
        .entries()
        .into_iter()
        .find(|e| e.operation == "merge ce_orders")
        .unwrap();
    assert_eq!(order_audit.status, AuditStatus::Succeeded);
    assert!(order_audit.detail.unwrap().contains("order.product_id:1"));

    check_warehouse(&wh).unwrap();
}

#[test]
fn same_natural_key_from_two_sources_stays_separate() {
    let (wh, _, _) = warehouse();
    wh.merge_conformed(&StagedBatch::new(
        EntityKind::Country,
        vec![
            row("DE", "countries").compare("country_name", "Germany"),
            StagedRow::new("DE", "crm", "land", t0()).compare("country_name", "Deutschland"),
        ],
    ))
    .unwrap();
    let report = wh
        .merge_conformed(&StagedBatch::new(
            EntityKind::City,
            vec![StagedRow::new("BER", "crm", "stadt", t0())
                .compare("city_name", "Berlin")
                .compare("country_id", "DE")],
        ))
        .unwrap();
    assert_eq!(report.resolution.hits, 1);

    let countries = wh.table(TableId::Conformed(EntityKind::Country)).unwrap();
    assert_eq!(countries.identities_for("DE").count(), 2);
    let crm_de = countries
        .current(&RecordIdentity::new("DE", "crm", "land"))
        .unwrap()
        .unwrap()
        .key;
    let cities = wh.table(TableId::Conformed(EntityKind::City)).unwrap();
    let berlin = cities.data_rows().next().unwrap();
    assert_eq!(berlin.attributes.key("country_id"), crm_de);
}

#[test]
fn global_scope_reconciles_sources_deterministically() {
    let country = EntitySchema::new(
        EntityKind::Country,
        MergePolicy::Overwrite,
        vec![AttributeDef::compare_required("country_name", AttributeType::Text)],
    )
    .unwrap()
    .with_scope(IdentityScope::Global);
    let schema = SalesSchema::standard().unwrap().with_entity(country).unwrap();
    let wh = Warehouse::builder().schema(schema).open().unwrap();

    let erp = row("DE", "countries").compare("country_name", "Germany");
    let crm = StagedRow::new("DE", "crm", "land", t0()).compare("country_name", "Deutschland");

    for batch in [vec![erp.clone(), crm.clone()], vec![crm, erp]] {
        let report = wh.merge_conformed(&StagedBatch::new(EntityKind::Country, batch)).unwrap();
        assert_eq!(report.duplicates_dropped, 1);
    }

    let countries = wh.table(TableId::Conformed(EntityKind::Country)).unwrap();
    assert_eq!(countries.data_rows().count(), 1);
    let de = countries.data_rows().next().unwrap();
    assert_eq!(de.identity.source_system, "crm");
    assert_eq!(de.attributes.get("country_name").and_then(|v| v.as_text()), Some("Deutschland"));
}

#[test]
fn halt_on_failure_skips_remaining_steps() {
    use starmerge::{Commit, InMemoryTableStore, Table, TableStore, WarehouseConfig};

    let store = Arc::new(InMemoryTableStore::new());
    let wh = Warehouse::builder().store(store.clone()).open().unwrap();
    Pipeline::new(&wh).run(batches("10.00", "P1"));

    // A table committed with two active product versions fails the next
    // product merge.
    let products = wh.table(TableId::Conformed(EntityKind::Product)).unwrap();
    let mut image = serde_json::to_value(&products).unwrap();
    let rows = image["rows"].as_array_mut().unwrap();
    let mut duplicate = rows.last().unwrap().clone();
    duplicate["key"] = serde_json::Value::from(999);
    rows.push(duplicate);
    let corrupted: Table = serde_json::from_value(image).unwrap();
    store.commit(Commit::new().with_table(corrupted)).unwrap();

    let report = Pipeline::new(&wh).run(batches("12.00", "P1"));
    assert!(!report.is_success());
    assert!(report.outcome(Step::Conformed(EntityKind::Product)).unwrap().is_failure());
    assert!(matches!(
        report.outcome(Step::Facts),
        Some(StepOutcome::Skipped { blocked_by: Some(Step::Conformed(EntityKind::Product)), .. })
    ));
    // Steps before the failure still ran; later independent ones did not.
    assert!(report.outcome(Step::Conformed(EntityKind::Customer)).unwrap().is_success());
    assert!(matches!(
        report.outcome(Step::Conformed(EntityKind::Discount)),
        Some(StepOutcome::Skipped { .. })
    ));

    // Without halting only dependents are skipped.
    let lenient = Warehouse::builder()
        .store(store)
        .config(WarehouseConfig {
            halt_on_failure: false,
            ..WarehouseConfig::default()
        })
        .open()
        .unwrap();
    let report = Pipeline::new(&lenient).run(batches("12.00", "P1"));
    assert!(report.outcome(Step::Conformed(EntityKind::Discount)).unwrap().is_success());
    assert!(matches!(
        report.outcome(Step::Conformed(EntityKind::Order)),
        Some(StepOutcome::Skipped { blocked_by: Some(Step::Conformed(EntityKind::Product)), .. })
    ));
    assert!(report.outcome(Step::Dimension(DimensionKind::Customer)).unwrap().is_success());
}

fn without(batches: Vec<StagedBatch>, entity: EntityKind) -> Vec<StagedBatch> {
    batches.into_iter().filter(|b| b.entity != entity).collect()
}

#[test]
fn late_arriving_product_and_payment_are_filled_in() {
    let (wh, clock, _) = warehouse();
    let pipeline = Pipeline::new(&wh);

    // P2 and PAY1 are not staged yet.
    let first = pipeline.run(without(batches("10.00", "P2"), EntityKind::Payment));
    assert!(first.is_success(), "{:?}", first.steps);
    let before = wh.facts().unwrap().rows().next().unwrap().clone();
    assert_eq!(before.product_key, UNKNOWN_MEMBER_KEY);
    assert_eq!(before.payment_key, UNKNOWN_MEMBER_KEY);
    assert_eq!(before.price_each, BigDecimal::from(0));
    assert!(!before.customer_key.is_unknown());

    clock.advance(Duration::days(1));
    let mut second_batches = batches("10.00", "P2");
    second_batches.push(StagedBatch::new(
        EntityKind::Product,
        vec![row("P2", "products")
            .display("product_name", "Gadget")
            .compare("price", "7.00")
            .compare("cost", "3.00")],
    ));
    let second = pipeline.run(second_batches);
    assert!(second.is_success(), "{:?}", second.steps);
    let facts_report = second.report(Step::Facts).unwrap();
    assert_eq!((facts_report.inserted, facts_report.updated), (0, 1));
    assert_eq!(facts_report.unchanged, 0);

    let products = wh.table(TableId::Dimension(DimensionKind::Product)).unwrap();
    let p2 = products
        .current(&RecordIdentity::new("P2", "erp", "products"))
        .unwrap()
        .unwrap();
    let payments = wh.table(TableId::Dimension(DimensionKind::Payment)).unwrap();
    let pay1 = payments
        .current(&RecordIdentity::new("PAY1", "erp", "payments"))
        .unwrap()
        .unwrap();

    let after = wh.facts().unwrap().rows().next().unwrap().clone();
    assert_eq!(after.product_key, p2.key);
    assert_eq!(after.payment_key, pay1.key);
    assert_eq!(after.price_each, decimal("7.00"));
    assert_eq!(after.cost_each, decimal("3.00"));
    assert_eq!(after.customer_key, before.customer_key);
    assert_eq!(after.key, before.key);
    assert_eq!(after.identity, before.identity);
    assert_eq!(after.insert_dt, before.insert_dt);
    assert_eq!(after.order_date, before.order_date);
    assert!(after.update_dt > before.update_dt);

    // Nothing is left to fill.
    let third = pipeline.run(batches("10.00", "P2"));
    assert_eq!(third.report(Step::Facts).map(|r| r.updated), Some(0));
    check_warehouse(&wh).unwrap();
}

/// Two products with one order line each, in the first and last quarter
/// of 2024.
fn two_quarter_batches(price: &str) -> Vec<StagedBatch> {
    let mut staged = batches(price, "P1");
    staged.extend([
        StagedBatch::new(
            EntityKind::Product,
            vec![row("P9", "products")
                .display("product_name", "Gizmo")
                .compare("price", "5.00")
                .compare("cost", "2.00")],
        ),
        StagedBatch::new(
            EntityKind::Order,
            vec![row("L2", "order_lines")
                .display("order_number", "SO-2")
                .compare("order_date", "2024-11-05")
                .compare("quantity", "1")
                .compare("customer_id", "C1")
                .compare("product_id", "P9")
                .compare("discount_id", "D1")],
        ),
        StagedBatch::new(
            EntityKind::Payment,
            vec![row("PAY2", "payments")
                .display("payment_date", "2024-11-06")
                .compare("payment_method", "card")
                .compare("amount", "4.50")
                .compare("order_line_id", "L2")],
        ),
    ]);
    staged
}

fn quarter_starts() -> [NaiveDate; 4] {
    [1, 4, 7, 10].map(|month| NaiveDate::from_ymd_opt(2024, month, 1).unwrap())
}

#[test]
fn orders_in_distant_quarters_fill_the_gap() {
    let (wh, _, _) = warehouse();
    let report = Pipeline::new(&wh).run(two_quarter_batches("10.00"));
    assert!(report.is_success(), "{:?}", report.steps);

    let facts_report = report.report(Step::Facts).unwrap();
    assert_eq!(facts_report.inserted, 2);
    let created: Vec<NaiveDate> = facts_report
        .partitions_created
        .iter()
        .map(|p| p.start)
        .collect::<std::collections::BTreeSet<_>>()
        .into_iter()
        .collect();
    assert_eq!(created, quarter_starts());
    assert_eq!(facts_report.partitions_created.len(), 4);

    let facts = wh.facts().unwrap();
    assert!(facts.partitions().is_contiguous());
    assert_eq!(facts.partitions().len(), 4);
    let per_quarter: Vec<usize> = facts
        .partitions()
        .iter()
        .map(|p| facts.rows_in(p).count())
        .collect();
    assert_eq!(per_quarter, vec![1, 0, 0, 1]);

    check_warehouse(&wh).unwrap();
}

#[test]
fn price_change_republishes_only_the_affected_partition() {
    let (wh, clock, _) = warehouse();
    let pipeline = Pipeline::new(&wh);
    assert!(pipeline.run(two_quarter_batches("10.00")).is_success());
    let revision = |start: NaiveDate| wh.store().load_partition(start).unwrap().revision();
    let before = quarter_starts().map(revision);
    assert_eq!(before, [1, 1, 1, 1]);
    let manifest_before = wh.store().load_fact_manifest().unwrap().revision();

    clock.advance(Duration::days(1));
    let report = pipeline.run(two_quarter_batches("12.00"));
    assert!(report.is_success(), "{:?}", report.steps);
    let facts_report = report.report(Step::Facts).unwrap();
    assert_eq!((facts_report.inserted, facts_report.updated), (0, 1));
    assert_eq!(facts_report.unchanged, 1);
    assert!(facts_report.partitions_created.is_empty());

    assert_eq!(quarter_starts().map(revision), [2, 1, 1, 1]);
    assert_eq!(
        wh.store().load_fact_manifest().unwrap().revision(),
        manifest_before + 1
    );
    let gizmo = wh
        .facts()
        .unwrap()
        .find(&RecordIdentity::new("L2", "erp", "order_lines"))
        .unwrap()
        .clone();
    assert_eq!(gizmo.price_each, decimal("5.00"));

    check_warehouse(&wh).unwrap();
}
