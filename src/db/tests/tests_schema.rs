//! Table validation, views, and fixed-point schema application.

use crate::bytemap::Value;
use crate::db::{Db, DbError, DbOpts, Schema};
use crate::expr::{self, Field, GroupBy};
use crate::table::TableOpts;

const SEC: i64 = 1_000_000_000;

fn table_opts(name: &str, stream: &str) -> TableOpts {
    let mut opts = TableOpts::new(name, stream, vec![Field::new("x", expr::sum("x"))]);
    opts.resolution = SEC;
    opts
}

// ------------------------------------------------------------------------------------------------
// Validation
// ------------------------------------------------------------------------------------------------

#[test]
fn zero_resolution_is_rejected() {
    let db = Db::open(DbOpts::default()).unwrap();
    let mut opts = table_opts("t", "events");
    opts.resolution = 0;
    assert!(matches!(
        db.create_table(opts).unwrap_err(),
        DbError::InvalidTableOpts(_)
    ));
}

#[test]
fn missing_fields_are_rejected() {
    let db = Db::open(DbOpts::default()).unwrap();
    let mut opts = table_opts("t", "events");
    opts.fields.clear();
    assert!(matches!(
        db.create_table(opts).unwrap_err(),
        DbError::InvalidTableOpts(_)
    ));
}

#[test]
fn unsorted_group_by_is_rejected() {
    let db = Db::open(DbOpts::default()).unwrap();
    let mut opts = table_opts("t", "events");
    opts.group_by = vec![GroupBy::on_dim("b"), GroupBy::on_dim("a")];
    assert!(matches!(
        db.create_table(opts).unwrap_err(),
        DbError::InvalidTableOpts(_)
    ));
}

#[test]
fn duplicate_table_names_are_rejected() {
    let db = Db::open(DbOpts::default()).unwrap();
    db.create_table(table_opts("t", "events")).unwrap();
    assert!(matches!(
        db.create_table(table_opts("T", "events")).unwrap_err(),
        DbError::DuplicateTable(_)
    ));
    db.close().unwrap();
}

// ------------------------------------------------------------------------------------------------
// Views
// ------------------------------------------------------------------------------------------------

#[test]
fn view_requires_its_base_table() {
    let db = Db::open(DbOpts::default()).unwrap();
    let mut view = table_opts("v", "ignored");
    view.view_of = Some("base".to_string());

    let err = db.create_table(view).unwrap_err();
    assert!(matches!(err, DbError::DependencyMissing { .. }));
}

#[test]
fn view_inherits_stream_and_fields_from_its_base() {
    let db = Db::open(DbOpts::default()).unwrap();
    db.create_table(table_opts("base", "events")).unwrap();

    let mut view = table_opts("v", "something-else");
    view.fields.clear();
    view.view_of = Some("base".to_string());
    view.where_expr = Some(expr::dim_eq("a", Value::Int(1)));
    db.create_table(view).unwrap();

    let v = db.get_table("v").unwrap();
    assert_eq!(v.stream(), "events");
    assert_eq!(v.fields().len(), 1);

    db.close().unwrap();
}

// ------------------------------------------------------------------------------------------------
// Schema application
// ------------------------------------------------------------------------------------------------

#[test]
fn schema_creates_views_after_their_bases() {
    let db = Db::open(DbOpts::default()).unwrap();

    // BTreeMap iteration puts the view first; the fixed point resolves it
    // on the second pass.
    let mut schema = Schema::new();
    let mut view = table_opts("a_view", "ignored");
    view.view_of = Some("zz_base".to_string());
    schema.insert("a_view".to_string(), view);
    schema.insert("zz_base".to_string(), table_opts("zz_base", "events"));

    db.apply_schema(schema).unwrap();
    assert!(db.get_table("a_view").is_some());
    assert!(db.get_table("zz_base").is_some());

    db.close().unwrap();
}

#[test]
fn schema_with_unresolvable_dependency_stalls() {
    let db = Db::open(DbOpts::default()).unwrap();

    let mut schema = Schema::new();
    let mut view = table_opts("orphan", "ignored");
    view.view_of = Some("never-created".to_string());
    schema.insert("orphan".to_string(), view);

    let err = db.apply_schema(schema).unwrap_err();
    match err {
        DbError::SchemaStalled(names) => assert_eq!(names, vec!["orphan".to_string()]),
        other => panic!("expected SchemaStalled, got {other:?}"),
    }
}

#[test]
fn schema_cycle_stalls_instead_of_spinning() {
    let db = Db::open(DbOpts::default()).unwrap();

    let mut schema = Schema::new();
    let mut a = table_opts("a", "ignored");
    a.view_of = Some("b".to_string());
    let mut b = table_opts("b", "ignored");
    b.view_of = Some("a".to_string());
    schema.insert("a".to_string(), a);
    schema.insert("b".to_string(), b);

    let err = db.apply_schema(schema).unwrap_err();
    assert!(matches!(err, DbError::SchemaStalled(names) if names.len() == 2));
}

#[test]
fn reapplying_a_schema_only_swaps_where() {
    let db = Db::open(DbOpts::default()).unwrap();

    let mut schema = Schema::new();
    schema.insert("t".to_string(), table_opts("t", "events"));
    db.apply_schema(schema.clone()).unwrap();

    db.insert("events", &{
        let mut p = crate::table::Point::default();
        p.ts = 1_000;
        p.dims.insert("a".to_string(), Value::Int(2));
        p.vals.insert("x".to_string(), 1.0);
        p
    })
    .unwrap();

    // Second application tightens the WHERE on the existing table.
    let mut tightened = table_opts("t", "events");
    tightened.where_expr = Some(expr::dim_eq("a", Value::Int(1)));
    schema.insert("t".to_string(), tightened);
    db.apply_schema(schema).unwrap();

    let t = db.get_table("t").unwrap();
    db.insert("events", &{
        let mut p = crate::table::Point::default();
        p.ts = 2_000;
        p.dims.insert("a".to_string(), Value::Int(2));
        p.vals.insert("x".to_string(), 1.0);
        p
    })
    .unwrap();

    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    while t.stats().filtered_points < 1 {
        assert!(std::time::Instant::now() < deadline);
        std::thread::sleep(std::time::Duration::from_millis(5));
    }

    db.close().unwrap();
}
