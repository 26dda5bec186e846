//! Database source runs against an in-memory SQLite reporting database.

use std::collections::BTreeMap;
use std::sync::Arc;

use reportage::cache::{MemoryCache, ReportCache};
use reportage::column::Column;
use reportage::database::{self, Condition, Database, TableKeyRange};
use reportage::error::ReportError;
use reportage::filter::Filter;
use reportage::key_range::KeyRange;
use reportage::report::{Report, ReportDefinition};
use reportage::row::Row;
use reportage::value::Value;
use reportage::widget::Widget;

fn widgets_db() -> Arc<Database> {
    let db = Database::open_in_memory().unwrap();
    db.execute_batch(
        "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT);
         INSERT INTO users (id, name) VALUES (1, 'ann'), (2, 'bo'), (3, 'cy'), (4, 'di');

         CREATE TABLE all_the_data (
             user_id INTEGER,
             user_is_active BOOLEAN,
             widget_id INTEGER,
             widget_price REAL
         );
         INSERT INTO all_the_data VALUES
             (1, 1, 1, 2.0),
             (1, 1, 2, 4.0),
             (2, 0, 3, 50.0),
             (3, NULL, 4, 1.0),
             (3, 0, 4, 1.5),
             (NULL, 1, 5, 9.0);",
    )
    .unwrap();
    Arc::new(db)
}

fn cache() -> Arc<dyn ReportCache> {
    Arc::new(MemoryCache::new())
}

fn run(definition: ReportDefinition) -> Vec<Row> {
    let mut report = Report::new(definition, cache()).unwrap();
    report.run_report().unwrap();
    report.cached_rows().unwrap()
}

fn column(rows: &[Row], name: &str) -> Vec<Option<Value>> {
    rows.iter().map(|row| row.get(name).cloned()).collect()
}

fn base(db: &Arc<Database>) -> ReportDefinition {
    ReportDefinition::new("WidgetsReport")
        .with_database(Arc::clone(db), "all_the_data")
        .with_key("user_id", KeyRange::Source)
        .with_column("user_id", database::group_by("user_id"))
}

#[test]
fn test_grouped_aggregates() {
    let db = widgets_db();
    let rows = run(base(&db)
        .with_column("num_widgets", database::count_distinct("widget_id"))
        .with_column("rows", database::count("widget_id"))
        .with_column("total", database::sum("widget_price"))
        .with_column(
            "average",
            Column::derived(|row| row.num("total")?.div(&row.num("num_widgets")?)),
        ));

    // the NULL user group is left out
    assert_eq!(
        column(&rows, "user_id"),
        vec![Some(Value::Int(1)), Some(Value::Int(2)), Some(Value::Int(3))]
    );
    assert_eq!(
        column(&rows, "num_widgets"),
        vec![Some(Value::Int(2)), Some(Value::Int(1)), Some(Value::Int(1))]
    );
    assert_eq!(column(&rows, "rows")[2], Some(Value::Int(2)));
    assert_eq!(column(&rows, "total")[0], Some(Value::Float(6.0)));
    assert_eq!(column(&rows, "average")[0], Some(Value::Float(3.0)));
    assert_eq!(column(&rows, "average")[2], Some(Value::Float(2.5)));
}

#[test]
fn test_group_including_null() {
    let db = widgets_db();
    let definition = ReportDefinition::new("WithNulls")
        .with_database(Arc::clone(&db), "all_the_data")
        .with_key("user_id", KeyRange::Source)
        .with_column("user_id", database::group_by_including_null("user_id"))
        .with_column("num_widgets", database::count("widget_id"));
    let rows = run(definition);
    assert_eq!(rows.len(), 4);
    assert_eq!(rows[0].get("user_id"), None);
    assert_eq!(rows[0].get("num_widgets"), Some(&Value::Int(1)));
}

#[test]
fn test_first_and_boolean_aggregates() {
    let db = widgets_db();
    let rows = run(base(&db)
        .with_column("active", database::first("user_is_active"))
        .with_column("all_active", database::bool_and("user_is_active"))
        .with_column("any_active", database::bool_or("user_is_active"))
        .with_column("widget_ids", database::array_agg("widget_id")));

    // user 3's first row has a NULL flag
    assert_eq!(
        column(&rows, "active"),
        vec![Some(Value::Int(1)), Some(Value::Int(0)), Some(Value::Int(0))]
    );
    assert_eq!(column(&rows, "all_active")[0], Some(Value::Bool(true)));
    assert_eq!(column(&rows, "any_active")[1], Some(Value::Bool(false)));
    assert_eq!(
        column(&rows, "widget_ids")[1],
        Some(Value::List(vec![Value::Int(3)]))
    );
}

#[test]
fn test_report_wide_query_filter_with_widget() {
    let db = widgets_db();
    let choices = vec![
        (None, "All".to_string()),
        (Some(Value::Bool(true)), "Active".to_string()),
        (Some(Value::Bool(false)), "Inactive".to_string()),
    ];
    let definition = base(&db)
        .with_column("num_widgets", database::count("widget_id"))
        .with_filter(
            "user_is_active",
            Filter::query(|entity, input| {
                input.map(|active| Condition::eq(&entity.col("user_is_active"), active.clone()))
            })
            .with_widget(Widget::select(choices)),
        );
    let mut report = Report::new(definition, cache()).unwrap();

    let inputs = BTreeMap::from([("user_is_active".to_string(), "1".to_string())]);
    assert!(report.clean_user_inputs(&inputs).is_empty());
    report.run_report().unwrap();
    let rows = report.cached_rows().unwrap();
    assert_eq!(column(&rows, "user_id"), vec![Some(Value::Int(1))]);

    let inputs = BTreeMap::from([("user_is_active".to_string(), "0".to_string())]);
    assert!(report.clean_user_inputs(&inputs).is_empty());
    report.run_report().unwrap();
    assert_eq!(report.report_row_count().unwrap(), 3);
}

#[test]
fn test_column_scoped_filter_runs_separate_query() {
    let db = widgets_db();
    let definition = base(&db)
        .with_column("num_widgets", database::count("widget_id"))
        .with_column("expensive", database::count("widget_id"))
        .with_filter(
            "pricey",
            Filter::query(|entity, _| {
                Some(Condition::compare(&entity.col("widget_price"), ">", 3.0))
            })
            .with_columns(["expensive"]),
        );
    let rows = run(definition);
    assert_eq!(rows.len(), 3);
    assert_eq!(
        column(&rows, "num_widgets"),
        vec![Some(Value::Int(2)), Some(Value::Int(1)), Some(Value::Int(2))]
    );
    assert_eq!(
        column(&rows, "expensive"),
        vec![Some(Value::Int(1)), Some(Value::Int(1)), None]
    );
}

#[test]
fn test_column_transform() {
    let db = widgets_db();
    let definition = base(&db)
        .with_column("total", database::sum("widget_price"))
        .with_filter(
            "in_cents",
            Filter::transform(|expr, _| format!("({expr} * 100)"), ["widget_price"]),
        );
    let rows = run(definition);
    assert_eq!(rows[0].get("total"), Some(&Value::Float(600.0)));
}

#[test]
fn test_lookup_columns() {
    let db = widgets_db();
    let definition = base(&db)
        .with_column("num_widgets", database::count("widget_id"))
        .with_column("name", database::lookup("users", "name", "user_id"));
    let rows = run(definition);
    assert_eq!(
        column(&rows, "name"),
        vec![
            Some(Value::from("ann")),
            Some(Value::from("bo")),
            Some(Value::from("cy"))
        ]
    );
}

#[test]
fn test_table_key_range_adds_missing_keys() {
    let db = widgets_db();
    let definition = ReportDefinition::new("AllUsers")
        .with_database(Arc::clone(&db), "all_the_data")
        .with_key(
            "user_id",
            KeyRange::Table(TableKeyRange::new(Arc::clone(&db), "users")),
        )
        .with_column("user_id", database::group_by("user_id"))
        .with_column("num_widgets", database::count("widget_id"));
    let rows = run(definition);
    assert_eq!(rows.len(), 4);
    assert_eq!(rows[3].get("user_id"), Some(&Value::Int(4)));
    assert_eq!(rows[3].get("num_widgets"), None);
}

#[test]
fn test_filtered_table_key_range() {
    let db = widgets_db();
    let range = TableKeyRange::new(Arc::clone(&db), "users")
        .filter(|entity, _| Some(Condition::compare(&entity.col("id"), ">=", 3)));
    let definition = ReportDefinition::new("LateUsers")
        .with_database(Arc::clone(&db), "all_the_data")
        .with_key("user_id", KeyRange::Table(range))
        .with_column("user_id", database::group_by("user_id"))
        .with_column("num_widgets", database::count("widget_id"));
    let rows = run(definition);
    // key range rows plus source rows outside the range
    assert_eq!(
        column(&rows, "user_id"),
        vec![
            Some(Value::Int(1)),
            Some(Value::Int(2)),
            Some(Value::Int(3)),
            Some(Value::Int(4))
        ]
    );
}

#[test]
fn test_large_results_page_and_batch_lookups() {
    let db = Database::open_in_memory().unwrap();
    db.execute_batch(
        "CREATE TABLE events (user_id INTEGER, amount INTEGER);
         CREATE TABLE people (id INTEGER PRIMARY KEY, name TEXT);
         WITH RECURSIVE seq(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM seq WHERE x < 600)
         INSERT INTO events SELECT x, x * 2 FROM seq;
         WITH RECURSIVE seq(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM seq WHERE x < 600)
         INSERT INTO people SELECT x, 'p' || x FROM seq;",
    )
    .unwrap();
    let definition = ReportDefinition::new("Events")
        .with_database(Arc::new(db), "events")
        .with_key("user_id", KeyRange::Source)
        .with_column("user_id", database::group_by("user_id"))
        .with_column("amount", database::sum("amount"))
        .with_column("name", database::lookup("people", "name", "user_id"));
    let rows = run(definition);
    assert_eq!(rows.len(), 600);
    assert_eq!(rows[599].get("amount"), Some(&Value::Int(1200)));
    assert_eq!(rows[251].get("name"), Some(&Value::from("p252")));
    assert!(rows.iter().all(|row| row.get("name").is_some()));
}

#[test]
fn test_configuration_errors() {
    let db = widgets_db();
    let cases = vec![
        // key column without a group-by
        ReportDefinition::new("NoGroup")
            .with_database(Arc::clone(&db), "all_the_data")
            .with_key("user_id", KeyRange::Source)
            .with_column("user_id", database::sum("user_id")),
        // overlapping column filters
        base(&db)
            .with_column("n", database::count("widget_id"))
            .with_filter(
                "a",
                Filter::query(|_, _| None).with_columns(["n"]),
            )
            .with_filter(
                "b",
                Filter::query(|_, _| None).with_columns(["n"]),
            ),
        // filtering a key column
        base(&db).with_filter(
            "a",
            Filter::query(|_, _| None).with_columns(["user_id"]),
        ),
        // transform without columns
        base(&db).with_filter(
            "t",
            Filter::transform(|expr, _| expr.to_string(), Vec::<String>::new()),
        ),
        // database column with no table
        ReportDefinition::new("NoTable").with_column("n", database::count("x")),
    ];
    for definition in cases {
        let name = definition.code_name().to_string();
        match Report::new(definition, cache()) {
            Err(ReportError::Config(_)) => {}
            other => panic!("{name}: expected a configuration error, got {other:?}"),
        }
    }
}
