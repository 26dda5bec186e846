//! JSON responses for table frontends.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{json, Value as Json};

use reportage::cache::{MemoryCache, ReportCache, Sort};
use reportage::database::{self, Condition, Database};
use reportage::filter::Filter;
use reportage::format::Format;
use reportage::helpers::report_response;
use reportage::key_range::KeyRange;
use reportage::registry::Registry;
use reportage::report::ReportDefinition;
use reportage::value::Value;
use reportage::widget::Widget;

fn widgets_db() -> Arc<Database> {
    let db = Database::open_in_memory().unwrap();
    db.execute_batch(
        "CREATE TABLE all_the_data (
             user_id INTEGER,
             user_is_active BOOLEAN,
             widget_id INTEGER,
             widget_price REAL
         );
         INSERT INTO all_the_data VALUES
             (1, 1, 1, 2.0),
             (1, 1, 2, 4.0),
             (2, 0, 3, 50.0),
             (3, 1, 4, 1000.0);",
    )
    .unwrap();
    Arc::new(db)
}

fn registry() -> Registry {
    let db = widgets_db();
    let registry = Registry::new();
    registry
        .register(move || {
            ReportDefinition::new("WidgetsReport")
                .with_database(Arc::clone(&db), "all_the_data")
                .with_filter(
                    "user_is_active",
                    Filter::query(|entity, input| {
                        input.map(|active| {
                            Condition::eq(&entity.col("user_is_active"), active.clone())
                        })
                    })
                    .with_widget(
                        Widget::select(vec![
                            (None, "All".to_string()),
                            (Some(Value::Bool(true)), "Active".to_string()),
                        ])
                        .with_label("User Is Active"),
                    ),
                )
                .with_key("user_id", KeyRange::Source)
                .with_column(
                    "user_id",
                    database::group_by("user_id")
                        .with_format(Format::integer().without_grouping())
                        .with_footer(false),
                )
                .with_column(
                    "num_widgets",
                    database::count_distinct("widget_id").with_format(Format::integer()),
                )
                .with_column(
                    "total",
                    database::sum("widget_price").with_format(Format::float(1)),
                )
                .with_default_sort(Sort::asc("user_id"))
        })
        .unwrap();
    registry
}

fn params(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn respond(cache: &Arc<dyn ReportCache>, pairs: &[(&str, &str)]) -> Json {
    let body = report_response(&params(pairs), None, Arc::clone(cache), &registry());
    serde_json::from_str(&body).unwrap()
}

fn cache() -> Arc<dyn ReportCache> {
    Arc::new(MemoryCache::new())
}

fn user_ids(response: &Json) -> Vec<Json> {
    response["aaData"]
        .as_array()
        .unwrap()
        .iter()
        .map(|row| row[1].clone())
        .collect()
}

#[test]
fn test_report_must_be_named_and_known() {
    let cache = cache();
    assert_eq!(
        respond(&cache, &[]),
        json!({ "errors": ["Report code name not specified."] })
    );
    assert_eq!(
        respond(&cache, &[("report", "")]),
        json!({ "errors": ["Report code name not specified."] })
    );
    assert_eq!(
        respond(&cache, &[("report", "nope")]),
        json!({ "errors": ["Specified report not found."] })
    );
}

#[test]
fn test_metadata() {
    let response = respond(&cache(), &[("report", "widgets_report"), ("metadata", "1")]);
    assert_eq!(response["errors"], json!([]));
    assert_eq!(response["default_sort"], json!(["user_id", "asc"]));

    let widgets = response["widgets"].as_array().unwrap();
    assert_eq!(widgets.len(), 1);
    assert_eq!(widgets[0]["name"], json!("widgets_report_user_is_active"));
    assert_eq!(widgets[0]["type"], json!("select"));
    assert_eq!(widgets[0]["choices"], json!([[0, "All"], [1, "Active"]]));

    let keys: Vec<Json> = response["header"]
        .as_array()
        .unwrap()
        .iter()
        .map(|column| column["key"].clone())
        .collect();
    assert_eq!(keys, vec![json!("_row_id"), json!("user_id"), json!("num_widgets"), json!("total")]);
    assert_eq!(response["header"][0]["hidden"], json!(true));
}

#[test]
fn test_invalid_inputs_are_reported() {
    let response = respond(
        &cache(),
        &[("report", "widgets_report"), ("widgets_report_user_is_active", "7")],
    );
    assert_eq!(response, json!({ "errors": ["Please choose a valid option."] }));
}

#[test]
fn test_data_page_with_footer() {
    let response = respond(
        &cache(),
        &[
            ("report", "widgets_report"),
            ("widgets_report_user_is_active", "0"),
            ("sEcho", "3"),
        ],
    );
    assert_eq!(response["errors"], json!([]));
    assert_eq!(response["poll"], json!(false));
    assert_eq!(response["iTotalRecords"], json!(3));
    assert_eq!(response["iTotalDisplayRecords"], json!(3));
    assert_eq!(response["sEcho"], json!("3"));
    assert_eq!(
        response["aaData"],
        json!([
            [1, "1", "2", "6.0"],
            [2, "2", "1", "50.0"],
            [3, "3", "1", "1,000.0"],
        ])
    );
    assert_eq!(response["footer"], json!([null, null, "4", "1,056.0"]));
}

#[test]
fn test_filter_input_changes_instance() {
    let cache = cache();
    let all = respond(
        &cache,
        &[("report", "widgets_report"), ("widgets_report_user_is_active", "0")],
    );
    let active = respond(
        &cache,
        &[("report", "widgets_report"), ("user_is_active", "1")],
    );
    assert_eq!(all["iTotalRecords"], json!(3));
    assert_eq!(user_ids(&active), vec![json!("1"), json!("3")]);
    assert_eq!(cache.list_instances().unwrap().len(), 2);
}

#[test]
fn test_sorting_and_paging_params() {
    let cache = cache();
    let base = [("report", "widgets_report"), ("widgets_report_user_is_active", "0")];

    // column 3 is "total", counting the row id column as 0
    let mut pairs = base.to_vec();
    pairs.extend([("iSortCol_0", "3"), ("sSortDir_0", "desc")]);
    assert_eq!(
        user_ids(&respond(&cache, &pairs)),
        vec![json!("3"), json!("2"), json!("1")]
    );

    let mut pairs = base.to_vec();
    pairs.extend([
        ("iSortCol_0", "3"),
        ("sSortDir_0", "asc"),
        ("iDisplayStart", "1"),
        ("iDisplayLength", "1"),
    ]);
    let page = respond(&cache, &pairs);
    assert_eq!(user_ids(&page), vec![json!("2")]);
    // the totals still count every row
    assert_eq!(page["iTotalRecords"], json!(3));
}

#[test]
fn test_raw_output_mode() {
    let response = respond(
        &cache(),
        &[
            ("report", "widgets_report"),
            ("widgets_report_user_is_active", "0"),
            ("format", "raw"),
            ("iDisplayLength", "1"),
        ],
    );
    assert_eq!(response["aaData"], json!([[1, 1, 2, 6.0]]));
}

#[test]
fn test_bad_request_params() {
    let cache = cache();
    let base = [("report", "widgets_report"), ("widgets_report_user_is_active", "0")];
    for (name, value) in [
        ("iDisplayStart", "soon"),
        ("sSortDir_0", "sideways"),
        ("format", "pdf"),
        ("iSortCol_0", "99"),
    ] {
        let mut pairs = base.to_vec();
        pairs.push((name, value));
        let response = respond(&cache, &pairs);
        let errors = response["errors"].as_array().unwrap();
        assert_eq!(errors.len(), 1, "{name}: {response}");
        assert!(response.get("aaData").is_none(), "{name}");
    }
}

#[test]
fn test_runner_is_started_once_and_client_polls() {
    let cache = cache();
    let registry = registry();
    let started: RefCell<Vec<String>> = RefCell::new(Vec::new());
    let runner: &dyn Fn(&str, &BTreeMap<String, String>) = &|code_name, _| {
        started.borrow_mut().push(code_name.to_string());
    };
    let request = params(&[
        ("report", "widgets_report"),
        ("widgets_report_user_is_active", "0"),
    ]);

    let body = report_response(&request, Some(runner), Arc::clone(&cache), &registry);
    let response: Json = serde_json::from_str(&body).unwrap();
    assert_eq!(response, json!({ "errors": [], "poll": true }));
    assert_eq!(*started.borrow(), vec!["widgets_report"]);

    // once the run lands in the cache the same request returns data
    let body = report_response(&request, None, Arc::clone(&cache), &registry);
    let response: Json = serde_json::from_str(&body).unwrap();
    assert_eq!(response["iTotalRecords"], json!(3));

    let body = report_response(&request, Some(runner), cache, &registry);
    let response: Json = serde_json::from_str(&body).unwrap();
    assert_eq!(response["poll"], json!(false));
    assert_eq!(started.borrow().len(), 1);
}
