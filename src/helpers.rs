//! Request glue for table frontends.
//!
//! [`report_response`] answers one frontend request: report metadata,
//! input validation errors, a poll marker while an asynchronous run is in
//! progress, or a page of formatted rows with the footer. Paging and sorting
//! follow the DataTables parameter names (`iDisplayStart`, `iDisplayLength`,
//! `iSortCol_0`, `sSortDir_0`, `sEcho`).

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{json, Value as Json};

use crate::cache::{ReportCache, RowQuery, Sort, SortDirection};
use crate::error::{ReportError, ReportResult, ValidationError};
use crate::format::OutputMode;
use crate::registry::Registry;
use crate::report::Report;

/// Starts a report run elsewhere, given the code name and request inputs.
pub type Runner<'a> = &'a dyn Fn(&str, &BTreeMap<String, String>);

/// Handles one request and returns the JSON response body.
///
/// Without a runner, an unfinished report is run synchronously. With one,
/// the runner is started once and the response asks the caller to poll.
pub fn report_response(
    params: &BTreeMap<String, String>,
    runner: Option<Runner<'_>>,
    cache: Arc<dyn ReportCache>,
    registry: &Registry,
) -> String {
    let response = respond(params.clone(), runner, cache, registry).unwrap_or_else(|e| {
        let errors: Vec<String> = match e.validation_errors() {
            Some(errors) => errors.iter().map(ToString::to_string).collect(),
            None => vec![e.to_string()],
        };
        json!({ "errors": errors })
    });
    response.to_string()
}

fn respond(
    mut params: BTreeMap<String, String>,
    runner: Option<Runner<'_>>,
    cache: Arc<dyn ReportCache>,
    registry: &Registry,
) -> ReportResult<Json> {
    let Some(code_name) = params.remove("report").filter(|name| !name.is_empty()) else {
        return Ok(json!({ "errors": ["Report code name not specified."] }));
    };
    let Some(descriptor) = registry.get_report_by_code_name(&code_name) else {
        return Ok(json!({ "errors": ["Specified report not found."] }));
    };
    let mut report = descriptor.instantiate(cache)?;

    if params.remove("metadata").is_some_and(|flag| is_set(&flag)) {
        let default_sort = report
            .definition()
            .default_sort()
            .map(|sort| json!([sort.column, sort.direction]));
        return Ok(json!({
            "errors": [],
            "widgets": report.definition().widgets(),
            "header": report.report_header(),
            "default_sort": default_sort,
        }));
    }

    let mode = match params.remove("format") {
        Some(format) => format.parse().map_err(invalid)?,
        None => OutputMode::Display,
    };

    let errors = report.clean_user_inputs(&params);
    if !errors.is_empty() {
        return Err(ReportError::Validation(errors));
    }

    if !report.is_report_finished()? {
        match runner {
            Some(runner) => {
                if !report.is_report_started()? {
                    tracing::info!(report = %code_name, "handing report to runner");
                    runner(&code_name, &params);
                }
                return Ok(json!({ "errors": [], "poll": true }));
            }
            None => run(&mut report)?,
        }
    }

    let query = page_query(&report, &params)?;
    let echo = int_param(&params, "sEcho")?.unwrap_or(0);
    let count = report.report_row_count()?;
    Ok(json!({
        "errors": [],
        "poll": false,
        "iTotalRecords": count,
        "iTotalDisplayRecords": count,
        "sEcho": echo.to_string(),
        "aaData": report.report_rows(query, mode)?,
        "footer": report.report_footer(mode)?,
    }))
}

/// Runs the report, accepting an instance another request finished first.
fn run(report: &mut Report) -> ReportResult<()> {
    match report.run_report() {
        Err(ReportError::Cache(e)) if e.is_exists() => Ok(()),
        other => other,
    }
}

fn page_query(report: &Report, params: &BTreeMap<String, String>) -> ReportResult<RowQuery> {
    let definition = report.definition();
    let default_sort = definition.default_sort();

    let column = match int_param(params, "iSortCol_0")? {
        // index 0 is the row id column
        Some(index) if index > 0 => definition
            .columns()
            .get((index - 1) as usize)
            .map(|(name, _)| name.clone())
            .ok_or_else(|| ReportError::UnknownColumn(index.to_string()))?,
        _ => match &default_sort {
            Some(sort) => sort.column.clone(),
            None => return Ok(RowQuery::new()),
        },
    };
    let direction = match params.get("sSortDir_0") {
        Some(dir) => dir.parse().map_err(invalid)?,
        None => default_sort.map_or(SortDirection::Desc, |sort| sort.direction),
    };

    let mut query = RowQuery::new()
        .with_sort(Sort::new(column, direction))
        .with_offset(int_param(params, "iDisplayStart")?.unwrap_or(0).max(0) as usize);
    if let Some(limit) = int_param(params, "iDisplayLength")?.filter(|l| *l >= 0) {
        query = query.with_limit(limit as usize);
    }
    Ok(query)
}

fn int_param(params: &BTreeMap<String, String>, name: &str) -> ReportResult<Option<i64>> {
    params
        .get(name)
        .filter(|value| !value.is_empty())
        .map(|value| {
            value
                .trim()
                .parse()
                .map_err(|_| invalid(format!("Parameter {name} must be an integer.")))
        })
        .transpose()
}

fn invalid(message: impl Into<String>) -> ReportError {
    ReportError::Validation(vec![ValidationError::new(message)])
}

fn is_set(flag: &str) -> bool {
    !matches!(flag.trim().to_ascii_lowercase().as_str(), "" | "0" | "false")
}
