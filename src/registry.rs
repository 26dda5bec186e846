//! Process-wide report registry.
//!
//! Reports are registered explicitly at startup and looked up by code name
//! when a request names one. Registering two reports under the same code
//! name is rejected.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use once_cell::sync::Lazy;
use serde::Serialize;

use crate::cache::ReportCache;
use crate::error::{ReportError, ReportResult};
use crate::report::{Report, ReportDefinition, ReportFactory};

static GLOBAL: Lazy<Registry> = Lazy::new(Registry::new);

/// What the registry knows about a report without building it.
#[derive(Clone)]
pub struct ReportDescriptor {
    pub code_name: String,
    pub display_name: String,
    pub category: Option<String>,
    factory: ReportFactory,
}

impl ReportDescriptor {
    /// Builds a fresh definition of the report.
    pub fn definition(&self) -> ReportDefinition {
        (self.factory)()
    }

    /// Instantiates the report against `cache`.
    pub fn instantiate(&self, cache: Arc<dyn ReportCache>) -> ReportResult<Report> {
        Report::new(self.definition(), cache)
    }

    pub fn summary(&self) -> ReportSummary {
        ReportSummary {
            code_name: self.code_name.clone(),
            display_name: self.display_name.clone(),
            category: self.category.clone(),
        }
    }
}

impl std::fmt::Debug for ReportDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReportDescriptor")
            .field("code_name", &self.code_name)
            .field("category", &self.category)
            .finish_non_exhaustive()
    }
}

/// Serializable listing entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportSummary {
    pub code_name: String,
    pub display_name: String,
    pub category: Option<String>,
}

/// Mapping of code name to report descriptor.
#[derive(Default)]
pub struct Registry {
    reports: RwLock<BTreeMap<String, ReportDescriptor>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry.
    pub fn global() -> &'static Registry {
        &GLOBAL
    }

    /// Registers a report under the code name of the definition it builds.
    pub fn register<F>(&self, factory: F) -> ReportResult<()>
    where
        F: Fn() -> ReportDefinition + Send + Sync + 'static,
    {
        let definition = factory();
        let descriptor = ReportDescriptor {
            code_name: definition.code_name().to_string(),
            display_name: definition.display_name().to_string(),
            category: definition.category().map(str::to_string),
            factory: Arc::new(factory),
        };

        let mut reports = self.reports.write().unwrap_or_else(PoisonError::into_inner);
        if reports.contains_key(&descriptor.code_name) {
            return Err(ReportError::config(format!(
                "a report is already registered as {}",
                descriptor.code_name
            )));
        }
        tracing::debug!(report = %descriptor.code_name, "registered report");
        reports.insert(descriptor.code_name.clone(), descriptor);
        Ok(())
    }

    pub fn get_report_by_code_name(&self, code_name: &str) -> Option<ReportDescriptor> {
        self.reports
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(code_name)
            .cloned()
    }

    /// Looks a report up, failing with [`ReportError::UnknownReport`].
    pub fn require(&self, code_name: &str) -> ReportResult<ReportDescriptor> {
        self.get_report_by_code_name(code_name)
            .ok_or_else(|| ReportError::UnknownReport(code_name.to_string()))
    }

    /// Reports in a category, by code name. `None` lists every report.
    pub fn get_reports_by_category(&self, category: Option<&str>) -> Vec<ReportDescriptor> {
        self.reports
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|d| category.map_or(true, |c| d.category.as_deref() == Some(c)))
            .cloned()
            .collect()
    }
}

/// Registers a report in the process-wide registry.
pub fn register<F>(factory: F) -> ReportResult<()>
where
    F: Fn() -> ReportDefinition + Send + Sync + 'static,
{
    Registry::global().register(factory)
}

pub fn get_report_by_code_name(code_name: &str) -> Option<ReportDescriptor> {
    Registry::global().get_report_by_code_name(code_name)
}

pub fn get_reports_by_category(category: Option<&str>) -> Vec<ReportDescriptor> {
    Registry::global().get_reports_by_category(category)
}
