//! In-process report cache.
//!
//! Instances live in a concurrent map, so the cache can be shared across
//! threads but not across processes. Inserting the instance entry is the
//! write lock.

use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::mapref::one::Ref;
use dashmap::DashMap;

use super::{
    compare_rows, expiry, CacheError, CacheResult, CachedRow, InstanceInfo, ReportCache, RowQuery,
    RowStream, SortValue,
};
use crate::row::Row;

type InstanceKey = (String, String);

struct Instance {
    created: DateTime<Utc>,
    expires: DateTime<Utc>,
    finished: bool,
    columns: Vec<String>,
    rows: Vec<Row>,
    footer: Row,
}

impl Instance {
    fn locked(columns: Vec<String>, ttl: Duration) -> Self {
        let created = Utc::now();
        Self {
            created,
            expires: expiry(created, ttl),
            finished: false,
            columns,
            rows: Vec::new(),
            footer: Row::new(),
        }
    }

    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.finished && self.expires > now
    }
}

/// Report cache held in memory.
#[derive(Default)]
pub struct MemoryCache {
    instances: DashMap<InstanceKey, Instance>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(report_id: &str, instance_id: &str) -> InstanceKey {
        (report_id.to_string(), instance_id.to_string())
    }

    fn finished(&self, report_id: &str, instance_id: &str) -> CacheResult<Ref<'_, InstanceKey, Instance>> {
        match self.instances.get(&Self::key(report_id, instance_id)) {
            Some(instance) if instance.is_live(Utc::now()) => Ok(instance),
            _ => Err(CacheError::incomplete(report_id, instance_id)),
        }
    }
}

fn collect_rows(rows: &mut dyn RowStream) -> CacheResult<(Vec<Row>, Row)> {
    let mut collected = Vec::new();
    while let Some(row) = rows.next() {
        collected.push(row?);
    }
    let footer = rows.finalize_footer()?;
    Ok((collected, footer))
}

impl ReportCache for MemoryCache {
    fn create_instance(
        &self,
        report_id: &str,
        instance_id: &str,
        rows: &mut dyn RowStream,
        ttl: Duration,
    ) -> CacheResult<()> {
        let key = Self::key(report_id, instance_id);
        let columns = rows.column_names();
        match self.instances.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                if !entry.get().finished {
                    tracing::warn!(report_id, instance_id, "cache instance is locked");
                    return Err(CacheError::locked(report_id, instance_id));
                }
                if entry.get().expires > Utc::now() {
                    tracing::warn!(report_id, instance_id, "cache instance already exists");
                    return Err(CacheError::exists(report_id, instance_id));
                }
                entry.insert(Instance::locked(columns, ttl));
            }
            Entry::Vacant(entry) => {
                entry.insert(Instance::locked(columns, ttl));
            }
        }

        match collect_rows(rows) {
            Ok((collected, footer)) => {
                let count = collected.len();
                if let Some(mut instance) = self.instances.get_mut(&key) {
                    instance.rows = collected;
                    instance.footer = footer;
                    instance.finished = true;
                }
                tracing::debug!(report_id, instance_id, rows = count, "cache instance written");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(report_id, instance_id, error = %e, "cache write failed, unlocking");
                self.instances.remove(&key);
                Err(e)
            }
        }
    }

    fn kill_instance_cache(&self, report_id: &str, instance_id: &str) -> CacheResult<()> {
        self.instances.remove(&Self::key(report_id, instance_id));
        Ok(())
    }

    fn kill_report_cache(&self, report_id: &str) -> CacheResult<()> {
        self.instances.retain(|(report, _), _| report != report_id);
        Ok(())
    }

    fn is_instance_started(&self, report_id: &str, instance_id: &str) -> CacheResult<bool> {
        let now = Utc::now();
        Ok(self
            .instances
            .get(&Self::key(report_id, instance_id))
            .is_some_and(|instance| !instance.finished || instance.expires > now))
    }

    fn is_instance_finished(&self, report_id: &str, instance_id: &str) -> CacheResult<bool> {
        Ok(self.finished(report_id, instance_id).is_ok())
    }

    fn instance_row_count(&self, report_id: &str, instance_id: &str) -> CacheResult<usize> {
        Ok(self.finished(report_id, instance_id)?.rows.len())
    }

    fn instance_timestamp(&self, report_id: &str, instance_id: &str) -> CacheResult<DateTime<Utc>> {
        Ok(self.finished(report_id, instance_id)?.created)
    }

    fn instance_rows(
        &self,
        report_id: &str,
        instance_id: &str,
        query: &RowQuery,
    ) -> CacheResult<Vec<CachedRow>> {
        let instance = self.finished(report_id, instance_id)?;
        let mut rows: Vec<CachedRow> = instance
            .rows
            .iter()
            .zip(1i64..)
            .filter(|(_, id)| query.selected.as_ref().map_or(true, |ids| ids.contains(id)))
            .map(|(row, id)| CachedRow {
                id,
                row: row.clone(),
            })
            .collect();

        if let Some(sort) = &query.sort {
            if !instance.columns.contains(&sort.column) {
                return Err(CacheError::UnknownColumn(sort.column.clone()));
            }
            let mut keyed: Vec<(SortValue, CachedRow)> = rows
                .into_iter()
                .map(|cached| (SortValue::of(cached.row.get(&sort.column), query.alpha), cached))
                .collect();
            keyed.sort_by(|a, b| compare_rows((&a.0, a.1.id), (&b.0, b.1.id), sort.direction));
            rows = keyed.into_iter().map(|(_, cached)| cached).collect();
        }

        Ok(rows
            .into_iter()
            .skip(query.offset)
            .take(query.limit.unwrap_or(usize::MAX))
            .collect())
    }

    fn instance_footer(&self, report_id: &str, instance_id: &str) -> CacheResult<Row> {
        Ok(self.finished(report_id, instance_id)?.footer.clone())
    }

    fn purge_expired(&self) -> CacheResult<usize> {
        let now = Utc::now();
        let mut purged = 0;
        self.instances.retain(|_, instance| {
            let expired = instance.finished && instance.expires <= now;
            purged += usize::from(expired);
            !expired
        });
        if purged > 0 {
            tracing::info!(count = purged, "purged expired cache instances");
        }
        Ok(purged)
    }

    fn list_instances(&self) -> CacheResult<Vec<InstanceInfo>> {
        let mut instances: Vec<InstanceInfo> = self
            .instances
            .iter()
            .map(|entry| {
                let ((report_id, instance_id), instance) = entry.pair();
                InstanceInfo {
                    report_id: report_id.clone(),
                    instance_id: instance_id.clone(),
                    created: instance.created,
                    expires: instance.expires,
                    finished: instance.finished,
                    row_count: instance.rows.len(),
                }
            })
            .collect();
        instances.sort_by(|a, b| (&a.report_id, a.created).cmp(&(&b.report_id, b.created)));
        Ok(instances)
    }
}
