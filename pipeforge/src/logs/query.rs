//! Log queries, pages and summaries.
//!
//! Every backend answers the same query surface with the same semantics:
//! filters are conjunctive, results are ordered by `(timestamp, id)`, and an
//! `after_id` cursor selects entries strictly beyond the cursor entry's
//! position under the active sort. The in-memory evaluation here is the
//! reference; the SQLite backend translates it to SQL.

use super::entry::{LogEntry, LogLevel};
use crate::core::AgentType;
use crate::utils::Timestamp;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Result ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    /// Oldest first.
    #[default]
    Asc,
    /// Newest first.
    Desc,
}

/// A filtered, paginated read of one execution's log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogQuery {
    /// Execution to read.
    pub execution_id: Uuid,
    /// Restricts results to one tenant. Set by the log store from the caller.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    /// Exact level match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<LogLevel>,
    /// Exact stage match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<AgentType>,
    /// Inclusive lower time bound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<Timestamp>,
    /// Exclusive upper time bound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<Timestamp>,
    /// Case-sensitive substring of the message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
    /// Ordering.
    #[serde(default)]
    pub sort: SortOrder,
    /// Cursor: return entries strictly beyond this entry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after_id: Option<u64>,
    /// Page size; the store's default applies when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    /// Entries to skip after the cursor.
    #[serde(default)]
    pub offset: usize,
}

impl LogQuery {
    /// An unfiltered ascending query over one execution.
    #[must_use]
    pub fn new(execution_id: Uuid) -> Self {
        Self {
            execution_id,
            tenant_id: None,
            level: None,
            stage: None,
            start_time: None,
            end_time: None,
            search: None,
            sort: SortOrder::Asc,
            after_id: None,
            limit: None,
            offset: 0,
        }
    }

    /// Restricts to a tenant.
    #[must_use]
    pub fn for_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    /// Filters by level.
    #[must_use]
    pub fn level(mut self, level: LogLevel) -> Self {
        self.level = Some(level);
        self
    }

    /// Filters by stage.
    #[must_use]
    pub fn stage(mut self, stage: AgentType) -> Self {
        self.stage = Some(stage);
        self
    }

    /// Keeps entries at or after `start`.
    #[must_use]
    pub fn since(mut self, start: Timestamp) -> Self {
        self.start_time = Some(start);
        self
    }

    /// Keeps entries strictly before `end`.
    #[must_use]
    pub fn until(mut self, end: Timestamp) -> Self {
        self.end_time = Some(end);
        self
    }

    /// Filters by message substring.
    #[must_use]
    pub fn search(mut self, needle: impl Into<String>) -> Self {
        self.search = Some(needle.into());
        self
    }

    /// Sets the ordering.
    #[must_use]
    pub fn sort(mut self, sort: SortOrder) -> Self {
        self.sort = sort;
        self
    }

    /// Sets the cursor.
    #[must_use]
    pub fn after(mut self, id: u64) -> Self {
        self.after_id = Some(id);
        self
    }

    /// Sets the page size.
    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Sets the offset.
    #[must_use]
    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// Returns true if `entry` passes every filter. The cursor is not a filter.
    #[must_use]
    pub fn matches(&self, entry: &LogEntry) -> bool {
        entry.execution_id == self.execution_id
            && self.tenant_id.as_ref().map_or(true, |t| *t == entry.tenant_id)
            && self.level.map_or(true, |l| l == entry.level)
            && self.stage.map_or(true, |s| entry.stage == Some(s))
            && self.start_time.map_or(true, |t| entry.timestamp >= t)
            && self.end_time.map_or(true, |t| entry.timestamp < t)
            && self
                .search
                .as_deref()
                .map_or(true, |needle| entry.message.contains(needle))
    }

    /// The page size to use given the store's default and maximum.
    #[must_use]
    pub fn effective_limit(&self, default: usize, max: usize) -> usize {
        self.limit.unwrap_or(default).min(max)
    }
}

/// One page of query results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogPage {
    /// Entries in the requested order.
    pub entries: Vec<LogEntry>,
    /// Entries matching the filters, ignoring cursor, offset and limit.
    pub total: usize,
    /// Cursor for the next page, when there is one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<u64>,
    /// Whether entries remain beyond this page.
    pub has_more: bool,
}

impl LogPage {
    /// An empty page.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            entries: Vec::new(),
            total: 0,
            next_cursor: None,
            has_more: false,
        }
    }

    /// Ids of the entries on this page.
    #[must_use]
    pub fn ids(&self) -> Vec<u64> {
        self.entries.iter().map(|e| e.id).collect()
    }
}

/// The slice of an execution's log to summarise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryScope {
    /// Execution to summarise.
    pub execution_id: Uuid,
    /// Restricts to a tenant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    /// Inclusive lower time bound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<Timestamp>,
    /// Exclusive upper time bound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<Timestamp>,
}

impl SummaryScope {
    /// The whole log of an execution.
    #[must_use]
    pub fn new(execution_id: Uuid) -> Self {
        Self {
            execution_id,
            tenant_id: None,
            start_time: None,
            end_time: None,
        }
    }

    /// Restricts to a tenant.
    #[must_use]
    pub fn for_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    /// Restricts to `[start, end)`.
    #[must_use]
    pub fn between(mut self, start: Option<Timestamp>, end: Option<Timestamp>) -> Self {
        self.start_time = start;
        self.end_time = end;
        self
    }

    fn as_query(&self) -> LogQuery {
        LogQuery {
            tenant_id: self.tenant_id.clone(),
            start_time: self.start_time,
            end_time: self.end_time,
            ..LogQuery::new(self.execution_id)
        }
    }
}

/// Aggregate counts over a slice of an execution's log.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LogSummary {
    /// Entries in scope.
    pub total: usize,
    /// Counts keyed by uppercase level name.
    pub by_level: BTreeMap<String, usize>,
    /// Counts keyed by stage name; stage-less entries are not counted here.
    pub by_stage: BTreeMap<String, usize>,
    /// Earliest timestamp in scope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_timestamp: Option<Timestamp>,
    /// Latest timestamp in scope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_timestamp: Option<Timestamp>,
}

impl LogSummary {
    /// Count for one level.
    #[must_use]
    pub fn level_count(&self, level: LogLevel) -> usize {
        self.by_level.get(level.as_str()).copied().unwrap_or(0)
    }

    /// Count for one stage.
    #[must_use]
    pub fn stage_count(&self, stage: AgentType) -> usize {
        self.by_stage.get(stage.as_str()).copied().unwrap_or(0)
    }

    /// Folds one entry into the summary.
    pub fn add(&mut self, entry: &LogEntry) {
        self.total += 1;
        *self.by_level.entry(entry.level.as_str().to_string()).or_insert(0) += 1;
        if let Some(stage) = entry.stage {
            *self.by_stage.entry(stage.as_str().to_string()).or_insert(0) += 1;
        }
        self.first_timestamp = Some(
            self.first_timestamp
                .map_or(entry.timestamp, |t| t.min(entry.timestamp)),
        );
        self.last_timestamp = Some(
            self.last_timestamp
                .map_or(entry.timestamp, |t| t.max(entry.timestamp)),
        );
    }
}

/// Position of an `after_id` cursor.
#[derive(Debug, Clone, Copy)]
enum Cursor {
    /// The cursor entry exists: compare on `(timestamp, id)`.
    Key(Timestamp, u64),
    /// The cursor entry is unknown: compare on id alone.
    Seq(u64),
}

impl Cursor {
    fn is_beyond(self, entry: &LogEntry, sort: SortOrder) -> bool {
        match (self, sort) {
            (Self::Key(ts, id), SortOrder::Asc) => entry.sort_key() > (ts, id),
            (Self::Key(ts, id), SortOrder::Desc) => entry.sort_key() < (ts, id),
            (Self::Seq(id), SortOrder::Asc) => entry.id > id,
            (Self::Seq(id), SortOrder::Desc) => entry.id < id,
        }
    }
}

/// Evaluates `query` over `entries`, which may hold other executions' rows.
pub(crate) fn evaluate<'a, I>(entries: I, query: &LogQuery, limit: usize) -> LogPage
where
    I: IntoIterator<Item = &'a LogEntry>,
{
    let mut cursor_key = None;
    let mut matching: Vec<&LogEntry> = Vec::new();
    for entry in entries {
        if entry.execution_id != query.execution_id {
            continue;
        }
        if query.after_id == Some(entry.id) {
            cursor_key = Some(Cursor::Key(entry.timestamp, entry.id));
        }
        if query.matches(entry) {
            matching.push(entry);
        }
    }

    match query.sort {
        SortOrder::Asc => matching.sort_by_key(|e| e.sort_key()),
        SortOrder::Desc => matching.sort_by(|a, b| b.sort_key().cmp(&a.sort_key())),
    }
    let total = matching.len();

    let cursor = query.after_id.map(|id| cursor_key.unwrap_or(Cursor::Seq(id)));
    let beyond: Vec<&LogEntry> = matching
        .into_iter()
        .filter(|e| cursor.map_or(true, |c| c.is_beyond(e, query.sort)))
        .collect();

    let entries: Vec<LogEntry> = beyond
        .iter()
        .skip(query.offset)
        .take(limit)
        .map(|e| (*e).clone())
        .collect();
    let has_more = beyond.len() > query.offset.saturating_add(entries.len());
    let next_cursor = if has_more { entries.last().map(|e| e.id) } else { None };

    LogPage {
        entries,
        total,
        next_cursor,
        has_more,
    }
}

/// Summarises the entries of `scope` found in `entries`.
pub(crate) fn summarize<'a, I>(entries: I, scope: &SummaryScope) -> LogSummary
where
    I: IntoIterator<Item = &'a LogEntry>,
{
    let filter = scope.as_query();
    let mut summary = LogSummary::default();
    for entry in entries.into_iter().filter(|e| filter.matches(e)) {
        summary.add(entry);
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use pretty_assertions::assert_eq;

    fn seed(execution_id: Uuid) -> Vec<LogEntry> {
        let t0 = crate::utils::now_utc();
        let specs = [
            (LogLevel::Info, "backend started", Some(AgentType::Backend)),
            (LogLevel::Error, "x failed to compile", Some(AgentType::Backend)),
            (LogLevel::Error, "database unreachable", None),
            (LogLevel::Info, "x generated", Some(AgentType::Frontend)),
            (LogLevel::Error, "x timeout", Some(AgentType::Frontend)),
        ];
        specs
            .iter()
            .enumerate()
            .map(|(i, (level, msg, stage))| {
                let mut e = LogEntry::new(execution_id, "acme", "shop", *level, *msg)
                    .at(t0 + Duration::milliseconds(i as i64));
                e.id = i as u64 + 1;
                e.stage = *stage;
                e
            })
            .collect()
    }

    #[test]
    fn test_unfiltered_ascending_returns_append_order() {
        let id = Uuid::now_v7();
        let entries = seed(id);
        let page = evaluate(&entries, &LogQuery::new(id), 100);
        assert_eq!(page.ids(), vec![1, 2, 3, 4, 5]);
        assert_eq!(page.total, 5);
        assert!(!page.has_more);
    }

    #[test]
    fn test_filter_conjunction() {
        let id = Uuid::now_v7();
        let entries = seed(id);
        let page = evaluate(&entries, &LogQuery::new(id).level(LogLevel::Error).search("x"), 100);
        assert_eq!(page.ids(), vec![2, 5]);
        assert!(page.entries.iter().all(|e| e.level == LogLevel::Error && e.message.contains('x')));
    }

    #[test]
    fn test_cursor_applies_after_filters() {
        let id = Uuid::now_v7();
        let entries = seed(id);
        let query = LogQuery::new(id).level(LogLevel::Error).after(2);
        assert_eq!(evaluate(&entries, &query, 100).ids(), vec![3, 5]);

        // The cursor entry itself need not match the filters.
        let query = LogQuery::new(id).level(LogLevel::Error).after(1);
        assert_eq!(evaluate(&entries, &query, 100).ids(), vec![2, 3, 5]);
    }

    #[test]
    fn test_descending_cursor() {
        let id = Uuid::now_v7();
        let entries = seed(id);
        let page = evaluate(&entries, &LogQuery::new(id).sort(SortOrder::Desc).after(4), 100);
        assert_eq!(page.ids(), vec![3, 2, 1]);
    }

    #[test]
    fn test_unknown_cursor_falls_back_to_sequence() {
        let id = Uuid::now_v7();
        let entries: Vec<LogEntry> = seed(id).into_iter().filter(|e| e.id != 3).collect();
        let page = evaluate(&entries, &LogQuery::new(id).after(3), 100);
        assert_eq!(page.ids(), vec![4, 5]);
    }

    #[test]
    fn test_pagination_walk() {
        let id = Uuid::now_v7();
        let entries = seed(id);
        let first = evaluate(&entries, &LogQuery::new(id), 2);
        assert_eq!(first.ids(), vec![1, 2]);
        assert!(first.has_more);
        assert_eq!(first.next_cursor, Some(2));

        let second = evaluate(&entries, &LogQuery::new(id).after(2), 2);
        assert_eq!(second.ids(), vec![3, 4]);

        let last = evaluate(&entries, &LogQuery::new(id).after(4), 2);
        assert_eq!(last.ids(), vec![5]);
        assert!(!last.has_more);
        assert_eq!(last.next_cursor, None);

        let offset = evaluate(&entries, &LogQuery::new(id).offset(3), 10);
        assert_eq!(offset.ids(), vec![4, 5]);
    }

    #[test]
    fn test_time_bounds_are_half_open() {
        let id = Uuid::now_v7();
        let entries = seed(id);
        let start = entries[1].timestamp;
        let end = entries[3].timestamp;
        let page = evaluate(&entries, &LogQuery::new(id).since(start).until(end), 100);
        assert_eq!(page.ids(), vec![2, 3]);
    }

    #[test]
    fn test_tenant_and_execution_isolation() {
        let id = Uuid::now_v7();
        let mut entries = seed(id);
        entries.extend(seed(Uuid::now_v7()));
        assert_eq!(evaluate(&entries, &LogQuery::new(id), 100).total, 5);
        assert_eq!(
            evaluate(&entries, &LogQuery::new(id).for_tenant("globex"), 100).total,
            0
        );
    }

    #[test]
    fn test_summary_excludes_stageless_from_stage_counts() {
        let id = Uuid::now_v7();
        let entries = seed(id);
        let summary = summarize(&entries, &SummaryScope::new(id));
        assert_eq!(summary.total, 5);
        assert_eq!(summary.level_count(LogLevel::Error), 3);
        assert_eq!(summary.stage_count(AgentType::Backend), 2);
        assert_eq!(summary.by_stage.values().sum::<usize>(), 4);
        assert_eq!(summary.first_timestamp, Some(entries[0].timestamp));
        assert_eq!(summary.last_timestamp, Some(entries[4].timestamp));
    }
}
