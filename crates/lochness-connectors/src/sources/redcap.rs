// crates/lochness-connectors/src/sources/redcap.rs
// ============================================================================
// Module: REDCap Source
// Description: Incremental record export from a REDCap project.
// Purpose: Turn REDCap log activity into per-record change items.
// Dependencies: lochness-core, reqwest, serde_json, tracing
// ============================================================================

//! ## Overview
//! Listing reads the project log (`content=log`) from the checkpoint minute
//! onward and keeps the latest create/update time per record. Records are
//! then exported in batches (`content=record`); all rows of a record (every
//! event and repeat instance) become one JSON payload.
//!
//! REDCap log timestamps have minute precision and are read as UTC. Changes
//! logged in the server's current minute are left for the next listing, so a
//! checkpoint never covers a minute that can still gain entries.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::collections::VecDeque;

use async_trait::async_trait;
use lochness_core::ChangeItem;
use lochness_core::ChangeStream;
use lochness_core::ConnectorError;
use lochness_core::DataSourceInstance;
use lochness_core::DataSourceType;
use lochness_core::ExternalId;
use lochness_core::Payload;
use lochness_core::Secret;
use lochness_core::SourceConnector;
use lochness_core::SourceMetadata;
use lochness_core::SubjectId;
use lochness_core::Timestamp;
use lochness_core::Watermark;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Map;
use serde_json::Value;
use tracing::debug;

use crate::http::HttpOptions;
use crate::http::build_client;
use crate::http::read_json;
use crate::http::send;
use crate::http::server_time;
use crate::registry::SourceFactory;
use crate::sources::descriptor_named;
use crate::sources::order_after;
use crate::sources::settled_before;
use crate::sources::wrong_metadata;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Records exported per request when the instance does not say otherwise.
const DEFAULT_BATCH_SIZE: usize = 50;
/// Record id field used when the instance does not name one.
const DEFAULT_RECORD_ID_FIELD: &str = "record_id";
/// Granularity of REDCap log timestamps (ms).
const LOG_CLOCK_UNIT_MS: i64 = 60_000;

// ============================================================================
// SECTION: Wire Types
// ============================================================================

/// One row of the REDCap log export.
#[derive(Debug, Deserialize)]
struct LogEntry {
    /// `YYYY-MM-DD HH:MM`.
    timestamp: String,
    /// Human-readable action (`Created Record 1001`, `Updated Record ...`).
    #[serde(default)]
    action: String,
    /// Record id (newer REDCap versions).
    #[serde(default)]
    record: Option<String>,
}

impl LogEntry {
    /// Returns the record created or updated by this entry, if any.
    fn changed_record(&self) -> Option<String> {
        let action = self.action.to_ascii_lowercase();
        if action.contains("delete") {
            return None;
        }
        if let Some(record) = self.record.as_deref().map(str::trim)
            && !record.is_empty()
        {
            return Some(record.to_string());
        }
        ["created record ", "updated record ", "create record ", "update record "]
            .iter()
            .find_map(|prefix| action.strip_prefix(prefix).map(|_| &self.action[prefix.len() ..]))
            .and_then(|rest| rest.split_whitespace().next())
            .map(str::to_string)
    }
}

/// Renders a scalar field value as text.
fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) if !text.is_empty() => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

// ============================================================================
// SECTION: Source
// ============================================================================

/// REDCap project source.
pub struct RedcapSource {
    /// Shared HTTP client.
    client: Client,
    /// API endpoint.
    endpoint: String,
    /// Record id field name.
    record_id_field: String,
    /// Field holding the subject id, when distinct from the record id.
    subject_id_variable: Option<String>,
    /// Records per export request.
    batch_size: usize,
    /// Response size cap.
    max_body_bytes: u64,
}

impl RedcapSource {
    /// Lists records changed after `since` with their latest change time.
    async fn changed_records(
        &self,
        since: &Watermark,
        token: &str,
    ) -> Result<Vec<(Timestamp, ExternalId, ())>, ConnectorError> {
        let begin_time = (!since.is_origin()).then(|| since.produced_at().format_minutes_utc());
        let mut form = vec![
            ("token", token),
            ("content", "log"),
            ("logtype", "record"),
            ("format", "json"),
            ("returnFormat", "json"),
        ];
        if let Some(begin_time) = &begin_time {
            form.push(("beginTime", begin_time.as_str()));
        }
        let response =
            send(self.client.post(&self.endpoint).form(&form), "redcap log export").await?;
        let server_now = server_time(&response);
        let entries: Vec<LogEntry> =
            read_json(response, self.max_body_bytes, "redcap log export").await?;

        let mut latest: BTreeMap<String, Timestamp> = BTreeMap::new();
        for entry in &entries {
            let Some(record) = entry.changed_record() else {
                continue;
            };
            let changed_at = Timestamp::parse_naive_utc(entry.timestamp.trim())
                .map_err(|err| ConnectorError::Malformed(format!("redcap log export: {err}")))?;
            latest
                .entry(record)
                .and_modify(|current| *current = (*current).max(changed_at))
                .or_insert(changed_at);
        }
        let listed =
            latest.into_iter().map(|(record, at)| (at, ExternalId::new(record), ())).collect();
        Ok(order_after(since, settled_before(listed, server_now, LOG_CLOCK_UNIT_MS)))
    }
}

#[async_trait]
impl SourceConnector for RedcapSource {
    async fn list_changes(
        &self,
        since: &Watermark,
        credential: &Secret,
    ) -> Result<Box<dyn ChangeStream>, ConnectorError> {
        let token = credential.field("api_token")?;
        let pending: VecDeque<(Timestamp, ExternalId)> = self
            .changed_records(since, &token)
            .await?
            .into_iter()
            .map(|(at, record, ())| (at, record))
            .collect();
        debug!(records = pending.len(), "redcap changes listed");
        Ok(Box::new(RedcapStream {
            client: self.client.clone(),
            endpoint: self.endpoint.clone(),
            record_id_field: self.record_id_field.clone(),
            subject_id_variable: self.subject_id_variable.clone(),
            batch_size: self.batch_size,
            max_body_bytes: self.max_body_bytes,
            pending,
            ready: VecDeque::new(),
        }))
    }
}

// ============================================================================
// SECTION: Stream
// ============================================================================

/// Batched record export stream.
struct RedcapStream {
    /// Shared HTTP client.
    client: Client,
    /// API endpoint.
    endpoint: String,
    /// Record id field name.
    record_id_field: String,
    /// Subject id field, if configured.
    subject_id_variable: Option<String>,
    /// Records per export request.
    batch_size: usize,
    /// Response size cap.
    max_body_bytes: u64,
    /// Records listed but not yet exported.
    pending: VecDeque<(Timestamp, ExternalId)>,
    /// Exported items not yet produced.
    ready: VecDeque<ChangeItem>,
}

impl RedcapStream {
    /// Exports the rows of `records`, grouped by record id.
    async fn export(
        &self,
        records: &[(Timestamp, ExternalId)],
        token: &str,
    ) -> Result<BTreeMap<String, Vec<Map<String, Value>>>, ConnectorError> {
        let keys: Vec<String> = (0 .. records.len()).map(|index| format!("records[{index}]")).collect();
        let mut form = vec![
            ("token", token),
            ("content", "record"),
            ("format", "json"),
            ("type", "flat"),
            ("returnFormat", "json"),
        ];
        for (key, (_, record)) in keys.iter().zip(records) {
            form.push((key.as_str(), record.as_str()));
        }
        let response =
            send(self.client.post(&self.endpoint).form(&form), "redcap record export").await?;
        let rows: Vec<Map<String, Value>> =
            read_json(response, self.max_body_bytes, "redcap record export").await?;

        let mut grouped: BTreeMap<String, Vec<Map<String, Value>>> = BTreeMap::new();
        for row in rows {
            let Some(record) = row.get(&self.record_id_field).and_then(scalar_text) else {
                return Err(ConnectorError::Malformed(format!(
                    "redcap record export: row without {}",
                    self.record_id_field
                )));
            };
            grouped.entry(record).or_default().push(row);
        }
        Ok(grouped)
    }

    /// Resolves the subject of a record from its rows.
    fn subject_of(&self, record: &ExternalId, rows: &[Map<String, Value>]) -> SubjectId {
        self.subject_id_variable
            .as_ref()
            .and_then(|field| rows.iter().find_map(|row| row.get(field).and_then(scalar_text)))
            .map_or_else(|| SubjectId::new(record.as_str()), SubjectId::new)
    }
}

#[async_trait]
impl ChangeStream for RedcapStream {
    async fn next_item(
        &mut self,
        credential: &Secret,
    ) -> Result<Option<ChangeItem>, ConnectorError> {
        loop {
            if let Some(item) = self.ready.pop_front() {
                return Ok(Some(item));
            }
            if self.pending.is_empty() {
                return Ok(None);
            }
            let take = self.batch_size.min(self.pending.len());
            let batch: Vec<(Timestamp, ExternalId)> =
                self.pending.iter().take(take).cloned().collect();
            let token = credential.field("api_token")?;
            let mut grouped = self.export(&batch, &token).await?;
            drop(token);
            self.pending.drain(.. take);
            for (produced_at, record) in batch {
                let Some(rows) = grouped.remove(record.as_str()) else {
                    debug!(record = %record, "redcap record listed but not exported");
                    continue;
                };
                let bytes = serde_json::to_vec(&rows).map_err(|err| {
                    ConnectorError::Malformed(format!("redcap record {record}: {err}"))
                })?;
                let subject = self.subject_of(&record, &rows);
                self.ready.push_back(ChangeItem {
                    external_id: record,
                    payload: Payload::json(bytes),
                    produced_at,
                    subject_id: Some(subject),
                });
            }
        }
    }
}

// ============================================================================
// SECTION: Factory
// ============================================================================

/// Factory for `redcap` sources.
pub struct RedcapSourceFactory {
    /// Shared HTTP client.
    client: Client,
    /// Response size cap.
    max_body_bytes: u64,
}

impl RedcapSourceFactory {
    /// Creates the factory and its HTTP client.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectorError::Permanent`] when the client cannot be built.
    pub fn new(options: &HttpOptions) -> Result<Self, ConnectorError> {
        Ok(Self {
            client: build_client(options)?,
            max_body_bytes: options.max_body_bytes,
        })
    }
}

impl SourceFactory for RedcapSourceFactory {
    fn descriptor(&self) -> DataSourceType {
        descriptor_named("redcap")
    }

    fn credential_fields(&self) -> &'static [&'static str] {
        &["api_token"]
    }

    fn build(
        &self,
        instance: &DataSourceInstance,
    ) -> Result<Box<dyn SourceConnector>, ConnectorError> {
        let SourceMetadata::Redcap(meta) = &instance.connector else {
            return Err(wrong_metadata("redcap", &instance.connector));
        };
        let batch_size = meta
            .batch_size
            .and_then(|size| usize::try_from(size).ok())
            .filter(|size| *size > 0)
            .unwrap_or(DEFAULT_BATCH_SIZE);
        Ok(Box::new(RedcapSource {
            client: self.client.clone(),
            endpoint: meta.endpoint_url.clone(),
            record_id_field: meta
                .record_id_field
                .clone()
                .unwrap_or_else(|| DEFAULT_RECORD_ID_FIELD.to_string()),
            subject_id_variable: meta.subject_id_variable.clone(),
            batch_size,
            max_body_bytes: self.max_body_bytes,
        }))
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests {
    #![allow(clippy::panic, clippy::unwrap_used, reason = "Test-only assertions.")]

    use super::LogEntry;

    fn entry(action: &str, record: Option<&str>) -> LogEntry {
        LogEntry {
            timestamp: "2024-05-01 12:30".to_string(),
            action: action.to_string(),
            record: record.map(str::to_string),
        }
    }

    #[test]
    fn record_ids_come_from_the_record_column_or_the_action() {
        assert_eq!(entry("Updated Record", Some("YA00001")).changed_record().unwrap(), "YA00001");
        assert_eq!(
            entry("Created Record YA00002 (API)", None).changed_record().unwrap(),
            "YA00002"
        );
        assert_eq!(entry("Deleted Record YA00003", Some("YA00003")).changed_record(), None);
        assert_eq!(entry("Data Export", None).changed_record(), None);
    }
}
