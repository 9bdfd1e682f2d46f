//! # Entity Stream
//!
//! One entity's raw tabular stream, read row by row with one row of
//! lookahead.
//!
//! ## Lifecycle
//!
//! `Unbound` -> `bind` -> `Bound` -> `accept_data_streams` -> `Streaming`
//! -> `Exhausted`. The header is checked on accept, before any data row is
//! read. `Exhausted` is terminal; the reader is dropped on entry, including
//! on every error path.
//!
//! Rows are handed to the caller's `RowHook` as they are read, so the
//! lookahead row is already complete when a predicate inspects it.

use super::{DataStream, RowHook, StreamSpec};
use crate::primitives::FIELD_DELIMITER;
use crate::types::{MergeError, Row, VariableSpec};
use csv::{Reader, ReaderBuilder, StringRecord};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::mem;

enum StreamState {
    Unbound,
    Bound,
    Streaming {
        reader: Reader<DataStream>,
        lookahead: Row,
    },
    Exhausted,
}

impl StreamState {
    const fn name(&self) -> &'static str {
        match self {
            Self::Unbound => "unbound",
            Self::Bound => "bound",
            Self::Streaming { .. } => "streaming",
            Self::Exhausted => "exhausted",
        }
    }
}

struct Binding {
    spec: StreamSpec,
    /// Raw variable ids, as the upstream header must list them.
    expected_header: Vec<String>,
    /// Dot-notation keys of each row.
    columns: Vec<String>,
}

/// Detects rows that are not grouped contiguously by one column.
struct GroupingCheck {
    column: String,
    current: Option<String>,
    finished: BTreeSet<String>,
}

impl GroupingCheck {
    fn observe(&mut self, stream: &str, row: &Row) -> Result<(), MergeError> {
        let Some(value) = row.get(&self.column) else {
            return Ok(());
        };
        if self.current.as_deref() == Some(value.as_str()) {
            return Ok(());
        }
        if self.finished.contains(value) {
            return Err(MergeError::OutOfOrder {
                stream: stream.to_string(),
                column: self.column.clone(),
                id: value.clone(),
            });
        }
        if let Some(previous) = self.current.replace(value.clone()) {
            self.finished.insert(previous);
        }
        Ok(())
    }
}

/// Streaming reader for one entity.
pub struct EntityStream {
    binding: Option<Binding>,
    state: StreamState,
    line: u64,
    record: StringRecord,
    grouping: Option<GroupingCheck>,
}

impl fmt::Debug for EntityStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityStream")
            .field("name", &self.name())
            .field("state", &self.state.name())
            .field("line", &self.line)
            .finish()
    }
}

impl Default for EntityStream {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityStream {
    #[must_use]
    pub fn new() -> Self {
        Self {
            binding: None,
            state: StreamState::Unbound,
            line: 0,
            record: StringRecord::new(),
            grouping: None,
        }
    }

    /// Bind a stream spec and the full column list its stream carries.
    pub fn bind(&mut self, spec: StreamSpec, columns: &[VariableSpec]) -> Result<(), MergeError> {
        if !matches!(self.state, StreamState::Unbound) {
            return Err(self.state_error(format!("bind called while {}", self.state.name())));
        }
        self.binding = Some(Binding {
            spec,
            expected_header: columns.iter().map(|c| c.variable_id.clone()).collect(),
            columns: columns.iter().map(VariableSpec::dot_notation).collect(),
        });
        self.state = StreamState::Bound;
        Ok(())
    }

    /// Reject rows whose `column` value reappears after a different value.
    pub fn validate_grouping(&mut self, column: impl Into<String>) {
        self.grouping = Some(GroupingCheck {
            column: column.into(),
            current: None,
            finished: BTreeSet::new(),
        });
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.binding.as_ref().map_or("<unbound>", |b| b.spec.name.as_str())
    }

    #[must_use]
    pub fn spec(&self) -> Option<&StreamSpec> {
        self.binding.as_ref().map(|b| &b.spec)
    }

    /// Dot-notation column names of each row.
    #[must_use]
    pub fn columns(&self) -> &[String] {
        self.binding.as_ref().map_or(&[], |b| b.columns.as_slice())
    }

    /// Header line the upstream stream must carry.
    #[must_use]
    pub fn expected_header(&self) -> &[String] {
        self.binding
            .as_ref()
            .map_or(&[], |b| b.expected_header.as_slice())
    }

    /// Claim this stream's source from `streams`, check its header and
    /// prime the lookahead row.
    pub fn accept_data_streams<H: RowHook + ?Sized>(
        &mut self,
        streams: &mut BTreeMap<String, DataStream>,
        hook: &mut H,
    ) -> Result<(), MergeError> {
        if !matches!(self.state, StreamState::Bound) {
            return Err(self.state_error(format!(
                "accept_data_streams called while {}",
                self.state.name()
            )));
        }
        let Some(binding) = self.binding.as_ref() else {
            return Err(self.state_error("no stream spec bound".to_string()));
        };
        let source = streams.remove(&binding.spec.name).ok_or_else(|| {
            MergeError::StreamNotDistributed {
                stream: binding.spec.name.clone(),
                entity_id: binding.spec.entity_id.clone(),
            }
        })?;

        let mut reader = ReaderBuilder::new()
            .delimiter(FIELD_DELIMITER)
            .has_headers(false)
            .quoting(false)
            .flexible(true)
            .from_reader(source);

        let mut header = StringRecord::new();
        if !reader.read_record(&mut header)? {
            self.state = StreamState::Exhausted;
            return Err(MergeError::EmptyStream(binding.spec.name.clone()));
        }
        if header.iter().ne(binding.expected_header.iter().map(String::as_str)) {
            self.state = StreamState::Exhausted;
            return Err(MergeError::HeaderMismatch {
                stream: binding.spec.name.clone(),
                expected: binding.expected_header.clone(),
                found: header.iter().map(str::to_string).collect(),
            });
        }
        tracing::info!(
            stream = %binding.spec.name,
            entity = %binding.spec.entity_id,
            columns = binding.columns.len(),
            "stream header accepted"
        );

        self.line = 1;
        self.state = StreamState::Exhausted;
        if let Some(first) = self.read_row(&mut reader, hook)? {
            self.state = StreamState::Streaming {
                reader,
                lookahead: first,
            };
        } else {
            tracing::debug!(stream = %self.name(), "stream has no data rows");
        }
        Ok(())
    }

    #[must_use]
    pub fn has_next(&self) -> bool {
        matches!(self.state, StreamState::Streaming { .. })
    }

    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        matches!(self.state, StreamState::Exhausted)
    }

    /// Consume the lookahead row and read the next one.
    pub fn next_row<H: RowHook + ?Sized>(
        &mut self,
        hook: &mut H,
    ) -> Result<Option<Row>, MergeError> {
        match mem::replace(&mut self.state, StreamState::Exhausted) {
            StreamState::Streaming {
                mut reader,
                lookahead,
            } => {
                if let Some(next) = self.read_row(&mut reader, hook)? {
                    self.state = StreamState::Streaming {
                        reader,
                        lookahead: next,
                    };
                }
                Ok(Some(lookahead))
            }
            StreamState::Exhausted => Ok(None),
            other => {
                let reason = format!("next_row called while {}", other.name());
                self.state = other;
                Err(self.state_error(reason))
            }
        }
    }

    /// The lookahead row, if it satisfies `predicate`. Does not consume.
    pub fn peek_if(&self, predicate: impl FnOnce(&Row) -> bool) -> Option<&Row> {
        match &self.state {
            StreamState::Streaming { lookahead, .. } if predicate(lookahead) => Some(lookahead),
            _ => None,
        }
    }

    /// Consume the lookahead row only if it satisfies `predicate`.
    pub fn consume_if<H: RowHook + ?Sized>(
        &mut self,
        predicate: impl FnOnce(&Row) -> bool,
        hook: &mut H,
    ) -> Result<Option<Row>, MergeError> {
        if self.peek_if(predicate).is_none() {
            return Ok(None);
        }
        self.next_row(hook)
    }

    fn read_row<H: RowHook + ?Sized>(
        &mut self,
        reader: &mut Reader<DataStream>,
        hook: &mut H,
    ) -> Result<Option<Row>, MergeError> {
        if !reader.read_record(&mut self.record)? {
            return Ok(None);
        }
        self.line += 1;
        let Some(binding) = self.binding.as_ref() else {
            return Err(self.state_error("no stream spec bound".to_string()));
        };
        if self.record.len() != binding.columns.len() {
            return Err(MergeError::RowWidth {
                stream: binding.spec.name.clone(),
                line: self.line,
                expected: binding.columns.len(),
                found: self.record.len(),
            });
        }

        let mut row: Row = binding
            .columns
            .iter()
            .cloned()
            .zip(self.record.iter().map(str::to_string))
            .collect();
        if let Some(check) = self.grouping.as_mut() {
            check.observe(&binding.spec.name, &row)?;
        }
        hook.apply_derived_vars(&mut row)?;
        Ok(Some(row))
    }

    fn state_error(&self, reason: String) -> MergeError {
        MergeError::StreamState {
            stream: self.name().to_string(),
            reason,
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
