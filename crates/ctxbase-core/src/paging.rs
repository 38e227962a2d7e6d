//! Keyset pagination over `(created_at, id)` ordered record streams.
//!
//! A cursor is `base64url("{unix_nanos}|{uuid}")` without padding. The
//! position it names is exclusive: the next page starts strictly after it in
//! the requested order.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

pub const DEFAULT_PAGE_LIMIT: u32 = 20;
pub const MAX_PAGE_LIMIT: u32 = 200;
const CURSOR_DELIMITER: char = '|';

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PagingError {
    #[error("invalid cursor: {reason}")]
    InvalidCursor { reason: String },
    #[error("invalid limit {limit}: expected 1..={max}")]
    InvalidLimit { limit: u32, max: u32 },
    #[error("timestamp does not fit a nanosecond cursor")]
    TimestampOutOfRange,
}

impl PagingError {
    fn invalid_cursor(reason: impl Into<String>) -> Self {
        Self::InvalidCursor {
            reason: reason.into(),
        }
    }

    /// Errors caused by caller input rather than by the stored data.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::InvalidCursor { .. } | Self::InvalidLimit { .. })
    }
}

/// Composite ordering key. `id` breaks ties between equal timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SortKey {
    pub created_at: DateTime<Utc>,
    pub id: Uuid,
}

impl SortKey {
    pub fn new(created_at: DateTime<Utc>, id: Uuid) -> Self {
        Self { created_at, id }
    }

    pub fn created_at_nanos(&self) -> Result<i64, PagingError> {
        self.created_at
            .timestamp_nanos_opt()
            .ok_or(PagingError::TimestampOutOfRange)
    }

    pub fn to_cursor(&self) -> Result<String, PagingError> {
        encode_cursor(self.created_at, self.id)
    }
}

impl Ord for SortKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.created_at
            .cmp(&other.created_at)
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for SortKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

pub trait Keyed {
    fn sort_key(&self) -> SortKey;
}

impl Keyed for SortKey {
    fn sort_key(&self) -> SortKey {
        *self
    }
}

pub fn encode_cursor(created_at: DateTime<Utc>, id: Uuid) -> Result<String, PagingError> {
    let nanos = created_at
        .timestamp_nanos_opt()
        .ok_or(PagingError::TimestampOutOfRange)?;
    let raw = format!("{nanos}{CURSOR_DELIMITER}{}", id.hyphenated());
    Ok(URL_SAFE_NO_PAD.encode(raw.as_bytes()))
}

/// Decodes a cursor. The empty string means "no position" and yields `None`.
pub fn decode_cursor(cursor: &str) -> Result<Option<SortKey>, PagingError> {
    if cursor.is_empty() {
        return Ok(None);
    }

    let bytes = URL_SAFE_NO_PAD
        .decode(cursor)
        .map_err(|err| PagingError::invalid_cursor(format!("not base64url: {err}")))?;
    let raw = String::from_utf8(bytes)
        .map_err(|_| PagingError::invalid_cursor("payload is not utf-8"))?;

    let mut fields = raw.split(CURSOR_DELIMITER);
    let (Some(nanos), Some(id), None) = (fields.next(), fields.next(), fields.next()) else {
        return Err(PagingError::invalid_cursor(
            "expected exactly two delimited fields",
        ));
    };

    let parsed_nanos = nanos
        .parse::<i64>()
        .map_err(|err| PagingError::invalid_cursor(format!("bad timestamp {nanos:?}: {err}")))?;
    let parsed_id = Uuid::parse_str(id)
        .map_err(|err| PagingError::invalid_cursor(format!("bad id {id:?}: {err}")))?;

    // Only the exact text encode_cursor emits names a position.
    if parsed_nanos.to_string() != nanos {
        return Err(PagingError::invalid_cursor(format!(
            "non-canonical timestamp {nanos:?}"
        )));
    }
    if parsed_id.hyphenated().to_string() != id {
        return Err(PagingError::invalid_cursor(format!("non-canonical id {id:?}")));
    }

    Ok(Some(SortKey::new(Utc.timestamp_nanos(parsed_nanos), parsed_id)))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    #[default]
    Descending,
    Ascending,
}

impl SortOrder {
    pub fn from_time_desc(time_desc: bool) -> Self {
        if time_desc {
            Self::Descending
        } else {
            Self::Ascending
        }
    }

    pub fn as_sql(self) -> &'static str {
        match self {
            Self::Descending => "DESC",
            Self::Ascending => "ASC",
        }
    }

    /// Operator selecting rows strictly after a position in this order.
    pub fn after_operator(self) -> &'static str {
        match self {
            Self::Descending => "<",
            Self::Ascending => ">",
        }
    }
}

impl fmt::Display for SortOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Descending => "desc",
            Self::Ascending => "asc",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PagingLimits {
    pub default_limit: u32,
    pub max_limit: u32,
}

impl Default for PagingLimits {
    fn default() -> Self {
        Self {
            default_limit: DEFAULT_PAGE_LIMIT,
            max_limit: MAX_PAGE_LIMIT,
        }
    }
}

/// Validated, positive page size. Never includes the lookahead row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageSize(u32);

impl PageSize {
    pub fn new(limit: u32, max: u32) -> Result<Self, PagingError> {
        if limit == 0 || limit > max {
            return Err(PagingError::InvalidLimit { limit, max });
        }
        Ok(Self(limit))
    }

    pub fn get(self) -> u32 {
        self.0
    }

    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// Raw list parameters as they arrive from a caller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_desc: Option<bool>,
}

impl PageRequest {
    pub fn with_limit(limit: u32) -> Self {
        Self {
            limit: Some(limit),
            ..Self::default()
        }
    }

    pub fn cursor(mut self, cursor: impl Into<String>) -> Self {
        self.cursor = Some(cursor.into());
        self
    }

    pub fn time_desc(mut self, time_desc: bool) -> Self {
        self.time_desc = Some(time_desc);
        self
    }

    pub fn resolve(&self, limits: &PagingLimits) -> Result<KeysetQuery, PagingError> {
        let page_size = PageSize::new(
            self.limit.unwrap_or(limits.default_limit),
            limits.max_limit,
        )?;
        let after = match self.cursor.as_deref() {
            Some(cursor) => decode_cursor(cursor)?,
            None => None,
        };
        let order = SortOrder::from_time_desc(self.time_desc.unwrap_or(true));
        Ok(KeysetQuery::new(after, order, page_size))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeysetQuery {
    after: Option<SortKey>,
    order: SortOrder,
    page_size: PageSize,
}

impl KeysetQuery {
    pub fn new(after: Option<SortKey>, order: SortOrder, page_size: PageSize) -> Self {
        Self {
            after,
            order,
            page_size,
        }
    }

    pub fn after(&self) -> Option<SortKey> {
        self.after
    }

    pub fn order(&self) -> SortOrder {
        self.order
    }

    pub fn page_size(&self) -> PageSize {
        self.page_size
    }

    /// Rows to fetch: the page plus one lookahead row.
    pub fn fetch_limit(&self) -> usize {
        self.page_size.as_usize() + 1
    }

    /// Descending keeps keys below the position, ascending keeps keys above it.
    pub fn admits(&self, key: &SortKey) -> bool {
        match (self.after, self.order) {
            (None, _) => true,
            (Some(after), SortOrder::Descending) => *key < after,
            (Some(after), SortOrder::Ascending) => *key > after,
        }
    }

    /// Runs the query against an unordered in-memory collection.
    pub fn select<T, I>(&self, records: I) -> Vec<T>
    where
        T: Keyed,
        I: IntoIterator<Item = T>,
    {
        let mut rows = records
            .into_iter()
            .filter(|record| self.admits(&record.sort_key()))
            .collect::<Vec<_>>();
        rows.sort_by_key(|row| row.sort_key());
        if self.order == SortOrder::Descending {
            rows.reverse();
        }
        rows.truncate(self.fetch_limit());
        rows
    }

    pub fn assemble<T: Keyed>(&self, rows: Vec<T>) -> Result<Page<T>, PagingError> {
        Page::assemble(rows, self.page_size)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub has_more: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

impl<T: Keyed> Page<T> {
    /// Builds a page from a `page_size + 1` fetch. The cursor points at the
    /// last retained row, never at the dropped lookahead row.
    pub fn assemble(mut rows: Vec<T>, page_size: PageSize) -> Result<Self, PagingError> {
        if rows.len() <= page_size.as_usize() {
            return Ok(Self {
                items: rows,
                has_more: false,
                next_cursor: None,
            });
        }

        rows.truncate(page_size.as_usize());
        let next_cursor = rows
            .last()
            .map(|last| last.sort_key().to_cursor())
            .transpose()?;
        Ok(Self {
            items: rows,
            has_more: true,
            next_cursor,
        })
    }
}
