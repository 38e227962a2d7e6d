use chrono::{DateTime, TimeZone, Utc};
use ctxbase_core::paging::{Keyed, KeysetQuery, Page, PagingError};
use ctxbase_core::{
    ContractError, Disk, JsonObject, LearningStatus, Message, Session, Space, Task, TaskStatus,
};
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

pub const CONTEXT_SCHEMA_VERSION: i64 = 1;

const SPACE_COLUMNS: &str = "id, project_id, configs_json, created_at_ns, updated_at_ns";
const SESSION_COLUMNS: &str =
    "id, project_id, space_id, configs_json, created_at_ns, updated_at_ns";
const MESSAGE_COLUMNS: &str = "id, session_id, parent_id, role, meta_json, parts_json, task_id, \
     process_status, created_at_ns, updated_at_ns";
const TASK_COLUMNS: &str = "id, session_id, task_order, data_json, status, is_planning, \
     space_digested, created_at_ns, updated_at_ns";
const DISK_COLUMNS: &str = "id, project_id, created_at_ns, updated_at_ns";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("timestamp error: {0}")]
    Timestamp(String),
    #[error("paging error: {0}")]
    Paging(#[from] PagingError),
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
}

/// Which sessions of a project a listing covers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SessionFilter {
    #[default]
    All,
    InSpace(Uuid),
    NotConnected,
}

/// Equality filters applied before the keyset predicate.
#[derive(Default)]
struct ListScope {
    conditions: Vec<String>,
    params: Vec<Value>,
}

impl ListScope {
    fn matching(column: &str, id: Uuid) -> Self {
        Self::default().and_matching(column, id)
    }

    fn and_matching(mut self, column: &str, id: Uuid) -> Self {
        self.conditions.push(format!("{column} = ?"));
        self.params.push(Value::Text(id.to_string()));
        self
    }

    fn and_null(mut self, column: &str) -> Self {
        self.conditions.push(format!("{column} IS NULL"));
        self
    }

    /// Restricts to rows strictly after the cursor position in the query order.
    fn and_after(mut self, query: &KeysetQuery) -> Result<Self, StorageError> {
        if let Some(after) = query.after() {
            let op = query.order().after_operator();
            let nanos = after.created_at_nanos()?;
            self.conditions.push(format!(
                "(created_at_ns {op} ? OR (created_at_ns = ? AND id {op} ?))"
            ));
            self.params.extend([
                Value::Integer(nanos),
                Value::Integer(nanos),
                Value::Text(after.id.to_string()),
            ]);
        }
        Ok(self)
    }

    fn where_clause(&self) -> String {
        if self.conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", self.conditions.join(" AND "))
        }
    }
}

pub struct ContextStore {
    conn: Connection,
}

impl ContextStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, StorageError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        Ok(self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        let current = self.schema_version()?;
        if current > CONTEXT_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: CONTEXT_SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let sql = include_str!("../migrations/0001_context_schema.sql");
            self.conn.execute_batch(sql)?;
            self.conn
                .execute("PRAGMA user_version = 1", [])
                .map(|_| ())?;
            info!(version = 1, "applied context schema migration");
        }

        Ok(())
    }

    pub fn table_exists(&self, table: &str) -> Result<bool, StorageError> {
        let exists = self
            .conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
                [table],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        Ok(exists.is_some())
    }

    pub fn create_space(&self, space: &Space) -> Result<(), StorageError> {
        self.conn.execute(
            "
            INSERT INTO spaces (id, project_id, configs_json, created_at_ns, updated_at_ns)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ",
            params![
                space.id.to_string(),
                space.project_id.to_string(),
                to_json(&space.configs)?,
                nanos(space.created_at)?,
                nanos(space.updated_at)?,
            ],
        )?;
        Ok(())
    }

    pub fn space(&self, id: Uuid) -> Result<Option<Space>, StorageError> {
        self.fetch_one("spaces", SPACE_COLUMNS, id, map_space)
    }

    pub fn update_space_configs(&self, id: Uuid, configs: &JsonObject) -> Result<(), StorageError> {
        let changes = self.conn.execute(
            "UPDATE spaces SET configs_json = ?1, updated_at_ns = ?2 WHERE id = ?3",
            params![to_json(configs)?, nanos(Utc::now())?, id.to_string()],
        )?;
        ensure_found(changes, "space", id)
    }

    pub fn delete_space(&self, id: Uuid) -> Result<(), StorageError> {
        let changes = self
            .conn
            .execute("DELETE FROM spaces WHERE id = ?1", [id.to_string()])?;
        ensure_found(changes, "space", id)
    }

    pub fn list_spaces(
        &self,
        project_id: Uuid,
        query: &KeysetQuery,
    ) -> Result<Page<Space>, StorageError> {
        self.fetch_page(
            "spaces",
            SPACE_COLUMNS,
            ListScope::matching("project_id", project_id),
            query,
            map_space,
        )
    }

    pub fn create_session(&self, session: &Session) -> Result<(), StorageError> {
        self.conn.execute(
            "
            INSERT INTO sessions (
                id,
                project_id,
                space_id,
                configs_json,
                created_at_ns,
                updated_at_ns
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ",
            params![
                session.id.to_string(),
                session.project_id.to_string(),
                session.space_id.map(|id| id.to_string()),
                to_json(&session.configs)?,
                nanos(session.created_at)?,
                nanos(session.updated_at)?,
            ],
        )?;
        Ok(())
    }

    pub fn session(&self, id: Uuid) -> Result<Option<Session>, StorageError> {
        self.fetch_one("sessions", SESSION_COLUMNS, id, map_session)
    }

    pub fn update_session_configs(
        &self,
        id: Uuid,
        configs: &JsonObject,
    ) -> Result<(), StorageError> {
        let changes = self.conn.execute(
            "UPDATE sessions SET configs_json = ?1, updated_at_ns = ?2 WHERE id = ?3",
            params![to_json(configs)?, nanos(Utc::now())?, id.to_string()],
        )?;
        ensure_found(changes, "session", id)
    }

    pub fn connect_session_to_space(
        &self,
        session_id: Uuid,
        space_id: Uuid,
    ) -> Result<(), StorageError> {
        if self.space(space_id)?.is_none() {
            return Err(StorageError::NotFound {
                entity: "space",
                id: space_id,
            });
        }
        let changes = self.conn.execute(
            "UPDATE sessions SET space_id = ?1, updated_at_ns = ?2 WHERE id = ?3",
            params![
                space_id.to_string(),
                nanos(Utc::now())?,
                session_id.to_string()
            ],
        )?;
        ensure_found(changes, "session", session_id)
    }

    /// Deletes the session together with its messages and tasks.
    pub fn delete_session(&self, id: Uuid) -> Result<(), StorageError> {
        let changes = self
            .conn
            .execute("DELETE FROM sessions WHERE id = ?1", [id.to_string()])?;
        ensure_found(changes, "session", id)
    }

    pub fn list_sessions(
        &self,
        project_id: Uuid,
        filter: SessionFilter,
        query: &KeysetQuery,
    ) -> Result<Page<Session>, StorageError> {
        let scope = ListScope::matching("project_id", project_id);
        let scope = match filter {
            SessionFilter::All => scope,
            SessionFilter::InSpace(space_id) => scope.and_matching("space_id", space_id),
            SessionFilter::NotConnected => scope.and_null("space_id"),
        };
        self.fetch_page("sessions", SESSION_COLUMNS, scope, query, map_session)
    }

    /// Inserts a message, chaining it to the message inserted last in its
    /// session. Insertion order is the rowid, not `created_at`.
    pub fn insert_message(&self, message: &mut Message) -> Result<(), StorageError> {
        let parts_json = to_json(&message.parts)?;
        let meta_json = to_json(&message.meta)?;
        let tx = self.conn.unchecked_transaction()?;

        let parent_id = tx
            .query_row(
                "
                SELECT id
                FROM messages
                WHERE session_id = ?1
                ORDER BY rowid DESC
                LIMIT 1
                ",
                [message.session_id.to_string()],
                |row| uuid_at(row, 0),
            )
            .optional()?;

        tx.execute(
            "
            INSERT INTO messages (
                id,
                session_id,
                parent_id,
                role,
                meta_json,
                parts_json,
                task_id,
                process_status,
                created_at_ns,
                updated_at_ns
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ",
            params![
                message.id.to_string(),
                message.session_id.to_string(),
                parent_id.map(|id| id.to_string()),
                message.role.as_str(),
                meta_json,
                parts_json,
                message.task_id.map(|id| id.to_string()),
                message.process_status.as_str(),
                nanos(message.created_at)?,
                nanos(message.updated_at)?,
            ],
        )?;
        tx.commit()?;

        message.parent_id = parent_id;
        Ok(())
    }

    pub fn message(&self, id: Uuid) -> Result<Option<Message>, StorageError> {
        self.fetch_one("messages", MESSAGE_COLUMNS, id, map_message)
    }

    pub fn list_messages(
        &self,
        session_id: Uuid,
        query: &KeysetQuery,
    ) -> Result<Page<Message>, StorageError> {
        self.fetch_page(
            "messages",
            MESSAGE_COLUMNS,
            ListScope::matching("session_id", session_id),
            query,
            map_message,
        )
    }

    pub fn pending_message_count(&self, session_id: Uuid) -> Result<u64, StorageError> {
        let count: i64 = self.conn.query_row(
            "
            SELECT COUNT(*)
            FROM messages
            WHERE session_id = ?1 AND process_status = 'pending'
            ",
            [session_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    pub fn set_message_process_status(
        &self,
        message_ids: &[Uuid],
        status: TaskStatus,
    ) -> Result<usize, StorageError> {
        let tx = self.conn.unchecked_transaction()?;
        let updated_at = nanos(Utc::now())?;
        let mut changes = 0;
        {
            let mut statement = tx.prepare(
                "UPDATE messages SET process_status = ?1, updated_at_ns = ?2 WHERE id = ?3",
            )?;
            for id in message_ids {
                changes += statement.execute(params![
                    status.as_str(),
                    updated_at,
                    id.to_string()
                ])?;
            }
        }
        tx.commit()?;
        Ok(changes)
    }

    pub fn insert_task(&self, task: &Task) -> Result<(), StorageError> {
        self.conn.execute(
            "
            INSERT INTO tasks (
                id,
                session_id,
                task_order,
                data_json,
                status,
                is_planning,
                space_digested,
                created_at_ns,
                updated_at_ns
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ",
            params![
                task.id.to_string(),
                task.session_id.to_string(),
                task.order,
                to_json(&task.data)?,
                task.status.as_str(),
                task.is_planning,
                task.space_digested,
                nanos(task.created_at)?,
                nanos(task.updated_at)?,
            ],
        )?;
        Ok(())
    }

    pub fn task(&self, id: Uuid) -> Result<Option<Task>, StorageError> {
        self.fetch_one("tasks", TASK_COLUMNS, id, map_task)
    }

    pub fn list_tasks(
        &self,
        session_id: Uuid,
        query: &KeysetQuery,
    ) -> Result<Page<Task>, StorageError> {
        self.fetch_page(
            "tasks",
            TASK_COLUMNS,
            ListScope::matching("session_id", session_id),
            query,
            map_task,
        )
    }

    pub fn update_task_status(&self, id: Uuid, status: TaskStatus) -> Result<(), StorageError> {
        let changes = self.conn.execute(
            "UPDATE tasks SET status = ?1, updated_at_ns = ?2 WHERE id = ?3",
            params![status.as_str(), nanos(Utc::now())?, id.to_string()],
        )?;
        ensure_found(changes, "task", id)
    }

    pub fn mark_task_space_digested(&self, id: Uuid) -> Result<(), StorageError> {
        let changes = self.conn.execute(
            "UPDATE tasks SET space_digested = 1, updated_at_ns = ?1 WHERE id = ?2",
            params![nanos(Utc::now())?, id.to_string()],
        )?;
        ensure_found(changes, "task", id)
    }

    pub fn learning_status(&self, session_id: Uuid) -> Result<LearningStatus, StorageError> {
        let (digested, not_digested): (i64, i64) = self.conn.query_row(
            "
            SELECT
                COALESCE(SUM(CASE WHEN space_digested = 1 THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN space_digested = 0 THEN 1 ELSE 0 END), 0)
            FROM tasks
            WHERE session_id = ?1
            ",
            [session_id.to_string()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(LearningStatus {
            space_digested_count: digested as u64,
            not_space_digested_count: not_digested as u64,
        })
    }

    pub fn create_disk(&self, disk: &Disk) -> Result<(), StorageError> {
        self.conn.execute(
            "
            INSERT INTO disks (id, project_id, created_at_ns, updated_at_ns)
            VALUES (?1, ?2, ?3, ?4)
            ",
            params![
                disk.id.to_string(),
                disk.project_id.to_string(),
                nanos(disk.created_at)?,
                nanos(disk.updated_at)?,
            ],
        )?;
        Ok(())
    }

    pub fn delete_disk(&self, id: Uuid) -> Result<(), StorageError> {
        let changes = self
            .conn
            .execute("DELETE FROM disks WHERE id = ?1", [id.to_string()])?;
        ensure_found(changes, "disk", id)
    }

    pub fn list_disks(
        &self,
        project_id: Uuid,
        query: &KeysetQuery,
    ) -> Result<Page<Disk>, StorageError> {
        self.fetch_page(
            "disks",
            DISK_COLUMNS,
            ListScope::matching("project_id", project_id),
            query,
            map_disk,
        )
    }

    fn fetch_one<T, F>(
        &self,
        table: &'static str,
        columns: &'static str,
        id: Uuid,
        map_row: F,
    ) -> Result<Option<T>, StorageError>
    where
        F: FnOnce(&Row<'_>) -> rusqlite::Result<T>,
    {
        let sql = format!("SELECT {columns} FROM {table} WHERE id = ?1");
        let row = self
            .conn
            .query_row(&sql, [id.to_string()], map_row)
            .optional()?;
        Ok(row)
    }

    /// Fetches `page_size + 1` rows ordered by `(created_at_ns, id)` and
    /// assembles them into a page.
    fn fetch_page<T, F>(
        &self,
        table: &'static str,
        columns: &'static str,
        scope: ListScope,
        query: &KeysetQuery,
        map_row: F,
    ) -> Result<Page<T>, StorageError>
    where
        T: Keyed,
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
    {
        let mut scope = scope.and_after(query)?;
        let direction = query.order().as_sql();
        let sql = format!(
            "SELECT {columns} FROM {table} {} \
             ORDER BY created_at_ns {direction}, id {direction} LIMIT ?",
            scope.where_clause()
        );
        scope.params.push(Value::Integer(query.fetch_limit() as i64));

        debug!(
            table,
            order = %query.order(),
            page_size = query.page_size().get(),
            has_cursor = query.after().is_some(),
            "keyset fetch"
        );

        let mut statement = self.conn.prepare(&sql)?;
        let rows = statement.query_map(params_from_iter(scope.params.iter()), map_row)?;
        let mut items = Vec::new();
        for row in rows {
            items.push(row?);
        }
        Ok(query.assemble(items)?)
    }
}

fn map_space(row: &Row<'_>) -> rusqlite::Result<Space> {
    Ok(Space {
        id: uuid_at(row, 0)?,
        project_id: uuid_at(row, 1)?,
        configs: json_at(row, 2)?,
        created_at: timestamp_at(row, 3)?,
        updated_at: timestamp_at(row, 4)?,
    })
}

fn map_session(row: &Row<'_>) -> rusqlite::Result<Session> {
    Ok(Session {
        id: uuid_at(row, 0)?,
        project_id: uuid_at(row, 1)?,
        space_id: optional_uuid_at(row, 2)?,
        configs: json_at(row, 3)?,
        created_at: timestamp_at(row, 4)?,
        updated_at: timestamp_at(row, 5)?,
    })
}

fn map_message(row: &Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: uuid_at(row, 0)?,
        session_id: uuid_at(row, 1)?,
        parent_id: optional_uuid_at(row, 2)?,
        role: parse_at(row, 3)?,
        meta: json_at(row, 4)?,
        parts: json_at(row, 5)?,
        task_id: optional_uuid_at(row, 6)?,
        process_status: parse_at(row, 7)?,
        created_at: timestamp_at(row, 8)?,
        updated_at: timestamp_at(row, 9)?,
    })
}

fn map_task(row: &Row<'_>) -> rusqlite::Result<Task> {
    Ok(Task {
        id: uuid_at(row, 0)?,
        session_id: uuid_at(row, 1)?,
        order: row.get(2)?,
        data: json_at(row, 3)?,
        status: parse_at(row, 4)?,
        is_planning: row.get(5)?,
        space_digested: row.get(6)?,
        created_at: timestamp_at(row, 7)?,
        updated_at: timestamp_at(row, 8)?,
    })
}

fn map_disk(row: &Row<'_>) -> rusqlite::Result<Disk> {
    Ok(Disk {
        id: uuid_at(row, 0)?,
        project_id: uuid_at(row, 1)?,
        created_at: timestamp_at(row, 2)?,
        updated_at: timestamp_at(row, 3)?,
    })
}

fn conversion_failure<E>(index: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(index, Type::Text, Box::new(err))
}

fn uuid_at(row: &Row<'_>, index: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(index)?;
    Uuid::parse_str(&raw).map_err(|err| conversion_failure(index, err))
}

fn optional_uuid_at(row: &Row<'_>, index: usize) -> rusqlite::Result<Option<Uuid>> {
    row.get::<_, Option<String>>(index)?
        .map(|raw| Uuid::parse_str(&raw).map_err(|err| conversion_failure(index, err)))
        .transpose()
}

fn timestamp_at(row: &Row<'_>, index: usize) -> rusqlite::Result<DateTime<Utc>> {
    Ok(Utc.timestamp_nanos(row.get::<_, i64>(index)?))
}

fn json_at<T: DeserializeOwned>(row: &Row<'_>, index: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(index)?;
    serde_json::from_str(&raw).map_err(|err| conversion_failure(index, err))
}

fn parse_at<T>(row: &Row<'_>, index: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = ContractError>,
{
    let raw: String = row.get(index)?;
    raw.parse::<T>().map_err(|err| conversion_failure(index, err))
}

fn nanos(ts: DateTime<Utc>) -> Result<i64, StorageError> {
    ts.timestamp_nanos_opt()
        .ok_or_else(|| StorageError::Timestamp(format!("{ts} is outside the storable range")))
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<String, StorageError> {
    serde_json::to_string(value).map_err(|err| StorageError::Serialization(err.to_string()))
}

fn ensure_found(changes: usize, entity: &'static str, id: Uuid) -> Result<(), StorageError> {
    if changes == 0 {
        return Err(StorageError::NotFound { entity, id });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ctxbase_core::paging::{decode_cursor, PageSize, SortOrder, MAX_PAGE_LIMIT};
    use ctxbase_core::{MessageRole, Part};
    use serde_json::json;
    use tempfile::NamedTempFile;

    fn ts(nanos: i64) -> DateTime<Utc> {
        Utc.timestamp_nanos(1_771_855_200_000_000_000 + nanos)
    }

    fn query(after: Option<&str>, order: SortOrder, limit: u32) -> KeysetQuery {
        let after = after.and_then(|cursor| decode_cursor(cursor).expect("decode cursor"));
        KeysetQuery::new(
            after,
            order,
            PageSize::new(limit, MAX_PAGE_LIMIT).expect("page size"),
        )
    }

    fn seeded_session(store: &ContextStore) -> Session {
        let session = Session::new(Uuid::new_v4(), None, JsonObject::new());
        store.create_session(&session).expect("create session");
        session
    }

    fn message_at(session_id: Uuid, id: u128, nanos: i64) -> Message {
        let mut message = Message::new(
            session_id,
            MessageRole::User,
            vec![Part::text(format!("message {id}"))],
            JsonObject::new(),
        );
        message.id = Uuid::from_u128(id);
        message.created_at = ts(nanos);
        message.updated_at = ts(nanos);
        message
    }

    fn drain_messages(store: &ContextStore, session_id: Uuid, order: SortOrder) -> Vec<Uuid> {
        let mut ids = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = store
                .list_messages(session_id, &query(cursor.as_deref(), order, 2))
                .expect("list messages");
            ids.extend(page.items.iter().map(|message| message.id));
            if !page.has_more {
                assert!(page.next_cursor.is_none());
                break;
            }
            cursor = page.next_cursor;
        }
        ids
    }

    #[test]
    fn migration_creates_context_tables() {
        let store = ContextStore::open_in_memory().expect("open db");
        for table in ["spaces", "sessions", "messages", "tasks", "disks"] {
            assert!(store.table_exists(table).expect("table check"), "{table}");
        }
        assert_eq!(
            store.schema_version().expect("schema version"),
            CONTEXT_SCHEMA_VERSION
        );
    }

    #[test]
    fn newer_schema_version_is_rejected() {
        let file = NamedTempFile::new().expect("temp db");
        {
            let store = ContextStore::open(file.path()).expect("open db");
            store
                .conn
                .execute_batch("PRAGMA user_version = 99;")
                .expect("bump version");
        }

        let err = ContextStore::open(file.path())
            .err()
            .expect("newer schema must fail");
        assert!(matches!(
            err,
            StorageError::UnsupportedSchemaVersion {
                found: 99,
                supported: CONTEXT_SCHEMA_VERSION
            }
        ));
    }

    #[test]
    fn session_roundtrip_preserves_configs_and_nanoseconds() {
        let store = ContextStore::open_in_memory().expect("open db");
        let mut session = Session::new(
            Uuid::new_v4(),
            None,
            json!({ "mode": "agent", "depth": 2 })
                .as_object()
                .cloned()
                .expect("object"),
        );
        session.created_at = ts(123_456_789);
        session.updated_at = ts(123_456_789);
        store.create_session(&session).expect("create session");

        let loaded = store
            .session(session.id)
            .expect("load session")
            .expect("session present");
        assert_eq!(loaded, session);
    }

    #[test]
    fn insert_message_chains_parent_to_latest_message() {
        let store = ContextStore::open_in_memory().expect("open db");
        let session = seeded_session(&store);

        let mut first = message_at(session.id, 1, 10);
        store.insert_message(&mut first).expect("insert first");
        assert_eq!(first.parent_id, None);

        let mut second = message_at(session.id, 2, 20);
        store.insert_message(&mut second).expect("insert second");
        assert_eq!(second.parent_id, Some(first.id));

        let loaded = store
            .message(second.id)
            .expect("load message")
            .expect("message present");
        assert_eq!(loaded.parent_id, Some(first.id));
        assert_eq!(loaded.parts, vec![Part::text("message 2")]);
        assert_eq!(loaded.process_status, TaskStatus::Pending);
    }

    #[test]
    fn parent_follows_insertion_order_not_timestamps() {
        let store = ContextStore::open_in_memory().expect("open db");
        let session = seeded_session(&store);

        let mut later = message_at(session.id, 9, 500);
        store.insert_message(&mut later).expect("insert later");
        let mut skewed = message_at(session.id, 1, 100);
        store.insert_message(&mut skewed).expect("insert skewed");
        assert_eq!(skewed.parent_id, Some(later.id));

        let mut tied = message_at(session.id, 2, 100);
        store.insert_message(&mut tied).expect("insert tied");
        assert_eq!(tied.parent_id, Some(skewed.id));
    }

    #[test]
    fn corrupt_row_fails_the_page_instead_of_shortening_it() {
        let store = ContextStore::open_in_memory().expect("open db");
        let session = seeded_session(&store);
        for (id, nanos) in [(1, 10), (2, 20), (3, 30)] {
            store
                .insert_message(&mut message_at(session.id, id, nanos))
                .expect("insert message");
        }
        store
            .conn
            .execute(
                "UPDATE messages SET parts_json = 'not json' WHERE id = ?1",
                [Uuid::from_u128(2).to_string()],
            )
            .expect("corrupt row");

        let result = store.list_messages(session.id, &query(None, SortOrder::Descending, 5));
        assert!(
            matches!(
                result,
                Err(StorageError::Sqlite(
                    rusqlite::Error::FromSqlConversionFailure(5, Type::Text, _)
                ))
            ),
            "{result:?}"
        );
    }

    #[test]
    fn message_pages_break_timestamp_ties_by_id() {
        let store = ContextStore::open_in_memory().expect("open db");
        let session = seeded_session(&store);
        for (id, nanos) in [(9, 90), (5, 100), (3, 100)] {
            store
                .insert_message(&mut message_at(session.id, id, nanos))
                .expect("insert message");
        }

        let first = store
            .list_messages(session.id, &query(None, SortOrder::Descending, 2))
            .expect("first page");
        assert_eq!(
            first.items.iter().map(|m| m.id).collect::<Vec<_>>(),
            vec![Uuid::from_u128(5), Uuid::from_u128(3)]
        );
        assert!(first.has_more);
        let cursor = first.next_cursor.expect("cursor");
        assert_eq!(
            decode_cursor(&cursor).expect("decode"),
            Some(ctxbase_core::paging::SortKey::new(ts(100), Uuid::from_u128(3)))
        );

        let second = store
            .list_messages(
                session.id,
                &query(Some(&cursor), SortOrder::Descending, 2),
            )
            .expect("second page");
        assert_eq!(
            second.items.iter().map(|m| m.id).collect::<Vec<_>>(),
            vec![Uuid::from_u128(9)]
        );
        assert!(!second.has_more);
        assert_eq!(second.next_cursor, None);
    }

    #[test]
    fn draining_messages_covers_stream_once_in_both_orders() {
        let store = ContextStore::open_in_memory().expect("open db");
        let session = seeded_session(&store);
        let other = seeded_session(&store);
        let mut expected = Vec::new();
        for id in 1..=9_u128 {
            let nanos = (id as i64 / 3) * 1_000;
            store
                .insert_message(&mut message_at(session.id, id, nanos))
                .expect("insert message");
            expected.push((ts(nanos), Uuid::from_u128(id)));
        }
        store
            .insert_message(&mut message_at(other.id, 100, 0))
            .expect("insert other");
        expected.sort();
        let ascending = expected.iter().map(|(_, id)| *id).collect::<Vec<_>>();
        let mut descending = ascending.clone();
        descending.reverse();

        assert_eq!(
            drain_messages(&store, session.id, SortOrder::Ascending),
            ascending
        );
        assert_eq!(
            drain_messages(&store, session.id, SortOrder::Descending),
            descending
        );
    }

    #[test]
    fn session_listing_honors_space_filters() {
        let store = ContextStore::open_in_memory().expect("open db");
        let project_id = Uuid::new_v4();
        let space = Space::new(project_id, JsonObject::new());
        store.create_space(&space).expect("create space");

        let connected = Session::new(project_id, Some(space.id), JsonObject::new());
        let loose = Session::new(project_id, None, JsonObject::new());
        let foreign = Session::new(Uuid::new_v4(), None, JsonObject::new());
        for session in [&connected, &loose, &foreign] {
            store.create_session(session).expect("create session");
        }

        let page_query = query(None, SortOrder::Descending, 10);
        let all = store
            .list_sessions(project_id, SessionFilter::All, &page_query)
            .expect("list all");
        assert_eq!(all.items.len(), 2);

        let in_space = store
            .list_sessions(project_id, SessionFilter::InSpace(space.id), &page_query)
            .expect("list in space");
        assert_eq!(in_space.items, vec![connected.clone()]);

        let not_connected = store
            .list_sessions(project_id, SessionFilter::NotConnected, &page_query)
            .expect("list not connected");
        assert_eq!(not_connected.items, vec![loose.clone()]);

        store
            .connect_session_to_space(loose.id, space.id)
            .expect("connect");
        let not_connected = store
            .list_sessions(project_id, SessionFilter::NotConnected, &page_query)
            .expect("list not connected");
        assert!(not_connected.items.is_empty());
    }

    #[test]
    fn connecting_to_missing_space_reports_not_found() {
        let store = ContextStore::open_in_memory().expect("open db");
        let session = seeded_session(&store);
        let missing = Uuid::new_v4();
        let err = store
            .connect_session_to_space(session.id, missing)
            .expect_err("missing space");
        assert!(matches!(
            err,
            StorageError::NotFound { entity: "space", id } if id == missing
        ));
    }

    #[test]
    fn deleting_session_cascades_to_messages_and_tasks() {
        let store = ContextStore::open_in_memory().expect("open db");
        let session = seeded_session(&store);
        let mut message = message_at(session.id, 1, 0);
        store.insert_message(&mut message).expect("insert message");
        let task = Task::new(session.id, 0, JsonObject::new());
        store.insert_task(&task).expect("insert task");

        store.delete_session(session.id).expect("delete session");

        assert!(store.message(message.id).expect("load message").is_none());
        assert!(store.task(task.id).expect("load task").is_none());
        assert!(matches!(
            store.delete_session(session.id),
            Err(StorageError::NotFound { entity: "session", .. })
        ));
    }

    #[test]
    fn task_order_is_unique_per_session() {
        let store = ContextStore::open_in_memory().expect("open db");
        let session = seeded_session(&store);
        store
            .insert_task(&Task::new(session.id, 1, JsonObject::new()))
            .expect("insert task");
        let err = store
            .insert_task(&Task::new(session.id, 1, JsonObject::new()))
            .expect_err("duplicate order");
        assert!(matches!(err, StorageError::Sqlite(_)));
    }

    #[test]
    fn learning_status_counts_digested_tasks() {
        let store = ContextStore::open_in_memory().expect("open db");
        let session = seeded_session(&store);
        let tasks = (0..3)
            .map(|order| Task::new(session.id, order, JsonObject::new()))
            .collect::<Vec<_>>();
        for task in &tasks {
            store.insert_task(task).expect("insert task");
        }
        store
            .mark_task_space_digested(tasks[0].id)
            .expect("mark digested");
        store
            .update_task_status(tasks[1].id, TaskStatus::Success)
            .expect("update status");

        assert_eq!(
            store.learning_status(session.id).expect("learning status"),
            LearningStatus {
                space_digested_count: 1,
                not_space_digested_count: 2,
            }
        );
        let loaded = store.task(tasks[1].id).expect("load").expect("present");
        assert_eq!(loaded.status, TaskStatus::Success);
    }

    #[test]
    fn pending_count_follows_process_status_updates() {
        let store = ContextStore::open_in_memory().expect("open db");
        let session = seeded_session(&store);
        let mut ids = Vec::new();
        for id in 1..=3 {
            let mut message = message_at(session.id, id, id as i64);
            store.insert_message(&mut message).expect("insert");
            ids.push(message.id);
        }
        assert_eq!(store.pending_message_count(session.id).expect("count"), 3);

        let changed = store
            .set_message_process_status(&ids[..2], TaskStatus::Success)
            .expect("update status");
        assert_eq!(changed, 2);
        assert_eq!(store.pending_message_count(session.id).expect("count"), 1);
    }

    #[test]
    fn spaces_and_disks_page_per_project() {
        let store = ContextStore::open_in_memory().expect("open db");
        let project_id = Uuid::new_v4();
        for offset in 0..3 {
            let mut disk = Disk::new(project_id);
            disk.created_at = ts(offset);
            store.create_disk(&disk).expect("create disk");
        }
        store
            .create_disk(&Disk::new(Uuid::new_v4()))
            .expect("create foreign disk");

        let page = store
            .list_disks(project_id, &query(None, SortOrder::Ascending, 2))
            .expect("list disks");
        assert_eq!(page.items.len(), 2);
        assert!(page.has_more);
        assert!(page.items[0].created_at < page.items[1].created_at);

        let rest = store
            .list_disks(
                project_id,
                &query(page.next_cursor.as_deref(), SortOrder::Ascending, 2),
            )
            .expect("list rest");
        assert_eq!(rest.items.len(), 1);
        assert!(!rest.has_more);

        let space = Space::new(project_id, JsonObject::new());
        store.create_space(&space).expect("create space");
        let configs = json!({ "k": "v" }).as_object().cloned().expect("object");
        store
            .update_space_configs(space.id, &configs)
            .expect("update configs");
        let spaces = store
            .list_spaces(project_id, &query(None, SortOrder::Descending, 5))
            .expect("list spaces");
        assert_eq!(spaces.items.len(), 1);
        assert_eq!(spaces.items[0].configs, configs);

        store.delete_space(space.id).expect("delete space");
        assert!(store.space(space.id).expect("load space").is_none());
    }
}
