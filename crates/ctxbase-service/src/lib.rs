mod publisher;

pub use publisher::{ChannelPublisher, MessagePublisher, PublishError};

use ctxbase_core::events::MessageInserted;
use ctxbase_core::paging::{Page, PageRequest, PagingError, PagingLimits};
use ctxbase_core::{
    ContractError, Disk, JsonObject, LearningStatus, Message, MessageRole, Part, Session, Space,
    Task, TaskStatus,
};
use ctxbase_storage::{ContextStore, SessionFilter, StorageError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("paging error: {0}")]
    Paging(#[from] PagingError),
    #[error("parts[{index}]: {source}")]
    InvalidPart {
        index: usize,
        #[source]
        source: ContractError,
    },
    #[error("message requires at least one part")]
    EmptyMessage,
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },
}

impl ServiceError {
    /// Whether the failure stems from the request and should surface as a
    /// client error rather than a server fault.
    pub fn is_client_error(&self) -> bool {
        match self {
            ServiceError::Paging(err) => err.is_client_error(),
            ServiceError::InvalidPart { .. }
            | ServiceError::EmptyMessage
            | ServiceError::NotFound { .. }
            | ServiceError::Storage(StorageError::NotFound { .. }) => true,
            ServiceError::Storage(_) => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessage {
    pub project_id: Uuid,
    pub session_id: Uuid,
    pub role: MessageRole,
    pub parts: Vec<Part>,
    #[serde(default)]
    pub meta: JsonObject,
}

pub struct ContextService {
    store: ContextStore,
    publisher: Option<Box<dyn MessagePublisher>>,
    limits: PagingLimits,
}

impl ContextService {
    pub fn new(store: ContextStore, limits: PagingLimits) -> Self {
        Self {
            store,
            publisher: None,
            limits,
        }
    }

    pub fn with_publisher(mut self, publisher: impl MessagePublisher + 'static) -> Self {
        self.publisher = Some(Box::new(publisher));
        self
    }

    pub fn create_space(&self, project_id: Uuid, configs: JsonObject) -> Result<Space, ServiceError> {
        let space = Space::new(project_id, configs);
        self.store.create_space(&space)?;
        Ok(space)
    }

    pub fn space(&self, id: Uuid) -> Result<Space, ServiceError> {
        self.store.space(id)?.ok_or(ServiceError::NotFound {
            entity: "space",
            id,
        })
    }

    pub fn update_space_configs(&self, id: Uuid, configs: &JsonObject) -> Result<(), ServiceError> {
        Ok(self.store.update_space_configs(id, configs)?)
    }

    pub fn delete_space(&self, id: Uuid) -> Result<(), ServiceError> {
        Ok(self.store.delete_space(id)?)
    }

    pub fn list_spaces(
        &self,
        project_id: Uuid,
        request: &PageRequest,
    ) -> Result<Page<Space>, ServiceError> {
        let query = request.resolve(&self.limits)?;
        Ok(self.store.list_spaces(project_id, &query)?)
    }

    pub fn create_session(
        &self,
        project_id: Uuid,
        space_id: Option<Uuid>,
        configs: JsonObject,
    ) -> Result<Session, ServiceError> {
        if let Some(space_id) = space_id {
            self.space(space_id)?;
        }
        let session = Session::new(project_id, space_id, configs);
        self.store.create_session(&session)?;
        Ok(session)
    }

    pub fn session(&self, id: Uuid) -> Result<Session, ServiceError> {
        self.store.session(id)?.ok_or(ServiceError::NotFound {
            entity: "session",
            id,
        })
    }

    pub fn update_session_configs(
        &self,
        id: Uuid,
        configs: &JsonObject,
    ) -> Result<(), ServiceError> {
        Ok(self.store.update_session_configs(id, configs)?)
    }

    pub fn connect_to_space(&self, session_id: Uuid, space_id: Uuid) -> Result<(), ServiceError> {
        Ok(self.store.connect_session_to_space(session_id, space_id)?)
    }

    pub fn delete_session(&self, id: Uuid) -> Result<(), ServiceError> {
        Ok(self.store.delete_session(id)?)
    }

    pub fn list_sessions(
        &self,
        project_id: Uuid,
        filter: SessionFilter,
        request: &PageRequest,
    ) -> Result<Page<Session>, ServiceError> {
        let query = request.resolve(&self.limits)?;
        Ok(self.store.list_sessions(project_id, filter, &query)?)
    }

    /// Validates and stores a message, then announces it on the insert queue.
    /// A failed announcement is logged; the stored message is still returned.
    pub fn send_message(&self, input: SendMessage) -> Result<Message, ServiceError> {
        if input.parts.is_empty() {
            return Err(ServiceError::EmptyMessage);
        }
        for (index, part) in input.parts.iter().enumerate() {
            part.validate()
                .map_err(|source| ServiceError::InvalidPart { index, source })?;
        }
        self.session(input.session_id)?;

        let mut message = Message::new(input.session_id, input.role, input.parts, input.meta);
        self.store.insert_message(&mut message)?;
        debug!(
            session_id = %message.session_id,
            message_id = %message.id,
            parts = message.parts.len(),
            "stored session message"
        );

        if let Some(publisher) = &self.publisher {
            let event = MessageInserted {
                project_id: input.project_id,
                session_id: message.session_id,
                message_id: message.id,
            };
            match publisher.publish(&event) {
                Ok(()) => info!(
                    routing_key = event.routing_key(),
                    message_id = %event.message_id,
                    "published session message"
                ),
                Err(err) => error!(
                    error = %err,
                    session_id = %event.session_id,
                    "publish session message"
                ),
            }
        }

        Ok(message)
    }

    pub fn get_messages(
        &self,
        session_id: Uuid,
        request: &PageRequest,
    ) -> Result<Page<Message>, ServiceError> {
        let query = request.resolve(&self.limits)?;
        Ok(self.store.list_messages(session_id, &query)?)
    }

    pub fn pending_message_count(&self, session_id: Uuid) -> Result<u64, ServiceError> {
        Ok(self.store.pending_message_count(session_id)?)
    }

    /// Records how far extraction got for a batch of messages. Returns the
    /// number of messages updated; unknown ids are skipped.
    pub fn set_message_process_status(
        &self,
        message_ids: &[Uuid],
        status: TaskStatus,
    ) -> Result<usize, ServiceError> {
        let updated = self.store.set_message_process_status(message_ids, status)?;
        debug!(
            requested = message_ids.len(),
            updated,
            status = %status,
            "updated message process status"
        );
        Ok(updated)
    }

    pub fn add_task(
        &self,
        session_id: Uuid,
        order: i64,
        data: JsonObject,
    ) -> Result<Task, ServiceError> {
        self.session(session_id)?;
        let task = Task::new(session_id, order, data);
        self.store.insert_task(&task)?;
        Ok(task)
    }

    pub fn update_task_status(&self, id: Uuid, status: TaskStatus) -> Result<(), ServiceError> {
        Ok(self.store.update_task_status(id, status)?)
    }

    pub fn mark_task_space_digested(&self, id: Uuid) -> Result<(), ServiceError> {
        Ok(self.store.mark_task_space_digested(id)?)
    }

    pub fn get_tasks(
        &self,
        session_id: Uuid,
        request: &PageRequest,
    ) -> Result<Page<Task>, ServiceError> {
        let query = request.resolve(&self.limits)?;
        Ok(self.store.list_tasks(session_id, &query)?)
    }

    pub fn learning_status(&self, session_id: Uuid) -> Result<LearningStatus, ServiceError> {
        Ok(self.store.learning_status(session_id)?)
    }

    pub fn create_disk(&self, project_id: Uuid) -> Result<Disk, ServiceError> {
        let disk = Disk::new(project_id);
        self.store.create_disk(&disk)?;
        Ok(disk)
    }

    pub fn delete_disk(&self, id: Uuid) -> Result<(), ServiceError> {
        Ok(self.store.delete_disk(id)?)
    }

    pub fn list_disks(
        &self,
        project_id: Uuid,
        request: &PageRequest,
    ) -> Result<Page<Disk>, ServiceError> {
        let query = request.resolve(&self.limits)?;
        Ok(self.store.list_disks(project_id, &query)?)
    }
}
