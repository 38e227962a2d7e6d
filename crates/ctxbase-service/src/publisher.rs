use ctxbase_core::events::MessageInserted;
use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("queue for {routing_key} is closed")]
    Closed { routing_key: &'static str },
}

/// Hands committed-message notifications to whatever drives extraction.
pub trait MessagePublisher: Send + Sync {
    fn publish(&self, event: &MessageInserted) -> Result<(), PublishError>;
}

pub struct ChannelPublisher {
    sender: UnboundedSender<MessageInserted>,
}

impl ChannelPublisher {
    pub fn new(sender: UnboundedSender<MessageInserted>) -> Self {
        Self { sender }
    }

    pub fn channel() -> (Self, UnboundedReceiver<MessageInserted>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self::new(sender), receiver)
    }
}

impl MessagePublisher for ChannelPublisher {
    fn publish(&self, event: &MessageInserted) -> Result<(), PublishError> {
        self.sender
            .send(*event)
            .map_err(|_| PublishError::Closed {
                routing_key: event.routing_key(),
            })
    }
}
