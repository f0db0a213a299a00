use super::Message;
use crate::core::{EntityError, Result};
use crate::entity::{EntityStats, Envelope, StatefulEntity};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Cloneable address of a running entity.
pub struct EntityHandle<E: StatefulEntity> {
    id: Arc<str>,
    mailbox: mpsc::UnboundedSender<Message<E>>,
}

impl<E: StatefulEntity> Clone for EntityHandle<E> {
    fn clone(&self) -> Self {
        Self {
            id: Arc::clone(&self.id),
            mailbox: self.mailbox.clone(),
        }
    }
}

impl<E: StatefulEntity> EntityHandle<E> {
    pub(crate) fn new(id: Arc<str>, mailbox: mpsc::UnboundedSender<Message<E>>) -> Self {
        Self { id, mailbox }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Sends `command` and waits for its result.
    ///
    /// Commands preserved without a reply supplier resolve to
    /// [`EntityError::NoReply`] once the write is confirmed.
    pub async fn ask(&self, command: E::Command) -> Result<E::Reply> {
        let (envelope, reply) = Envelope::ask(command);
        self.send(Message::Command(envelope))?;

        match reply.await {
            Ok(result) => result,
            // Dropped unanswered: the task ended or was aborted with the
            // command still pending.
            Err(_) if self.mailbox.is_closed() => Err(self.stopped()),
            Err(_) => Err(EntityError::NoReply(self.id.to_string())),
        }
    }

    /// Sends `command` without waiting for any result.
    pub fn tell(&self, command: E::Command) -> Result<()> {
        self.send(Message::Command(Envelope::tell(command)))
    }

    /// Current status and counters. Answered right away, even while the
    /// entity is busy.
    pub async fn stats(&self) -> Result<EntityStats> {
        let (tx, rx) = oneshot::channel();
        self.send(Message::Stats(tx))?;
        rx.await.map_err(|_| self.stopped())
    }

    /// Asks the entity to stop after everything already sent to it.
    pub fn shutdown(&self) -> Result<()> {
        self.send(Message::Shutdown)
    }

    /// True once the entity no longer accepts messages.
    pub fn is_closed(&self) -> bool {
        self.mailbox.is_closed()
    }

    fn send(&self, message: Message<E>) -> Result<()> {
        self.mailbox.send(message).map_err(|_| self.stopped())
    }

    fn stopped(&self) -> EntityError {
        EntityError::Stopped(self.id.to_string())
    }
}
