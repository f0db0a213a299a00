use super::{CompletionSupplier, StatefulEntity};
use crate::core::{EntityError, Result, Version};
use std::fmt;
use tokio::sync::oneshot;

/// Where a caller waits for the result of its command.
pub type ReplyTo<R> = oneshot::Sender<Result<R>>;

/// Tags one durability call so its response can be matched to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationId(u64);

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Binds one caller to the outcome of one write.
pub struct CompletionToken<E: StatefulEntity> {
    reply: Option<ReplyTo<E::Reply>>,
    supplier: Option<CompletionSupplier<E>>,
}

impl<E: StatefulEntity> CompletionToken<E> {
    pub fn new(reply: Option<ReplyTo<E::Reply>>, supplier: Option<CompletionSupplier<E>>) -> Self {
        Self { reply, supplier }
    }

    /// Delivers `supplier(entity)` to the caller. Returns whether a value was sent.
    ///
    /// Must only be called after the written state has been applied. With no
    /// supplier the caller is told [`EntityError::NoReply`]; with no listening
    /// caller the supplier is not evaluated.
    pub fn complete(self, entity: &E) -> bool {
        let Some(reply) = self.reply else {
            return false;
        };
        let Some(supplier) = self.supplier else {
            let _ = reply.send(Err(EntityError::NoReply(entity.id().to_string())));
            return false;
        };
        if reply.is_closed() {
            return false;
        }
        reply.send(Ok(supplier(entity))).is_ok()
    }

    pub fn fail(self, error: EntityError) {
        if let Some(reply) = self.reply {
            let _ = reply.send(Err(error));
        }
    }
}

/// The single durability call an entity may have outstanding.
pub enum InFlight<E: StatefulEntity> {
    Read,
    Write {
        version: Version,
        state: E::State,
        token: CompletionToken<E>,
    },
}

impl<E: StatefulEntity> InFlight<E> {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write { .. } => "write",
        }
    }
}

/// Issues correlation ids and holds the context of the outstanding call.
///
/// Refuses to start a second call while one is outstanding, and resolves each
/// id at most once.
pub struct CompletionCorrelator<E: StatefulEntity> {
    next_id: u64,
    outstanding: Option<(CorrelationId, InFlight<E>)>,
}

impl<E: StatefulEntity> Default for CompletionCorrelator<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: StatefulEntity> CompletionCorrelator<E> {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            outstanding: None,
        }
    }

    pub fn begin_read(&mut self) -> Result<CorrelationId> {
        self.begin(InFlight::Read)
    }

    /// Starts a write. If another call is outstanding the token's caller is
    /// failed with the same error that is returned.
    pub fn begin_write(
        &mut self,
        version: Version,
        state: E::State,
        token: CompletionToken<E>,
    ) -> Result<CorrelationId> {
        if let Err(err) = self.ensure_idle("write") {
            token.fail(err.clone());
            return Err(err);
        }
        self.begin(InFlight::Write {
            version,
            state,
            token,
        })
    }

    fn ensure_idle(&self, starting: &str) -> Result<()> {
        match &self.outstanding {
            Some((id, pending)) => Err(EntityError::IllegalState(format!(
                "{} {} is still outstanding; cannot start a {}",
                pending.kind(),
                id,
                starting
            ))),
            None => Ok(()),
        }
    }

    fn begin(&mut self, in_flight: InFlight<E>) -> Result<CorrelationId> {
        self.ensure_idle(in_flight.kind())?;
        let id = CorrelationId(self.next_id);
        self.next_id += 1;
        self.outstanding = Some((id, in_flight));
        Ok(id)
    }

    pub fn is_outstanding(&self) -> bool {
        self.outstanding.is_some()
    }

    pub fn outstanding_id(&self) -> Option<CorrelationId> {
        self.outstanding.as_ref().map(|(id, _)| *id)
    }

    /// Takes the call tagged `id`. Unknown or already resolved ids yield `None`
    /// and leave the outstanding call in place.
    pub fn resolve(&mut self, id: CorrelationId) -> Option<InFlight<E>> {
        if self.outstanding_id() != Some(id) {
            return None;
        }
        self.outstanding.take().map(|(_, call)| call)
    }
}
