//! Tokio driver for [`EntityMachine`].
//!
//! Each entity runs as one task that owns its machine and mailbox. Storage
//! calls are spawned as separate tasks, and their outcomes return through a
//! response channel as ordinary events. The task handles one event at a time.
//!
//! The driver has no timeout of its own. If the store never answers, the
//! entity stays busy and keeps buffering, so bound latency in the store.

mod handle;
mod worker;

pub use handle::EntityHandle;
pub use worker::EntityWorker;

use crate::core::{EntityError, Result};
use crate::entity::{
    DurabilityRequest, DurabilityResponse, EntityMachine, EntityPolicy, EntityStats, Envelope,
    StatefulEntity,
};
use crate::store::StateStore;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{Instrument, Level, event, info_span};

pub(crate) enum Message<E: StatefulEntity> {
    Command(Envelope<E>),
    Stats(oneshot::Sender<EntityStats>),
    Shutdown,
}

/// Starts `entity` on the current tokio runtime.
///
/// The entity restores its state first; commands sent meanwhile are
/// buffered. Must be called from within a tokio runtime.
pub fn spawn_entity<E>(
    entity: E,
    store: Arc<dyn StateStore<E::State>>,
    policy: EntityPolicy,
) -> EntityWorker<E>
where
    E: StatefulEntity,
{
    let machine = EntityMachine::new(entity, policy);
    let id: Arc<str> = Arc::from(machine.id());
    let (mailbox_tx, mailbox_rx) = mpsc::unbounded_channel();

    let span = info_span!("entity", id = %id);
    let join_handle = tokio::spawn(run_entity(machine, store, mailbox_rx).instrument(span));

    EntityWorker::new(EntityHandle::new(id, mailbox_tx), join_handle)
}

async fn run_entity<E>(
    mut machine: EntityMachine<E>,
    store: Arc<dyn StateStore<E::State>>,
    mut mailbox: mpsc::UnboundedReceiver<Message<E>>,
) -> Result<()>
where
    E: StatefulEntity,
{
    let (responses_tx, mut responses) = mpsc::unbounded_channel();

    let restore = machine.restore()?;
    dispatch(&store, restore, &responses_tx);

    let mut accepting = true;
    loop {
        tokio::select! {
            biased;

            Some(response) = responses.recv() => {
                match machine.on_response(response) {
                    Ok(Some(request)) => dispatch(&store, request, &responses_tx),
                    Ok(None) => {}
                    Err(fatal) => {
                        reject_queued(&machine, &mut mailbox);
                        return Err(fatal);
                    }
                }
            }

            message = mailbox.recv(), if accepting => match message {
                Some(Message::Command(envelope)) => {
                    if let Some(request) = machine.submit(envelope) {
                        dispatch(&store, request, &responses_tx);
                    }
                }
                Some(Message::Stats(reply)) => {
                    let _ = reply.send(machine.stats());
                }
                Some(Message::Shutdown) => {
                    event!(Level::DEBUG, buffered = machine.buffered(), "shutdown requested");
                    // Already queued messages are still delivered; new sends fail.
                    mailbox.close();
                }
                None => accepting = false,
            },
        }

        if !accepting && machine.is_idle() {
            break;
        }
    }

    event!(Level::DEBUG, version = machine.version(), "entity stopped");
    Ok(())
}

/// Issues `request` on its own task and routes the outcome back to the entity.
fn dispatch<S>(
    store: &Arc<dyn StateStore<S>>,
    request: DurabilityRequest<S>,
    responses: &mpsc::UnboundedSender<DurabilityResponse<S>>,
) where
    S: Send + Sync + 'static,
{
    let store = Arc::clone(store);
    let responses = responses.clone();

    tokio::spawn(
        async move {
            let response = match request {
                DurabilityRequest::Read { correlation, id } => DurabilityResponse::Read {
                    correlation,
                    outcome: store.read(&id).await,
                },
                DurabilityRequest::Write {
                    correlation,
                    id,
                    state,
                    version,
                    metadata,
                } => DurabilityResponse::Write {
                    correlation,
                    outcome: store.write(&id, state, version, metadata).await,
                },
            };
            // The entity task is gone if this fails; nobody is left to inform.
            let _ = responses.send(response);
        }
        .in_current_span(),
    );
}

/// Answers everything still queued after a fatal failure.
fn reject_queued<E: StatefulEntity>(
    machine: &EntityMachine<E>,
    mailbox: &mut mpsc::UnboundedReceiver<Message<E>>,
) {
    mailbox.close();
    while let Ok(message) = mailbox.try_recv() {
        match message {
            Message::Command(envelope) => {
                envelope.reject(EntityError::Unavailable(machine.id().to_string()))
            }
            Message::Stats(reply) => {
                let _ = reply.send(machine.stats());
            }
            Message::Shutdown => {}
        }
    }
}
