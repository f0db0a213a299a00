use super::correlator::InFlight;
use super::{
    CompletionCorrelator, CompletionToken, CorrelationId, EntityContext, EntityPolicy, Handled,
    PendingBuffer, Preserve, ReplyTo, StatefulEntity,
};
use crate::core::{
    EntityError, Metadata, Result, StoreResult, StoredState, Version, WriteReceipt,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::oneshot;
use tracing::{Level, error, event, warn};

/// Lifecycle of an entity.
///
/// `Initializing → Restoring → Ready ⇄ Writing`; any durability failure moves
/// to `Failed`, which only an external recreate leaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntityStatus {
    Initializing,
    Restoring,
    Ready,
    Writing,
    Failed,
}

impl EntityStatus {
    /// True while a durability call is outstanding.
    pub fn is_busy(self) -> bool {
        matches!(self, Self::Restoring | Self::Writing)
    }
}

impl fmt::Display for EntityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Initializing => "initializing",
            Self::Restoring => "restoring",
            Self::Ready => "ready",
            Self::Writing => "writing",
            Self::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// A command plus where to send its result.
pub struct Envelope<E: StatefulEntity> {
    pub command: E::Command,
    pub reply: Option<ReplyTo<E::Reply>>,
}

impl<E: StatefulEntity> Envelope<E> {
    /// Envelope whose result is awaited through the returned receiver.
    pub fn ask(command: E::Command) -> (Self, oneshot::Receiver<Result<E::Reply>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                command,
                reply: Some(tx),
            },
            rx,
        )
    }

    /// Envelope nobody waits on.
    pub fn tell(command: E::Command) -> Self {
        Self {
            command,
            reply: None,
        }
    }

    pub(crate) fn reject(self, error: EntityError) {
        if let Some(reply) = self.reply {
            let _ = reply.send(Err(error));
        }
    }
}

/// A storage call the machine wants issued.
#[derive(Debug, Clone)]
pub enum DurabilityRequest<S> {
    Read {
        correlation: CorrelationId,
        id: String,
    },
    Write {
        correlation: CorrelationId,
        id: String,
        state: S,
        version: Version,
        metadata: Metadata,
    },
}

impl<S> DurabilityRequest<S> {
    pub fn correlation(&self) -> CorrelationId {
        match self {
            Self::Read { correlation, .. } | Self::Write { correlation, .. } => *correlation,
        }
    }
}

/// The store's answer to a [`DurabilityRequest`], fed back as an event.
#[derive(Debug, Clone)]
pub enum DurabilityResponse<S> {
    Read {
        correlation: CorrelationId,
        outcome: StoreResult<StoredState<S>>,
    },
    Write {
        correlation: CorrelationId,
        outcome: StoreResult<WriteReceipt>,
    },
}

impl<S> DurabilityResponse<S> {
    pub fn correlation(&self) -> CorrelationId {
        match self {
            Self::Read { correlation, .. } | Self::Write { correlation, .. } => *correlation,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Read { .. } => "read",
            Self::Write { .. } => "write",
        }
    }
}

/// Point-in-time view of an entity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EntityStats {
    pub id: String,
    pub status: EntityStatus,
    pub version: Version,
    pub buffered: usize,
    pub buffer_high_water_mark: usize,
    pub writes_completed: u64,
    pub last_applied_at: Option<DateTime<Utc>>,
}

/// Ordering core of an entity.
///
/// Purely synchronous: the owner feeds it commands and storage responses one
/// at a time, and issues whatever [`DurabilityRequest`] it returns. At most
/// one request is outstanding; commands arriving meanwhile are buffered and
/// run, in arrival order, once the response has been applied.
pub struct EntityMachine<E: StatefulEntity> {
    entity: E,
    id: String,
    version: Version,
    status: EntityStatus,
    buffer: PendingBuffer<Envelope<E>>,
    correlator: CompletionCorrelator<E>,
    policy: EntityPolicy,
    failure: Option<EntityError>,
    writes_completed: u64,
    last_applied_at: Option<DateTime<Utc>>,
}

impl<E: StatefulEntity> EntityMachine<E> {
    pub fn new(entity: E, policy: EntityPolicy) -> Self {
        let id = entity.id().to_string();
        Self {
            entity,
            id,
            version: 0,
            status: EntityStatus::Initializing,
            buffer: PendingBuffer::new(),
            correlator: CompletionCorrelator::new(),
            policy,
            failure: None,
            writes_completed: 0,
            last_applied_at: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn status(&self) -> EntityStatus {
        self.status
    }

    pub fn entity(&self) -> &E {
        &self.entity
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// The fatal error that stopped this entity, if any.
    pub fn failure(&self) -> Option<&EntityError> {
        self.failure.as_ref()
    }

    /// True when nothing is outstanding and nothing is waiting.
    pub fn is_idle(&self) -> bool {
        !self.correlator.is_outstanding() && self.buffer.is_empty()
    }

    pub fn stats(&self) -> EntityStats {
        EntityStats {
            id: self.id.clone(),
            status: self.status,
            version: self.version,
            buffered: self.buffer.len(),
            buffer_high_water_mark: self.buffer.high_water_mark(),
            writes_completed: self.writes_completed,
            last_applied_at: self.last_applied_at,
        }
    }

    /// Starts the one-time read of persisted state.
    pub fn restore(&mut self) -> Result<DurabilityRequest<E::State>> {
        if self.status != EntityStatus::Initializing {
            return Err(EntityError::IllegalState(format!(
                "restore of '{}' requested while {}",
                self.id, self.status
            )));
        }

        let correlation = self.correlator.begin_read()?;
        self.status = EntityStatus::Restoring;
        event!(Level::DEBUG, entity = %self.id, %correlation, "restoring state");

        Ok(DurabilityRequest::Read {
            correlation,
            id: self.id.clone(),
        })
    }

    /// Accepts one command: runs it now, buffers it, or rejects it when failed.
    pub fn submit(&mut self, envelope: Envelope<E>) -> Option<DurabilityRequest<E::State>> {
        if self.status == EntityStatus::Failed {
            envelope.reject(EntityError::Unavailable(self.id.clone()));
            return None;
        }

        if self.status != EntityStatus::Ready || !self.buffer.is_empty() {
            self.stow(envelope);
            return None;
        }

        self.execute(envelope)
    }

    /// Applies a storage response and resumes buffered work.
    ///
    /// Returns the next request to issue, if resuming produced one. An `Err`
    /// is fatal: the machine is `Failed` and must be escalated.
    pub fn on_response(
        &mut self,
        response: DurabilityResponse<E::State>,
    ) -> Result<Option<DurabilityRequest<E::State>>> {
        let correlation = response.correlation();
        let Some(in_flight) = self.correlator.resolve(correlation) else {
            warn!(
                entity = %self.id,
                %correlation,
                status = %self.status,
                "ignoring {} response with no matching outstanding call",
                response.kind()
            );
            return Ok(None);
        };

        match (response, in_flight) {
            (DurabilityResponse::Read { outcome, .. }, InFlight::Read) => {
                self.complete_restore(outcome)
            }
            (
                DurabilityResponse::Write { outcome, .. },
                InFlight::Write {
                    version,
                    state,
                    token,
                },
            ) => self.complete_write(outcome, version, state, token),
            (response, in_flight) => {
                let err = EntityError::IllegalState(format!(
                    "{} response {} correlated with an outstanding {} on '{}'",
                    response.kind(),
                    correlation,
                    in_flight.kind(),
                    self.id
                ));
                if let InFlight::Write { token, .. } = in_flight {
                    token.fail(err.clone());
                }
                Err(self.fail(err))
            }
        }
    }

    fn complete_restore(
        &mut self,
        outcome: StoreResult<StoredState<E::State>>,
    ) -> Result<Option<DurabilityRequest<E::State>>> {
        match outcome {
            Ok(stored) => {
                self.entity.apply_state(stored.state);
                self.version = stored.version;
                self.last_applied_at = Some(Utc::now());
                event!(Level::DEBUG, entity = %self.id, version = self.version, "state restored");
            }
            Err(cause) if cause.is_not_found() && self.policy.restore.ignore_not_found => {
                event!(Level::DEBUG, entity = %self.id, "no persisted state; starting fresh");
            }
            Err(cause) => {
                let err = EntityError::RestoreFailed {
                    id: self.id.clone(),
                    source: cause,
                };
                error!(entity = %self.id, error = %err, "state not restored");
                return Err(self.fail(err));
            }
        }

        self.status = EntityStatus::Ready;
        Ok(self.drain())
    }

    fn complete_write(
        &mut self,
        outcome: StoreResult<WriteReceipt>,
        version: Version,
        state: E::State,
        token: CompletionToken<E>,
    ) -> Result<Option<DurabilityRequest<E::State>>> {
        match outcome {
            Ok(receipt) => {
                if receipt.version != version {
                    warn!(
                        entity = %self.id,
                        requested = version,
                        confirmed = receipt.version,
                        "store confirmed a different version than requested"
                    );
                }
                self.entity.apply_state(state);
                self.version = version;
                self.writes_completed = self.writes_completed.saturating_add(1);
                self.last_applied_at = Some(receipt.written_at);
                event!(Level::DEBUG, entity = %self.id, version, "state preserved");

                token.complete(&self.entity);
                self.status = EntityStatus::Ready;
                Ok(self.drain())
            }
            Err(cause) => {
                let err = EntityError::PreserveFailed {
                    id: self.id.clone(),
                    version,
                    source: cause,
                };
                error!(entity = %self.id, error = %err, "state not preserved");
                token.fail(err.clone());
                Err(self.fail(err))
            }
        }
    }

    fn execute(&mut self, envelope: Envelope<E>) -> Option<DurabilityRequest<E::State>> {
        let Envelope { command, reply } = envelope;
        let ctx = EntityContext {
            id: &self.id,
            version: self.version,
        };

        match self.entity.handle(command, &ctx) {
            Ok(Handled::Reply(value)) => {
                if let Some(reply) = reply {
                    let _ = reply.send(Ok(value));
                }
                None
            }
            Ok(Handled::Preserve(preserve)) => self.begin_write(preserve, reply),
            Err(err) => {
                event!(Level::DEBUG, entity = %self.id, error = %err, "command rejected");
                if let Some(reply) = reply {
                    let _ = reply.send(Err(err));
                }
                None
            }
        }
    }

    fn begin_write(
        &mut self,
        preserve: Preserve<E>,
        reply: Option<ReplyTo<E::Reply>>,
    ) -> Option<DurabilityRequest<E::State>> {
        let Preserve {
            state,
            metadata,
            supplier,
        } = preserve;
        let Some(version) = self.version.checked_add(1) else {
            let err = EntityError::IllegalState(format!(
                "'{}' has no version left after {}",
                self.id, self.version
            ));
            error!(entity = %self.id, error = %err, "preserve refused");
            CompletionToken::new(reply, supplier).fail(err);
            return None;
        };
        let token = CompletionToken::new(reply, supplier);

        match self.correlator.begin_write(version, state.clone(), token) {
            Ok(correlation) => {
                self.status = EntityStatus::Writing;
                event!(
                    Level::DEBUG,
                    entity = %self.id,
                    %correlation,
                    version,
                    operation = %metadata.operation,
                    "preserving state"
                );
                Some(DurabilityRequest::Write {
                    correlation,
                    id: self.id.clone(),
                    state,
                    version,
                    metadata,
                })
            }
            Err(err) => {
                // Only reachable if a command runs while a call is outstanding;
                // the correlator has already failed the caller.
                error!(entity = %self.id, error = %err, "preserve refused");
                None
            }
        }
    }

    fn stow(&mut self, envelope: Envelope<E>) {
        let len = self.buffer.stow(envelope);
        if self.policy.buffer_crossed_threshold(len) {
            warn!(
                entity = %self.id,
                buffered = len,
                status = %self.status,
                "pending-operation buffer is growing"
            );
        }
    }

    /// Runs buffered commands oldest first until one issues a durability call.
    fn drain(&mut self) -> Option<DurabilityRequest<E::State>> {
        while self.status == EntityStatus::Ready {
            let envelope = self.buffer.pop_next()?;
            if let Some(request) = self.execute(envelope) {
                return Some(request);
            }
        }
        None
    }

    /// Marks the entity failed. Buffered commands are rejected, never run.
    fn fail(&mut self, err: EntityError) -> EntityError {
        self.status = EntityStatus::Failed;
        self.failure = Some(err.clone());

        let abandoned = self.buffer.take_all();
        if !abandoned.is_empty() {
            warn!(
                entity = %self.id,
                abandoned = abandoned.len(),
                "rejecting buffered commands after fatal failure"
            );
        }
        for envelope in abandoned {
            envelope.reject(EntityError::Unavailable(self.id.clone()));
        }
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::StorageError;
    use tokio::sync::oneshot::error::TryRecvError;

    #[derive(Debug, Clone, PartialEq)]
    struct AccountState {
        balance: i64,
    }

    enum AccountCommand {
        Deposit(i64),
        Withdraw(i64),
        Balance,
    }

    struct Account {
        id: String,
        balance: i64,
        applied: Vec<i64>,
    }

    impl Account {
        fn new(id: &str) -> Self {
            Self {
                id: id.to_string(),
                balance: 0,
                applied: Vec::new(),
            }
        }
    }

    impl StatefulEntity for Account {
        type State = AccountState;
        type Command = AccountCommand;
        type Reply = i64;

        fn id(&self) -> &str {
            &self.id
        }

        fn apply_state(&mut self, state: AccountState) {
            self.balance = state.balance;
            self.applied.push(state.balance);
        }

        fn handle(
            &self,
            command: AccountCommand,
            _ctx: &EntityContext<'_>,
        ) -> Result<Handled<Self>> {
            match command {
                AccountCommand::Deposit(amount) => Ok(Handled::Preserve(
                    Preserve::<Self>::new(AccountState {
                        balance: self.balance + amount,
                    })
                    .operation("deposit")
                    .and_then(|account| account.balance),
                )),
                AccountCommand::Withdraw(amount) if amount > self.balance => Err(
                    EntityError::Rejected(format!("insufficient funds for {}", amount)),
                ),
                AccountCommand::Withdraw(amount) => Ok(Handled::Preserve(
                    Preserve::<Self>::new(AccountState {
                        balance: self.balance - amount,
                    })
                    .metadata_value("atm")
                    .operation("withdraw"),
                )),
                AccountCommand::Balance => Ok(Handled::Reply(self.balance)),
            }
        }
    }

    fn not_found(id: &str) -> StoreResult<StoredState<AccountState>> {
        Err(StorageError::NotFound(id.to_string()))
    }

    fn fresh_machine(id: &str) -> EntityMachine<Account> {
        let mut machine = EntityMachine::new(Account::new(id), EntityPolicy::default());
        let restore = machine.restore().unwrap();
        let next = machine
            .on_response(DurabilityResponse::Read {
                correlation: restore.correlation(),
                outcome: not_found(id),
            })
            .unwrap();
        assert!(next.is_none());
        machine
    }

    fn confirm(request: &DurabilityRequest<AccountState>) -> DurabilityResponse<AccountState> {
        let DurabilityRequest::Write {
            correlation,
            version,
            ..
        } = request
        else {
            panic!("expected a write request, got {:?}", request);
        };
        DurabilityResponse::Write {
            correlation: *correlation,
            outcome: Ok(WriteReceipt::new(*version)),
        }
    }

    fn write_version(request: &DurabilityRequest<AccountState>) -> (Version, i64, String) {
        match request {
            DurabilityRequest::Write {
                version,
                state,
                metadata,
                ..
            } => (*version, state.balance, metadata.operation.clone()),
            other => panic!("expected a write request, got {:?}", other),
        }
    }

    #[test]
    fn fresh_identity_starts_at_version_zero() {
        let machine = fresh_machine("acct-0");

        assert_eq!(machine.version(), 0);
        assert_eq!(machine.status(), EntityStatus::Ready);
        assert!(machine.entity().applied.is_empty());
    }

    #[test]
    fn restore_applies_persisted_state() {
        let mut machine = EntityMachine::new(Account::new("acct-7"), EntityPolicy::default());
        let restore = machine.restore().unwrap();
        assert!(matches!(restore, DurabilityRequest::Read { ref id, .. } if id == "acct-7"));
        assert_eq!(machine.status(), EntityStatus::Restoring);

        machine
            .on_response(DurabilityResponse::Read {
                correlation: restore.correlation(),
                outcome: Ok(StoredState::new(
                    AccountState { balance: 70 },
                    7,
                    Metadata::operation("deposit"),
                )),
            })
            .unwrap();

        assert_eq!(machine.version(), 7);
        assert_eq!(machine.entity().applied, vec![70]);
        assert!(machine.stats().last_applied_at.is_some());
    }

    #[test]
    fn restore_is_allowed_once() {
        let mut machine = fresh_machine("acct-1");
        let err = machine.restore().unwrap_err();
        assert!(matches!(err, EntityError::IllegalState(_)));
        assert_eq!(machine.status(), EntityStatus::Ready);
    }

    #[test]
    fn first_preserve_writes_version_one_and_applies_once() {
        let mut machine = fresh_machine("acct-1");
        let (envelope, mut reply) = Envelope::ask(AccountCommand::Deposit(100));

        let write = machine.submit(envelope).expect("deposit should write");
        assert_eq!(write_version(&write), (1, 100, "deposit".to_string()));
        assert_eq!(machine.status(), EntityStatus::Writing);
        assert!(matches!(reply.try_recv(), Err(TryRecvError::Empty)));
        assert!(machine.entity().applied.is_empty());

        assert!(machine.on_response(confirm(&write)).unwrap().is_none());

        assert_eq!(machine.version(), 1);
        assert_eq!(machine.entity().applied, vec![100]);
        assert_eq!(reply.try_recv().unwrap().unwrap(), 100);
        assert_eq!(machine.status(), EntityStatus::Ready);
    }

    #[test]
    fn commands_during_restore_run_in_arrival_order() {
        let mut machine = EntityMachine::new(Account::new("acct-2"), EntityPolicy::default());
        let restore = machine.restore().unwrap();

        let (first, mut first_reply) = Envelope::ask(AccountCommand::Deposit(10));
        let (second, mut second_reply) = Envelope::ask(AccountCommand::Deposit(5));
        let (query, mut query_reply) = Envelope::ask(AccountCommand::Balance);
        assert!(machine.submit(first).is_none());
        assert!(machine.submit(second).is_none());
        assert!(machine.submit(query).is_none());
        assert_eq!(machine.buffered(), 3);

        let write = machine
            .on_response(DurabilityResponse::Read {
                correlation: restore.correlation(),
                outcome: not_found("acct-2"),
            })
            .unwrap()
            .expect("first buffered deposit should write");
        assert_eq!(write_version(&write), (1, 10, "deposit".to_string()));
        assert_eq!(machine.buffered(), 2);

        let write = machine
            .on_response(confirm(&write))
            .unwrap()
            .expect("second buffered deposit should write");
        assert_eq!(write_version(&write), (2, 15, "deposit".to_string()));
        assert_eq!(first_reply.try_recv().unwrap().unwrap(), 10);
        assert!(matches!(query_reply.try_recv(), Err(TryRecvError::Empty)));

        assert!(machine.on_response(confirm(&write)).unwrap().is_none());
        assert_eq!(second_reply.try_recv().unwrap().unwrap(), 15);
        assert_eq!(query_reply.try_recv().unwrap().unwrap(), 15);
        assert_eq!(machine.entity().applied, vec![10, 15]);
        assert!(machine.is_idle());
    }

    #[test]
    fn arrivals_while_draining_queue_behind_remaining_commands() {
        let mut machine = fresh_machine("acct-3");
        let first = machine
            .submit(Envelope::tell(AccountCommand::Deposit(1)))
            .unwrap();
        assert!(machine.submit(Envelope::tell(AccountCommand::Deposit(2))).is_none());
        assert!(machine.submit(Envelope::tell(AccountCommand::Deposit(3))).is_none());

        let second = machine.on_response(confirm(&first)).unwrap().unwrap();
        // Deposit(3) is still buffered, so this one must wait behind it.
        assert!(machine.submit(Envelope::tell(AccountCommand::Deposit(4))).is_none());

        let third = machine.on_response(confirm(&second)).unwrap().unwrap();
        let fourth = machine.on_response(confirm(&third)).unwrap().unwrap();
        assert!(machine.on_response(confirm(&fourth)).unwrap().is_none());

        assert_eq!(machine.entity().applied, vec![1, 3, 6, 10]);
        assert_eq!(machine.version(), 4);
    }

    #[test]
    fn versions_increase_by_one_per_write() {
        let mut machine = fresh_machine("acct-4");
        let mut seen = Vec::new();
        for amount in 1..=5 {
            let write = machine
                .submit(Envelope::tell(AccountCommand::Deposit(amount)))
                .unwrap();
            machine.on_response(confirm(&write)).unwrap();
            seen.push(machine.version());
        }
        assert_eq!(seen, vec![1, 2, 3, 4, 5]);
        assert_eq!(machine.stats().writes_completed, 5);
    }

    #[test]
    fn conflict_leaves_version_and_state_untouched() {
        let mut machine = fresh_machine("acct-5");
        let write = machine
            .submit(Envelope::tell(AccountCommand::Deposit(50)))
            .unwrap();
        machine.on_response(confirm(&write)).unwrap();

        let (envelope, mut reply) = Envelope::ask(AccountCommand::Deposit(25));
        let write = machine.submit(envelope).unwrap();
        let (waiting, mut waiting_reply) = Envelope::ask(AccountCommand::Balance);
        assert!(machine.submit(waiting).is_none());

        let conflict = StorageError::Conflict {
            id: "acct-5".to_string(),
            expected: 2,
            actual: 2,
        };
        let err = machine
            .on_response(DurabilityResponse::Write {
                correlation: write.correlation(),
                outcome: Err(conflict.clone()),
            })
            .unwrap_err();

        assert_eq!(err.storage_cause(), Some(&conflict));
        assert_eq!(machine.version(), 1);
        assert_eq!(machine.entity().balance, 50);
        assert_eq!(machine.entity().applied, vec![50]);
        assert_eq!(machine.status(), EntityStatus::Failed);
        assert_eq!(machine.failure(), Some(&err));

        let caller_err = reply.try_recv().unwrap().unwrap_err();
        assert!(matches!(
            caller_err,
            EntityError::PreserveFailed { version: 2, .. }
        ));
        assert_eq!(
            waiting_reply.try_recv().unwrap().unwrap_err(),
            EntityError::Unavailable("acct-5".to_string())
        );
    }

    #[test]
    fn failed_entity_rejects_new_commands() {
        let mut machine = fresh_machine("acct-6");
        let write = machine
            .submit(Envelope::tell(AccountCommand::Deposit(1)))
            .unwrap();
        machine
            .on_response(DurabilityResponse::Write {
                correlation: write.correlation(),
                outcome: Err(StorageError::Unavailable("offline".to_string())),
            })
            .unwrap_err();

        let (envelope, mut reply) = Envelope::ask(AccountCommand::Balance);
        assert!(machine.submit(envelope).is_none());
        assert!(matches!(
            reply.try_recv().unwrap(),
            Err(EntityError::Unavailable(_))
        ));
        assert_eq!(machine.version(), 0);
    }

    #[test]
    fn write_response_to_outstanding_read_is_fatal() {
        let mut machine = EntityMachine::new(Account::new("acct-8"), EntityPolicy::default());
        let restore = machine.restore().unwrap();
        let (waiting, mut waiting_reply) = Envelope::ask(AccountCommand::Balance);
        assert!(machine.submit(waiting).is_none());

        let err = machine
            .on_response(DurabilityResponse::Write {
                correlation: restore.correlation(),
                outcome: Ok(WriteReceipt::new(1)),
            })
            .unwrap_err();

        assert!(matches!(err, EntityError::IllegalState(_)));
        assert_eq!(machine.status(), EntityStatus::Failed);
        assert_eq!(machine.version(), 0);
        assert!(machine.entity().applied.is_empty());
        assert_eq!(
            waiting_reply.try_recv().unwrap().unwrap_err(),
            EntityError::Unavailable("acct-8".to_string())
        );
    }

    #[test]
    fn read_response_to_outstanding_write_is_fatal() {
        let mut machine = fresh_machine("acct-9");
        let (envelope, mut reply) = Envelope::ask(AccountCommand::Deposit(10));
        let write = machine.submit(envelope).unwrap();

        let err = machine
            .on_response(DurabilityResponse::Read {
                correlation: write.correlation(),
                outcome: Ok(StoredState::new(
                    AccountState { balance: 500 },
                    9,
                    Metadata::default(),
                )),
            })
            .unwrap_err();

        assert!(matches!(err, EntityError::IllegalState(_)));
        assert_eq!(machine.status(), EntityStatus::Failed);
        assert_eq!(machine.version(), 0);
        assert_eq!(machine.entity().balance, 0);
        assert!(machine.entity().applied.is_empty());
        assert_eq!(reply.try_recv().unwrap().unwrap_err(), err);
    }

    #[test]
    fn preserve_at_last_version_is_refused() {
        let mut machine = EntityMachine::new(Account::new("acct-10"), EntityPolicy::default());
        let restore = machine.restore().unwrap();
        machine
            .on_response(DurabilityResponse::Read {
                correlation: restore.correlation(),
                outcome: Ok(StoredState::new(
                    AccountState { balance: 1 },
                    Version::MAX,
                    Metadata::default(),
                )),
            })
            .unwrap();

        let (envelope, mut reply) = Envelope::ask(AccountCommand::Deposit(1));
        assert!(machine.submit(envelope).is_none());

        assert!(matches!(
            reply.try_recv().unwrap().unwrap_err(),
            EntityError::IllegalState(_)
        ));
        assert_eq!(machine.status(), EntityStatus::Ready);
        assert_eq!(machine.version(), Version::MAX);
        assert!(machine.is_idle());
    }

    #[test]
    fn restore_failure_is_fatal_and_abandons_buffer() {
        let mut machine = EntityMachine::new(Account::new("acct-8"), EntityPolicy::default());
        let restore = machine.restore().unwrap();
        let (envelope, mut reply) = Envelope::ask(AccountCommand::Deposit(1));
        assert!(machine.submit(envelope).is_none());

        let err = machine
            .on_response(DurabilityResponse::Read {
                correlation: restore.correlation(),
                outcome: Err(StorageError::Failure("checksum mismatch".to_string())),
            })
            .unwrap_err();

        assert!(matches!(err, EntityError::RestoreFailed { .. }));
        assert!(err.is_fatal());
        assert_eq!(machine.status(), EntityStatus::Failed);
        assert!(machine.entity().applied.is_empty());
        assert!(matches!(
            reply.try_recv().unwrap(),
            Err(EntityError::Unavailable(_))
        ));
    }

    #[test]
    fn not_found_is_fatal_when_entity_must_exist() {
        let mut machine = EntityMachine::new(
            Account::new("acct-9"),
            EntityPolicy::default().require_existing(),
        );
        let restore = machine.restore().unwrap();
        let err = machine
            .on_response(DurabilityResponse::Read {
                correlation: restore.correlation(),
                outcome: not_found("acct-9"),
            })
            .unwrap_err();

        assert!(matches!(
            err,
            EntityError::RestoreFailed {
                source: StorageError::NotFound(_),
                ..
            }
        ));
        assert_eq!(machine.status(), EntityStatus::Failed);
    }

    #[test]
    fn duplicate_response_is_ignored() {
        let mut machine = fresh_machine("acct-10");
        let write = machine
            .submit(Envelope::tell(AccountCommand::Deposit(5)))
            .unwrap();
        let response = confirm(&write);
        machine.on_response(response.clone()).unwrap();

        assert!(machine.on_response(response).unwrap().is_none());
        assert_eq!(machine.version(), 1);
        assert_eq!(machine.entity().applied, vec![5]);
        assert_eq!(machine.status(), EntityStatus::Ready);
    }

    #[test]
    fn domain_rejection_does_not_touch_state() {
        let mut machine = fresh_machine("acct-11");
        let (envelope, mut reply) = Envelope::ask(AccountCommand::Withdraw(10));

        assert!(machine.submit(envelope).is_none());
        assert!(matches!(
            reply.try_recv().unwrap(),
            Err(EntityError::Rejected(_))
        ));
        assert_eq!(machine.status(), EntityStatus::Ready);
        assert_eq!(machine.version(), 0);
    }

    #[test]
    fn preserve_without_supplier_answers_no_reply() {
        let mut machine = fresh_machine("acct-12");
        let write = machine
            .submit(Envelope::tell(AccountCommand::Deposit(20)))
            .unwrap();
        machine.on_response(confirm(&write)).unwrap();

        let (envelope, mut reply) = Envelope::ask(AccountCommand::Withdraw(5));
        let write = machine.submit(envelope).unwrap();
        match &write {
            DurabilityRequest::Write { metadata, .. } => {
                assert_eq!(metadata, &Metadata::new("atm", "withdraw"));
            }
            other => panic!("expected a write request, got {:?}", other),
        }
        machine.on_response(confirm(&write)).unwrap();

        assert_eq!(machine.entity().balance, 15);
        assert_eq!(machine.version(), 2);
        assert_eq!(
            reply.try_recv().unwrap().unwrap_err(),
            EntityError::NoReply("acct-12".to_string())
        );
    }
}
