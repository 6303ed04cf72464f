//! # Optimistic Mutation Coordinator
//!
//! Three-phase protocol for locally originated changes:
//!
//! 1. **Speculative apply**: a provisional record with a temporary id is
//!    appended to the target collection before any network call.
//! 2. **Remote commit**: the real mutation goes through the gateway.
//! 3. **Reconcile or rollback**: any 2xx confirms, and the provisional record
//!    is replaced by the confirmed one when the response carries it; on
//!    failure it is removed from the collection state current at rollback
//!    time, and the error is surfaced.
//!
//! At most one mutation per slot is in flight.

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::gateway::RequestGateway;
use super::session::SessionManager;
use super::store::Collection;
use crate::domain::{
    MutationReceipt, MutationStatus, PendingMutation, Record, SyncError, TempId,
};
use crate::ports::HttpMethod;

/// Remote half of a mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationRequest {
    /// Verb
    pub method: HttpMethod,
    /// Resource path
    pub route: String,
    /// Request body
    pub body: Value,
}

impl MutationRequest {
    /// POST `body` to `route`.
    pub fn post(route: impl Into<String>, body: Value) -> Self {
        Self {
            method: HttpMethod::Post,
            route: route.into(),
            body,
        }
    }
}

/// Runs optimistic mutations against store collections.
pub struct MutationCoordinator {
    gateway: Arc<RequestGateway>,
    session: Arc<SessionManager>,
    in_flight: Arc<Mutex<HashMap<String, PendingMutation>>>,
}

impl MutationCoordinator {
    /// Coordinator committing through `gateway`.
    pub fn new(gateway: Arc<RequestGateway>, session: Arc<SessionManager>) -> Self {
        Self {
            gateway,
            session,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// The pending mutation holding `slot`, if any.
    pub fn pending(&self, slot: &str) -> Option<PendingMutation> {
        self.in_flight.lock().get(slot).cloned()
    }

    /// Number of mutations in flight.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// Provisional records of still-pending mutations whose slot satisfies
    /// `matches`, oldest first.
    ///
    /// A re-fetch that replaces a collection wholesale appends these so
    /// in-flight changes stay visible until they settle.
    pub fn provisional_records<F>(&self, matches: F) -> Vec<Record>
    where
        F: Fn(&str) -> bool,
    {
        let in_flight = self.in_flight.lock();
        let mut pending: Vec<&PendingMutation> = in_flight
            .values()
            .filter(|m| m.status.is_pending() && matches(&m.slot))
            .collect();
        pending.sort_by_key(|m| m.created_at);
        pending.into_iter().map(PendingMutation::provisional_record).collect()
    }

    /// Run one optimistic mutation.
    ///
    /// `payload` becomes the provisional record appended to `target`;
    /// `request` is the remote commit. Fails with `MutationInFlight` without
    /// touching `target` when `slot` is busy.
    pub async fn submit(
        &self,
        slot: &str,
        target: &Collection<Vec<Record>>,
        payload: Value,
        request: MutationRequest,
    ) -> Result<MutationReceipt, SyncError> {
        self.submit_scoped(slot, target, target.scope(), payload, request)
            .await
    }

    /// [`submit`](Self::submit) against `target` as of `scope`.
    ///
    /// Once `target` is rescoped the confirmed record is no longer placed
    /// into it; the mutation still settles and the receipt carries the record.
    pub async fn submit_scoped(
        &self,
        slot: &str,
        target: &Collection<Vec<Record>>,
        scope: u64,
        payload: Value,
        request: MutationRequest,
    ) -> Result<MutationReceipt, SyncError> {
        let mutation = PendingMutation::new(slot, payload);
        let temp_id = mutation.temp_id.clone();
        let provisional = mutation.provisional_record();
        let _guard = self.acquire(mutation, target)?;

        // Phase 1: speculative apply
        let epoch = self.session.epoch();
        target.update_scoped(epoch, scope, |records| {
            let mut next = records.clone();
            next.push(provisional);
            next
        });
        debug!(slot, temp_id = %temp_id, collection = target.name(), "Provisional record applied");

        // Phase 2: remote commit
        let committed = self
            .gateway
            .commit(&request.route, request.method, Some(request.body))
            .await;

        // Phase 3: reconcile or rollback
        match committed {
            Ok(fetched) => {
                let confirmed = Record::from_response(fetched.value).unwrap_or_else(|e| {
                    warn!(slot, temp_id = %temp_id, error = %e, "Mutation accepted without a usable record");
                    None
                });
                let record_id = confirmed.as_ref().map(|r| r.id().to_string());
                self.settle(slot, |m| m.confirm(record_id.clone()));

                let placed = target.update_scoped(fetched.epoch, scope, |records| {
                    reconcile(records, &temp_id, confirmed.as_ref())
                });
                info!(slot, temp_id = %temp_id, record_id = ?record_id, placed, "Mutation confirmed");

                Ok(MutationReceipt {
                    temp_id,
                    status: MutationStatus::Confirmed { record_id },
                    record: confirmed,
                })
            }
            Err(error) => {
                self.settle(slot, |m| m.roll_back(error.clone()));
                target.update(|records| without(records, &temp_id));
                warn!(slot, temp_id = %temp_id, error = %error, "Mutation rolled back");
                Err(error)
            }
        }
    }

    fn acquire<'a>(
        &self,
        mutation: PendingMutation,
        target: &'a Collection<Vec<Record>>,
    ) -> Result<InFlight<'a>, SyncError> {
        let mut in_flight = self.in_flight.lock();
        if in_flight.contains_key(&mutation.slot) {
            debug!(slot = %mutation.slot, "Rejecting mutation; slot busy");
            return Err(SyncError::MutationInFlight(mutation.slot));
        }
        let guard = InFlight {
            slot: mutation.slot.clone(),
            temp_id: mutation.temp_id.clone(),
            in_flight: Arc::clone(&self.in_flight),
            target,
        };
        in_flight.insert(guard.slot.clone(), mutation);
        Ok(guard)
    }

    fn settle<F>(&self, slot: &str, transition: F)
    where
        F: FnOnce(&mut PendingMutation),
    {
        if let Some(mutation) = self.in_flight.lock().get_mut(slot) {
            transition(mutation);
        }
    }
}

/// Holds a mutation slot. On drop the slot is released and the provisional
/// record is removed from the target if it is still there, so a submit
/// future dropped mid-commit leaves nothing behind.
struct InFlight<'a> {
    slot: String,
    temp_id: TempId,
    in_flight: Arc<Mutex<HashMap<String, PendingMutation>>>,
    target: &'a Collection<Vec<Record>>,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.in_flight.lock().remove(&self.slot);
        if self.target.update(|records| without(records, &self.temp_id)) {
            debug!(slot = %self.slot, temp_id = %self.temp_id, "Abandoned provisional record removed");
        }
    }
}

fn without(records: &[Record], temp_id: &TempId) -> Vec<Record> {
    records
        .iter()
        .filter(|r| r.id() != temp_id.as_str())
        .cloned()
        .collect()
}

/// Swap the provisional record for the confirmed one.
///
/// If the confirmed record already arrived through a re-fetch, only the
/// provisional record is dropped. If a re-fetch replaced the provisional
/// record without the confirmed one, it is appended. Without a confirmed
/// record the provisional one is dropped and the next re-fetch fills the gap.
fn reconcile(records: &[Record], temp_id: &TempId, confirmed: Option<&Record>) -> Vec<Record> {
    let Some(confirmed) = confirmed else {
        return without(records, temp_id);
    };

    let already_present = records.iter().any(|r| r.id() == confirmed.id());
    let mut placed = already_present;
    let mut next: Vec<Record> = records
        .iter()
        .filter_map(|r| {
            if r.id() != temp_id.as_str() {
                Some(r.clone())
            } else if !placed {
                placed = true;
                Some(confirmed.clone())
            } else {
                None
            }
        })
        .collect();

    if !placed {
        next.push(confirmed.clone());
    }
    next
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MemoryCredentialStore;
    use crate::domain::{Credential, RetryPolicy};
    use crate::ports::{MockReply, MockTransport};
    use serde_json::json;
    use tokio::sync::Notify;

    const ROUTE: &str = "conversations/c1/messages";

    struct Fixture {
        coordinator: Arc<MutationCoordinator>,
        transport: Arc<MockTransport>,
        session: Arc<SessionManager>,
        messages: Arc<Collection<Vec<Record>>>,
    }

    fn fixture() -> Fixture {
        let transport = Arc::new(MockTransport::new());
        let session = Arc::new(SessionManager::new(Arc::new(MemoryCredentialStore::new())));
        let epoch = session.set_credential(Credential::new("tok")).unwrap();
        let gateway = Arc::new(RequestGateway::new(
            transport.clone(),
            session.clone(),
            RetryPolicy::no_retry(),
        ));
        let messages = Arc::new(Collection::new("messages"));
        messages.clear(epoch);
        messages.set_at(epoch, vec![record("m1", "earlier")]);

        Fixture {
            coordinator: Arc::new(MutationCoordinator::new(gateway, session.clone())),
            transport,
            session,
            messages,
        }
    }

    fn record(id: &str, text: &str) -> Record {
        serde_json::from_value(json!({"id": id, "text": text})).unwrap()
    }

    fn send(text: &str) -> MutationRequest {
        MutationRequest::post(ROUTE, json!({"text": text}))
    }

    #[tokio::test]
    async fn test_confirmed_record_replaces_provisional() {
        let f = fixture();
        f.transport.enqueue(
            HttpMethod::Post,
            ROUTE,
            MockReply::Json(201, json!({"id": "m2", "text": "Hello"})),
        );

        let receipt = f
            .coordinator
            .submit("composer:c1", &f.messages, json!({"text": "Hello"}), send("Hello"))
            .await
            .unwrap();

        assert_eq!(
            receipt.status,
            MutationStatus::Confirmed {
                record_id: Some("m2".into())
            }
        );
        let ids: Vec<_> = f.messages.get().iter().map(|r| r.id().to_string()).collect();
        assert_eq!(ids, vec!["m1", "m2"]);
        assert_eq!(f.coordinator.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_failure_restores_pre_mutation_state() {
        let f = fixture();
        f.transport
            .enqueue(HttpMethod::Post, ROUTE, MockReply::Fail("offline".into()));
        let before = f.messages.get();

        let err = f
            .coordinator
            .submit("composer:c1", &f.messages, json!({"text": "Hello"}), send("Hello"))
            .await
            .unwrap_err();

        assert_eq!(err, SyncError::TransportError("offline".into()));
        assert_eq!(*f.messages.get(), *before);
        assert!(f.coordinator.pending("composer:c1").is_none());
    }

    #[tokio::test]
    async fn test_provisional_visible_before_commit_and_slot_busy() {
        let f = fixture();
        let gate = Arc::new(Notify::new());
        f.transport.enqueue(
            HttpMethod::Post,
            ROUTE,
            MockReply::gated(&gate, MockReply::ok(json!({"id": "m2", "text": "Hello"}))),
        );

        let task = {
            let coordinator = f.coordinator.clone();
            let messages = f.messages.clone();
            tokio::spawn(async move {
                coordinator
                    .submit("composer:c1", &messages, json!({"text": "Hello"}), send("Hello"))
                    .await
            })
        };
        tokio::task::yield_now().await;

        let current = f.messages.get();
        assert_eq!(current.len(), 2);
        assert!(current[1].is_provisional());
        assert!(f.coordinator.pending("composer:c1").unwrap().status.is_pending());

        let second = f
            .coordinator
            .submit("composer:c1", &f.messages, json!({"text": "again"}), send("again"))
            .await;
        assert_eq!(second, Err(SyncError::MutationInFlight("composer:c1".into())));
        assert_eq!(f.messages.get().len(), 2);

        gate.notify_one();
        task.await.unwrap().unwrap();
        assert!(!f.messages.get().iter().any(Record::is_provisional));
    }

    #[tokio::test]
    async fn test_rollback_applies_to_current_state() {
        let f = fixture();
        let gate = Arc::new(Notify::new());
        f.transport.enqueue(
            HttpMethod::Post,
            ROUTE,
            MockReply::gated(&gate, MockReply::status(500)),
        );

        let task = {
            let coordinator = f.coordinator.clone();
            let messages = f.messages.clone();
            tokio::spawn(async move {
                coordinator
                    .submit("composer:c1", &messages, json!({"text": "Hello"}), send("Hello"))
                    .await
            })
        };
        tokio::task::yield_now().await;

        // A push-triggered re-fetch lands while the commit is in flight
        let provisional = f.messages.get()[1].clone();
        f.messages.set(vec![
            record("m1", "earlier"),
            record("m9", "from someone else"),
            provisional,
        ]);

        gate.notify_one();
        assert!(task.await.unwrap().is_err());

        let ids: Vec<_> = f.messages.get().iter().map(|r| r.id().to_string()).collect();
        assert_eq!(ids, vec!["m1", "m9"]);
    }

    #[tokio::test]
    async fn test_no_record_in_response_drops_provisional() {
        let f = fixture();
        f.transport
            .enqueue(HttpMethod::Post, ROUTE, MockReply::status(202));

        let receipt = f
            .coordinator
            .submit("composer:c1", &f.messages, json!({"text": "Hello"}), send("Hello"))
            .await
            .unwrap();

        assert_eq!(receipt.record, None);
        assert_eq!(f.messages.get().len(), 1);
    }

    #[tokio::test]
    async fn test_logout_mid_commit_leaves_store_cleared() {
        let f = fixture();
        let gate = Arc::new(Notify::new());
        f.transport.enqueue(
            HttpMethod::Post,
            ROUTE,
            MockReply::gated(&gate, MockReply::ok(json!({"id": "m2"}))),
        );

        let task = {
            let coordinator = f.coordinator.clone();
            let messages = f.messages.clone();
            tokio::spawn(async move {
                coordinator
                    .submit("composer:c1", &messages, json!({"text": "Hello"}), send("Hello"))
                    .await
            })
        };
        tokio::task::yield_now().await;

        f.session.invalidate();
        f.messages.clear(f.session.epoch());
        gate.notify_one();

        assert_eq!(task.await.unwrap(), Err(SyncError::Cancelled));
        assert!(f.messages.get().is_empty());
    }

    #[tokio::test]
    async fn test_accepted_body_without_record_still_confirms() {
        let f = fixture();
        f.transport
            .enqueue(HttpMethod::Post, ROUTE, MockReply::Raw(201, "Created".into()))
            .enqueue(HttpMethod::Post, ROUTE, MockReply::Json(201, json!({"id": null})));

        for text in ["first", "second"] {
            let receipt = f
                .coordinator
                .submit("composer:c1", &f.messages, json!({"text": text}), send(text))
                .await
                .unwrap();

            assert_eq!(receipt.status, MutationStatus::Confirmed { record_id: None });
            assert_eq!(receipt.record, None);
            let ids: Vec<_> = f.messages.get().iter().map(|r| r.id().to_string()).collect();
            assert_eq!(ids, vec!["m1"]);
        }
        assert_eq!(f.transport.count(HttpMethod::Post, ROUTE), 2);
    }

    #[tokio::test]
    async fn test_dropped_submit_removes_provisional_and_frees_slot() {
        let f = fixture();
        let gate = Arc::new(Notify::new());
        f.transport.enqueue(
            HttpMethod::Post,
            ROUTE,
            MockReply::gated(&gate, MockReply::ok(json!({"id": "m2"}))),
        );

        let abandoned = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            f.coordinator
                .submit("composer:c1", &f.messages, json!({"text": "Hello"}), send("Hello")),
        )
        .await;

        assert!(abandoned.is_err());
        let ids: Vec<_> = f.messages.get().iter().map(|r| r.id().to_string()).collect();
        assert_eq!(ids, vec!["m1"]);
        assert_eq!(f.coordinator.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_rescoped_target_is_not_repopulated() {
        let f = fixture();
        let gate = Arc::new(Notify::new());
        f.transport.enqueue(
            HttpMethod::Post,
            ROUTE,
            MockReply::gated(&gate, MockReply::ok(json!({"id": "m2", "text": "Hello"}))),
        );

        let task = {
            let coordinator = f.coordinator.clone();
            let messages = f.messages.clone();
            tokio::spawn(async move {
                coordinator
                    .submit("composer:c1", &messages, json!({"text": "Hello"}), send("Hello"))
                    .await
            })
        };
        tokio::task::yield_now().await;
        assert_eq!(f.messages.get().len(), 2);

        // The collection now shows another conversation
        let scope = f.messages.rescope();
        f.messages
            .update_scoped(f.session.epoch(), scope, |_| vec![record("x1", "elsewhere")]);
        gate.notify_one();

        let receipt = task.await.unwrap().unwrap();
        assert_eq!(receipt.record.unwrap().id(), "m2");
        let ids: Vec<_> = f.messages.get().iter().map(|r| r.id().to_string()).collect();
        assert_eq!(ids, vec!["x1"]);
    }

    #[tokio::test]
    async fn test_provisional_records_only_while_pending() {
        let f = fixture();
        let gate = Arc::new(Notify::new());
        f.transport.enqueue(
            HttpMethod::Post,
            ROUTE,
            MockReply::gated(&gate, MockReply::ok(json!({"id": "m2"}))),
        );

        let task = {
            let coordinator = f.coordinator.clone();
            let messages = f.messages.clone();
            tokio::spawn(async move {
                coordinator
                    .submit("composer:c1", &messages, json!({"text": "Hello"}), send("Hello"))
                    .await
            })
        };
        tokio::task::yield_now().await;

        let pending = f.coordinator.provisional_records(|slot| slot == "composer:c1");
        assert_eq!(pending.len(), 1);
        assert!(pending[0].is_provisional());
        assert!(f.coordinator.provisional_records(|slot| slot == "composer:c2").is_empty());

        gate.notify_one();
        task.await.unwrap().unwrap();
        assert!(f.coordinator.provisional_records(|_| true).is_empty());
    }

    #[test]
    fn test_reconcile_when_confirmed_already_present() {
        let temp = TempId::generate();
        let provisional = Record::provisional(temp.as_str(), &json!({"text": "Hello"}));
        let confirmed = record("m2", "Hello");
        let records = vec![record("m1", "a"), confirmed.clone(), provisional];

        let next = reconcile(&records, &temp, Some(&confirmed));

        assert_eq!(next, vec![record("m1", "a"), confirmed]);
    }

    #[test]
    fn test_reconcile_when_provisional_gone() {
        let temp = TempId::generate();
        let confirmed = record("m2", "Hello");
        let next = reconcile(&[record("m1", "a")], &temp, Some(&confirmed));
        assert_eq!(next, vec![record("m1", "a"), confirmed]);
    }
}
