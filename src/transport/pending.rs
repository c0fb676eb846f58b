//! Request correlation and deadline scheduling.
//!
//! Outstanding requests live in two maps behind one mutex: id → completion
//! slot and id → deadline. A dedicated timer thread sleeps until the
//! earliest deadline and fails expired requests with an internal-error
//! response. Every slot is fulfilled exactly once, by a matching response,
//! by deadline expiry, or by transport close.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};

use crate::protocol::{RequestId, Response};

/// Create a connected completion-slot pair.
pub(crate) fn response_slot() -> (SlotSender, ResponseSlot) {
    let (tx, rx) = bounded(1);
    (SlotSender { tx }, ResponseSlot { rx })
}

/// A slot already holding its response, for calls that fail immediately.
pub(crate) fn ready_slot(response: Response) -> ResponseSlot {
    let (sender, slot) = response_slot();
    sender.fulfill(response);
    slot
}

/// Producer half of a completion slot. Fulfillment consumes the sender,
/// which is what makes exactly-once structural.
pub(crate) struct SlotSender {
    tx: Sender<Response>,
}

impl SlotSender {
    pub(crate) fn fulfill(self, response: Response) {
        // The caller may have dropped its half; nothing to deliver to.
        let _ = self.tx.send(response);
    }
}

/// Awaitable handle for one in-flight request.
///
/// The slot always resolves: with the peer's response, a
/// `"Request timeout"` error, or a `"Transport closed"` error.
pub struct ResponseSlot {
    rx: Receiver<Response>,
}

impl ResponseSlot {
    /// Block until the response arrives.
    pub fn recv(self) -> Response {
        self.rx
            .recv()
            .unwrap_or_else(|_| Response::internal_error(RequestId::default(), "Transport closed"))
    }

    /// Block with a deadline. `None` means the wait timed out; the
    /// request is still pending and the slot can be waited on again.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Response> {
        match self.rx.recv_timeout(timeout) {
            Ok(response) => Some(response),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Response::internal_error(
                RequestId::default(),
                "Transport closed",
            )),
        }
    }

    /// Non-blocking poll.
    pub fn try_recv(&self) -> Option<Response> {
        self.rx.try_recv().ok()
    }
}

struct PendingEntry {
    /// The caller's id in its original form, for synthesized responses.
    id: RequestId,
    slot: SlotSender,
}

struct TableState {
    pending: HashMap<String, PendingEntry>,
    /// `None` means the request never expires (timeouts disabled).
    deadlines: HashMap<String, Option<Instant>>,
}

/// The correlation table plus the timer thread's condition variable.
pub(crate) struct PendingTable {
    state: Mutex<TableState>,
    cv: Condvar,
}

impl PendingTable {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(TableState {
                pending: HashMap::new(),
                deadlines: HashMap::new(),
            }),
            cv: Condvar::new(),
        }
    }

    /// Register an in-flight request and wake the timer thread so it
    /// recomputes its next deadline.
    pub(crate) fn insert(
        &self,
        key: String,
        id: RequestId,
        slot: SlotSender,
        deadline: Option<Instant>,
    ) {
        let mut state = self.lock();
        state.pending.insert(key.clone(), PendingEntry { id, slot });
        state.deadlines.insert(key, deadline);
        drop(state);
        self.cv.notify_all();
    }

    /// Deliver a wire response to its waiting slot. Returns `false` when
    /// no request with this key is pending (late or unknown response).
    pub(crate) fn complete(&self, key: &str, response: Response) -> bool {
        let mut state = self.lock();
        state.deadlines.remove(key);
        match state.pending.remove(key) {
            Some(entry) => {
                entry.slot.fulfill(response);
                true
            }
            None => false,
        }
    }

    /// Fail every outstanding request with an internal error carrying its
    /// original id, and clear both maps.
    pub(crate) fn fail_all(&self, message: &str) {
        let mut state = self.lock();
        let entries: Vec<PendingEntry> = state.pending.drain().map(|(_, e)| e).collect();
        state.deadlines.clear();
        drop(state);
        for entry in entries {
            entry.slot.fulfill(Response::internal_error(entry.id, message));
        }
        self.cv.notify_all();
    }

    /// Wake the timer thread (shutdown, new deadline). Takes the lock
    /// first so the timer cannot miss the wakeup between its connected
    /// check and its wait.
    pub(crate) fn notify(&self) {
        drop(self.lock());
        self.cv.notify_all();
    }

    /// Number of outstanding requests.
    pub(crate) fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    /// Body of the timer thread: sleep until the earliest deadline and
    /// expire due requests with `"Request timeout"`. Exits once
    /// `connected` goes false and the thread is woken.
    pub(crate) fn run_timeout_loop(&self, connected: &AtomicBool) {
        let mut state = self.lock();
        loop {
            if !connected.load(Ordering::Acquire) {
                break;
            }

            let now = Instant::now();
            let expired: Vec<String> = state
                .deadlines
                .iter()
                .filter_map(|(key, deadline)| match deadline {
                    Some(at) if *at <= now => Some(key.clone()),
                    _ => None,
                })
                .collect();
            for key in &expired {
                state.deadlines.remove(key);
                if let Some(entry) = state.pending.remove(key) {
                    tracing::debug!(id = %entry.id, "request timed out");
                    entry
                        .slot
                        .fulfill(Response::internal_error(entry.id, "Request timeout"));
                }
            }

            let next = state.deadlines.values().filter_map(|d| *d).min();
            state = match next {
                // Nothing scheduled: sleep until an insert or shutdown.
                None => self.wait(state),
                Some(at) => {
                    let now = Instant::now();
                    if at <= now {
                        continue;
                    }
                    self.wait_timeout(state, at - now)
                }
            };
        }
    }

    fn lock(&self) -> MutexGuard<'_, TableState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, TableState>) -> MutexGuard<'a, TableState> {
        match self.cv.wait(guard) {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn wait_timeout<'a>(
        &self,
        guard: MutexGuard<'a, TableState>,
        timeout: Duration,
    ) -> MutexGuard<'a, TableState> {
        match self.cv.wait_timeout(guard, timeout) {
            Ok((guard, _)) => guard,
            Err(poisoned) => poisoned.into_inner().0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_slot_roundtrip() {
        let (sender, slot) = response_slot();
        sender.fulfill(Response::success(RequestId::from(1), "ok".into()));
        let response = slot.recv();
        assert_eq!(response.id, RequestId::Num(1));
        assert!(!response.is_error());
    }

    #[test]
    fn test_ready_slot_resolves_immediately() {
        let slot = ready_slot(Response::internal_error(
            RequestId::from("x"),
            "Transport not connected",
        ));
        let response = slot.recv_timeout(Duration::from_millis(1)).unwrap();
        assert_eq!(response.error.unwrap().message, "Transport not connected");
    }

    #[test]
    fn test_complete_fulfills_and_clears() {
        let table = PendingTable::new();
        let (sender, slot) = response_slot();
        table.insert("7".into(), RequestId::from(7), sender, None);
        assert_eq!(table.pending_count(), 1);

        let wire = Response::success(RequestId::from(7), "pong".into());
        assert!(table.complete("7", wire));
        assert_eq!(table.pending_count(), 0);
        assert!(!table.complete("7", Response::success(RequestId::from(7), "again".into())));

        assert_eq!(slot.recv().result.unwrap(), "pong");
    }

    #[test]
    fn test_fail_all_uses_original_id() {
        let table = PendingTable::new();
        let (sender_a, slot_a) = response_slot();
        let (sender_b, slot_b) = response_slot();
        table.insert("5".into(), RequestId::from(5), sender_a, None);
        table.insert("req-2".into(), RequestId::from("req-2"), sender_b, None);

        table.fail_all("Transport closed");
        assert_eq!(table.pending_count(), 0);

        let a = slot_a.recv();
        assert_eq!(a.id, RequestId::Num(5));
        assert_eq!(a.error.unwrap().message, "Transport closed");
        let b = slot_b.recv();
        assert_eq!(b.id, RequestId::Str("req-2".into()));
        assert_eq!(b.error.unwrap().message, "Transport closed");
    }

    #[test]
    fn test_timeout_loop_expires_due_requests() {
        let table = Arc::new(PendingTable::new());
        let connected = Arc::new(AtomicBool::new(true));

        let timer = {
            let table = table.clone();
            let connected = connected.clone();
            thread::spawn(move || table.run_timeout_loop(&connected))
        };

        let (sender, slot) = response_slot();
        table.insert(
            "1".into(),
            RequestId::from(1),
            sender,
            Some(Instant::now() + Duration::from_millis(30)),
        );

        let response = slot.recv_timeout(Duration::from_millis(500)).unwrap();
        assert_eq!(response.id, RequestId::Num(1));
        assert_eq!(response.error.unwrap().message, "Request timeout");
        assert_eq!(table.pending_count(), 0);

        connected.store(false, Ordering::Release);
        table.notify();
        timer.join().unwrap();
    }

    #[test]
    fn test_timeout_loop_ignores_disabled_deadlines() {
        let table = Arc::new(PendingTable::new());
        let connected = Arc::new(AtomicBool::new(true));

        let timer = {
            let table = table.clone();
            let connected = connected.clone();
            thread::spawn(move || table.run_timeout_loop(&connected))
        };

        let (sender, slot) = response_slot();
        table.insert("1".into(), RequestId::from(1), sender, None);

        // No deadline: nothing may resolve on its own.
        assert!(slot.recv_timeout(Duration::from_millis(100)).is_none());
        assert_eq!(table.pending_count(), 1);

        connected.store(false, Ordering::Release);
        table.notify();
        timer.join().unwrap();
        table.fail_all("Transport closed");
    }

    #[test]
    fn test_response_beats_deadline() {
        let table = Arc::new(PendingTable::new());
        let connected = Arc::new(AtomicBool::new(true));

        let timer = {
            let table = table.clone();
            let connected = connected.clone();
            thread::spawn(move || table.run_timeout_loop(&connected))
        };

        let (sender, slot) = response_slot();
        table.insert(
            "1".into(),
            RequestId::from(1),
            sender,
            Some(Instant::now() + Duration::from_millis(200)),
        );
        assert!(table.complete("1", Response::success(RequestId::from(1), "fast".into())));

        let response = slot.recv_timeout(Duration::from_millis(100)).unwrap();
        assert!(!response.is_error());

        connected.store(false, Ordering::Release);
        table.notify();
        timer.join().unwrap();
    }
}
