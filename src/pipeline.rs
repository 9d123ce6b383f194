use std::collections::VecDeque;
use std::sync::Arc;
use tracing::debug;

use crate::buffer::SharedBuffer;
use crate::command::Command;
use crate::error::Error;

/// Anything that waits for a backend reply: a client session, or the upstream's own
/// authentication step.
pub trait Waiter: Send + Sync {
    /// The identity the waiter carries right now. Pooled sessions get a new identity each time
    /// they are reused.
    fn identity(&self) -> u64;

    /// Hands a reply over.
    fn on_reply(&self, reply: SharedBuffer);

    /// Delivers `reply` if the waiter still carries `identity`. Returns `false` when the reply
    /// belongs to an earlier incarnation and was dropped.
    fn deliver(&self, identity: u64, reply: SharedBuffer) -> bool {
        if self.identity() != identity {
            return false;
        }

        self.on_reply(reply);
        true
    }
}

/// A request forwarded upstream whose reply has not arrived yet.
pub struct Pending {
    identity: u64,
    waiter: Arc<dyn Waiter>,
}

impl Pending {
    pub fn identity(&self) -> u64 {
        self.identity
    }

    /// Routes the reply to the waiter recorded at submission time.
    pub fn dispatch(self, reply: SharedBuffer) -> bool {
        self.waiter.deliver(self.identity, reply)
    }
}

/// In-order queue of requests written to the backend and still waiting for their reply.
///
/// Redis answers a connection's requests in the order it received them, so the head of the queue
/// always owns the next reply read from the backend.
pub struct Pipeline {
    entries: VecDeque<Pending>,
    capacity: usize,
}

impl Pipeline {
    pub fn with_capacity(capacity: usize) -> Pipeline {
        Pipeline {
            entries: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    /// Encodes `cmd` onto `outbound` and records `waiter` as the owner of its reply.
    ///
    /// Returns [`Error::Full`] without touching `outbound` when no slot is free.
    pub fn push(
        &mut self,
        cmd: &Command,
        waiter: Arc<dyn Waiter>,
        outbound: &mut SharedBuffer,
    ) -> Result<(), Error> {
        if self.is_full() {
            return Err(Error::Full);
        }

        cmd.format_resp2(outbound)?;

        let identity = waiter.identity();
        self.entries.push_back(Pending { identity, waiter });

        Ok(())
    }

    /// Removes the oldest pending request. [`Error::Empty`] means a reply showed up that no
    /// request accounts for.
    pub fn pop(&mut self) -> Result<Pending, Error> {
        self.entries.pop_front().ok_or(Error::Empty)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    /// Drops every pending request. Used when the backend connection is lost, since their replies
    /// will never come.
    pub fn abandon(&mut self) -> usize {
        let abandoned = self.entries.len();
        if abandoned > 0 {
            debug!(abandoned, "abandoning pending requests");
        }

        self.entries.clear();
        abandoned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        identity: AtomicU64,
        replies: Mutex<Vec<SharedBuffer>>,
    }

    impl Recorder {
        fn with_identity(identity: u64) -> Arc<Recorder> {
            let recorder = Recorder::default();
            recorder.identity.store(identity, Ordering::SeqCst);
            Arc::new(recorder)
        }

        fn replies(&self) -> Vec<SharedBuffer> {
            self.replies.lock().unwrap().clone()
        }
    }

    impl Waiter for Recorder {
        fn identity(&self) -> u64 {
            self.identity.load(Ordering::SeqCst)
        }

        fn on_reply(&self, reply: SharedBuffer) {
            self.replies.lock().unwrap().push(reply);
        }
    }

    #[test]
    fn replies_are_routed_in_submission_order() {
        let first = Recorder::with_identity(1);
        let second = Recorder::with_identity(2);
        let mut pipeline = Pipeline::with_capacity(10);
        let mut outbound = SharedBuffer::new();

        pipeline
            .push(&Command::from_iter(["GET", "a"]), first.clone(), &mut outbound)
            .unwrap();
        pipeline
            .push(&Command::from_iter(["GET", "b"]), second.clone(), &mut outbound)
            .unwrap();
        pipeline
            .push(&Command::from_iter(["GET", "c"]), first.clone(), &mut outbound)
            .unwrap();

        assert_eq!(
            outbound,
            "*2\r\n$3\r\nGET\r\n$1\r\na\r\n*2\r\n$3\r\nGET\r\n$1\r\nb\r\n*2\r\n$3\r\nGET\r\n$1\r\nc\r\n"
        );
        assert_eq!(pipeline.len(), 3);

        for reply in ["$1\r\nA\r\n", "$1\r\nB\r\n", "$1\r\nC\r\n"] {
            assert!(pipeline.pop().unwrap().dispatch(SharedBuffer::from(reply)));
        }

        assert_eq!(
            first.replies(),
            vec![
                SharedBuffer::from("$1\r\nA\r\n"),
                SharedBuffer::from("$1\r\nC\r\n"),
            ]
        );
        assert_eq!(second.replies(), vec![SharedBuffer::from("$1\r\nB\r\n")]);
        assert!(matches!(pipeline.pop(), Err(Error::Empty)));
    }

    #[test]
    fn reply_for_recycled_waiter_is_dropped() {
        let waiter = Recorder::with_identity(7);
        let mut pipeline = Pipeline::with_capacity(10);
        let mut outbound = SharedBuffer::new();

        pipeline
            .push(&Command::from_iter(["PING"]), waiter.clone(), &mut outbound)
            .unwrap();

        // The session went back to the pool and was handed to a new client.
        waiter.identity.store(8, Ordering::SeqCst);

        let pending = pipeline.pop().unwrap();
        assert_eq!(pending.identity(), 7);
        assert!(!pending.dispatch(SharedBuffer::from("+PONG\r\n")));
        assert!(waiter.replies().is_empty());
    }

    #[test]
    fn push_into_full_pipeline_leaves_outbound_untouched() {
        let waiter = Recorder::with_identity(1);
        let mut pipeline = Pipeline::with_capacity(2);
        let mut outbound = SharedBuffer::new();

        for _ in 0..2 {
            pipeline
                .push(&Command::from_iter(["PING"]), waiter.clone(), &mut outbound)
                .unwrap();
        }
        let written = outbound.len();

        assert!(pipeline.is_full());
        assert!(matches!(
            pipeline.push(&Command::from_iter(["PING"]), waiter.clone(), &mut outbound),
            Err(Error::Full)
        ));
        assert_eq!(outbound.len(), written);

        pipeline.pop().unwrap();
        assert!(!pipeline.is_full());
    }

    #[test]
    fn abandon_clears_pending_requests() {
        let waiter = Recorder::with_identity(1);
        let mut pipeline = Pipeline::with_capacity(4);
        let mut outbound = SharedBuffer::new();

        for _ in 0..3 {
            pipeline
                .push(&Command::from_iter(["PING"]), waiter.clone(), &mut outbound)
                .unwrap();
        }

        assert_eq!(pipeline.abandon(), 3);
        assert!(pipeline.is_empty());
        assert!(matches!(pipeline.pop(), Err(Error::Empty)));
    }
}
