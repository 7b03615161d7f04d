//! Message ports

use super::message::{Envelope, Message, MsgFlags, MsgId, MsgStatus};
use crate::signal::TaskSignals;
use crate::task::{current_id, TaskId};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

/// Notification hook, run under the port lock whenever a message arrives
pub type PortHook = Arc<dyn Fn(&Envelope) + Send + Sync>;

struct PortQueue {
    messages: VecDeque<Message>,
    hook: Option<PortHook>,
}

/// FIFO of messages owned by one task
///
/// Arrivals signal the owning task with the port's signal bit. Only the
/// owner waits on a port; any task may put to it.
pub struct MsgPort {
    queue: Mutex<PortQueue>,
    signal: u32,
    owner: Arc<TaskSignals>,
    owns_signal: bool,
}

impl MsgPort {
    /// Port signalling `signal` on `owner`; an owned signal is freed with the port
    pub(crate) fn new(owner: Arc<TaskSignals>, signal: u32, owns_signal: bool) -> Self {
        Self {
            queue: Mutex::new(PortQueue {
                messages: VecDeque::new(),
                hook: None,
            }),
            signal,
            owner,
            owns_signal,
        }
    }

    /// Signal bit raised on message arrival
    pub fn signal(&self) -> u32 {
        self.signal
    }

    /// Task that owns the port
    pub fn owner(&self) -> TaskId {
        self.owner.task()
    }

    /// Number of queued messages
    pub fn len(&self) -> usize {
        self.queue.lock().messages.len()
    }

    /// Whether no message is queued
    pub fn is_empty(&self) -> bool {
        self.queue.lock().messages.is_empty()
    }

    /// Install a notification hook, returning the previous one
    pub fn set_hook(&self, hook: Option<PortHook>) -> Option<PortHook> {
        std::mem::replace(&mut self.queue.lock().hook, hook)
    }

    /// Send a message, to be returned to `reply` (one-way if `None`)
    pub fn put(&self, reply: Option<Arc<MsgPort>>, msg: impl Into<Message>) {
        let mut msg = msg.into();
        msg.reply_port = reply;
        msg.sender = current_id();
        msg.flags = MsgFlags::SENT | MsgFlags::QUEUED;
        tracing::trace!(msg = msg.id().as_u64(), "put message");
        self.enqueue(msg);
    }

    /// Append, notify the hook, then signal the owner
    pub(crate) fn enqueue(&self, msg: Message) {
        {
            let mut guard = self.queue.lock();
            let queue = &mut *guard;
            queue.messages.push_back(msg);
            if let (Some(hook), Some(msg)) = (&queue.hook, queue.messages.back()) {
                hook(msg);
            }
        }
        self.owner.signal(self.signal);
    }

    /// Insert a message after `after` (at the head if `None`) with the given status
    ///
    /// A predecessor that is no longer queued puts the message at the tail.
    pub fn insert(&self, msg: impl Into<Message>, after: Option<MsgId>, status: MsgStatus) {
        let mut msg = msg.into();
        msg.flags = status.flags() | MsgFlags::QUEUED;
        {
            let mut guard = self.queue.lock();
            let queue = &mut *guard;
            let index = match after {
                None => 0,
                Some(id) => match queue.messages.iter().position(|m| m.id() == id) {
                    Some(pos) => pos + 1,
                    None => {
                        tracing::warn!(after = id.as_u64(), "insert after a message that is not queued");
                        queue.messages.len()
                    }
                },
            };
            queue.messages.insert(index, msg);
            if let (Some(hook), Some(msg)) = (&queue.hook, queue.messages.get(index)) {
                hook(msg);
            }
        }
        self.owner.signal(self.signal);
    }

    /// Take the next message, if any
    pub fn get(&self) -> Option<Message> {
        let mut msg = self.queue.lock().messages.pop_front()?;
        Self::unqueue(&mut msg);
        Some(msg)
    }

    /// Take a specific message out of the queue
    pub fn remove(&self, id: MsgId) -> Option<Message> {
        let mut msg = {
            let mut queue = self.queue.lock();
            let index = queue.messages.iter().position(|m| m.id() == id)?;
            queue.messages.remove(index)?
        };
        Self::unqueue(&mut msg);
        Some(msg)
    }

    fn unqueue(msg: &mut Message) {
        if !msg.flags.contains(MsgFlags::QUEUED) {
            tracing::error!(msg = msg.id().as_u64(), "message in port without queued flag");
            debug_assert!(false, "message in port without queued flag");
        }
        msg.flags = msg.flags.without(MsgFlags::QUEUED);
    }

    /// Identity of the head message, if any
    pub fn peek(&self) -> Option<MsgId> {
        self.queue.lock().messages.front().map(|m| m.id())
    }

    /// Whether message `id` is queued here
    pub fn contains(&self, id: MsgId) -> bool {
        self.queue.lock().messages.iter().any(|m| m.id() == id)
    }

    /// Block the owner until a message is queued and return its identity
    ///
    /// The message stays in the queue. Must be called by the owning task.
    pub fn wait(&self) -> MsgId {
        loop {
            if let Some(id) = self.peek() {
                return id;
            }
            self.owner.event().wait(self.signal);
        }
    }
}

impl Drop for MsgPort {
    fn drop(&mut self) {
        let pending = self.queue.get_mut().messages.len();
        if pending > 0 {
            tracing::warn!(pending, "message queue was not empty");
        }
        if self.owns_signal {
            self.owner.release(self.signal);
        }
    }
}

impl fmt::Debug for MsgPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MsgPort")
            .field("owner", &self.owner.task())
            .field("signal", &self.signal)
            .field("queued", &self.len())
            .finish()
    }
}

fn return_msg(mut msg: Message, status: MsgStatus) {
    if !msg.in_flight() {
        tracing::error!(msg = msg.id().as_u64(), flags = msg.flags.bits(), "returning a message that is not in flight");
        debug_assert!(false, "returning a message that is not in flight");
        return;
    }
    // a returned message no longer points back at the port holding it
    match msg.reply_port.take() {
        Some(port) => {
            msg.flags = status.flags() | MsgFlags::QUEUED;
            port.enqueue(msg);
        }
        None => {
            tracing::trace!(msg = msg.id().as_u64(), "one-way message released");
        }
    }
}

/// Return a message to its sender as replied
///
/// One-way messages are released instead.
pub fn reply_msg(msg: impl Into<Message>) {
    return_msg(msg.into(), MsgStatus::Replied);
}

/// Return a message to its sender as acknowledged
pub fn ack_msg(msg: impl Into<Message>) {
    return_msg(msg.into(), MsgStatus::Acked);
}

/// Return a message to its sender as failed
pub fn drop_msg(msg: impl Into<Message>) {
    return_msg(msg.into(), MsgStatus::Failed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn port() -> (Arc<TaskSignals>, Arc<MsgPort>) {
        let signals = Arc::new(TaskSignals::new(TaskId::new()));
        let port = Arc::new(MsgPort::new(signals.clone(), crate::signal::SIG_USER, false));
        (signals, port)
    }

    #[test]
    fn test_fifo_order() {
        let (signals, port) = port();
        for i in 0..3u32 {
            port.put(None, Envelope::new(i));
        }
        assert_eq!(signals.event().pending(), crate::signal::SIG_USER);
        for i in 0..3u32 {
            let msg = port.get().unwrap().downcast::<u32>().unwrap();
            assert_eq!(msg.body, i);
            assert_eq!(msg.status(), MsgStatus::Sent);
        }
        assert!(port.get().is_none());
    }

    #[test]
    fn test_hook_sees_message_before_signal() {
        let (signals, port) = port();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let observer = signals.clone();
        port.set_hook(Some(Arc::new(move |msg: &Envelope| {
            assert!(msg.flags().contains(MsgFlags::QUEUED));
            assert_eq!(observer.event().pending(), 0);
            counter.fetch_add(1, Ordering::SeqCst);
        })));
        port.put(None, Envelope::new("ping"));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(signals.event().pending(), crate::signal::SIG_USER);
    }

    #[test]
    fn test_reply_returns_to_reply_port() {
        let (_, reply) = port();
        let (_, port) = port();
        port.put(Some(reply.clone()), Envelope::new(1u8));
        let msg = port.get().unwrap();
        let id = msg.id();
        reply_msg(msg);
        let back = reply.remove(id).unwrap();
        assert_eq!(back.status(), MsgStatus::Replied);

        port.put(Some(reply.clone()), Envelope::new(2u8));
        ack_msg(port.get().unwrap());
        assert_eq!(reply.get().unwrap().status(), MsgStatus::Acked);

        port.put(Some(reply.clone()), Envelope::new(3u8));
        drop_msg(port.get().unwrap());
        assert_eq!(reply.get().unwrap().status(), MsgStatus::Failed);
    }

    #[test]
    fn test_one_way_reply_releases() {
        let (_, port) = port();
        port.put(None, Envelope::new(vec![1u8, 2, 3]));
        reply_msg(port.get().unwrap());
        assert!(port.is_empty());
    }

    #[test]
    fn test_insert_and_remove() {
        let (_, port) = port();
        let a = Envelope::new('a');
        let a_id = a.id();
        port.put(None, a);
        port.put(None, Envelope::new('c'));
        port.insert(Envelope::new('b'), Some(a_id), MsgStatus::Sent);
        port.insert(Envelope::new('0'), None, MsgStatus::Sent);

        let order: Vec<char> = std::iter::from_fn(|| port.get())
            .map(|m| m.downcast::<char>().unwrap().body)
            .collect();
        assert_eq!(order, vec!['0', 'a', 'b', 'c']);
    }

    #[test]
    fn test_remove_by_id_leaves_others() {
        let (_, port) = port();
        let first = Envelope::new(1);
        let second = Envelope::new(2);
        let wanted = second.id();
        port.put(None, first);
        port.put(None, second);
        assert!(port.remove(wanted).is_some());
        assert_eq!(port.len(), 1);
        assert!(port.remove(wanted).is_none());
    }

    #[test]
    fn test_owned_signal_released_on_drop() {
        let signals = Arc::new(TaskSignals::new(TaskId::new()));
        let bit = signals.alloc(0).unwrap();
        let port = MsgPort::new(signals.clone(), bit, true);
        assert_ne!(signals.used() & bit, 0);
        drop(port);
        assert_eq!(signals.used() & bit, 0);
    }

    #[test]
    fn test_wait_returns_head() {
        let (_, port) = port();
        let msg = Envelope::new(7);
        let id = msg.id();
        port.put(None, msg);
        assert_eq!(port.wait(), id);
        assert_eq!(port.len(), 1);
    }
}
