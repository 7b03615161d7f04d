//! Messages and their envelopes

use super::MsgPort;
use crate::task::TaskId;
use std::any::Any;
use std::fmt;
use std::ops::{BitOr, Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_MSG_ID: AtomicU64 = AtomicU64::new(1);

/// Unique message identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MsgId(u64);

impl MsgId {
    fn new() -> Self {
        Self(NEXT_MSG_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Numeric value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

/// Delivery flags of a message
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct MsgFlags(u32);

impl MsgFlags {
    /// Not in flight
    pub const NONE: Self = Self(0);
    /// Handed to a port
    pub const SENT: Self = Self(1);
    /// Came back to the sender
    pub const RETURNED: Self = Self(2);
    /// Payload changed by the receiver
    pub const MODIFIED: Self = Self(4);
    /// Currently in a port queue
    pub const QUEUED: Self = Self(8);

    /// Raw bits
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Whether all bits of `other` are set
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Same flags without `other`'s bits
    pub const fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }
}

impl BitOr for MsgFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for MsgFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MsgFlags({:#x})", self.0)
    }
}

/// Outcome carried by a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgStatus {
    /// Dropped by the receiver
    Failed,
    /// Still in flight
    Sent,
    /// Returned unmodified
    Acked,
    /// Returned, payload possibly modified
    Replied,
}

impl MsgStatus {
    /// Flags a message carries once returned with this status
    pub fn flags(self) -> MsgFlags {
        match self {
            MsgStatus::Failed => MsgFlags::NONE,
            MsgStatus::Sent => MsgFlags::SENT,
            MsgStatus::Acked => MsgFlags::SENT | MsgFlags::RETURNED,
            MsgStatus::Replied => MsgFlags::SENT | MsgFlags::RETURNED | MsgFlags::MODIFIED,
        }
    }

    /// Status encoded by `flags`, ignoring the queued bit
    pub fn from_flags(flags: MsgFlags) -> Self {
        let flags = flags.without(MsgFlags::QUEUED);
        if flags.contains(MsgStatus::Replied.flags()) {
            MsgStatus::Replied
        } else if flags.contains(MsgStatus::Acked.flags()) {
            MsgStatus::Acked
        } else if flags.contains(MsgFlags::SENT) {
            MsgStatus::Sent
        } else {
            MsgStatus::Failed
        }
    }
}

/// A message body with its delivery header
pub struct Envelope<T: ?Sized = dyn Any + Send> {
    id: MsgId,
    pub(crate) flags: MsgFlags,
    pub(crate) reply_port: Option<Arc<MsgPort>>,
    pub(crate) sender: Option<TaskId>,
    /// Payload
    pub body: T,
}

impl<T: Any + Send> Envelope<T> {
    /// Wrap `body` in a fresh envelope
    pub fn new(body: T) -> Box<Self> {
        Box::new(Self {
            id: MsgId::new(),
            flags: MsgFlags::NONE,
            reply_port: None,
            sender: None,
            body,
        })
    }

    /// Unwrap the payload
    pub fn into_body(self: Box<Self>) -> T {
        self.body
    }
}

impl<T: ?Sized> Envelope<T> {
    /// Message identity
    pub fn id(&self) -> MsgId {
        self.id
    }

    /// Current delivery flags
    pub fn flags(&self) -> MsgFlags {
        self.flags
    }

    /// Delivery status
    pub fn status(&self) -> MsgStatus {
        MsgStatus::from_flags(self.flags)
    }

    /// Task that last put the message, if sent from a task
    pub fn sender(&self) -> Option<TaskId> {
        self.sender
    }

    /// Port the message is returned to
    pub fn reply_port(&self) -> Option<&Arc<MsgPort>> {
        self.reply_port.as_ref()
    }

    /// Replace the reply port, returning the old one
    pub fn set_reply_port(&mut self, port: Option<Arc<MsgPort>>) -> Option<Arc<MsgPort>> {
        std::mem::replace(&mut self.reply_port, port)
    }

    /// Whether the message is out with a receiver
    pub(crate) fn in_flight(&self) -> bool {
        self.flags.without(MsgFlags::QUEUED) == MsgFlags::SENT
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for Envelope<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope")
            .field("id", &self.id)
            .field("flags", &self.flags)
            .field("sender", &self.sender)
            .field("body", &&self.body)
            .finish()
    }
}

/// A message of any payload type, as it travels through ports
pub struct Message(Box<Envelope>);

impl Message {
    /// Recover the typed envelope, or get the message back if the type differs
    pub fn downcast<T: Any + Send>(self) -> Result<Box<Envelope<T>>, Message> {
        if self.0.body.is::<T>() {
            let raw: *mut Envelope = Box::into_raw(self.0);
            // SAFETY: the payload is a `T`, so the allocation is an
            // `Envelope<T>` that was unsized into `Envelope<dyn Any + Send>`.
            Ok(unsafe { Box::from_raw(raw as *mut Envelope<T>) })
        } else {
            Err(self)
        }
    }

    /// Whether the payload is a `T`
    pub fn is<T: Any + Send>(&self) -> bool {
        self.0.body.is::<T>()
    }
}

impl<T: Any + Send> From<Box<Envelope<T>>> for Message {
    fn from(envelope: Box<Envelope<T>>) -> Self {
        Message(envelope)
    }
}

impl Deref for Message {
    type Target = Envelope;

    fn deref(&self) -> &Envelope {
        &self.0
    }
}

impl DerefMut for Message {
    fn deref_mut(&mut self) -> &mut Envelope {
        &mut self.0
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("id", &self.0.id)
            .field("flags", &self.0.flags)
            .field("sender", &self.0.sender)
            .finish()
    }
}
