//! Message ports and IPC
//!
//! A message travels as a boxed [`Envelope`]. Putting it to a port hands
//! ownership to the port; getting it hands ownership to the receiver, who
//! returns it to the reply port with [`reply_msg`], [`ack_msg`] or
//! [`drop_msg`]. Messages without a reply port are released on return.

mod message;
#[allow(clippy::module_inception)]
mod port;

pub use message::{Envelope, Message, MsgFlags, MsgId, MsgStatus};
pub use port::{ack_msg, drop_msg, reply_msg, MsgPort, PortHook};
