//! Core SMTP types.

mod address;
mod extension;
mod reply;

pub use address::{Address, Mailbox};
pub use extension::{AuthMechanism, ExtensionMap};
pub use reply::{Reply, ReplyCode};
