#[allow(clippy::module_inception)]
mod message;
mod registry;

pub use message::{Message, MessageKind};
pub use registry::{MessageCallback, MessageRegistry, RegistryError};
