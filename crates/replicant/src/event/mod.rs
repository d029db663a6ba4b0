mod subscribers;
mod types;

pub use subscribers::{HandlerError, HandlerResult, SubscriptionId, Subscribers};
pub use types::SessionEvent;
