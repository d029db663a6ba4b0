mod calls;
mod config;
mod outbound;
mod player;
#[allow(clippy::module_inception)]
mod session;

pub use config::SessionConfig;
pub use outbound::{Outbound, Outbox, Route};
pub use player::Player;
pub use session::{Mode, Session, SessionError};
