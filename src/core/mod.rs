/// Core building blocks shared by client sessions and the backend pool:
/// socket helpers, the two handshakes and the session supervisor.
pub mod backend;
pub mod connection;
pub mod frontend;
pub mod session;

pub use frontend::Credentials;
pub use session::{SessionEntry, SessionId, SessionState, SessionTable, SessionTicket};
