//! POP3 retrieval service

mod command;
mod response;
mod server;
mod session;

pub use command::{Pop3Command, Pop3Parser};
pub use response::Pop3Response;
pub use server::Pop3Handler;
pub use session::{Pop3Backend, Pop3Session, SessionState};
