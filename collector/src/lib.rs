#[macro_use]
extern crate log;

pub mod server;
pub mod session;
pub mod store;
pub mod util;

pub use crate::session::{client_loop, CollectorConfig, SessionSummary};
pub use crate::server::serve;
pub use crate::store::{ExecFile, ProjectStore, Store};
pub use crate::util::{on_ctrlc, Sigint};
