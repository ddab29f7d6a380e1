pub mod config;
pub mod engine;
pub mod error;
pub mod git;
pub mod governance;
pub mod graph;
pub mod history;
pub mod hook;
pub mod io;
pub mod issue;
pub mod lock;
pub mod paths;
pub mod process;
pub mod query;
pub mod store;
pub mod types;
pub mod verify;
pub mod workflow;

pub use config::Config;
pub use engine::{CancelToken, Engine};
pub use error::{Result, TrellisError};
pub use issue::Issue;
pub use types::{Action, RelationKind, Stage, Status};
