//! filemesh client session
//!
//! A [`SessionManager`] walks the discovered nodes as if they were the top
//! level of one file tree: `cd n1/docs` selects node `n1` and the `docs`
//! directory inside its storage. [`CommandInterpreter`] turns the
//! `show`/`cd`/`ls`/`get` command lines into calls on the session.

pub mod command;
pub mod error;
pub mod format;
pub mod session;

pub use command::{Command, CommandInterpreter};
pub use error::{Result, SessionError};
pub use format::{format_file_size, format_listing, format_nodes};
pub use session::{Download, SessionConfig, SessionManager};
