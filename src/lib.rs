mod config;
mod error;
mod fixed;
mod meta;
mod node;
mod pager;
mod tree;

pub use config::{Config, PageId, INITIAL_PAGE_COUNT, MAGIC, META_PID, PAGE_SIZE, VERSION};
pub use error::{Error, Result};
pub use fixed::{FixedBytes, FixedSized};
pub use pager::Pager;
pub use tree::Tree;
