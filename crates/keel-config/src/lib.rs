mod error;
mod path;
mod persist;
pub mod services;
mod tree;

pub use error::ConfigTreeError;
pub use path::TopicPath;
pub use persist::{write_atomically, TreeStore};
pub use tree::{ChangeEvent, ChangeHandler, ConfigTree, NodeView, SubscriptionId, TopicNode};
