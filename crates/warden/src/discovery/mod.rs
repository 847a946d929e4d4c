//! Domain discovery from container routing labels

pub mod docker;
pub mod rules;
pub mod watcher;

pub use docker::{ContainerEvent, DockerEventFeed, EventFeed, FeedError};
pub use rules::{hosts_in_labels, hosts_in_rule};
pub use watcher::{DiscoveryWatcher, WatchError};
