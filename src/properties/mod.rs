//! Publish/subscribe broadcast of named device properties.
//!
//! Property names are dotted paths such as `scope.stage.x`. A
//! [`PropertyServer`] keeps the latest value of each and streams updates to
//! every [`PropertyClient`]; clients subscribe to exact names or to prefixes.

pub mod client;
pub mod server;
pub mod trie;

pub use client::{PropertyClient, SubscriptionId};
pub use server::{PropertyDevice, PropertyServer, PropertyUpdater};
pub use trie::PrefixTrie;
