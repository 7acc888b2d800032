//! Engine for an autonomous document-cataloging agent: the poller, the
//! object resolver, the per-document task lifecycle, the paginated walker,
//! the patch builder, fact extraction, the updater, the cataloging
//! workflow and the store pruner.

pub mod client;
pub mod facter;
pub mod facts_extract;
pub mod patchbuilder;
pub mod poller;
pub mod resolver;
pub mod storepruner;
pub mod task;
pub mod updater;
pub mod walker;
pub mod workflow;

pub use cataloger_core::*;
