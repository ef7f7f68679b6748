//! Bulk content: descriptors, the download cache, archives and placement.

pub mod archive;
pub mod cache;
pub mod catalog;
pub mod collection;
pub mod descriptor;
pub mod sizing;

pub use archive::{extract_and_move, extract_entry, unarchive};
pub use cache::{download_if_missing, is_cached, FetchStatus, HttpFetcher, ReqwestFetcher, RetryPolicy};
pub use catalog::Catalogs;
pub use collection::{Collection, Selection};
pub use descriptor::{ContentDescriptor, ContentIndex};
