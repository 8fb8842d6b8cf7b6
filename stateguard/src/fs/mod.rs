//! File system helpers: artifact archives and recursive file listing.

pub mod archive;
pub mod walker;
