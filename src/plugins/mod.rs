//! Optional features layered on top of the core store.

pub mod attachments;
