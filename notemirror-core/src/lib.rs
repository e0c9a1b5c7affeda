mod client;
mod models;

pub use client::{ApiError, ApiErrorClass, NodeClient};
pub use models::{Block, BlockPage, NodeMetadata, PageSnapshot, normalize_node_id};
