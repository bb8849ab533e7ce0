pub mod itf8;
pub mod codec;
pub mod block;
pub mod container;
pub mod crypto;
pub mod iterator;

pub use codec::{CompressionMethod, get_codec};
pub use block::{Block, BlockError, ContentType};
pub use container::{Container, ContainerError, read_container, SENSITIVE_BLOCK_CONTENT_ID};
pub use crypto::{FilterConfig, KeyedFilter, SecurityFilter};
pub use iterator::{ContainerIterator, IterError, IterTimings};
