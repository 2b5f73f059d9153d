//! Pooled, authenticated share access for the crawler.
//!
//! Sessions are expensive, so they live in a [`KeyedPool`] partitioned by
//! [`SessionKey`](sharecrawl_core::SessionKey). File handles and SID
//! resolvers reach them through a [`SessionLoader`], which returns a session
//! after successful use and invalidates it after any failure.

pub mod ace;
pub mod client;
pub mod content;
pub mod error;
pub mod factory;
pub mod file;
pub mod interrupt;
pub mod loader;
pub mod loopback;
pub mod mime;
pub mod pool;
pub mod protocol;
pub mod session;
pub mod sid;

pub use ace::Ace;
pub use client::{CrawlResult, Method, OwnerAttributes, ResponseData, SmbClient};
pub use content::{ContentStream, ResponseBody};
pub use error::{Error, Result};
pub use factory::{SessionPool, SmbSessionFactory};
pub use file::{FileSnapshot, SmbFile};
pub use interrupt::Interrupt;
pub use loader::{BorrowedSession, SessionLoader};
pub use loopback::{LoopbackConnector, LoopbackServer, LoopbackStats};
pub use pool::{KeyedPool, PoolStats, PooledObjectFactory};
pub use protocol::{Connector, ProtocolError};
pub use session::{PooledSession, SharedSession};
pub use sid::{SecurityIdentifier, SidType};
