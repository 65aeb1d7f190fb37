pub mod config;
pub mod error;
pub mod extract;
pub mod guard;
pub mod image;
pub mod janitor;
pub mod mounts;
pub mod pool;
pub mod repo;
pub mod runner;
pub mod source;
pub mod version;

pub use config::UpdateConfig;
pub use error::UpdateError;
pub use pool::UpdatePool;
pub use source::UpdateSource;
