pub mod collaborators;
pub mod db;
pub mod file_cache;

pub use collaborators::{MirroredAccessLog, MirroredUserRegistry};
pub use db::PgDocumentStore;
pub use file_cache::FileCacheStore;
