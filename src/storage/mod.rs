//! Storage seams: the transactional bucketed backend, its on-disk schema,
//! pre-commit hooks, and the raft-side persistent storage (log save +
//! snapshot files).

mod backend;
mod hooks;
mod persist;
pub mod schema;

pub use self::backend::live_db_path;
pub use self::backend::BatchTx;
pub use self::backend::Backend;
pub use self::backend::Bucket;
pub use self::backend::Hooks;
pub use self::backend::ReadTx;
pub use self::backend::TxReader;
pub use self::hooks::BackendHooks;
pub use self::persist::FileStorage;
pub use self::persist::PersistentStorage;
