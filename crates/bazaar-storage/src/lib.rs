pub mod mem;
pub mod snapshot;
pub mod traits;

pub use mem::InMemoryStore;
pub use traits::*;
