pub mod envelope;
pub mod errors;
pub mod model;
pub mod pipeline;
pub mod query;
pub mod util;

pub use envelope::*;
pub use errors::*;
pub use model::*;
pub use pipeline::*;
pub use query::*;
pub use util::slugify;
