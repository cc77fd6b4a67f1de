pub mod blob;
pub mod callback;
pub mod queue;

pub use blob::*;
pub use callback::*;
pub use queue::*;
