mod admission;
mod completion;

pub use admission::*;
pub use completion::*;
