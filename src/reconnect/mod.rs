mod engine;
mod policy;

pub use engine::*;
pub use policy::*;
