mod bindings;
mod filesystem;
mod system;

pub(crate) use bindings::*;
pub(crate) use filesystem::*;
pub use system::SystemTopology;
