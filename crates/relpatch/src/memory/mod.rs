pub mod layout;
mod backend;
mod system;
mod writer;

#[cfg(test)]
pub mod mock;

pub use backend::{MemoryBackend, Protection};
pub use system::SystemMemory;
pub use writer::ProtectedWriter;

#[cfg(test)]
pub use mock::MockMemory;
