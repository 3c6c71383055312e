//! System tree information shared by the builders.

pub mod identifier;
pub mod result;
pub mod size;

pub use identifier::SystemIdentifier;
pub use result::BuildResult;
pub use size::SystemSize;
