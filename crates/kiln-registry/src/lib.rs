pub mod bucket;
pub mod build;
pub mod env;
pub mod error;
pub mod fingerprint;
pub mod memory;
pub mod registry;
pub mod service;
pub mod version;

pub use bucket::*;
pub use build::*;
pub use env::*;
pub use error::*;
pub use fingerprint::*;
pub use memory::*;
pub use registry::*;
pub use service::*;
pub use version::*;
