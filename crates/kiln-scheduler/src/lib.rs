pub mod diagnostics;
pub mod executor;
pub mod options;
pub mod registry;
pub mod scheduler;
pub mod settings;

pub use diagnostics::*;
pub use executor::*;
pub use options::*;
pub use registry::*;
pub use scheduler::*;
pub use settings::*;
