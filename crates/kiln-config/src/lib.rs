pub mod block;
pub mod core_build;
pub mod datasource;
pub mod duration;
pub mod error;
pub mod eval;
pub mod filter;
pub mod handler;
pub mod legacy;
pub mod plan;
pub mod policy;
pub mod suggest;
pub mod template;
pub mod variables;

pub use block::*;
pub use core_build::*;
pub use datasource::*;
pub use duration::*;
pub use error::*;
pub use eval::*;
pub use filter::*;
pub use handler::*;
pub use legacy::*;
pub use plan::*;
pub use policy::*;
pub use suggest::*;
pub use template::*;
pub use variables::*;
