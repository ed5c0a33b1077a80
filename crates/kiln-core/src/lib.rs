pub mod artifact;
pub mod build;
pub mod cancel;
pub mod diag;
pub mod duration;
pub mod ids;
pub mod plugin;
pub mod secrets;
pub mod ui;

pub use artifact::*;
pub use build::*;
pub use cancel::*;
pub use diag::*;
pub use duration::*;
pub use ids::*;
pub use plugin::*;
pub use secrets::*;
pub use ui::*;
