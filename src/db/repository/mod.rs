pub mod audit;
pub mod entity;
pub mod visit;

pub use audit::*;
pub use entity::*;
pub use visit::*;
