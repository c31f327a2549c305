pub mod entity;
pub mod enums;
pub mod proposal;

pub use entity::*;
pub use proposal::*;
