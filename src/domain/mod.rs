pub mod order;
pub mod position;
pub mod signal;

pub use order::*;
pub use position::*;
pub use signal::*;
