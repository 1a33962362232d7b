pub mod distribution;
pub mod stage;
pub mod sweep;
pub mod trial;
pub mod errors;

pub use distribution::*;
pub use stage::*;
pub use sweep::*;
pub use trial::*;
pub use errors::*;
