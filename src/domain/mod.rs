pub mod message;
pub mod room;
pub mod round;

pub use message::*;
pub use room::*;
pub use round::*;
