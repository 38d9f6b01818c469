//! Voice session lifecycle.

pub mod controller;
pub mod events;
pub mod state;

pub use controller::SessionController;
pub use events::SessionEvent;
pub use state::{labels, SessionState, SessionStateCell};
