//! Conversation session: turn-taking, voice coordination and published state.

pub mod controller;
pub mod messages;

pub use controller::{ONBOARDING_COMPLETE_MESSAGE, SessionController, SessionServices};
pub use messages::{CaptionState, InteractionMode, Preview, SessionSnapshot};
