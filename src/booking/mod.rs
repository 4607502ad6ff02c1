//! Appointment booking: a pure dialogue machine (`machine`) and the shell
//! that feeds it catalog data and commits reservations (`desk`).

pub mod desk;
pub mod machine;

pub use desk::{BookingDesk, Clock};
pub use machine::{BookingEvent, BookingReply, BookingStep, DialogueState};
