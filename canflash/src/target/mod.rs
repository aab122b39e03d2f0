//! Target controllers and flash programming.

pub mod profile;
pub mod programmer;

pub use profile::ControllerProfile;
pub use programmer::{PageBuffer, PageProgrammer, layout_pages};
