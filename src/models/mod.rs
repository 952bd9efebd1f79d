//! Data models for strands, frames and pages.

mod frame;
mod page;
mod strand;

pub use frame::{Frame, FrameLink};
pub use page::Page;
pub use strand::{NewStrand, Strand, START_LABEL};
