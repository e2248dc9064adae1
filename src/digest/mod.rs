pub mod composer;
pub mod format;

pub use composer::{compose_confirmed, compose_fast, Composition, DigestOutcome, FilterReason};
pub use format::render_digest;
