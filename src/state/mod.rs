pub mod cooldown;
pub mod kv;

pub use cooldown::{ClaimOutcome, CooldownLedger};
pub use kv::KvStore;
