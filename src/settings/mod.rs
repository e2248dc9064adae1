pub mod cache;
pub mod plans;
pub mod resolver;

pub use cache::SettingsCache;
pub use resolver::{resolve, EffectiveSettings, Plan, SettingsAnomaly, SettingsLayer, UserPreferences};
