pub mod grouper;
pub mod key;

pub use grouper::{group_alerts, rank_alerts, Theme, ThemeMember};
pub use key::{extract_theme, ThemeExtract, ThemeKind};
