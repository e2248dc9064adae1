pub mod feed;
pub mod llm;
pub mod telegram;

pub use feed::{GammaFeed, MarketFeed};
pub use llm::{OpenAiLlm, RationaleLlm};
pub use telegram::{InlineButton, Messenger, TelegramMessenger};
