// Adapters for the outside world: GitHub and the notification providers

pub mod dingtalk;
pub mod github_client;
pub mod http_client;
pub mod telegram;

pub use dingtalk::DingTalkChannel;
pub use github_client::GithubClient;
pub use telegram::TelegramChannel;
