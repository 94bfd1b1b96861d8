//! Process-wide startup configuration.

use clap::Parser;

/// Streamgate bot configuration. Every flag can also come from the
/// environment (a `.env` file is loaded at startup).
#[derive(Parser, Debug, Clone)]
#[command(name = "streamgate_bot", about = "Streamgate subscription bot")]
pub struct Config {
    /// Telegram bot token.
    #[arg(long, env = "BOT_TOKEN")]
    pub bot_token: String,

    /// Chat identity of the administrator.
    #[arg(long, env = "ADMIN_ID")]
    pub admin_id: i64,

    /// Phone number shown on the bank-transfer payment screen.
    #[arg(long, env = "SBP_PHONE")]
    pub sbp_phone: String,

    /// Wallet address shown on the wallet payment screen.
    #[arg(long, env = "ADMIN_WALLET")]
    pub wallet_address: String,

    /// Address users point their players at.
    #[arg(long, env = "STREAM_SERVER_ADDRESS")]
    pub server_address: String,

    /// Command that makes the media server reload its accounts.
    #[arg(
        long,
        env = "STREAM_SERVER_RESTART",
        default_value = "systemctl restart streamserver",
        value_delimiter = ' '
    )]
    pub restart_command: Vec<String>,

    /// SQLite database location.
    #[arg(long, env = "DATABASE_URL", default_value = "sqlite://streamgate.db")]
    pub database_url: String,

    /// Support chat link offered in the menus.
    #[arg(
        long,
        env = "SUPPORT_CHAT_URL",
        default_value = "https://t.me/streamgate_support"
    )]
    pub support_chat_url: String,

    /// Long-poll timeout in seconds.
    #[arg(long, default_value_t = 50)]
    pub poll_timeout: u64,
}
