//! Inline menus and user-facing texts.

use streamgate_core::models::PayChannel;
use streamgate_core::notify::{Button, Keyboard};

pub fn main_menu(support_chat_url: &str) -> Keyboard {
    vec![
        vec![Button::callback("💳 Pay for subscription", "pay")],
        vec![Button::callback("📅 Subscription status", "status")],
        vec![Button::callback("🔑 Account details", "get_account")],
        vec![Button::callback("🎁 Free trial", "trial")],
        vec![Button::url("💬 Support chat", support_chat_url)],
    ]
}

pub fn back_to_main_menu() -> Keyboard {
    vec![vec![Button::callback("🔙 Main menu", "main_menu")]]
}

pub fn support_chat(support_chat_url: &str) -> Keyboard {
    vec![vec![Button::url("💬 Support chat", support_chat_url)]]
}

pub fn pay_channels() -> Keyboard {
    vec![
        vec![Button::callback("Bank transfer (SBP)", "pay_sbp")],
        vec![Button::callback("Wallet transfer", "pay_wallet")],
        vec![Button::callback("🔙 Main menu", "main_menu")],
    ]
}

/// Tariff buttons for one payment channel; the callback payload carries
/// the channel and the amount in that channel's denomination.
pub fn tariffs(channel: PayChannel) -> Keyboard {
    let amounts: [(u32, &str); 3] = match channel {
        PayChannel::Sbp => [(100, "1 month — 100 RUB"), (300, "3 months — 300 RUB"), (600, "6 months — 600 RUB")],
        PayChannel::Wallet => [(1, "1 month — 1 USDT"), (3, "3 months — 3 USDT"), (6, "6 months — 6 USDT")],
    };

    let mut rows: Keyboard = amounts
        .iter()
        .map(|(amount, label)| vec![Button::callback(*label, format!("tariff:{channel}:{amount}"))])
        .collect();
    rows.push(vec![Button::callback("🔙 Back", "pay")]);
    rows
}

/// "I paid" button shown under the transfer instructions.
pub fn paid_button(claim_id: &str) -> Keyboard {
    vec![vec![Button::callback("I paid", format!("paid:{claim_id}"))]]
}

/// Confirm / reject buttons for the administrator's review message.
pub fn claim_review(claim_id: &str) -> Keyboard {
    vec![
        vec![Button::callback("Confirm", format!("confirm:{claim_id}"))],
        vec![Button::callback("Reject", format!("reject:{claim_id}"))],
    ]
}

pub fn greeting() -> &'static str {
    "Hi! I manage subscriptions for the streaming service. Pick an action from the menu below:"
}

pub fn no_active_subscription() -> &'static str {
    "You have no active subscription. You can order one from the main menu."
}

/// Where to send the money for a given channel.
pub fn payment_destination(channel: PayChannel, sbp_phone: &str, wallet_address: &str) -> String {
    match channel {
        PayChannel::Sbp => format!(
            "Pick a tariff and transfer the amount by SBP to:\n\n💳 {sbp_phone}\n\n\
             You will get a transfer id to put in the comment on the next step."
        ),
        PayChannel::Wallet => format!(
            "Pick a tariff and transfer the amount to the wallet:\n\n💳 {wallet_address}\n\n\
             You will get a transfer id to put in the comment on the next step."
        ),
    }
}
