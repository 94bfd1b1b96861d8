//! Update dispatch — maps chat events onto engine transitions.
//!
//! Everything here is presentation glue: menus, texts, and the admin-only
//! gates. State lives behind the engine; claims live in the claim store
//! and are referenced from callback payloads by opaque id only.

use std::sync::Arc;

use tracing::{debug, error, warn};

use streamgate_core::claims::{ClaimStore, PaymentClaim, new_transfer_id};
use streamgate_core::engine::{
    AccountStatus, CreateOutcome, DeleteOutcome, EngineError, IssuedAccount, SubscriptionEngine,
    TRIAL_DURATION_HOURS, TrialOutcome, extension_days,
};
use streamgate_core::models::{EXPIRY_DISPLAY_FORMAT, PayChannel};
use streamgate_core::notify::{Button, Keyboard};

use crate::config::Config;
use crate::menus;
use crate::telegram::{Bot, CallbackQuery, Message, TgUser, Update};
use crate::throttle::RateLimiter;

const ADMIN_CREATE_USAGE: &str = "Usage: /admin_create <login> [credential] [days]";

pub struct BotHandlers {
    bot: Bot,
    engine: Arc<SubscriptionEngine>,
    claims: ClaimStore,
    limiter: RateLimiter,
    config: Config,
}

impl BotHandlers {
    pub fn new(bot: Bot, engine: Arc<SubscriptionEngine>, config: Config) -> Self {
        Self {
            bot,
            engine,
            claims: ClaimStore::new(),
            limiter: RateLimiter::new(),
            config,
        }
    }

    pub async fn handle_update(&self, update: Update) {
        if let Some(message) = update.message {
            self.handle_message(message).await;
        } else if let Some(callback) = update.callback_query {
            self.handle_callback(callback).await;
        }
    }

    fn is_admin(&self, user_id: i64) -> bool {
        user_id == self.config.admin_id
    }

    async fn handle_message(&self, message: Message) {
        let Some(from) = &message.from else { return };
        let Some(text) = message.text.as_deref() else {
            return;
        };
        let chat_id = message.chat.id;

        if !self.limiter.check(from.id) {
            self.reply(chat_id, "Too many requests. Give it a moment!", None)
                .await;
            return;
        }

        let command = text.split_whitespace().next().unwrap_or_default();
        match command {
            "/start" => {
                self.reply(
                    chat_id,
                    menus::greeting(),
                    Some(&menus::main_menu(&self.config.support_chat_url)),
                )
                .await;
            }
            "/admin_create" => self.admin_create(chat_id, from.id, text).await,
            "/delete_subscription" => self.delete_menu(chat_id, from.id).await,
            _ => debug!(chat_id, "ignoring message"),
        }
    }

    async fn admin_create(&self, chat_id: i64, from_id: i64, text: &str) {
        if !self.is_admin(from_id) {
            self.reply(chat_id, "You are not allowed to run this command.", None)
                .await;
            return;
        }

        let parts: Vec<&str> = text.split_whitespace().collect();
        let Some(login) = parts.get(1) else {
            self.reply(chat_id, ADMIN_CREATE_USAGE, None).await;
            return;
        };
        let credential = parts.get(2).map(|s| s.to_string());
        let days = match parts.get(3) {
            None => None,
            Some(raw) => match raw.parse::<i64>() {
                Ok(days) if days > 0 => Some(days),
                _ => {
                    self.reply(chat_id, ADMIN_CREATE_USAGE, None).await;
                    return;
                }
            },
        };

        match self.engine.admin_create(login, credential, days).await {
            Ok(CreateOutcome::Created(account)) => {
                self.reply(
                    chat_id,
                    &format!(
                        "Account created:\nLogin: {}\nCredential: {}\nExpires: {}\n\
                         The media server has been restarted.",
                        account.login,
                        account.credential,
                        account.expires_at.format(EXPIRY_DISPLAY_FORMAT)
                    ),
                    None,
                )
                .await;
            }
            Ok(CreateOutcome::LoginTaken) => {
                self.reply(chat_id, &format!("Login {login} already exists."), None)
                    .await;
            }
            Err(err) => self.report_engine_error(chat_id, &err).await,
        }
    }

    async fn delete_menu(&self, chat_id: i64, from_id: i64) {
        if !self.is_admin(from_id) {
            self.reply(chat_id, "You are not allowed to run this command.", None)
                .await;
            return;
        }

        let accounts = match self.engine.list_accounts().await {
            Ok(accounts) => accounts,
            Err(err) => {
                self.report_engine_error(chat_id, &err).await;
                return;
            }
        };
        if accounts.is_empty() {
            self.reply(chat_id, "There are no accounts to remove.", None)
                .await;
            return;
        }

        let keyboard: Keyboard = accounts
            .iter()
            .map(|record| {
                vec![Button::callback(
                    format!(
                        "{} (until {})",
                        record.login,
                        record.expires_at.format(EXPIRY_DISPLAY_FORMAT)
                    ),
                    format!("delete:{}", record.login),
                )]
            })
            .collect();
        self.reply(chat_id, "Pick an account to remove:", Some(&keyboard))
            .await;
    }

    async fn handle_callback(&self, callback: CallbackQuery) {
        let from_id = callback.from.id;
        let target = callback
            .message
            .as_ref()
            .map(|message| (message.chat.id, message.message_id));
        let Some(data) = callback.data.as_deref() else {
            self.answer(&callback.id).await;
            return;
        };

        match data {
            "main_menu" => {
                self.respond(
                    target,
                    from_id,
                    "Pick an action:",
                    Some(&menus::main_menu(&self.config.support_chat_url)),
                )
                .await;
            }
            "status" => self.show_status(target, from_id).await,
            "get_account" => self.show_account(target, from_id).await,
            "trial" => self.activate_trial(target, from_id).await,
            "pay" => {
                self.respond(
                    target,
                    from_id,
                    "Pick a payment method:",
                    Some(&menus::pay_channels()),
                )
                .await;
            }
            "pay_sbp" => self.show_tariffs(target, from_id, PayChannel::Sbp).await,
            "pay_wallet" => self.show_tariffs(target, from_id, PayChannel::Wallet).await,
            _ => {
                if let Some(rest) = data.strip_prefix("tariff:") {
                    self.start_claim(target, &callback.from, rest).await;
                } else if let Some(claim_id) = data.strip_prefix("paid:") {
                    self.submit_claim(target, from_id, claim_id).await;
                } else if let Some(claim_id) = data.strip_prefix("confirm:") {
                    self.confirm_claim(target, from_id, claim_id).await;
                } else if let Some(claim_id) = data.strip_prefix("reject:") {
                    self.reject_claim(target, from_id, claim_id).await;
                } else if let Some(login) = data.strip_prefix("delete:") {
                    self.delete_account(target, from_id, login).await;
                } else {
                    debug!(data, "unknown callback");
                }
            }
        }

        self.answer(&callback.id).await;
    }

    async fn show_status(&self, target: Option<(i64, i64)>, user_id: i64) {
        match self.engine.query_status(user_id).await {
            Ok(AccountStatus::Active {
                login,
                expires_at,
                is_trial,
                ..
            }) => {
                let text = format!(
                    "Your subscription status:\n\nLogin: {login}\nExpires: {}\n\n\
                     Subscription type: {}",
                    expires_at.format(EXPIRY_DISPLAY_FORMAT),
                    if is_trial {
                        "Trial"
                    } else {
                        "Regular"
                    }
                );
                self.respond(target, user_id, &text, Some(&menus::back_to_main_menu()))
                    .await;
            }
            Ok(AccountStatus::Inactive) => {
                self.respond(
                    target,
                    user_id,
                    menus::no_active_subscription(),
                    Some(&menus::back_to_main_menu()),
                )
                .await;
            }
            Err(err) => {
                error!(user_id, %err, "status query failed");
                self.respond(
                    target,
                    user_id,
                    "Something went wrong. Try again later.",
                    Some(&menus::support_chat(&self.config.support_chat_url)),
                )
                .await;
            }
        }
    }

    async fn show_account(&self, target: Option<(i64, i64)>, user_id: i64) {
        match self.engine.query_status(user_id).await {
            Ok(AccountStatus::Active {
                login,
                credential,
                expires_at,
                is_trial,
            }) => {
                let details = self.engine.connection_details(&IssuedAccount {
                    login,
                    credential,
                    expires_at,
                });
                let text = format!(
                    "Your connection details:\n\n{details}\n\nSubscription type: {}",
                    if is_trial {
                        "Trial"
                    } else {
                        "Regular"
                    }
                );
                self.respond(target, user_id, &text, Some(&menus::back_to_main_menu()))
                    .await;
            }
            Ok(AccountStatus::Inactive) => {
                self.respond(
                    target,
                    user_id,
                    menus::no_active_subscription(),
                    Some(&menus::back_to_main_menu()),
                )
                .await;
            }
            Err(err) => {
                error!(user_id, %err, "account query failed");
                self.respond(
                    target,
                    user_id,
                    "Something went wrong. Try again later.",
                    Some(&menus::support_chat(&self.config.support_chat_url)),
                )
                .await;
            }
        }
    }

    async fn activate_trial(&self, target: Option<(i64, i64)>, user_id: i64) {
        match self.engine.request_trial(user_id).await {
            Ok(TrialOutcome::Activated(account)) => {
                let text = format!(
                    "Your trial is active for {TRIAL_DURATION_HOURS} hours.\n\n\
                     Your connection details:\n{}\n\nThank you for trying our service!",
                    self.engine.connection_details(&account)
                );
                self.respond(target, user_id, &text, Some(&menus::back_to_main_menu()))
                    .await;
            }
            Ok(TrialOutcome::AlreadyActive) => {
                self.respond(
                    target,
                    user_id,
                    "You already have an active subscription, so the trial is unavailable.\n\n\
                     You can extend it from the main menu.",
                    Some(&menus::back_to_main_menu()),
                )
                .await;
            }
            Ok(TrialOutcome::AlreadyUsed) => {
                self.respond(
                    target,
                    user_id,
                    "You already used your trial period.\n\n\
                     To keep using the service, order a subscription from the main menu.",
                    Some(&menus::back_to_main_menu()),
                )
                .await;
            }
            Err(err) => {
                error!(user_id, %err, "trial activation failed");
                self.respond(
                    target,
                    user_id,
                    "Something went wrong. Try again later.",
                    Some(&menus::support_chat(&self.config.support_chat_url)),
                )
                .await;
            }
        }
    }

    async fn show_tariffs(&self, target: Option<(i64, i64)>, user_id: i64, channel: PayChannel) {
        let text = menus::payment_destination(
            channel,
            &self.config.sbp_phone,
            &self.config.wallet_address,
        );
        self.respond(target, user_id, &text, Some(&menus::tariffs(channel)))
            .await;
    }

    /// A tariff was picked: create the claim and show transfer instructions.
    async fn start_claim(
        &self,
        target: Option<(i64, i64)>,
        from: &TgUser,
        payload: &str,
    ) {
        let parsed = payload.split_once(':').and_then(|(channel, amount)| {
            Some((PayChannel::parse(channel)?, amount.parse::<u32>().ok()?))
        });
        let Some((channel, amount)) = parsed.filter(|(_, amount)| extension_days(*amount).is_some())
        else {
            warn!(payload, "malformed tariff payload");
            return;
        };

        let unique_id = new_transfer_id();
        let claim_id = self.claims.create(PaymentClaim {
            user_id: from.id,
            username: from.username.clone(),
            amount,
            unique_id: unique_id.clone(),
            channel,
        });

        let destination = match channel {
            PayChannel::Sbp => &self.config.sbp_phone,
            PayChannel::Wallet => &self.config.wallet_address,
        };
        let text = format!(
            "You picked the {amount} {} tariff.\n\nTransfer the amount to:\n💳 {destination}\n\n\
             ‼️ Put this transfer id in the comment: {unique_id}\n\n\
             Press \"I paid\" once the transfer is done.",
            channel.currency()
        );
        self.respond(target, from.id, &text, Some(&menus::paid_button(&claim_id)))
            .await;
    }

    /// The user reported the transfer: hand the claim to the administrator.
    async fn submit_claim(&self, target: Option<(i64, i64)>, user_id: i64, claim_id: &str) {
        let Some(claim) = self.claims.get(claim_id) else {
            self.respond(
                target,
                user_id,
                "This payment request has expired. Start over from the main menu.",
                Some(&menus::back_to_main_menu()),
            )
            .await;
            return;
        };

        let review = format!(
            "User @{} (ID: {}) reports a transfer via {}.\n\nAmount: {} {}\nTransfer id: {}",
            claim.username.as_deref().unwrap_or("nameless"),
            claim.user_id,
            claim.channel,
            claim.amount,
            claim.channel.currency(),
            claim.unique_id
        );
        if let Err(err) = self
            .bot
            .send_message(
                self.config.admin_id,
                &review,
                Some(&menus::claim_review(claim_id)),
            )
            .await
        {
            error!(%err, "failed to notify the administrator");
            self.respond(
                target,
                user_id,
                "Could not reach the administrator. Try again later.",
                Some(&menus::back_to_main_menu()),
            )
            .await;
            return;
        }

        self.respond(
            target,
            user_id,
            "Your payment was sent for review.\nYou will be notified once the administrator confirms it.",
            Some(&menus::back_to_main_menu()),
        )
        .await;
    }

    async fn confirm_claim(
        &self,
        target: Option<(i64, i64)>,
        from_id: i64,
        claim_id: &str,
    ) {
        if !self.is_admin(from_id) {
            self.respond(target, from_id, "You are not allowed to do this.", None)
                .await;
            return;
        }

        // Taking the claim consumes it: a replayed confirm, or a confirm
        // after a reject, finds nothing.
        let Some(claim) = self.claims.take(claim_id) else {
            self.respond(target, from_id, "This claim was already handled.", None)
                .await;
            return;
        };

        match self.engine.confirm_payment(&claim).await {
            Ok(account) => {
                let text = format!(
                    "Payment from user {} confirmed.\n\nAmount: {} {}\nLogin: {}\n\
                     Credential: {}\nExpires: {}",
                    claim.user_id,
                    claim.amount,
                    claim.channel.currency(),
                    account.login,
                    account.credential,
                    account.expires_at.format(EXPIRY_DISPLAY_FORMAT)
                );
                self.respond(target, from_id, &text, None).await;
            }
            Err(err) => self.report_engine_error_at(target, from_id, &err).await,
        }
    }

    async fn reject_claim(
        &self,
        target: Option<(i64, i64)>,
        from_id: i64,
        claim_id: &str,
    ) {
        if !self.is_admin(from_id) {
            self.respond(target, from_id, "You are not allowed to do this.", None)
                .await;
            return;
        }

        let Some(claim) = self.claims.take(claim_id) else {
            self.respond(target, from_id, "This claim was already handled.", None)
                .await;
            return;
        };

        self.engine.reject_payment(claim.user_id).await;
        self.respond(
            target,
            from_id,
            &format!("Payment from user {} rejected.", claim.user_id),
            None,
        )
        .await;
    }

    async fn delete_account(
        &self,
        target: Option<(i64, i64)>,
        from_id: i64,
        login: &str,
    ) {
        if !self.is_admin(from_id) {
            self.respond(target, from_id, "You are not allowed to do this.", None)
                .await;
            return;
        }

        match self.engine.admin_delete(login).await {
            Ok(DeleteOutcome::Deleted) => {
                self.respond(
                    target,
                    from_id,
                    &format!("Subscription {login} removed."),
                    None,
                )
                .await;
            }
            Ok(DeleteOutcome::AlreadyGone) => {
                self.respond(
                    target,
                    from_id,
                    &format!("{login} is already removed or never existed."),
                    None,
                )
                .await;
            }
            Err(err) => self.report_engine_error_at(target, from_id, &err).await,
        }
    }

    async fn report_engine_error(&self, chat_id: i64, err: &EngineError) {
        self.report_engine_error_at(None, chat_id, err).await;
    }

    async fn report_engine_error_at(
        &self,
        target: Option<(i64, i64)>,
        chat_id: i64,
        err: &EngineError,
    ) {
        let text = match err {
            EngineError::UnknownAmount(amount) => {
                format!("Unknown payment amount: {amount}.")
            }
            EngineError::Store(_) => {
                error!(%err, "engine failure");
                "Internal error. Check the logs.".to_string()
            }
        };
        self.respond(target, chat_id, &text, None).await;
    }

    /// Edit the originating message when there is one; send a fresh message
    /// otherwise.
    async fn respond(
        &self,
        target: Option<(i64, i64)>,
        fallback_chat: i64,
        text: &str,
        keyboard: Option<&Keyboard>,
    ) {
        match target {
            Some((chat_id, message_id)) => {
                if let Err(err) = self
                    .bot
                    .edit_message_text(chat_id, message_id, text, keyboard)
                    .await
                {
                    warn!(chat_id, %err, "edit failed");
                }
            }
            None => self.reply(fallback_chat, text, keyboard).await,
        }
    }

    async fn reply(&self, chat_id: i64, text: &str, keyboard: Option<&Keyboard>) {
        if let Err(err) = self.bot.send_message(chat_id, text, keyboard).await {
            warn!(chat_id, %err, "send failed");
        }
    }

    async fn answer(&self, callback_id: &str) {
        if let Err(err) = self.bot.answer_callback_query(callback_id, None).await {
            warn!(%err, "answerCallbackQuery failed");
        }
    }
}
