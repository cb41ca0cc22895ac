use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as TimeDelta, Utc};
use serde::Deserialize;
use std::{
    collections::HashMap,
    future::Future,
    net::SocketAddr,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};
use teloxide::{
    dispatching::UpdateHandler,
    dptree,
    prelude::*,
    types::{ChatId, Message, MessageId, ParseMode, ReplyParameters, User, UserId},
    update_listeners::webhooks,
    utils::html,
};
use tokio::sync::{broadcast, Mutex};
use tracing::{info, warn};
use url::Url;

const TOKEN_ENV_VAR: &str = "BOT_TOKEN";
const DEFAULT_TTL_MINUTES: i64 = 1;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 10;
const HEALTH_PATH: &str = "/healthz";

#[derive(Debug, Deserialize, Clone, Default)]
struct Config {
    #[serde(default)]
    bot: BotConfig,
    #[serde(default)]
    runtime: RuntimeConfig,
}

#[derive(Debug, Deserialize, Clone, Default)]
struct BotConfig {
    token: Option<String>,
    log_level: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
struct RuntimeConfig {
    ttl_minutes: Option<i64>,
    sweep_interval_secs: Option<u64>,

    // absent => long polling
    #[serde(default)]
    webhook: Option<WebhookConfig>,
}

#[derive(Debug, Deserialize, Clone)]
struct WebhookConfig {
    listen_addr: String,
    public_url: String,
    health_addr: Option<String>,
}

fn load_config(path: &PathBuf, explicit: bool) -> Result<Config> {
    if !path.exists() && !explicit {
        // no config.yaml next to the binary: run on defaults + BOT_TOKEN
        return Ok(Config::default());
    }
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("read config: {}", path.display()))?;
    let cfg: Config = serde_yaml::from_str(&text).context("parse yaml")?;
    Ok(cfg)
}

fn validate_config(cfg: &Config) -> Result<()> {
    if let Some(ttl) = cfg.runtime.ttl_minutes {
        if !(1..=1440).contains(&ttl) {
            return Err(anyhow!("ttl_minutes={} out of range (1..=1440)", ttl));
        }
    }
    if let Some(secs) = cfg.runtime.sweep_interval_secs {
        if !(1..=3600).contains(&secs) {
            return Err(anyhow!(
                "sweep_interval_secs={} out of range (1..=3600)",
                secs
            ));
        }
    }
    if let Some(w) = &cfg.runtime.webhook {
        w.listen_addr
            .parse::<SocketAddr>()
            .with_context(|| format!("webhook.listen_addr '{}' is not an address", w.listen_addr))?;
        w.public_url
            .parse::<Url>()
            .with_context(|| format!("webhook.public_url '{}' is not a URL", w.public_url))?;
        if let Some(h) = &w.health_addr {
            h.parse::<SocketAddr>()
                .with_context(|| format!("webhook.health_addr '{}' is not an address", h))?;
        }
    }
    Ok(())
}

fn pick_token(from_config: Option<String>, from_env: Option<String>) -> Result<String> {
    from_config
        .filter(|t| !t.is_empty())
        .or_else(|| from_env.filter(|t| !t.is_empty()))
        .ok_or_else(|| {
            anyhow!("bot token missing: set bot.token in the config or the {TOKEN_ENV_VAR} env var")
        })
}

/// Members that still owe a verification photo, keyed by `(chat, user)` and
/// mapped to the deadline after which they get removed.
///
/// All three operations take the same lock, so a key is claimed by either
/// `resolve` or `drain_expired`, never both, and never twice.
struct PendingRegistry {
    entries: Mutex<HashMap<(ChatId, UserId), DateTime<Utc>>>,
}

impl PendingRegistry {
    fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Starts the verification window for a member and returns the deadline.
    /// A repeated join overwrites the previous deadline.
    async fn add(
        &self,
        chat_id: ChatId,
        user_id: UserId,
        now: DateTime<Utc>,
        ttl: TimeDelta,
    ) -> DateTime<Utc> {
        let deadline = now + ttl;
        self.entries.lock().await.insert((chat_id, user_id), deadline);
        deadline
    }

    /// Removes the entry if present; returns whether the member was pending.
    async fn resolve(&self, chat_id: ChatId, user_id: UserId) -> bool {
        self.entries.lock().await.remove(&(chat_id, user_id)).is_some()
    }

    /// Removes and returns every key whose deadline is at or before `now`.
    async fn drain_expired(&self, now: DateTime<Utc>) -> Vec<(ChatId, UserId)> {
        let mut entries = self.entries.lock().await;
        let mut expired = Vec::new();
        entries.retain(|key, deadline| {
            if *deadline <= now {
                expired.push(*key);
                false
            } else {
                true
            }
        });
        expired
    }
}

struct AppState {
    registry: PendingRegistry,
    ttl_minutes: i64,
}

impl AppState {
    fn new(ttl_minutes: i64) -> Self {
        Self {
            registry: PendingRegistry::new(),
            ttl_minutes,
        }
    }

    fn ttl(&self) -> TimeDelta {
        TimeDelta::minutes(self.ttl_minutes)
    }
}

/// Outbound platform actions. The production implementation wraps teloxide;
/// tests substitute a recording double.
#[async_trait]
trait Gateway: Send + Sync {
    async fn send_message(&self, chat_id: ChatId, text: String) -> Result<()>;
    async fn reply_to(&self, chat_id: ChatId, message_id: MessageId, text: String) -> Result<()>;
    async fn remove_member(&self, chat_id: ChatId, user_id: UserId) -> Result<()>;
    async fn unban_member(&self, chat_id: ChatId, user_id: UserId) -> Result<()>;
}

struct TelegramGateway {
    bot: Bot,
}

impl TelegramGateway {
    fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

#[async_trait]
impl Gateway for TelegramGateway {
    async fn send_message(&self, chat_id: ChatId, text: String) -> Result<()> {
        self.bot
            .send_message(chat_id, text)
            .parse_mode(ParseMode::Html)
            .await
            .context("send_message")?;
        Ok(())
    }

    async fn reply_to(&self, chat_id: ChatId, message_id: MessageId, text: String) -> Result<()> {
        self.bot
            .send_message(chat_id, text)
            .parse_mode(ParseMode::Html)
            .reply_parameters(ReplyParameters::new(message_id))
            .await
            .context("send_message (reply)")?;
        Ok(())
    }

    async fn remove_member(&self, chat_id: ChatId, user_id: UserId) -> Result<()> {
        // ban followed by unban (below) ejects the member without a lasting ban
        self.bot
            .ban_chat_member(chat_id, user_id)
            .await
            .context("ban_chat_member")?;
        Ok(())
    }

    async fn unban_member(&self, chat_id: ChatId, user_id: UserId) -> Result<()> {
        self.bot
            .unban_chat_member(chat_id, user_id)
            .await
            .context("unban_chat_member")?;
        Ok(())
    }
}

fn perm_hint(action: &str) -> &'static str {
    match action {
        "remove_member" | "unban_member" => {
            "bot must be a group admin with the Ban users right"
        }
        "send_message" | "reply_to" => "bot must be allowed to post in the chat",
        _ => "check the bot's rights in the chat",
    }
}

async fn run_action<F>(action: &'static str, chat_id: ChatId, fut: F) -> bool
where
    F: Future<Output = Result<()>>,
{
    match fut.await {
        Ok(()) => true,
        Err(e) => {
            warn!(
                "{action} failed (chat {chat_id}): {e:#}; hint: {}",
                perm_hint(action)
            );
            false
        }
    }
}

fn mention(user: &User) -> String {
    let name = if !user.first_name.is_empty() {
        user.first_name.clone()
    } else {
        user.username.clone().unwrap_or_else(|| "member".to_string())
    };
    format!(
        "<a href=\"tg://user?id={}\">{}</a>",
        user.id,
        html::escape(&name)
    )
}

fn mention_by_id(user_id: UserId) -> String {
    format!("<a href=\"tg://user?id={}\">this member</a>", user_id)
}

fn join_notice(user: &User, ttl_minutes: i64, deadline: DateTime<Utc>) -> String {
    format!(
        "🚨 <b>New member verification</b>\n\n\
         {}, post a photo in this chat within <b>{} minute(s)</b> \
         (before {} UTC),\n\
         otherwise you will be removed automatically. You may rejoin afterwards.",
        mention(user),
        ttl_minutes,
        deadline.format("%H:%M:%S"),
    )
}

fn verified_notice(user: &User) -> String {
    format!(
        "🟢 <b>Verification passed</b>\n{}, you are off the watch list. Welcome!",
        mention(user)
    )
}

fn removal_notice(user_id: UserId, ttl_minutes: i64) -> String {
    format!(
        "❌ <b>Removed</b>\n{} did not post a photo within {} minute(s) \
         and was removed automatically. Rejoining is allowed.",
        mention_by_id(user_id),
        ttl_minutes
    )
}

async fn handle_new_members(
    gw: &dyn Gateway,
    state: &AppState,
    chat_id: ChatId,
    users: &[User],
    now: DateTime<Utc>,
) {
    for user in users {
        if user.is_bot {
            continue;
        }
        let deadline = state.registry.add(chat_id, user.id, now, state.ttl()).await;
        info!(
            "pending: chat {} user {} until {}",
            chat_id, user.id, deadline
        );
        let text = join_notice(user, state.ttl_minutes, deadline);
        run_action("send_message", chat_id, gw.send_message(chat_id, text)).await;
    }
}

async fn handle_photo(
    gw: &dyn Gateway,
    state: &AppState,
    chat_id: ChatId,
    from: &User,
    message_id: MessageId,
) {
    if !state.registry.resolve(chat_id, from.id).await {
        // photo from a member that was never pending (or already verified)
        return;
    }
    info!("verified: chat {} user {}", chat_id, from.id);
    run_action(
        "reply_to",
        chat_id,
        gw.reply_to(chat_id, message_id, verified_notice(from)),
    )
    .await;
}

async fn sweep_once(gw: &dyn Gateway, state: &AppState, now: DateTime<Utc>) {
    for (chat_id, user_id) in state.registry.drain_expired(now).await {
        info!("expired: chat {} user {}", chat_id, user_id);
        // every action gets its own fault boundary; expiry is handled
        // at most once per key, a failed call is logged and not retried
        run_action(
            "remove_member",
            chat_id,
            gw.remove_member(chat_id, user_id),
        )
        .await;
        run_action("unban_member", chat_id, gw.unban_member(chat_id, user_id)).await;
        run_action(
            "send_message",
            chat_id,
            gw.send_message(chat_id, removal_notice(user_id, state.ttl_minutes)),
        )
        .await;
    }
}

async fn health_server(addr: SocketAddr, mut shutdown_rx: broadcast::Receiver<()>) {
    use axum::{routing::get, Router};

    let app = Router::new().route(HEALTH_PATH, get(|| async { "OK" }));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            warn!("health endpoint bind failed on {addr}: {e}");
            return;
        }
    };
    info!("health endpoint on http://{addr}{HEALTH_PATH}");

    let shutdown = async move {
        let _ = shutdown_rx.recv().await;
    };
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
    {
        warn!("health endpoint error: {e}");
    }
}

fn schema() -> UpdateHandler<anyhow::Error> {
    dptree::entry().branch(Update::filter_message().endpoint(
        |bot: Bot, state: Arc<AppState>, msg: Message| async move {
            let gw = TelegramGateway::new(bot);
            if let Some(users) = msg.new_chat_members() {
                handle_new_members(&gw, &state, msg.chat.id, users, Utc::now()).await;
            } else if msg.photo().is_some() {
                if let Some(from) = msg.from.as_ref() {
                    handle_photo(&gw, &state, msg.chat.id, from, msg.id).await;
                }
            }
            Ok(())
        },
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let explicit = parse_config_arg(&args).is_some();
    let config_path = parse_config_arg(&args).unwrap_or_else(|| PathBuf::from("config.yaml"));

    let cfg = load_config(&config_path, explicit)?;
    validate_config(&cfg)?;

    let filter = cfg.bot.log_level.clone().unwrap_or_else(|| "info".into());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let token = pick_token(
        cfg.bot.token.clone(),
        std::env::var(TOKEN_ENV_VAR).ok(),
    )?;

    let ttl_minutes = cfg.runtime.ttl_minutes.unwrap_or(DEFAULT_TTL_MINUTES);
    let sweep_secs = cfg
        .runtime
        .sweep_interval_secs
        .unwrap_or(DEFAULT_SWEEP_INTERVAL_SECS);

    let (shutdown_tx, _shutdown_rx0) = broadcast::channel::<()>(8);

    let shutdown_ctrl = shutdown_tx.clone();
    let ctrl_handle = tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        let _ = shutdown_ctrl.send(());
    });

    let bot = Bot::new(token);

    let me = bot.get_me().await.context("get_me (is the token valid?)")?;
    let bot_username = me.user.username.clone().unwrap_or_else(|| "bot".into());

    info!(
        "verification window {} min, sweep every {}s",
        ttl_minutes, sweep_secs
    );

    let state = Arc::new(AppState::new(ttl_minutes));

    let bot_sweep = bot.clone();
    let state_sweep = state.clone();
    let mut shutdown_rx_sweep = shutdown_tx.subscribe();
    let h_sweep = tokio::spawn(async move {
        let gw = TelegramGateway::new(bot_sweep);
        let mut ticker = tokio::time::interval(Duration::from_secs(sweep_secs));
        loop {
            tokio::select! {
                _ = shutdown_rx_sweep.recv() => { break; }
                _ = ticker.tick() => {
                    sweep_once(&gw, &state_sweep, Utc::now()).await;
                }
            }
        }
    });

    let mut dispatcher = Dispatcher::builder(bot.clone(), schema())
        .dependencies(dptree::deps![state])
        .default_handler(|upd| async move {
            let _ = upd;
        })
        .error_handler(LoggingErrorHandler::with_custom_text("Dispatcher error"))
        .enable_ctrlc_handler()
        .build();

    let mut h_health = None;
    match cfg.runtime.webhook.clone() {
        Some(w) => {
            let addr: SocketAddr = w.listen_addr.parse()?;
            let url: Url = w.public_url.parse()?;
            if let Some(h) = &w.health_addr {
                let health_addr: SocketAddr = h.parse()?;
                h_health = Some(tokio::spawn(health_server(
                    health_addr,
                    shutdown_tx.subscribe(),
                )));
            }
            info!("Start webhook on {} as @{}", w.public_url, bot_username);
            let listener = webhooks::axum(bot, webhooks::Options::new(addr, url))
                .await
                .context("set webhook")?;
            dispatcher
                .dispatch_with_listener(
                    listener,
                    LoggingErrorHandler::with_custom_text("Webhook listener error"),
                )
                .await;
        }
        None => {
            info!("Start polling as @{}", bot_username);
            dispatcher.dispatch().await;
        }
    }

    let _ = shutdown_tx.send(());
    let _ = ctrl_handle.await;
    let _ = h_sweep.await;
    if let Some(h) = h_health {
        let _ = h.await;
    }

    Ok(())
}

fn parse_config_arg(args: &[String]) -> Option<PathBuf> {
    let mut i = 0;
    while i < args.len() {
        if args[i] == "--config" && i + 1 < args.len() {
            return Some(PathBuf::from(&args[i + 1]));
        }
        i += 1;
    }
    None
}
