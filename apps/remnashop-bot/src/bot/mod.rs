use teloxide::{dptree, prelude::*, types::Update};
use tracing::{error, info};

pub mod handlers;
pub mod keyboards;

use crate::state::AppState;

pub async fn run_bot(bot: Bot, state: AppState) {
    info!("Starting bot dispatcher...");

    match bot.get_me().await {
        Ok(me) => info!("Bot connected as: @{}", me.username.clone().unwrap_or_default()),
        Err(e) => {
            error!("CRITICAL: Bot failed to connect to Telegram: {}", e);
            return;
        }
    }

    let message_handler = Update::filter_message().endpoint(handlers::command::message_handler);
    let callback_handler =
        Update::filter_callback_query().endpoint(handlers::callback::callback_handler);
    let pre_checkout_handler =
        Update::filter_pre_checkout_query().endpoint(handlers::payment::pre_checkout_handler);

    Dispatcher::builder(
        bot,
        dptree::entry()
            .branch(message_handler)
            .branch(callback_handler)
            .branch(pre_checkout_handler),
    )
    .dependencies(dptree::deps![state])
    .enable_ctrlc_handler()
    .build()
    .dispatch()
    .await;
}
