use teloxide::prelude::*;
use teloxide::types::PreCheckoutQuery;
use tracing::info;

use crate::services::reconcile_service::PreCheckoutVerdict;
use crate::state::AppState;

/// Answers the Stars pre-commit query. The PSP deadline is a few seconds,
/// so this path does a single local lookup and nothing else.
pub async fn pre_checkout_handler(
    bot: Bot,
    q: PreCheckoutQuery,
    state: AppState,
) -> Result<(), teloxide::RequestError> {
    let verdict = state
        .reconcile
        .pre_checkout(&q.invoice_payload, q.total_amount as i64)
        .await;

    info!(
        "Pre-checkout for payload '{}' (amount {}): {:?}",
        q.invoice_payload, q.total_amount, verdict
    );

    match verdict {
        PreCheckoutVerdict::Approve => {
            bot.answer_pre_checkout_query(q.id, true).await?;
        }
        PreCheckoutVerdict::UnknownPayment => {
            bot.answer_pre_checkout_query(q.id, false)
                .error_message("Payment not found. Please create a new order.")
                .await?;
        }
        PreCheckoutVerdict::AlreadyProcessed => {
            bot.answer_pre_checkout_query(q.id, false)
                .error_message("This payment has already been processed.")
                .await?;
        }
        PreCheckoutVerdict::AmountMismatch => {
            bot.answer_pre_checkout_query(q.id, false)
                .error_message("Payment amount does not match. Please create a new order.")
                .await?;
        }
    }

    Ok(())
}
