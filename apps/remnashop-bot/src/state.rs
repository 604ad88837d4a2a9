use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::config::Settings;
use crate::services::gift_service::GiftService;
use crate::services::invoice_service::InvoiceService;
use crate::services::loyalty_service::LoyaltyService;
use crate::services::notification_service::NotificationService;
use crate::services::reconcile_service::ReconcileService;
use crate::services::referral_service::ReferralService;
use crate::services::trial_service::TrialService;
use remnashop_db::repositories::{PaymentRepository, UserRepository};

/// Multi-step input the driver is waiting for from a user, keyed by
/// telegram id. Mutated only by the driver on behalf of that user.
#[derive(Debug, Clone)]
pub enum PendingInput {
    PromoCode { months: u32 },
    GiftRedeem,
}

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub users: UserRepository,
    pub payments: PaymentRepository,
    pub loyalty: LoyaltyService,
    pub invoice: InvoiceService,
    pub reconcile: ReconcileService,
    pub referral: ReferralService,
    pub trial: TrialService,
    pub gifts: GiftService,
    pub notifier: NotificationService,
    pub pending_inputs: Arc<Mutex<HashMap<i64, PendingInput>>>,
}

impl AppState {
    pub fn take_pending(&self, telegram_id: i64) -> Option<PendingInput> {
        self.pending_inputs.lock().unwrap().remove(&telegram_id)
    }

    pub fn set_pending(&self, telegram_id: i64, input: PendingInput) {
        self.pending_inputs.lock().unwrap().insert(telegram_id, input);
    }
}
