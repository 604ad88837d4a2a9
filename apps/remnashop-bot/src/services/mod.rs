pub mod gift_service;
pub mod invoice_service;
pub mod loyalty_service;
pub mod notification_service;
pub mod payment;
pub mod promo_service;
pub mod provision_service;
pub mod reconcile_service;
pub mod referral_service;
pub mod renewal_service;
pub mod trial_service;
