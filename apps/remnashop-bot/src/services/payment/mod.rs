pub mod yookassa;

pub use yookassa::{YookassaClient, YookassaPayment, YookassaStatus};
