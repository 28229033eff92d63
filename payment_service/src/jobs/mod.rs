pub mod ach_verification;
pub mod subscription_billing;
pub mod webhook_delivery;
