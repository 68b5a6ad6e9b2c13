pub mod billing_duration;
pub mod notification_type;
pub mod payment;
pub mod payment_method;
pub mod subscription_status;
pub mod subscription_type;
