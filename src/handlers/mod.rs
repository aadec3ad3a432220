pub(crate) mod payment_handlers;
pub(crate) mod webhook_handlers;
