pub mod access;
pub mod guest_token;
pub mod inventory;
pub mod payment_intent;
pub mod provider;
pub mod registration;
pub mod webhook;
