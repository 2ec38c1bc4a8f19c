pub mod event;
pub mod participant;
pub mod payment;
pub mod purchase;
pub mod registration;
pub mod ticket;
