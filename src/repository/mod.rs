pub mod contracts;
pub mod handovers;
pub mod invoices;
pub mod payments;
pub mod rooms;
