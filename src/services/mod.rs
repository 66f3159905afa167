pub mod audit;
pub mod handover;
pub mod invoice_generator;
pub mod jobs;
pub mod midtrans;
pub mod notifier;
pub mod payment_sync;
pub mod pricing;
pub mod rate_limit;
pub mod renewal;
pub mod scheduler;
pub mod state_machine;
