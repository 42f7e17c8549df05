pub mod error;
pub mod expiry;
pub mod gateway;
pub mod orchestrator;
mod reservation;
pub mod validation;

pub use error::{AvailabilityReport, BookingError, BookingLeg, LegAvailability, UnavailableReason};
pub use expiry::{IntentSweeper, SweepReport};
pub use gateway::MockPaymentGateway;
pub use orchestrator::{
    BookingOrchestrator, Collaborators, CreatedIntent, OrchestratorRules, PaymentStart, WebhookOutcome,
};

#[cfg(test)]
mod tests;
