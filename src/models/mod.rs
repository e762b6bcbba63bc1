// Persistence models
pub mod attendance;
pub mod event;
pub mod fee_config;
pub mod payment;
pub mod settlement_report;

pub use attendance::AttendanceStatus;
pub use event::EventStatus;
pub use payment::{PaymentMethod, PaymentStatus};
