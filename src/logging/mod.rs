pub mod audit;
pub mod format;

pub use audit::{AuditEvent, AuditLog, AuditRecord, Stage};
pub use format::StructuredLogger;
