//! Guard Mount: removable storage gatekeeper.
//!
//! Intercepts USB block devices before they are mounted, keeps them isolated while
//! their contents are scanned read-only, and restores access only after an explicit
//! decision.
//!
//! Modular structure:
//! - [`device`]: Device events, identity, udev event source
//! - [`isolation`]: Bus deauthorization / forced unmount and their reversal
//! - [`heuristics`]: Per-file suspicion rules (autorun, extension, hidden, entropy)
//! - [`scan`]: Mount slot, signature scanner, scan report
//! - [`decision`]: Report rendering and the bounded operator choice
//! - [`monitor`]: Lifecycle coordinator and device sessions
//! - [`logging`]: Structured process logging and the audit trail

pub mod config;
pub mod decision;
pub mod device;
pub mod heuristics;
pub mod isolation;
pub mod logging;
pub mod monitor;
pub mod scan;

pub use config::GuardConfig;
pub use decision::{Decision, DecisionGateway};
pub use device::{DeviceEvent, DeviceIdentity, TriggerPolicy};
pub use heuristics::HeuristicClassifier;
pub use isolation::{IsolationController, IsolationHandle};
pub use logging::{AuditLog, StructuredLogger};
pub use monitor::session::{DeviceSession, SessionState};
pub use monitor::Coordinator;
pub use scan::{ScanOrchestrator, ScanReport};
