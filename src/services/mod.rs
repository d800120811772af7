//! Services module
//!
//! Este módulo contiene la lógica de negocio: el reconciliador de
//! vinculación, el dispatcher de consultas telemáticas, el scheduler de jobs
//! y las métricas que publican.

pub mod linking_reconciler;
pub mod metrics;
pub mod scheduler;
pub mod telematics_dispatcher;

pub use linking_reconciler::{LinkingReconciler, PassOutcome, PassReport, ReconcilerConfig};
pub use scheduler::JobScheduler;
pub use telematics_dispatcher::{CycleOutcome, DispatchReport, TelematicsDispatcher};
