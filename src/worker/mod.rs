//! The interception engine: lifecycle, routing, reconciliation and the client
//! message bridge.
//!
//! Host events map onto explicit methods so the core can run under any event
//! model:
//! - install / activate: [`Registration::install`], [`Registration::activate_waiting`]
//! - intercepted request: [`Registration::fetch`]
//! - periodic refresh: [`Registration::reconcile`]
//! - client message: [`Registration::handle_message`]

mod bridge;
mod lifecycle;
mod reconciler;
mod registration;
mod router;
mod version;

pub use bridge::{ClientId, ClientMessage, CoreMessage, SubscriberRegistry};
pub use lifecycle::{ActivationReport, Controller, Environment, Phase};
pub use reconciler::{ReconcileReport, Reconciler};
pub use registration::Registration;
pub use router::{
  BypassReason, Intercepted, RoutePolicy, Router, Served, Source, StatsSnapshot, WriteOutcome,
};
pub use version::{VersionDescriptor, VersionInfo};
