//! # tollgate
//!
//! Conditional metered-pricing core for AI gateways.
//!
//! The crate turns a catalog of conditional price rules into exact,
//! reconciled bills for both buffered and streamed LLM responses, and ships
//! a differential simulator that cross-checks the billing engine against an
//! independent cost oracle.
//!
//! ## Architecture
//!
//! - [`money`]: fixed-point money as `i64` nanos (10⁻⁹ units). All monetary
//!   arithmetic in the crate is integer arithmetic; decimal strings are
//!   parsed once at the boundary and formatted exactly on the way out.
//! - [`pricing`]: the data model ([`pricing::PriceCard`],
//!   [`pricing::PriceRule`], [`pricing::Bill`]), the condition predicate
//!   language ([`pricing::conditions`]), the catalog snapshot and per-lookup
//!   card derivation ([`pricing::catalog`]), and the rule-selection engine
//!   ([`pricing::engine`]).
//! - [`stream`]: the SSE reconciler that forwards provider frames unchanged
//!   (or through a rewrite hook) while capturing the terminal usage snapshot
//!   and finalizing billing exactly once per request, aborted streams
//!   included.
//! - [`audit`]: the sink every priced (or unpriceable) request reports to,
//!   decoupled from the response path.
//! - [`sim`]: the differential simulator behind the `tollgate-sim` binary:
//!   deterministic scenario generation, an engine-independent estimator, and
//!   run aggregation with a non-zero exit code on any disagreement.
//!
//! ## Design rules
//!
//! - Pricing never fails a request: missing cards, unknown plans, and
//!   unmatched conditions degrade to zero-line bills, and every such outcome
//!   is auditable.
//! - Streams are transparent: bytes are forwarded in arrival order, and a
//!   frame the reconciler cannot parse is passed through untouched.
//! - Billing is latched: exactly one finalize per streamed request, whether
//!   it completed or aborted.

pub mod audit;
pub mod config;
pub mod errors;
pub mod money;
pub mod pricing;
pub mod sim;
pub mod stream;
pub mod telemetry;
pub mod types;

pub use errors::{Error, Result};
pub use money::{Nanos, ceil_nanos_to_cents, format_nanos_exact, parse_decimal_to_nanos};
pub use pricing::{Bill, Catalog, PriceCard, PriceRule, UsageSample, compute_bill};
pub use types::{FinalizeReason, ModelKey};
