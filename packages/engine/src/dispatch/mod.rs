// packages/engine/src/dispatch/mod.rs
//! Render dispatch
//!
//! - **Request**: normalized source, fingerprint and display size
//! - **Validator**: pre-execution policy check
//! - **Dispatcher**: validate → cache → lease a worker → execute → cache
//! - **Result**: status taxonomy returned to callers

pub mod dispatcher;
pub mod display;
pub mod request;
pub mod result;
pub mod validator;

pub use dispatcher::{DispatchConfig, RenderDispatcher};
pub use display::DisplaySize;
pub use request::{CodeNormalizer, Fingerprint, RenderRequest, SubmitterId, TrimNormalizer};
pub use result::{RenderResult, RenderStatus};
pub use validator::{AcceptAll, CodeValidator, PatternValidator, Validation, ValidatorConfig};
