//! Plan Definition Module
//!
//! Provides data structures and utilities for defining, parsing, and
//! validating the static plan graph an execution walks through.
//!
//! # Structure
//!
//! - [`model`]: Core data structures (PlanNode, Plan)
//! - [`parser`]: YAML parsing and loading
//! - [`validator`]: Validation rules and reference checking

pub mod model;
pub mod parser;
pub mod validator;

pub use model::{AdviserObtainment, Plan, PlanNode, StepSpec};
pub use parser::{load_plan, parse_plan, save_plan};
pub use validator::validate_plan;
