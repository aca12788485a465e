pub mod admin;
pub mod backend;
pub mod bucketing;
pub mod cache;
pub mod config;
pub mod config_validator;
pub mod error;
pub mod evaluator;
pub mod extract;
pub mod feature;
pub mod handlers;
pub mod health;
pub mod middleware;
pub mod overrides;
pub mod registry;
pub mod response;
pub mod server;
pub mod validation;

pub use config::{Config, Settings};
pub use error::{EntitlementError, Result};
pub use evaluator::{evaluate_feature, Entitlements, EvaluationResult};
pub use feature::{CompanyFeatureOverride, Feature, FeatureSpec, UserContext};
pub use handlers::{AppState, SharedState};
pub use server::create_app;
