pub mod capture;
pub mod configuration;
pub mod connections;
pub mod controller;
pub mod error_handling;
pub mod flow;
pub mod importer;
pub mod notifications;
pub mod pipeline;
pub mod rules;
pub mod search;
pub mod services;
pub mod statistics;
pub mod storage;
pub mod web_interface;

pub use configuration::Configuration;
pub use controller::{AnalysisContext, Controller};
