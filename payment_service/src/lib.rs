//! Payment Service Library
//!
//! This library acts as the core of the Payment Service, exporting the necessary modules
//! for the application binary and integration tests.
//!
//! # Modules
//!
//! * `api` - Contains the HTTP API surface (routes, auth, browser-post endpoints).
//! * `config` - Contains the enumerated environment configuration.
//! * `domain` - Contains the domain entities, group state machine and business rules.
//! * `infrastructure` - Contains the concrete implementations of repositories, gateways and resilience primitives.
//! * `jobs` - Contains the background workers (webhooks, billing, ACH verification).
//! * `use_cases` - Contains the application business logic and workflows.

pub mod api;
pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod jobs;
pub mod use_cases;
