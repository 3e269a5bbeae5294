//! Coach Core: conversational fitness coach.
//!
//! Inbound messages go through the [`dispatch::Dispatcher`], which classifies
//! intent, enforces onboarding and sticky consultations, and routes to the
//! onboarding, consultation and image handlers.

pub mod affinity;
pub mod channels;
pub mod config;
pub mod consultation;
pub mod dispatch;
pub mod error;
pub mod handler;
pub mod image;
pub mod intent;
pub mod llm;
pub mod memory;
pub mod observe;
pub mod onboarding;
pub mod profile;
pub mod replies;
pub mod routes;
pub mod store;
