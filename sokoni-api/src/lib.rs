//! Serializable API surface of the sokoni escrow engine: the error taxonomy
//! returned by every endpoint, the entity views, and the request / response
//! models.

/// Api error types and error kinds.
pub mod error;
/// Request and response models per endpoint.
pub mod models;
/// Entity views and shared domain enums.
pub mod types;
