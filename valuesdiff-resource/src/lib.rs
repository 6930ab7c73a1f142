//! The provider side of the resource protocol.
//!
//! A provider process receives exactly one request on its stdin, as a single
//! line of JSON, and answers with a single JSON response on its stdout.

pub mod framework;
pub mod schema;
