//! Proxy candidates and the network checks run against them
//!
//! This module provides:
//! - The candidate schema and its strict conversion into [`Proxy`]
//! - Parsing candidates from plain-text lists
//! - The [`ProxyProbe`] seam used by every network check
//! - Bulk pre-screening of discovered candidates
//! - Geolocation enrichment

pub mod checker;
pub mod geo;
pub mod models;
pub mod parser;
pub mod probe;

pub use checker::{BulkChecker, PreScreen};
pub use geo::{CachedResolver, GeoLocation, GeoResolver, IpApiResolver, MmdbResolver, NoopResolver};
pub use models::{Proxy, ProxyType, RawCandidate};
pub use parser::CandidateParser;
pub use probe::{ProbeRequest, ProbeResponse, ProxyProbe, ReqwestProbe};
