//! Relationship mapping: constraint discovery across the market universe.

pub mod mapper;
pub mod oracle;

pub use mapper::{DiscoveryPass, RelationshipMapper};
pub use oracle::{InferenceOracle, RawRelationship, RelationshipOracle};
