//! Hash maps: the SWAR bucket map, the deadline-indexed TTL map, and the
//! layered rotation wrapper over TTL maps.

pub mod bucket;
pub mod layer;
pub mod ttl;
