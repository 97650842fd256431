// onezone-common: shared page, presence, and wire types for the OneZone relay

pub mod mutation;
pub mod protocol;
pub mod types;
