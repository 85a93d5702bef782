//! Key normalization shared by the diff, trace and report boundaries.

pub mod path;
pub mod stable_id;
