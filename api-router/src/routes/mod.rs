pub mod evaluate;
pub mod kg;
pub mod liveness;
pub mod mining;
pub mod readiness;
pub mod refine;
pub mod validate;
pub mod workflow;
