//! A push-based MapReduce: the coordinator owns every scheduling decision and
//! drives a static set of stateless workers over tarpc.

pub mod assembler;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod function;
pub mod job;
pub mod liveness;
pub mod rpc;
pub mod task;
pub mod transport;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;
