//! Multi-threaded IPFIX flow record aggregation.
//!
//! Flow records are read by [`ipfix::provider::FlowProvider`], folded into
//! per-key records by an [`aggregator::Aggregator`] and rendered by a
//! [`printer::Printer`].

pub mod aggregator;
pub mod config;
pub mod ipfix;
pub mod printer;
