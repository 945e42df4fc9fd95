//! Flow record input: element metadata, parsed records, file reading and
//! the per-thread record provider.

pub mod element;
pub mod flow;
pub mod provider;
pub mod reader;

pub use element::{ElementType, Registry};
pub use flow::{Direction, FieldView, Flow, FlowDirection};
pub use provider::{FlowFilter, FlowProvider};
pub use reader::{FlowReader, ReadError};
