//! Deployment package reading: zip archives and BPMN 2.0 XML.

pub mod interpolate;
pub mod parser;

pub use parser::{Package, parse_definitions, read_package};
