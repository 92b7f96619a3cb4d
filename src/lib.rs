pub mod api;
pub mod bpmn;
pub mod cli;
pub mod engine;
pub mod services;
pub mod storage;
