pub mod emitter;
pub mod fanout;
pub mod graph;
pub mod orchestrator;
pub mod retention;
pub mod routing;
pub mod status;
