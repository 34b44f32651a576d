pub mod panel;
pub mod preprocess;

pub use panel::{build_panel_graph, panel_input, panel_schema};
pub use preprocess::{build_preprocess_graph, preprocess_input, preprocess_schema, two_stage};
