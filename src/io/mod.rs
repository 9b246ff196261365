//! Thin collaborators around the model core: raster persistence, category
//! lookup tables, forcing series and report naming.

pub mod forcing;
pub mod report;
pub mod store;
pub mod tables;

pub use forcing::{Forcing, TimeSeries};
pub use report::{output_name, report_variables, Reporter};
pub use store::{AsciiGridStore, GridStore, MemoryStore};
pub use tables::{LandUseFields, LandUseTable, SoilFields, SoilTable};
