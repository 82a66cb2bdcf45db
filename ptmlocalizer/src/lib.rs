mod args;
mod driver;
mod project;
mod write;

pub use args::*;
pub use driver::{PtmLocalizer, PtmLocalizerError};
pub use project::{Project, TabulatedSiteScorer};
pub use write::{write_json, LocalizationReport};
