mod alignment_io;
mod engine;
mod error;
mod model;
mod score_files;
mod score_importer;
mod session;
mod tempo;
mod util;

pub use alignment_io::*;
pub use engine::process::*;
pub use engine::*;
pub use error::*;
pub use model::alignment::*;
pub use model::config::*;
pub use model::fraction::*;
pub use model::score::*;
pub use score_files::*;
pub use score_importer::*;
pub use session::*;
pub use tempo::*;
pub use util::*;
