//! Output generation: stored articles and the run report.
//!
//! # Submodules
//!
//! - [`storage`]: article text files plus the CSV index
//! - [`json`]: the JSON summary of a harvest run
//!
//! # Output Structure
//!
//! ```text
//! directory/
//! ├── 1a2b3c4d5e6f.txt
//! ├── …
//! ├── index.txt       # Id,URL,Author,Title
//! └── harvest.json    # HarvestReport
//! ```

pub mod json;
pub mod storage;
