pub mod analysis;
pub mod artifact;
pub mod audit;
pub mod completion;
pub mod config;
pub mod errors;
pub mod forge_config;
pub mod logging;
pub mod oracle;
pub mod orchestrator;
pub mod synthesis;
pub mod util;
