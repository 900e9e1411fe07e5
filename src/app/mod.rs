pub mod cli;

pub use cli::run_cli;
