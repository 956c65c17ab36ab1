pub type Result<T> = color_eyre::eyre::Result<T>;

pub mod cgi_gateway;
pub mod cli;
pub mod errors;
pub mod fixtures;
pub mod http_probe;
pub mod raw_socket;
pub mod report;
pub mod signals;
pub mod suite;
pub mod supervisor;
pub mod timeout_scenarios;

#[cfg(test)]
mod test_support;

pub use errors::HarnessError;
