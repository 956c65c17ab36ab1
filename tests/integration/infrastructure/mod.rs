pub mod assertions;
pub mod sut_harness;

pub use assertions::*;
pub use socket_framework::SocketTestUtils;
pub use sut_harness::{fixture_layout, RunningSut, SutTestHarness};
