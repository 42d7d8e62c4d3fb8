// Re-export dependencies potentially needed by consumers (like the agent binary)
pub use bollard;
pub use hostagent_common as common;

pub mod docker;
pub mod fake;
pub mod test_utils;

pub use docker::DockerRuntime;
pub use fake::{FakeOp, FakeRuntime};
