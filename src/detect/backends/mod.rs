pub mod remote;
pub mod stub;

pub use remote::RemoteBackend;
pub use stub::StubBackend;
