mod stub_connection;

pub use stub_connection::StubConnection;
pub use stub_transport::StubTransport;
