// Each integration test file is compiled as its own crate with its own copy
// of this module, so helpers unused by one of them would warn there.
#![allow(dead_code)]

use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use grpcmd_core::{ConnectionConfig, GrpcmdService};
pub use testserver::Reflection;

/// Start a test server in the current runtime and return its `host:port`.
pub async fn start_server(reflection: Reflection) -> String {
    testserver::spawn(reflection)
        .await
        .expect("failed to start testserver")
        .to_string()
}

pub fn test_config() -> ConnectionConfig {
    ConnectionConfig::default().with_connect_timeout(Duration::from_secs(10))
}

pub fn service() -> GrpcmdService {
    GrpcmdService::with_config(test_config())
}

/// The schema the test server is built from.
pub fn testserver_proto() -> String {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../testing/testserver/proto/testserver.proto")
        .canonicalize()
        .expect("testserver proto exists")
        .to_string_lossy()
        .into_owned()
}

/// A free localhost address nothing is listening on.
pub fn closed_address() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
    let address = listener.local_addr().expect("local addr").to_string();
    drop(listener);
    address
}

/// Output sink whose contents stay readable after it is handed away.
#[derive(Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
