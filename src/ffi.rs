//! C-compatible FFI that exposes a minimal surface for embedding.
//!
//! A host creates a node, optionally waits for it to join the network, then
//! calls [`cabi_node_identify`] with a peer id or multiaddr. The record comes
//! back as JSON in a caller-owned buffer; status lines produced along the way
//! are drained with [`cabi_node_next_progress`].

use std::{
    ffi::CStr,
    os::raw::{c_char, c_int},
    ptr,
    str::FromStr,
    sync::Mutex,
    time::Duration,
};

use anyhow::{Context, Result};
use libp2p::Multiaddr;
use tokio::{runtime::Runtime, task::JoinHandle, time::Instant};

type FfiResult<T> = std::result::Result<T, c_int>;

use crate::{
    config::{self, WorkflowConfig, DEFAULT_BOOTSTRAP_PEERS},
    error::{ErrorKind, IdentifyError},
    peer::{PeerManager, PeerManagerHandle, PeerReadinessGate},
    transport::TransportConfig,
    workflow::{IdentifyWorkflow, ProgressQueue, WorkflowEventSender},
};

/// Operation completed successfully.
pub const CABI_STATUS_SUCCESS: c_int = 0;
/// One of the provided pointers was null.
pub const CABI_STATUS_NULL_POINTER: c_int = 1;
/// Invalid argument supplied (e.g. malformed multiaddr or peer id).
pub const CABI_STATUS_INVALID_ARGUMENT: c_int = 2;
/// Internal runtime error – check logs for details.
pub const CABI_STATUS_INTERNAL_ERROR: c_int = 3;
/// The output buffer cannot hold the value; `written` holds the needed length.
pub const CABI_STATUS_BUFFER_TOO_SMALL: c_int = 4;
/// No progress line is waiting.
pub const CABI_STATUS_QUEUE_EMPTY: c_int = 5;
/// The DHT lookup did not finish before the deadline.
pub const CABI_STATUS_RESOLUTION_TIMEOUT: c_int = 10;
/// The DHT lookup finished without a dialable address.
pub const CABI_STATUS_RESOLUTION_FAILED: c_int = 11;
/// No connection was made before the deadline.
pub const CABI_STATUS_DIAL_TIMEOUT: c_int = 12;
/// Every candidate address failed to connect.
pub const CABI_STATUS_DIAL_FAILED: c_int = 13;
/// The identify response did not arrive before the deadline.
pub const CABI_STATUS_HANDSHAKE_TIMEOUT: c_int = 14;
/// The identify exchange was rejected or malformed.
pub const CABI_STATUS_HANDSHAKE_FAILED: c_int = 15;
/// The node found no peers within the readiness bound.
pub const CABI_STATUS_NOT_READY: c_int = 16;

/// Opaque handle that callers treat as an identifier for a running node.
#[repr(C)]
pub struct CabiNodeHandle {
    _private: [u8; 0],
}

/// Wrapper struct around the identify workflow and its tokio runtime
struct ManagedNode {
    runtime: Runtime,
    workflow: IdentifyWorkflow<PeerManagerHandle>,
    progress_sender: WorkflowEventSender,
    progress: Mutex<ProgressQueue>,
    worker: Option<JoinHandle<()>>,
}

impl ManagedNode {
    /// Creates a peer manager joined to the default bootstrap peers
    fn new(config: TransportConfig, workflow_config: WorkflowConfig) -> Result<Self> {
        let runtime = Runtime::new().context("failed to create tokio runtime")?;
        let bootstrap_peers = DEFAULT_BOOTSTRAP_PEERS
            .iter()
            .filter_map(|value| match value.parse::<Multiaddr>() {
                Ok(addr) => Some(addr),
                Err(err) => {
                    tracing::warn!(target: "ffi", %err, value, "invalid default bootstrap peer; skipping");
                    None
                }
            })
            .collect();

        // The swarm needs a runtime context for its tokio transports.
        let (manager, handle) = {
            let _guard = runtime.enter();
            PeerManager::new(config, bootstrap_peers)?
        };
        let worker = runtime.spawn(async move {
            if let Err(err) = manager.run().await {
                tracing::error!(target: "ffi", %err, "peer manager exited with error");
            }
        });

        let progress = ProgressQueue::new();
        Ok(Self {
            runtime,
            workflow: IdentifyWorkflow::new(handle, workflow_config),
            progress_sender: progress.sender(),
            progress: Mutex::new(progress),
            worker: Some(worker),
        })
    }

    /// Requests to start listening operation on provided address
    fn start_listening(&self, address: Multiaddr) -> Result<()> {
        self.runtime
            .block_on(self.workflow.node().start_listening(address))
            .context("failed to start listening")
    }

    fn await_readiness(&self, max_wait: Option<Duration>) -> std::result::Result<usize, IdentifyError> {
        match max_wait {
            None => self.runtime.block_on(self.workflow.await_readiness()),
            Some(max_wait) => {
                let gate = PeerReadinessGate::new(
                    self.workflow.node(),
                    self.workflow.config().readiness_poll_interval,
                )
                .with_max_wait(Some(max_wait));
                self.runtime.block_on(gate.await_readiness())
            }
        }
    }

    fn identify(&self, input: &str, timeout: Option<Duration>) -> std::result::Result<String, IdentifyError> {
        let record = self.runtime.block_on(async {
            let deadline = Instant::now() + timeout.unwrap_or(self.workflow.config().deadline);
            self.workflow
                .run_identify_until(input, deadline, &self.progress_sender)
                .await
        })?;

        record.to_json_pretty().map_err(|err| IdentifyError::HandshakeFailed {
            peer: record.peer_id.clone(),
            reason: format!("{err:#}"),
        })
    }

    fn next_progress(&self) -> Option<String> {
        let mut queue = match self.progress.lock() {
            Ok(queue) => queue,
            Err(poisoned) => poisoned.into_inner(),
        };
        queue.try_dequeue().map(|event| event.to_string())
    }

    /// Requests to gracefully shutdown peer manager and joins the background task
    fn shutdown(&mut self) {
        if let Err(err) = self.runtime.block_on(self.workflow.node().shutdown()) {
            tracing::warn!(target: "ffi", %err, "node shutdown request failed");
        }

        if let Some(worker) = self.worker.take() {
            self.runtime.block_on(async {
                if let Err(err) = worker.await {
                    tracing::warn!(target: "ffi", %err, "peer manager task join failed");
                }
            });
        }
    }
}

impl Drop for ManagedNode {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Maps a workflow failure onto its C status code.
pub fn status_for(kind: ErrorKind) -> c_int {
    match kind {
        ErrorKind::InvalidInput => CABI_STATUS_INVALID_ARGUMENT,
        ErrorKind::ResolutionTimeout => CABI_STATUS_RESOLUTION_TIMEOUT,
        ErrorKind::ResolutionFailed => CABI_STATUS_RESOLUTION_FAILED,
        ErrorKind::DialTimeout => CABI_STATUS_DIAL_TIMEOUT,
        ErrorKind::DialFailed => CABI_STATUS_DIAL_FAILED,
        ErrorKind::HandshakeTimeout => CABI_STATUS_HANDSHAKE_TIMEOUT,
        ErrorKind::HandshakeFailed => CABI_STATUS_HANDSHAKE_FAILED,
        ErrorKind::NotReady => CABI_STATUS_NOT_READY,
    }
}

#[no_mangle]
/// C-ABI. Inits tracing for the library in order to give more proper info on networking
pub extern "C" fn cabi_init_tracing() -> c_int {
    match config::init_tracing() {
        Ok(_) => CABI_STATUS_SUCCESS,
        Err(err) => {
            eprintln!("peer-identify: failed to init tracing: {err:?}");
            CABI_STATUS_INTERNAL_ERROR
        }
    }
}

#[no_mangle]
/// C-ABI. Creates a new node instance and returns its handle, or null on failure.
/// Timings come from the `PEER_IDENTIFY_*` environment variables.
pub extern "C" fn cabi_node_new(use_quic: bool) -> *mut CabiNodeHandle {
    // Safe to call multiple times; only the first invocation sets up tracing.
    let _ = config::init_tracing();

    let workflow_config = match WorkflowConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(target: "ffi", err = %format!("{err:#}"), "invalid workflow configuration");
            return ptr::null_mut();
        }
    };

    match ManagedNode::new(TransportConfig::new(use_quic), workflow_config) {
        Ok(node) => Box::into_raw(Box::new(node)) as *mut CabiNodeHandle,
        Err(err) => {
            tracing::error!(target: "ffi", %err, "failed to create node");
            ptr::null_mut()
        }
    }
}

#[no_mangle]
/// C-ABI. Inits listening on the given address
pub extern "C" fn cabi_node_listen(handle: *mut CabiNodeHandle, address: *const c_char) -> c_int {
    let node = match node_from_ptr(handle) {
        Ok(node) => node,
        Err(status) => return status,
    };

    let multiaddr = match read_c_str(address).and_then(parse_multiaddr) {
        Ok(addr) => addr,
        Err(status) => return status,
    };

    match node.start_listening(multiaddr) {
        Ok(_) => CABI_STATUS_SUCCESS,
        Err(err) => {
            tracing::error!(target: "ffi", %err, "start_listening failed");
            CABI_STATUS_INTERNAL_ERROR
        }
    }
}

#[no_mangle]
/// C-ABI. Writes the local peer id as a NUL-terminated string into `out`.
pub extern "C" fn cabi_node_local_peer_id(
    handle: *mut CabiNodeHandle,
    out: *mut c_char,
    out_len: usize,
    written: *mut usize,
) -> c_int {
    let node = match node_from_ptr(handle) {
        Ok(node) => node,
        Err(status) => return status,
    };

    let peer_id = node.workflow.node().local_peer_id().to_string();
    write_c_string(&peer_id, out, out_len, written)
}

#[no_mangle]
/// C-ABI. Blocks until the node has at least one peer or `timeout_ms` elapses.
/// A `timeout_ms` of zero uses the configured readiness bound.
pub extern "C" fn cabi_node_await_ready(handle: *mut CabiNodeHandle, timeout_ms: u64) -> c_int {
    let node = match node_from_ptr(handle) {
        Ok(node) => node,
        Err(status) => return status,
    };

    let max_wait = (timeout_ms > 0).then(|| Duration::from_millis(timeout_ms));
    match node.await_readiness(max_wait) {
        Ok(_) => CABI_STATUS_SUCCESS,
        Err(err) => {
            tracing::warn!(target: "ffi", %err, "node not ready");
            status_for(err.kind())
        }
    }
}

#[no_mangle]
/// C-ABI. Identifies a peer id or multiaddr.
///
/// On success `out` receives the peer metadata as JSON. On failure it
/// receives the error message and the return value names the failed step.
/// A `timeout_ms` of zero uses the configured deadline.
pub extern "C" fn cabi_node_identify(
    handle: *mut CabiNodeHandle,
    input: *const c_char,
    timeout_ms: u64,
    out: *mut c_char,
    out_len: usize,
    written: *mut usize,
) -> c_int {
    let node = match node_from_ptr(handle) {
        Ok(node) => node,
        Err(status) => return status,
    };

    let input = match read_c_str(input) {
        Ok(input) => input,
        Err(status) => return status,
    };

    let timeout = (timeout_ms > 0).then(|| Duration::from_millis(timeout_ms));
    match node.identify(input, timeout) {
        Ok(json) => write_c_string(&json, out, out_len, written),
        Err(err) => {
            tracing::warn!(target: "ffi", %err, "identify failed");
            let _ = write_c_string(&err.to_string(), out, out_len, written);
            status_for(err.kind())
        }
    }
}

#[no_mangle]
/// C-ABI. Dequeues the oldest progress line produced by identify calls.
pub extern "C" fn cabi_node_next_progress(
    handle: *mut CabiNodeHandle,
    out: *mut c_char,
    out_len: usize,
    written: *mut usize,
) -> c_int {
    let node = match node_from_ptr(handle) {
        Ok(node) => node,
        Err(status) => return status,
    };

    match node.next_progress() {
        Some(line) => write_c_string(&line, out, out_len, written),
        None => CABI_STATUS_QUEUE_EMPTY,
    }
}

#[no_mangle]
/// C-ABI. Frees node with specified handle
pub extern "C" fn cabi_node_free(handle: *mut CabiNodeHandle) {
    if handle.is_null() {
        return;
    }

    unsafe {
        drop(Box::from_raw(handle as *mut ManagedNode));
    }
}

/// Converts pointer into node reference
fn node_from_ptr(handle: *mut CabiNodeHandle) -> FfiResult<&'static ManagedNode> {
    if handle.is_null() {
        return Err(CABI_STATUS_NULL_POINTER);
    }

    Ok(unsafe { &*(handle as *const ManagedNode) })
}

/// Borrows a C string as UTF-8.
fn read_c_str<'a>(value: *const c_char) -> FfiResult<&'a str> {
    if value.is_null() {
        return Err(CABI_STATUS_NULL_POINTER);
    }

    let c_str = unsafe { CStr::from_ptr(value) };
    c_str.to_str().map_err(|_| CABI_STATUS_INVALID_ARGUMENT)
}

fn parse_multiaddr(address: &str) -> FfiResult<Multiaddr> {
    Multiaddr::from_str(address).map_err(|_| CABI_STATUS_INVALID_ARGUMENT)
}

/// Copies `value` plus a trailing NUL into `out`. `written` always receives
/// the length without the NUL so callers can retry with a larger buffer.
fn write_c_string(value: &str, out: *mut c_char, out_len: usize, written: *mut usize) -> c_int {
    if out.is_null() {
        return CABI_STATUS_NULL_POINTER;
    }

    let bytes = value.as_bytes();
    if !written.is_null() {
        unsafe { *written = bytes.len() };
    }
    if bytes.len() >= out_len {
        return CABI_STATUS_BUFFER_TOO_SMALL;
    }

    unsafe {
        ptr::copy_nonoverlapping(bytes.as_ptr() as *const c_char, out, bytes.len());
        *out.add(bytes.len()) = 0;
    }
    CABI_STATUS_SUCCESS
}
