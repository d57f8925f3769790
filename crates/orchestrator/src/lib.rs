//! Per-task MicroVM Orchestrator: boots a Firecracker microVM wired to the
//! guest agent over vsock, ships a strategy payload, and waits for the
//! framed JSON result.
pub mod error;
pub mod naming;

use error::OrchestratorError;
use firecracker_sdk::FirecrackerBuilder;
use firecracker_sdk::dto::{BootSource, Drive, MachineConfiguration, Vsock};
use firecracker_sdk::firecracker::Firecracker;
use naming::VmNaming;
use shared::protocol;
use shared::rpc::ResultOutcome;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::net::UnixStream;
use tokio::time::timeout;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
const RESULT_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const MAX_CID_RETRIES: u32 = 3;

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub firecracker_binary: PathBuf,
    pub kernel_path: PathBuf,
    pub rootfs_path: PathBuf,
    pub agent_port: u32,
    pub vcpu_count: isize,
    pub mem_size_mib: isize,
}

impl RunConfig {
    pub fn from_shared(cfg: &shared::config::Config) -> Self {
        Self {
            firecracker_binary: cfg.firecracker_binary.clone().into(),
            kernel_path: cfg.kernel_path.clone().into(),
            rootfs_path: cfg.rootfs_path.clone().into(),
            agent_port: cfg.agent_port,
            vcpu_count: 1,
            mem_size_mib: 256,
        }
    }
}

/// Boot a microVM for `task_id`, send `payload_bytes` to the guest agent,
/// and wait for its framed JSON result. Never returns an `Err`, every
/// failure path is folded into [`ResultOutcome::Error`], matching the
/// contract's `run(...) -> ResultJSON`.
pub async fn run(
    task_id: &str,
    payload_bytes: &[u8],
    config: &RunConfig,
    deps_image_path: Option<&Path>,
    mut log_sink: impl FnMut(&str) + Send,
) -> ResultOutcome {
    match run_inner(task_id, payload_bytes, config, deps_image_path, &mut log_sink).await {
        Ok(outcome) => outcome,
        Err(e) => e.into_outcome(),
    }
}

async fn run_inner(
    task_id: &str,
    payload_bytes: &[u8],
    config: &RunConfig,
    deps_image_path: Option<&Path>,
    log_sink: &mut impl FnMut(&str),
) -> Result<ResultOutcome, OrchestratorError> {
    let mut retry = 0;
    let (mut guard, naming) = loop {
        let naming = VmNaming::derive(task_id, retry)
            .map_err(|e| OrchestratorError::InvalidTaskId(e.to_string()))?;
        let mut guard = CleanupGuard::pending(naming.clone());

        match boot(&naming, config, deps_image_path).await {
            Ok(vm) => {
                guard.attach(vm);
                break (guard, naming);
            }
            Err(e) if e.looks_like_vsock_rejection() && retry < MAX_CID_RETRIES => {
                guard.finish().await;
                log_sink(&format!(
                    "Guest CID {} rejected, retrying with a fresh derivation",
                    naming.guest_cid
                ));
                retry += 1;
                continue;
            }
            Err(e) => {
                guard.finish().await;
                return Err(e);
            }
        }
    };

    let result = drive_guest(&naming, config, payload_bytes, log_sink).await;
    guard.finish().await;
    result
}

async fn boot(
    naming: &VmNaming,
    config: &RunConfig,
    deps_image_path: Option<&Path>,
) -> Result<Firecracker, OrchestratorError> {
    for stale in [&naming.api_sock, &naming.vsock_uds] {
        let _ = tokio::fs::remove_file(stale).await;
    }

    let mut builder = FirecrackerBuilder::new(config.firecracker_binary.clone());
    builder
        .with_api_socket_path(Some(naming.api_sock.clone()))
        .with_log_file(Some(naming.vm_log.clone()));
    let mut vm = builder.build().map_err(|e| OrchestratorError::Boot(e.to_string()))?;

    vm.set_machine_config(MachineConfiguration {
        cpu_template: None,
        smt: Some(false),
        mem_size_mib: config.mem_size_mib,
        track_dirty_pages: None,
        vcpu_count: config.vcpu_count,
        huge_pages: None,
    })
    .map_err(|e| OrchestratorError::Config(e.to_string()))?;

    vm.set_boot_source(BootSource {
        boot_args: Some("console=ttyS0 reboot=k panic=1 pci=off init=/sbin/myinit".to_string()),
        initrd_path: None,
        kernel_image_path: config.kernel_path.to_string_lossy().to_string(),
    })
    .map_err(|e| OrchestratorError::Config(e.to_string()))?;

    vm.add_drive(Drive {
        drive_id: "rootfs".to_string(),
        partuuid: None,
        is_root_device: true,
        cache_type: None,
        is_read_only: Some(true),
        path_on_host: Some(config.rootfs_path.to_string_lossy().to_string()),
        rate_limiter: None,
        io_engine: None,
        socket: None,
    })
    .map_err(|e| OrchestratorError::Config(e.to_string()))?;

    if let Some(deps_path) = deps_image_path {
        vm.add_drive(Drive {
            drive_id: "deps".to_string(),
            partuuid: None,
            is_root_device: false,
            cache_type: None,
            is_read_only: Some(true),
            path_on_host: Some(deps_path.to_string_lossy().to_string()),
            rate_limiter: None,
            io_engine: None,
            socket: None,
        })
        .map_err(|e| OrchestratorError::Config(e.to_string()))?;
    }

    vm.set_vsock(Vsock {
        guest_cid: naming.guest_cid as isize,
        uds_path: naming.vsock_uds.to_string_lossy().to_string(),
        vsock_id: None,
    })
    .map_err(|e| OrchestratorError::Config(e.to_string()))?;

    vm.start(naming.api_sock.clone())
        .await
        .map_err(map_start_error)?;

    Ok(vm)
}

fn map_start_error(e: firecracker_sdk::firecracker::Error) -> OrchestratorError {
    use firecracker_sdk::firecracker::Error as FcError;
    match e {
        FcError::Process(io) => OrchestratorError::Boot(io.to_string()),
        FcError::CannotConnectApiSocket => {
            OrchestratorError::Boot("Firecracker exited immediately. Check vm.log.".to_string())
        }
        FcError::Api(api_err) => OrchestratorError::Config(format!("API Error: {api_err}")),
        FcError::InvalidState(m) => OrchestratorError::Config(m.to_string()),
        FcError::InvalidConfiguration(m) => OrchestratorError::Config(m),
        FcError::WaitForApi(m) => OrchestratorError::Boot(m),
    }
}

async fn drive_guest(
    naming: &VmNaming,
    config: &RunConfig,
    payload_bytes: &[u8],
    log_sink: &mut impl FnMut(&str),
) -> Result<ResultOutcome, OrchestratorError> {
    let mut stream = handshake(naming, config).await?;

    log_sink("Sending Strategy Payload...");
    protocol::write_terminated(&mut stream, payload_bytes).await?;

    log_sink("Executing Backtesting..");
    let body = match timeout(RESULT_TIMEOUT, protocol::read_frame(&mut stream)).await {
        Ok(Ok(body)) => body,
        Ok(Err(e)) => return Err(e.into()),
        Err(_) => return Err(OrchestratorError::Timeout),
    };
    log_sink("Backtest Completed Compiling Results..");

    let value: serde_json::Value = serde_json::from_slice(&body).map_err(|_| {
        let preview = String::from_utf8_lossy(&body[..body.len().min(100)]).to_string();
        OrchestratorError::Json(preview)
    })?;

    Ok(ResultOutcome::from_guest_json(value))
}

/// Repeatedly dial the host-side vsock UDS bridge and perform Firecracker's
/// `CONNECT <port>\n` handshake until the guest agent's proxy replies `OK`.
async fn handshake(naming: &VmNaming, config: &RunConfig) -> Result<UnixStream, OrchestratorError> {
    let deadline = Instant::now() + HANDSHAKE_TIMEOUT;

    loop {
        if Instant::now() >= deadline {
            return Err(OrchestratorError::Connection);
        }

        let Ok(mut stream) = UnixStream::connect(&naming.vsock_uds).await else {
            tokio::time::sleep(Duration::from_millis(200)).await;
            continue;
        };

        use tokio::io::AsyncWriteExt;
        if stream
            .write_all(format!("CONNECT {}\n", config.agent_port).as_bytes())
            .await
            .is_err()
        {
            tokio::time::sleep(Duration::from_millis(200)).await;
            continue;
        }

        let mut ack = [0u8; 1024];
        match stream.read(&mut ack).await {
            Ok(n) if contains_ok(&ack[..n]) => return Ok(stream),
            _ => {
                tokio::time::sleep(Duration::from_millis(200)).await;
                continue;
            }
        }
    }
}

fn contains_ok(buf: &[u8]) -> bool {
    buf.windows(2).any(|w| w == b"OK")
}

/// Guarantees teardown on every exit path: closes the client socket (via
/// `drive_guest` returning), kills and reaps the hypervisor if still alive,
/// and removes every host-side path this task allocated. Idempotent. Covers
/// a boot failure too: firecracker can have already created `api_sock` and
/// `vm_log` before its own `--api-sock` PUT sequence errors out, so the
/// guard is constructed before `boot()` is even attempted.
struct CleanupGuard {
    vm: Option<Firecracker>,
    naming: VmNaming,
    done: bool,
}

impl CleanupGuard {
    fn pending(naming: VmNaming) -> Self {
        Self { vm: None, naming, done: false }
    }

    fn attach(&mut self, vm: Firecracker) {
        self.vm = Some(vm);
    }

    async fn finish(&mut self) {
        if self.done {
            return;
        }
        self.done = true;

        if let Some(mut vm) = self.vm.take() {
            let _ = vm.shutdown().await;
        }

        for path in [&self.naming.api_sock, &self.naming.vsock_uds, &self.naming.vm_log] {
            let _ = tokio::fs::remove_file(path).await;
        }
    }
}

/// Best-effort fallback for when a task is cancelled or the process is
/// shutting down between boot and the explicit `finish().await` above.
/// Dropping `vm` here runs `Firecracker`'s own `Drop`, which `start_kill()`s
/// the process; this impl only needs to remove the leftover host paths,
/// synchronously, since `Drop` cannot `.await`.
impl Drop for CleanupGuard {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        self.done = true;

        self.vm.take();

        for path in [&self.naming.api_sock, &self.naming.vsock_uds, &self.naming.vm_log] {
            let _ = std::fs::remove_file(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contains_ok_matches_prefix() {
        assert!(contains_ok(b"OK 3\n"));
        assert!(!contains_ok(b"ERR\n"));
    }
}
