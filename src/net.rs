use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tokio::io::AsyncWriteExt;

use crate::cmd;
use crate::error::AgentError;

/// Inclusive bounds of the IP-block pool.
pub const MIN_IP_BLOCK_ID: u16 = 10;
pub const MAX_IP_BLOCK_ID: u16 = 250;

/// Network identity derived from an IP-block id. The mapping is a pure
/// function: block `n` owns the /30 at `168.254.n.0`, the host keeps `.1`
/// on the tap device and the guest gets `.2`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmNetwork {
    pub block_id: u16,
    pub vm_ip: Ipv4Addr,
    pub tap_ip: Ipv4Addr,
    pub tap_name: String,
    pub cidr: u8,
}

pub fn network_for_block(block_id: u16) -> VmNetwork {
    debug_assert!((MIN_IP_BLOCK_ID..=MAX_IP_BLOCK_ID).contains(&block_id) || cfg!(test));
    let octet = block_id as u8;
    VmNetwork {
        block_id,
        vm_ip: Ipv4Addr::new(168, 254, octet, 2),
        tap_ip: Ipv4Addr::new(168, 254, octet, 1),
        tap_name: format!("hocustap{block_id}"),
        cidr: 30,
    }
}

impl VmNetwork {
    fn subnet(&self) -> String {
        format!("168.254.{}.0/{}", self.block_id as u8, self.cidr)
    }
}

#[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct BusyIpState {
    busy_ip_ids: Vec<u16>,
}

/// Hands out /30 block ids from a fixed pool and persists the busy set so
/// that no two VMs on this host ever share a subnet, across restarts
/// included.
pub struct IpBlockAllocator {
    state_path: PathBuf,
    min_id: u16,
    max_id: u16,
    busy: tokio::sync::Mutex<BTreeSet<u16>>,
}

impl IpBlockAllocator {
    pub async fn load(state_path: impl Into<PathBuf>) -> Result<Self> {
        Self::load_with_range(state_path, MIN_IP_BLOCK_ID, MAX_IP_BLOCK_ID).await
    }

    /// Same as [`load`](Self::load) with a custom pool range. Small pools
    /// are useful for exhaustion handling and in tests.
    pub async fn load_with_range(
        state_path: impl Into<PathBuf>,
        min_id: u16,
        max_id: u16,
    ) -> Result<Self> {
        let state_path = state_path.into();
        let busy = match tokio::fs::read(&state_path).await {
            Ok(bytes) => {
                let state: BusyIpState = serde_json::from_slice(&bytes).with_context(|| {
                    format!("busy ip file {} is corrupt", state_path.display())
                })?;
                for id in &state.busy_ip_ids {
                    if !(min_id..=max_id).contains(id) {
                        bail!(
                            "busy ip file {} contains out-of-range block id {id}",
                            state_path.display()
                        );
                    }
                }
                state.busy_ip_ids.into_iter().collect()
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeSet::new(),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("could not read {}", state_path.display()))
            }
        };
        Ok(Self {
            state_path,
            min_id,
            max_id,
            busy: tokio::sync::Mutex::new(busy),
        })
    }

    /// Reserves a free block id, persisting the busy set before returning
    /// it. Fails with [`AgentError::NoFreeIpBlock`] when the pool is
    /// exhausted.
    pub async fn allocate(&self) -> Result<u16> {
        let mut busy = self.busy.lock().await;
        let id = (self.min_id..=self.max_id)
            .find(|candidate| !busy.contains(candidate))
            .ok_or(AgentError::NoFreeIpBlock)?;
        busy.insert(id);
        self.persist(&busy).await?;
        tracing::debug!(block_id = id, "allocated ip block");
        Ok(id)
    }

    pub async fn release(&self, id: u16) -> Result<()> {
        let mut busy = self.busy.lock().await;
        if !busy.remove(&id) {
            tracing::warn!(block_id = id, "releasing ip block that was not busy");
        }
        self.persist(&busy).await?;
        tracing::debug!(block_id = id, "released ip block");
        Ok(())
    }

    pub async fn busy_ids(&self) -> Vec<u16> {
        self.busy.lock().await.iter().copied().collect()
    }

    //write-then-fsync-then-rename keeps the busy set crash consistent
    async fn persist(&self, busy: &BTreeSet<u16>) -> Result<()> {
        let state = BusyIpState {
            busy_ip_ids: busy.iter().copied().collect(),
        };
        let bytes = serde_json::to_vec_pretty(&state).context("could not encode busy ip state")?;

        let file_name = self
            .state_path
            .file_name()
            .context("busy ip file path has no file name")?
            .to_string_lossy();
        let tmp_path = self.state_path.with_file_name(format!("{file_name}.tmp"));

        let mut file = tokio::fs::File::create(&tmp_path)
            .await
            .with_context(|| format!("could not create {}", tmp_path.display()))?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp_path, &self.state_path)
            .await
            .context("could not move busy ip state into place")?;
        Ok(())
    }
}

/// Creates and configures the host side of a VM's network: a tap device
/// carrying the gateway address of the block's /30.
pub async fn create_tap_device(network: &VmNetwork) -> Result<()> {
    cmd::run_checked(&["ip", "tuntap", "add", &network.tap_name, "mode", "tap"]).await?;
    cmd::run_checked(&[
        "ip",
        "addr",
        "add",
        &format!("{}/{}", network.tap_ip, network.cidr),
        "dev",
        &network.tap_name,
    ])
    .await?;
    cmd::run_checked(&["ip", "link", "set", &network.tap_name, "up"]).await?;
    tracing::debug!(tap = %network.tap_name, "tap device up");
    Ok(())
}

pub async fn delete_tap_device(network: &VmNetwork) -> Result<()> {
    //public rules may or may not exist, drop them either way
    let _ = retract_from_network(network).await;
    cmd::run_checked(&["ip", "link", "del", &network.tap_name]).await
}

/// Flips a VM from host-only to publicly routable by allowing forwarding
/// for its tap and masquerading its /30.
pub async fn expose_to_network(network: &VmNetwork) -> Result<()> {
    cmd::run_checked(&[
        "iptables",
        "-t",
        "nat",
        "-A",
        "POSTROUTING",
        "-s",
        &network.subnet(),
        "-j",
        "MASQUERADE",
    ])
    .await?;
    cmd::run_checked(&["iptables", "-A", "FORWARD", "-i", &network.tap_name, "-j", "ACCEPT"])
        .await?;
    cmd::run_checked(&["iptables", "-A", "FORWARD", "-o", &network.tap_name, "-j", "ACCEPT"])
        .await?;
    tracing::info!(tap = %network.tap_name, vm_ip = %network.vm_ip, "vm network is now public");
    Ok(())
}

async fn retract_from_network(network: &VmNetwork) -> Result<()> {
    cmd::run_checked(&[
        "iptables",
        "-t",
        "nat",
        "-D",
        "POSTROUTING",
        "-s",
        &network.subnet(),
        "-j",
        "MASQUERADE",
    ])
    .await?;
    cmd::run_checked(&["iptables", "-D", "FORWARD", "-i", &network.tap_name, "-j", "ACCEPT"])
        .await?;
    cmd::run_checked(&["iptables", "-D", "FORWARD", "-o", &network.tap_name, "-j", "ACCEPT"])
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AgentError;

    fn state_file(dir: &tempfile::TempDir) -> PathBuf {
        dir.path().join("busy-ip-blocks.json")
    }

    #[test]
    fn block_mapping_is_pure_and_disjoint() {
        let a = network_for_block(10);
        let b = network_for_block(11);
        assert_eq!(a, network_for_block(10));
        assert_eq!(a.vm_ip, Ipv4Addr::new(168, 254, 10, 2));
        assert_eq!(a.tap_ip, Ipv4Addr::new(168, 254, 10, 1));
        assert_eq!(a.tap_name, "hocustap10");
        assert_eq!(a.cidr, 30);
        assert_ne!(a.vm_ip, b.vm_ip);
        assert_ne!(a.tap_name, b.tap_name);
    }

    #[tokio::test]
    async fn allocates_distinct_ids_under_concurrency() {
        let dir = tempfile::tempdir().unwrap();
        let allocator = IpBlockAllocator::load_with_range(state_file(&dir), 10, 30)
            .await
            .unwrap();

        let ids = futures::future::join_all((0..10).map(|_| allocator.allocate())).await;
        let ids: Vec<u16> = ids.into_iter().map(|id| id.unwrap()).collect();
        let unique: std::collections::HashSet<_> = ids.iter().copied().collect();
        assert_eq!(unique.len(), ids.len());
    }

    #[tokio::test]
    async fn pool_of_one_exhausts_and_recovers() {
        let dir = tempfile::tempdir().unwrap();
        let allocator = IpBlockAllocator::load_with_range(state_file(&dir), 10, 10)
            .await
            .unwrap();

        let held = allocator.allocate().await.unwrap();
        assert_eq!(held, 10);

        let second = allocator.allocate().await;
        let err = second.expect_err("pool of one should be exhausted");
        assert!(matches!(
            err.downcast_ref::<AgentError>(),
            Some(AgentError::NoFreeIpBlock)
        ));

        allocator.release(held).await.unwrap();
        assert_eq!(allocator.allocate().await.unwrap(), 10);
    }

    #[tokio::test]
    async fn busy_set_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = state_file(&dir);

        let first = IpBlockAllocator::load_with_range(&path, 10, 20).await.unwrap();
        let id = first.allocate().await.unwrap();
        drop(first);

        let second = IpBlockAllocator::load_with_range(&path, 10, 20).await.unwrap();
        assert_eq!(second.busy_ids().await, vec![id]);
        //the reloaded allocator must not hand the held block out again
        assert_ne!(second.allocate().await.unwrap(), id);
    }

    #[tokio::test]
    async fn release_empties_the_persisted_set() {
        let dir = tempfile::tempdir().unwrap();
        let path = state_file(&dir);

        let allocator = IpBlockAllocator::load_with_range(&path, 10, 20).await.unwrap();
        let id = allocator.allocate().await.unwrap();
        allocator.release(id).await.unwrap();

        let raw = tokio::fs::read(&path).await.unwrap();
        let state: BusyIpState = serde_json::from_slice(&raw).unwrap();
        assert!(state.busy_ip_ids.is_empty());
    }

    #[tokio::test]
    async fn corrupt_state_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = state_file(&dir);
        tokio::fs::write(&path, b"not json at all").await.unwrap();

        assert!(IpBlockAllocator::load_with_range(&path, 10, 20).await.is_err());
    }

    #[tokio::test]
    async fn out_of_range_busy_id_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = state_file(&dir);
        tokio::fs::write(&path, br#"{"busyIpIds": [900]}"#).await.unwrap();

        assert!(IpBlockAllocator::load_with_range(&path, 10, 20).await.is_err());
    }
}
