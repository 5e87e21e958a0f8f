//! Storage motion strategy
//!
//! Phases run strictly in sequence. Each remote phase goes through the
//! async dispatcher and is awaited before the next one is considered.

use super::{MigrationProtocol, MigrationReport, MotionState, MotionTracker, VolumeRelocation};
use crate::config::MotionConfig;
use crate::dispatch::AsyncCompletionDispatcher;
use crate::domain::model::{
    DetailKey, Host, MigrationPlan, PlannedMove, StoragePool, VirtualMachineDescriptor, Volume,
    VolumeId,
};
use crate::domain::ports::{AgentChannelRef, Repositories};
use crate::driver::{CreatedVolume, DriverRegistry};
use crate::error::{Error, Result};
use crate::metrics::MotionMetrics;
use crate::protocol::{
    expect_payload, Command, CommandKind, CompleteMigrationCommand, CompleteMigrationReply,
    Endpoint, ManagedStoragePoolCommand, ManagedStoragePoolReply, ReceiveMigrationCommand,
    ReceiveMigrationReply, ReplyPayload, SendMigrationCommand, SendMigrationReply,
    TargetLocator, VolumeFilerPair, VolumePath, VolumeTarget, WithinClusterMigrationCommand,
    WithinClusterMigrationReply, managed_target_details,
};
use prometheus::HistogramTimer;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// How well the strategy fits a pair of hosts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyPriority {
    Highest,
    CantHandle,
}

/// Managed volume provisioned on the destination ahead of the transfer
struct ProvisionedTarget {
    volume: Volume,
    pool: StoragePool,
    locator: String,
}

/// Migrates a running VM together with its volumes
pub struct StorageMotionStrategy {
    dispatcher: AsyncCompletionDispatcher,
    drivers: Arc<DriverRegistry>,
    repos: Repositories,
    config: MotionConfig,
    metrics: Option<Arc<MotionMetrics>>,
}

impl StorageMotionStrategy {
    pub fn new(
        channel: AgentChannelRef,
        drivers: Arc<DriverRegistry>,
        repos: Repositories,
        config: MotionConfig,
        metrics: Option<Arc<MotionMetrics>>,
    ) -> Self {
        Self {
            dispatcher: AsyncCompletionDispatcher::new(channel),
            drivers,
            repos,
            config,
            metrics,
        }
    }

    pub fn can_handle(&self, source: &Host, destination: &Host) -> StrategyPriority {
        if self.config.require_same_hypervisor && source.hypervisor != destination.hypervisor {
            debug!(
                "Hosts {} ({}) and {} ({}) run different hypervisors",
                source.id, source.hypervisor, destination.id, destination.hypervisor
            );
            return StrategyPriority::CantHandle;
        }
        if !source.hypervisor.supports_storage_motion()
            || !destination.hypervisor.supports_storage_motion()
        {
            return StrategyPriority::CantHandle;
        }
        StrategyPriority::Highest
    }

    /// Migrate `vm` from `source` to `destination`, moving every volume in
    /// `plan` to its destination pool.
    ///
    /// Either every volume is relocated and its record updated, or the
    /// migration fails as a unit with one error.
    pub async fn migrate_vm_with_volumes(
        &self,
        vm: &VirtualMachineDescriptor,
        source: &Host,
        destination: &Host,
        plan: &MigrationPlan,
    ) -> Result<MigrationReport> {
        let protocol = if source.shares_cluster_with(destination) {
            MigrationProtocol::WithinCluster
        } else {
            MigrationProtocol::CrossCluster
        };
        info!(
            "Migrating vm {} with {} volume(s) from {} to {} ({})",
            vm.id,
            plan.len(),
            source.id,
            destination.id,
            protocol
        );

        let mut tracker = MotionTracker::new();
        let outcome = match protocol {
            MigrationProtocol::WithinCluster => {
                self.migrate_within_cluster(&mut tracker, vm, destination, plan)
                    .await
            }
            MigrationProtocol::CrossCluster => {
                self.migrate_across_clusters(&mut tracker, vm, source, destination, plan)
                    .await
            }
        };

        if let Some(metrics) = &self.metrics {
            metrics.record_migration(protocol.as_str(), outcome.is_ok());
        }

        match outcome {
            Ok(relocations) => {
                info!("Migrated vm {} to {}", vm.id, destination.id);
                Ok(MigrationReport {
                    vm_id: vm.id.clone(),
                    protocol,
                    relocations,
                    states: tracker.history().to_vec(),
                })
            }
            Err(e) => {
                error!(
                    "Migration of vm {} failed during {}: {}",
                    vm.id,
                    tracker.state(),
                    e
                );
                tracker.fail();
                Err(e)
            }
        }
    }

    /// Reject the plan if any managed volume, or any volume headed for
    /// managed storage, still has snapshots that are not destroyed
    pub async fn check_snapshot_preconditions(&self, plan: &MigrationPlan) -> Result<()> {
        for planned in plan
            .moves
            .iter()
            .filter(|m| m.volume.managed || m.destination.managed)
        {
            let snapshots = self.repos.snapshots.list_by_volume(&planned.volume.id).await?;
            let live = snapshots.iter().filter(|s| s.is_live()).count();
            if live > 0 {
                return Err(Error::PreconditionViolation {
                    volume: planned.volume.id.to_string(),
                    reason: format!(
                        "{} snapshot(s) not destroyed; managed volumes with snapshots cannot be migrated",
                        live
                    ),
                });
            }
        }
        Ok(())
    }

    // =========================================================================
    // Within-cluster protocol
    // =========================================================================

    async fn migrate_within_cluster(
        &self,
        tracker: &mut MotionTracker,
        vm: &VirtualMachineDescriptor,
        destination: &Host,
        plan: &MigrationPlan,
    ) -> Result<Vec<VolumeRelocation>> {
        tracker.advance(MotionState::ValidatingPreconditions)?;
        self.check_snapshot_preconditions(plan).await?;

        tracker.advance(MotionState::Migrating)?;
        let command = Command::WithinClusterMigration(WithinClusterMigrationCommand {
            vm: vm.clone(),
            volumes: plan
                .moves
                .iter()
                .map(|m| VolumeFilerPair {
                    volume: (&m.volume).into(),
                    filer: (&m.destination).into(),
                })
                .collect(),
        });
        let timer = self.phase_timer("within_cluster");
        let reply: WithinClusterMigrationReply =
            self.exchange(command, destination, vm, destination).await?;
        drop(timer);

        tracker.advance(MotionState::Finalizing)?;
        let paths = final_paths(
            plan,
            &reply.volume_paths,
            CommandKind::WithinClusterMigration,
        )?;

        let updated = plan
            .moves
            .iter()
            .map(|planned| {
                let mut updated = planned.volume.placed_on(&planned.destination);
                updated.folder = Some(planned.destination.path.clone());
                updated.pod_id = planned.destination.pod_id.clone();
                updated
            })
            .collect();
        let relocations = self.commit(plan, updated, paths).await?;

        tracker.advance(MotionState::Done)?;
        Ok(relocations)
    }

    // =========================================================================
    // Cross-cluster protocol
    // =========================================================================

    async fn migrate_across_clusters(
        &self,
        tracker: &mut MotionTracker,
        vm: &VirtualMachineDescriptor,
        source: &Host,
        destination: &Host,
        plan: &MigrationPlan,
    ) -> Result<Vec<VolumeRelocation>> {
        tracker.advance(MotionState::ValidatingPreconditions)?;
        self.check_snapshot_preconditions(plan).await?;

        // A failure here is not rolled back; targets provisioned so far stay.
        tracker.advance(MotionState::ProvisioningManagedTargets)?;
        let timer = self.phase_timer("provision");
        let mut provisioned: Vec<ProvisionedTarget> = Vec::new();
        let mut targets = Vec::with_capacity(plan.len());
        for planned in &plan.moves {
            let target = if planned.destination.managed {
                let target = self
                    .provision_managed_target(vm, planned, destination)
                    .await?;
                let locator = TargetLocator::Managed {
                    locator: target.locator.clone(),
                };
                provisioned.push(target);
                locator
            } else {
                TargetLocator::Filer((&planned.destination).into())
            };
            targets.push(VolumeTarget {
                volume: (&planned.volume).into(),
                target,
            });
        }
        drop(timer);

        tracker.advance(MotionState::AwaitingDestinationReady)?;
        let receive = Command::ReceiveMigration(ReceiveMigrationCommand {
            vm: vm.clone(),
            volumes: targets,
        });
        let timer = self.phase_timer("receive");
        let outcome: Result<ReceiveMigrationReply> =
            self.exchange(receive, destination, vm, destination).await;
        drop(timer);
        let received = match outcome {
            Ok(received) => received,
            Err(e) => {
                return Err(self
                    .roll_back(tracker, vm, destination, &provisioned, e)
                    .await)
            }
        };
        debug!(
            "Destination {} accepted vm {} (token {}, {} handle(s))",
            destination.id,
            vm.id,
            received.token,
            received.target_handles.len()
        );

        tracker.advance(MotionState::Migrating)?;
        let send = Command::SendMigration(SendMigrationCommand {
            vm: vm.clone(),
            target_handles: received.target_handles,
            nic_networks: received.nic_networks,
            token: received.token,
        });
        let timer = self.phase_timer("send");
        let outcome: Result<SendMigrationReply> =
            self.exchange(send, source, vm, destination).await;
        drop(timer);
        if let Err(e) = outcome {
            return Err(self
                .roll_back(tracker, vm, destination, &provisioned, e)
                .await);
        }

        tracker.advance(MotionState::Completing)?;
        let complete = Command::CompleteMigration(CompleteMigrationCommand { vm: vm.clone() });
        let timer = self.phase_timer("complete");
        let completed: CompleteMigrationReply = self
            .exchange(complete, destination, vm, destination)
            .await
            .map_err(|e| {
                warn!(
                    "Complete failed for vm {}; {} managed target(s) on {} are left in place",
                    vm.id,
                    provisioned.len(),
                    destination.id
                );
                e
            })?;
        drop(timer);

        tracker.advance(MotionState::Finalizing)?;
        let paths = final_paths(plan, &completed.volume_paths, CommandKind::CompleteMigration)?;

        let updated = plan
            .moves
            .iter()
            .map(|planned| {
                let mut updated = planned.volume.placed_on(&planned.destination);
                if let Some(target) = provisioned.iter().find(|t| t.volume.id == planned.volume.id)
                {
                    updated.locator = Some(target.locator.clone());
                }
                updated
            })
            .collect();
        let relocations = self.commit(plan, updated, paths).await?;

        // Source copies go only once the records point at the destination
        for planned in plan.moves.iter().filter(|m| m.volume.managed) {
            self.clean_up_source(vm, &planned.volume, source, destination)
                .await;
        }

        tracker.advance(MotionState::Done)?;
        Ok(relocations)
    }

    /// Create the destination volume, grant the destination host access and
    /// associate the resulting target with that host
    async fn provision_managed_target(
        &self,
        vm: &VirtualMachineDescriptor,
        planned: &PlannedMove,
        destination: &Host,
    ) -> Result<ProvisionedTarget> {
        let pool = &planned.destination;
        let id = &planned.volume.id;
        let driver = self.drivers.for_pool(pool)?;

        let mut volume = planned.volume.placed_on(pool);
        let CreatedVolume {
            path,
            locator,
            size_bytes,
        } = driver.create_volume(&volume, pool).await?;
        volume.locator = Some(locator.unwrap_or_else(|| path.clone()));
        volume.path = Some(path);
        volume.size_bytes = size_bytes;
        self.repos.details.add(id, DetailKey::PreCreate, "true").await?;

        let locator = driver.grant_access(&volume, destination, pool).await?;
        self.repos
            .details
            .add(id, DetailKey::PreGrantAccess, "true")
            .await?;

        let association = Command::CreateManagedStoragePool(ManagedStoragePoolCommand {
            pool: pool.into(),
            details: managed_target_details(&locator, pool),
        });
        let _: ManagedStoragePoolReply = self
            .exchange(association, destination, vm, destination)
            .await?;
        self.repos
            .details
            .add(id, DetailKey::ResolvedLocator, &locator)
            .await?;

        info!(
            "Provisioned {} on pool {} for volume {}",
            locator, pool.id, id
        );
        Ok(ProvisionedTarget {
            volume,
            pool: pool.clone(),
            locator,
        })
    }

    /// Undo destination provisioning and hand back the error that caused it
    async fn roll_back(
        &self,
        tracker: &mut MotionTracker,
        vm: &VirtualMachineDescriptor,
        destination: &Host,
        provisioned: &[ProvisionedTarget],
        cause: Error,
    ) -> Error {
        if let Err(e) = tracker.advance(MotionState::RollingBack) {
            warn!("{}", e);
        }
        if !provisioned.is_empty() {
            warn!(
                "Releasing {} managed target(s) on {} for vm {}",
                provisioned.len(),
                destination.id,
                vm.id
            );
        }

        for target in provisioned {
            let id = &target.volume.id;
            let release = Command::DeleteManagedStoragePool(ManagedStoragePoolCommand {
                pool: (&target.pool).into(),
                details: managed_target_details(&target.locator, &target.pool),
            });
            let released = self
                .exchange::<ManagedStoragePoolReply>(release, destination, vm, destination)
                .await
                .map(|_| true);
            let ok = self.best_effort(id, "remove storage association", released);
            self.record_compensation(ok);

            let driver = match self.drivers.for_pool(&target.pool) {
                Ok(driver) => driver,
                Err(e) => {
                    self.best_effort(id, "resolve driver", Err(e));
                    continue;
                }
            };
            let revoked = driver
                .revoke_access(&target.volume, destination, &target.pool)
                .await;
            let ok = self.best_effort(id, "revoke access", revoked);
            self.record_compensation(ok);

            let deleted = driver.delete_volume(&target.volume, &target.pool).await;
            let ok = self.best_effort(id, "delete volume", deleted);
            self.record_compensation(ok);
        }
        cause
    }

    /// Tear down the managed volume left behind on the source
    async fn clean_up_source(
        &self,
        vm: &VirtualMachineDescriptor,
        volume: &Volume,
        source: &Host,
        destination: &Host,
    ) {
        let id = &volume.id;
        let pool = match self.repos.pools.get(&volume.pool_id).await {
            Ok(Some(pool)) => pool,
            Ok(None) => {
                let missing = Error::ResourceNotFound {
                    kind: "StoragePool".into(),
                    name: volume.pool_id.to_string(),
                };
                self.best_effort(id, "resolve source pool", Err(missing));
                return;
            }
            Err(e) => {
                self.best_effort(id, "resolve source pool", Err(e));
                return;
            }
        };
        let driver = match self.drivers.for_pool(&pool) {
            Ok(driver) => driver,
            Err(e) => {
                self.best_effort(id, "resolve source driver", Err(e));
                return;
            }
        };

        if let Some(locator) = &volume.locator {
            let release = Command::DeleteManagedStoragePool(ManagedStoragePoolCommand {
                pool: (&pool).into(),
                details: managed_target_details(locator, &pool),
            });
            let released = self
                .exchange::<ManagedStoragePoolReply>(release, source, vm, destination)
                .await
                .map(|_| true);
            self.best_effort(id, "remove stale storage association", released);
        }

        let revoked = driver.revoke_access(volume, source, &pool).await;
        if self.best_effort(id, "revoke source access", revoked) {
            self.note(id, DetailKey::PostRevokeAccess, "true").await;
        }

        self.note(id, DetailKey::PostDelete, "true").await;
        let deleted = driver.delete_volume(volume, &pool).await;
        if !self.best_effort(id, "delete source volume", deleted) {
            self.note(id, DetailKey::DeleteFailure, "true").await;
        }
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    /// Run one remote phase to completion and extract its payload
    async fn exchange<P: ReplyPayload>(
        &self,
        command: Command,
        host: &Host,
        vm: &VirtualMachineDescriptor,
        destination: &Host,
    ) -> Result<P> {
        let kind = command.kind();
        let endpoint = Endpoint::for_host(host);
        debug!("Sending {} for vm {} to {}", kind, vm.id, endpoint);

        let reply = self
            .dispatcher
            .dispatch_and_wait(command, endpoint, (), |reply, _: &()| reply)
            .await?;
        expect_payload(kind, reply, || {
            format!(
                "Error while migrating the vm {} to host {}",
                vm.id, destination.id
            )
        })
        .map_err(|e| {
            error!("{} for vm {} failed: {}", kind, vm.id, e);
            e
        })
    }

    /// Persist every relocated record in one write, in plan order
    async fn commit(
        &self,
        plan: &MigrationPlan,
        mut updated: Vec<Volume>,
        paths: Vec<String>,
    ) -> Result<Vec<VolumeRelocation>> {
        for (volume, path) in updated.iter_mut().zip(&paths) {
            volume.path = Some(path.clone());
        }
        self.repos.volumes.update_all(&updated).await?;

        let relocations = plan
            .moves
            .iter()
            .zip(updated)
            .zip(paths)
            .map(|((planned, volume), path)| {
                debug!("Volume {} now on pool {} at {}", volume.id, volume.pool_id, path);
                VolumeRelocation {
                    volume_id: volume.id,
                    previous_pool: planned.volume.pool_id.clone(),
                    new_pool: volume.pool_id,
                    path,
                }
            })
            .collect();
        Ok(relocations)
    }

    /// Log a failed cleanup step; `true` when the step succeeded
    fn best_effort(&self, volume_id: &VolumeId, step: &str, outcome: Result<bool>) -> bool {
        let reason = match outcome {
            Ok(true) => return true,
            Ok(false) => format!("{} refused", step),
            Err(e) => format!("{}: {}", step, e),
        };
        warn!(
            "{}",
            Error::Compensation {
                volume: volume_id.to_string(),
                reason,
            }
        );
        false
    }

    async fn note(&self, volume_id: &VolumeId, key: DetailKey, value: &str) {
        if let Err(e) = self.repos.details.add(volume_id, key, value).await {
            warn!("Failed to record {} for volume {}: {}", key, volume_id, e);
        }
    }

    fn record_compensation(&self, success: bool) {
        if let Some(metrics) = &self.metrics {
            metrics.record_compensation(success);
        }
    }

    fn phase_timer(&self, phase: &str) -> Option<HistogramTimer> {
        self.metrics.as_ref().map(|m| m.phase_timer(phase))
    }
}

/// Final path of every planned volume, in plan order
fn final_paths(
    plan: &MigrationPlan,
    reported: &[VolumePath],
    command: CommandKind,
) -> Result<Vec<String>> {
    plan.moves
        .iter()
        .map(|planned| {
            reported
                .iter()
                .find(|p| p.volume_id == planned.volume.id)
                .map(|p| p.path.clone())
                .ok_or_else(|| Error::RemoteOperation {
                    command: command.to_string(),
                    detail: format!("no final path reported for volume {}", planned.volume.id),
                })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::mock::MockAgentChannel;
    use crate::config::DriverConfig;
    use crate::domain::model::{HostId, HypervisorType, PoolId, Snapshot, SnapshotState};
    use crate::driver::managed::fake::{BackendCall, FakeManagedClient};
    use crate::driver::{ManagedPrimaryDriver, StaticEndpointSelector};
    use crate::inventory::Inventory;
    use crate::protocol::{Answer, RemoteReply, VolumeTargetHandle};
    use crate::testing::{host, managed_volume, pool, vm, volume};
    use assert_matches::assert_matches;
    use prometheus::Registry;
    use std::collections::BTreeMap;

    struct Harness {
        channel: MockAgentChannel,
        inventory: Arc<Inventory>,
        source_backend: Arc<FakeManagedClient>,
        dest_backend: Arc<FakeManagedClient>,
        metrics: Arc<MotionMetrics>,
        strategy: StorageMotionStrategy,
    }

    fn harness() -> Harness {
        harness_with(FakeManagedClient::new("iqn.2024-01.test"))
    }

    /// h1 and h3 share cluster c1, h2 sits in c2
    fn harness_with(dest_backend: FakeManagedClient) -> Harness {
        let channel = MockAgentChannel::new();
        let inventory = Arc::new(Inventory::new());
        for h in [host("h1", "c1"), host("h2", "c2"), host("h3", "c1")] {
            inventory.insert_host(h);
        }
        for p in [
            pool("p1", false),
            pool("p2", false),
            pool("m-src", true),
            pool("m-dst", true),
        ] {
            inventory.insert_pool(p);
        }

        let channel_ref: AgentChannelRef = Arc::new(channel.clone());
        let registry = DriverRegistry::new(
            channel_ref.clone(),
            Arc::new(StaticEndpointSelector::new(vec![])),
            &DriverConfig::default(),
        );
        let source_backend = Arc::new(FakeManagedClient::new("iqn.2023-01.src"));
        let dest_backend = Arc::new(dest_backend);
        registry.register_managed(
            PoolId::new("m-src"),
            Arc::new(ManagedPrimaryDriver::new(source_backend.clone())),
        );
        registry.register_managed(
            PoolId::new("m-dst"),
            Arc::new(ManagedPrimaryDriver::new(dest_backend.clone())),
        );

        let metrics = Arc::new(MotionMetrics::new(&Registry::new()).unwrap());
        let strategy = StorageMotionStrategy::new(
            channel_ref,
            Arc::new(registry),
            inventory.repositories(),
            MotionConfig::default(),
            Some(metrics.clone()),
        );

        Harness {
            channel,
            inventory,
            source_backend,
            dest_backend,
            metrics,
            strategy,
        }
    }

    /// Managed volume named so the destination backend assigns
    /// `iqn.2024-01.test:vol1`
    fn managed_source_volume(h: &Harness) -> Volume {
        let vol = Volume {
            name: "vol1".into(),
            ..managed_volume("vol-1", "m-src")
        };
        h.inventory.insert_volume(vol.clone());
        vol
    }

    fn script_cross_cluster(channel: &MockAgentChannel) {
        script_cross_cluster_with_send(
            channel,
            Ok(Answer::success(SendMigrationReply::default())),
        );
    }

    fn script_cross_cluster_with_send(channel: &MockAgentChannel, send: RemoteReply) {
        channel
            .always(
                CommandKind::CreateManagedStoragePool,
                Ok(Answer::success(ManagedStoragePoolReply::default())),
            )
            .always(
                CommandKind::DeleteManagedStoragePool,
                Ok(Answer::success(ManagedStoragePoolReply::default())),
            )
            .reply(
                CommandKind::ReceiveMigration,
                Ok(Answer::success(ReceiveMigrationReply {
                    token: "T1".into(),
                    target_handles: vec![VolumeTargetHandle {
                        volume_id: VolumeId::new("vol-1"),
                        handle: "handle-1".into(),
                    }],
                    nic_networks: BTreeMap::from([("nic-1".into(), "guest-net-b".into())]),
                })),
            )
            .reply(CommandKind::SendMigration, send)
            .reply(
                CommandKind::CompleteMigration,
                Ok(Answer::success(CompleteMigrationReply {
                    volume_paths: vec![VolumePath {
                        volume_id: VolumeId::new("vol-1"),
                        path: "/mnt/v1".into(),
                    }],
                })),
            );
    }

    #[test]
    fn test_can_handle_by_hypervisor() {
        let h = harness();
        let kvm = host("h1", "c1");
        assert_eq!(
            h.strategy.can_handle(&kvm, &host("h2", "c2")),
            StrategyPriority::Highest
        );

        let mut xen = host("h2", "c2");
        xen.hypervisor = HypervisorType::XenServer;
        assert_eq!(h.strategy.can_handle(&kvm, &xen), StrategyPriority::CantHandle);

        let mut vmware = host("h2", "c2");
        vmware.hypervisor = HypervisorType::Vmware;
        let mut vmware_src = host("h1", "c1");
        vmware_src.hypervisor = HypervisorType::Vmware;
        assert_eq!(
            h.strategy.can_handle(&vmware_src, &vmware),
            StrategyPriority::CantHandle
        );
    }

    #[tokio::test]
    async fn test_within_cluster_single_round_trip() {
        let h = harness();
        h.inventory.insert_volume(volume("vol-1", "p1"));
        h.channel.reply(
            CommandKind::WithinClusterMigration,
            Ok(Answer::success(WithinClusterMigrationReply {
                volume_paths: vec![VolumePath {
                    volume_id: VolumeId::new("vol-1"),
                    path: "/data/v1".into(),
                }],
            })),
        );

        let plan = MigrationPlan::new().with_move(volume("vol-1", "p1"), pool("p2", false));
        let report = h
            .strategy
            .migrate_vm_with_volumes(&vm("vm-1"), &host("h1", "c1"), &host("h3", "c1"), &plan)
            .await
            .unwrap();

        assert_eq!(report.protocol, MigrationProtocol::WithinCluster);
        assert_eq!(report.states.last(), Some(&MotionState::Done));
        assert_eq!(h.channel.sent_kinds(), vec![CommandKind::WithinClusterMigration]);
        assert_eq!(
            h.channel.sent_to(&HostId::new("h3")),
            vec![CommandKind::WithinClusterMigration]
        );

        let stored = h.inventory.volume(&VolumeId::new("vol-1")).unwrap();
        assert_eq!(stored.pool_id, PoolId::new("p2"));
        assert_eq!(stored.path.as_deref(), Some("/data/v1"));
        assert_eq!(stored.last_pool_id, Some(PoolId::new("p1")));
        assert_eq!(stored.folder.as_deref(), Some("/export/p2"));
        assert_eq!(stored.pod_id, pool("p2", false).pod_id);
        assert_eq!(h.metrics.migrations("within_cluster", "success"), 1);
    }

    #[tokio::test]
    async fn test_cross_cluster_managed_migration() {
        let h = harness();
        let vol = managed_source_volume(&h);
        script_cross_cluster(&h.channel);

        let plan = MigrationPlan::new().with_move(vol, pool("m-dst", true));
        let report = h
            .strategy
            .migrate_vm_with_volumes(&vm("vm-1"), &host("h1", "c1"), &host("h2", "c2"), &plan)
            .await
            .unwrap();

        assert_eq!(report.protocol, MigrationProtocol::CrossCluster);
        assert_eq!(report.relocations[0].previous_pool, PoolId::new("m-src"));
        assert_eq!(report.relocations[0].path, "/mnt/v1");

        let stored = h.inventory.volume(&VolumeId::new("vol-1")).unwrap();
        assert_eq!(stored.pool_id, PoolId::new("m-dst"));
        assert_eq!(stored.path.as_deref(), Some("/mnt/v1"));
        assert_eq!(stored.last_pool_id, Some(PoolId::new("m-src")));
        assert_eq!(stored.locator.as_deref(), Some("iqn.2024-01.test:vol1"));

        // Cleanup of the old volume happened on the source only
        assert_eq!(
            h.source_backend.calls(),
            vec![
                BackendCall::Revoke(
                    "iqn.2023-01.src:vol-1".into(),
                    "iqn.1994-05.com.redhat:h1".into()
                ),
                BackendCall::Delete("iqn.2023-01.src:vol-1".into()),
            ]
        );
        assert_eq!(
            h.dest_backend.calls(),
            vec![
                BackendCall::Create("vol1".into()),
                BackendCall::Grant(
                    "iqn.2024-01.test:vol1".into(),
                    "iqn.1994-05.com.redhat:h2".into()
                ),
            ]
        );

        assert_eq!(
            h.channel.sent_to(&HostId::new("h2")),
            vec![
                CommandKind::CreateManagedStoragePool,
                CommandKind::ReceiveMigration,
                CommandKind::CompleteMigration,
            ]
        );
        assert_eq!(
            h.channel.sent_to(&HostId::new("h1")),
            vec![
                CommandKind::SendMigration,
                CommandKind::DeleteManagedStoragePool
            ]
        );

        let sent = h.channel.sent();
        let send = sent
            .iter()
            .find_map(|s| match &s.command {
                Command::SendMigration(cmd) => Some(cmd.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(send.token, "T1");
        assert_eq!(send.target_handles[0].handle, "handle-1");

        assert_eq!(
            h.inventory.detail_keys(&VolumeId::new("vol-1")),
            vec![
                DetailKey::PreCreate,
                DetailKey::PreGrantAccess,
                DetailKey::ResolvedLocator,
                DetailKey::PostRevokeAccess,
                DetailKey::PostDelete,
            ]
        );
    }

    #[tokio::test]
    async fn test_receive_without_answer_compensates_destination() {
        let h = harness();
        let vol = managed_source_volume(&h);
        h.channel
            .always(
                CommandKind::CreateManagedStoragePool,
                Ok(Answer::success(ManagedStoragePoolReply::default())),
            )
            .always(
                CommandKind::DeleteManagedStoragePool,
                Ok(Answer::success(ManagedStoragePoolReply::default())),
            );

        let plan = MigrationPlan::new().with_move(vol.clone(), pool("m-dst", true));
        let err = h
            .strategy
            .migrate_vm_with_volumes(&vm("vm-1"), &host("h1", "c1"), &host("h2", "c2"), &plan)
            .await
            .unwrap_err();

        assert_matches!(err, Error::RemoteCommunication { .. });
        let message = err.to_string();
        assert!(message.contains("vm-1"), "{}", message);
        assert!(message.contains("h2"), "{}", message);

        assert_eq!(
            h.dest_backend.calls()[2..],
            [
                BackendCall::Revoke(
                    "iqn.2024-01.test:vol1".into(),
                    "iqn.1994-05.com.redhat:h2".into()
                ),
                BackendCall::Delete("iqn.2024-01.test:vol1".into()),
            ]
        );
        assert!(h.source_backend.calls().is_empty());
        assert_eq!(h.channel.count(CommandKind::SendMigration), 0);
        assert_eq!(h.channel.count(CommandKind::CompleteMigration), 0);
        assert_eq!(h.inventory.volume(&VolumeId::new("vol-1")), Some(vol));
        assert_eq!(h.metrics.compensations("success"), 3);
        assert_eq!(h.metrics.migrations("cross_cluster", "failure"), 1);
    }

    #[tokio::test]
    async fn test_send_rejection_compensates_and_skips_complete() {
        let h = harness();
        let vol = managed_source_volume(&h);
        script_cross_cluster_with_send(
            &h.channel,
            Ok(Answer::failure("host h1 refused migration")),
        );

        let plan = MigrationPlan::new().with_move(vol, pool("m-dst", true));
        let err = h
            .strategy
            .migrate_vm_with_volumes(&vm("vm-1"), &host("h1", "c1"), &host("h2", "c2"), &plan)
            .await
            .unwrap_err();

        assert_matches!(err, Error::RemoteOperation { ref detail, .. }
            if detail == "host h1 refused migration");
        assert_eq!(h.channel.count(CommandKind::CompleteMigration), 0);
        assert_eq!(h.dest_backend.calls().len(), 4);
    }

    #[tokio::test]
    async fn test_complete_failure_is_not_compensated() {
        let h = harness();
        let vol = managed_source_volume(&h);
        h.channel
            .always(
                CommandKind::CreateManagedStoragePool,
                Ok(Answer::success(ManagedStoragePoolReply::default())),
            )
            .reply(
                CommandKind::ReceiveMigration,
                Ok(Answer::success(ReceiveMigrationReply {
                    token: "T1".into(),
                    target_handles: vec![],
                    nic_networks: BTreeMap::new(),
                })),
            )
            .reply(
                CommandKind::SendMigration,
                Ok(Answer::success(SendMigrationReply::default())),
            )
            .reply(
                CommandKind::CompleteMigration,
                Ok(Answer::failure("domain not found")),
            );

        let plan = MigrationPlan::new().with_move(vol.clone(), pool("m-dst", true));
        let err = h
            .strategy
            .migrate_vm_with_volumes(&vm("vm-1"), &host("h1", "c1"), &host("h2", "c2"), &plan)
            .await
            .unwrap_err();

        assert_matches!(err, Error::RemoteOperation { .. });
        assert_eq!(h.dest_backend.calls().len(), 2);
        assert_eq!(h.channel.count(CommandKind::DeleteManagedStoragePool), 0);
        assert_eq!(h.inventory.volume(&VolumeId::new("vol-1")), Some(vol));
        assert_eq!(h.metrics.compensations("success"), 0);
    }

    #[tokio::test]
    async fn test_live_snapshot_blocks_migration() {
        let h = harness();
        let vol = managed_source_volume(&h);
        h.inventory.insert_snapshot(Snapshot {
            id: "snap-1".into(),
            volume_id: vol.id.clone(),
            state: SnapshotState::BackedUp,
        });

        let plan = MigrationPlan::new().with_move(vol, pool("m-dst", true));
        let first = h.strategy.check_snapshot_preconditions(&plan).await;
        let second = h.strategy.check_snapshot_preconditions(&plan).await;
        assert_matches!(first, Err(Error::PreconditionViolation { .. }));
        assert_matches!(second, Err(Error::PreconditionViolation { .. }));

        let err = h
            .strategy
            .migrate_vm_with_volumes(&vm("vm-1"), &host("h1", "c1"), &host("h2", "c2"), &plan)
            .await
            .unwrap_err();
        assert_matches!(err, Error::PreconditionViolation { ref volume, .. } if volume == "vol-1");
        assert!(h.channel.sent().is_empty());
        assert!(h.dest_backend.calls().is_empty());
        assert_eq!(h.metrics.compensations("success"), 0);
    }

    #[tokio::test]
    async fn test_destroyed_snapshots_do_not_block() {
        let h = harness();
        let vol = managed_source_volume(&h);
        h.inventory.insert_snapshot(Snapshot {
            id: "snap-1".into(),
            volume_id: vol.id.clone(),
            state: SnapshotState::Destroyed,
        });

        let plan = MigrationPlan::new().with_move(vol, pool("m-dst", true));
        tokio_test::assert_ok!(h.strategy.check_snapshot_preconditions(&plan).await);
    }

    #[tokio::test]
    async fn test_missing_final_path_leaves_metadata_untouched() {
        let h = harness();
        h.inventory.insert_volume(volume("vol-1", "p1"));
        h.channel.reply(
            CommandKind::WithinClusterMigration,
            Ok(Answer::success(WithinClusterMigrationReply {
                volume_paths: vec![],
            })),
        );

        let plan = MigrationPlan::new().with_move(volume("vol-1", "p1"), pool("p2", false));
        let err = h
            .strategy
            .migrate_vm_with_volumes(&vm("vm-1"), &host("h1", "c1"), &host("h3", "c1"), &plan)
            .await
            .unwrap_err();

        assert_matches!(err, Error::RemoteOperation { ref command, .. }
            if command == "within_cluster_migration");
        assert_eq!(
            h.inventory.volume(&VolumeId::new("vol-1")),
            Some(volume("vol-1", "p1"))
        );
    }

    #[tokio::test]
    async fn test_unmanaged_cross_cluster_uses_filer_targets() {
        let h = harness();
        h.inventory.insert_volume(volume("vol-1", "p1"));
        script_cross_cluster(&h.channel);

        let plan = MigrationPlan::new().with_move(volume("vol-1", "p1"), pool("p2", false));
        let report = h
            .strategy
            .migrate_vm_with_volumes(&vm("vm-2"), &host("h1", "c1"), &host("h2", "c2"), &plan)
            .await
            .unwrap();

        assert_eq!(
            h.channel.sent_kinds(),
            vec![
                CommandKind::ReceiveMigration,
                CommandKind::SendMigration,
                CommandKind::CompleteMigration,
            ]
        );
        let sent = h.channel.sent();
        assert_matches!(&sent[0].command, Command::ReceiveMigration(cmd)
            if matches!(cmd.volumes[0].target, TargetLocator::Filer(_)));
        assert!(h.dest_backend.calls().is_empty());
        assert_eq!(report.relocations[0].new_pool, PoolId::new("p2"));
    }

    #[tokio::test]
    async fn test_failed_commit_writes_no_volume_record() {
        let h = harness();
        h.inventory.insert_volume(volume("vol-1", "p1"));
        h.channel.reply(
            CommandKind::WithinClusterMigration,
            Ok(Answer::success(WithinClusterMigrationReply {
                volume_paths: vec![
                    VolumePath {
                        volume_id: VolumeId::new("vol-1"),
                        path: "/data/v1".into(),
                    },
                    VolumePath {
                        volume_id: VolumeId::new("vol-2"),
                        path: "/data/v2".into(),
                    },
                ],
            })),
        );

        // vol-2 has no stored record, so its write fails
        let plan = MigrationPlan::new()
            .with_move(volume("vol-1", "p1"), pool("p2", false))
            .with_move(volume("vol-2", "p1"), pool("p2", false));
        let err = h
            .strategy
            .migrate_vm_with_volumes(&vm("vm-1"), &host("h1", "c1"), &host("h3", "c1"), &plan)
            .await
            .unwrap_err();

        assert_matches!(err, Error::ResourceNotFound { ref name, .. } if name == "vol-2");
        assert_eq!(
            h.inventory.volume(&VolumeId::new("vol-1")),
            Some(volume("vol-1", "p1"))
        );
        assert_eq!(h.metrics.migrations("within_cluster", "failure"), 1);
    }

    #[tokio::test]
    async fn test_source_survives_failed_commit() {
        let h = harness();
        // Never stored, so the final write fails after Complete
        let vol = Volume {
            name: "vol1".into(),
            ..managed_volume("vol-1", "m-src")
        };
        script_cross_cluster(&h.channel);

        let plan = MigrationPlan::new().with_move(vol, pool("m-dst", true));
        let err = h
            .strategy
            .migrate_vm_with_volumes(&vm("vm-1"), &host("h1", "c1"), &host("h2", "c2"), &plan)
            .await
            .unwrap_err();

        assert_matches!(err, Error::ResourceNotFound { ref name, .. } if name == "vol-1");
        assert_eq!(h.channel.count(CommandKind::CompleteMigration), 1);
        assert!(h.source_backend.calls().is_empty());
        assert_eq!(
            h.channel.sent_to(&HostId::new("h1")),
            vec![CommandKind::SendMigration]
        );
    }

    #[tokio::test]
    async fn test_failed_revoke_during_rollback_keeps_cause() {
        let h = harness_with(FakeManagedClient::new("iqn.2024-01.test").with_failing_revoke());
        let vol = managed_source_volume(&h);
        h.channel
            .always(
                CommandKind::CreateManagedStoragePool,
                Ok(Answer::success(ManagedStoragePoolReply::default())),
            )
            .always(
                CommandKind::DeleteManagedStoragePool,
                Ok(Answer::success(ManagedStoragePoolReply::default())),
            );

        let plan = MigrationPlan::new().with_move(vol.clone(), pool("m-dst", true));
        let err = h
            .strategy
            .migrate_vm_with_volumes(&vm("vm-1"), &host("h1", "c1"), &host("h2", "c2"), &plan)
            .await
            .unwrap_err();

        assert_matches!(err, Error::RemoteCommunication { .. });
        let message = err.to_string();
        assert!(message.contains("vm-1"), "{}", message);
        assert!(message.contains("h2"), "{}", message);

        // Delete is still attempted after the revoke error
        assert_eq!(
            h.dest_backend.calls()[2..],
            [
                BackendCall::Revoke(
                    "iqn.2024-01.test:vol1".into(),
                    "iqn.1994-05.com.redhat:h2".into()
                ),
                BackendCall::Delete("iqn.2024-01.test:vol1".into()),
            ]
        );
        assert_eq!(h.metrics.compensations("failure"), 1);
        assert_eq!(h.metrics.compensations("success"), 2);
        assert_eq!(h.inventory.volume(&VolumeId::new("vol-1")), Some(vol));
    }

    #[tokio::test]
    async fn test_failed_source_release_does_not_fail_migration() {
        let h = harness();
        let vol = managed_source_volume(&h);
        // No reply for the source release, so it is unreachable
        h.channel
            .always(
                CommandKind::CreateManagedStoragePool,
                Ok(Answer::success(ManagedStoragePoolReply::default())),
            )
            .reply(
                CommandKind::ReceiveMigration,
                Ok(Answer::success(ReceiveMigrationReply {
                    token: "T1".into(),
                    target_handles: vec![],
                    nic_networks: BTreeMap::new(),
                })),
            )
            .reply(
                CommandKind::SendMigration,
                Ok(Answer::success(SendMigrationReply::default())),
            )
            .reply(
                CommandKind::CompleteMigration,
                Ok(Answer::success(CompleteMigrationReply {
                    volume_paths: vec![VolumePath {
                        volume_id: VolumeId::new("vol-1"),
                        path: "/mnt/v1".into(),
                    }],
                })),
            );

        let plan = MigrationPlan::new().with_move(vol, pool("m-dst", true));
        let report = h
            .strategy
            .migrate_vm_with_volumes(&vm("vm-1"), &host("h1", "c1"), &host("h2", "c2"), &plan)
            .await
            .unwrap();

        assert_eq!(report.relocations[0].new_pool, PoolId::new("m-dst"));
        assert_eq!(h.channel.count(CommandKind::DeleteManagedStoragePool), 1);
        assert_eq!(h.source_backend.calls().len(), 2);
        assert_eq!(h.metrics.migrations("cross_cluster", "success"), 1);
    }
}
