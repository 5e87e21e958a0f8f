//! Shared fixtures for unit tests

use crate::domain::model::*;

pub fn host(id: &str, cluster: &str) -> Host {
    Host {
        id: HostId::new(id),
        name: id.to_string(),
        cluster_id: ClusterId::new(cluster),
        hypervisor: HypervisorType::Kvm,
        address: format!("{}.lab.local", id),
        initiator: Some(format!("iqn.1994-05.com.redhat:{}", id)),
    }
}

pub fn pool(id: &str, managed: bool) -> StoragePool {
    StoragePool {
        id: PoolId::new(id),
        name: id.to_string(),
        pool_type: if managed {
            PoolType::Iscsi
        } else {
            PoolType::NetworkFilesystem
        },
        managed,
        scope: PoolScope::Zone,
        pod_id: Some(PodId::new("pod-1")),
        host_address: "10.0.0.5".into(),
        port: if managed { 3260 } else { 2049 },
        path: format!("/export/{}", id),
        capacity_bytes: 1000,
        used_bytes: 100,
        local_path: None,
    }
}

pub fn volume(id: &str, pool_id: &str) -> Volume {
    Volume {
        id: VolumeId::new(id),
        name: format!("{}-disk", id),
        size_bytes: 10 * 1024 * 1024 * 1024,
        format: VolumeFormat::Qcow2,
        pool_id: PoolId::new(pool_id),
        last_pool_id: None,
        path: Some(format!("/old/{}", id)),
        folder: None,
        pod_id: None,
        managed: false,
        locator: None,
    }
}

pub fn managed_volume(id: &str, pool_id: &str) -> Volume {
    Volume {
        managed: true,
        format: VolumeFormat::Raw,
        locator: Some(format!("iqn.2023-01.src:{}", id)),
        ..volume(id, pool_id)
    }
}

pub fn vm(id: &str) -> VirtualMachineDescriptor {
    VirtualMachineDescriptor {
        id: VmId::new(id),
        instance_name: format!("i-2-{}-VM", id),
        nics: vec![NicDescriptor {
            uuid: "nic-1".into(),
            mac: "02:00:00:00:00:01".into(),
            network: "guest-net".into(),
        }],
        disks: vec![],
    }
}
