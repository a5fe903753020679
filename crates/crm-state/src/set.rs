//! CacheSet — every cache the CRM keeps, in one cloneable bundle.

use crm_core::*;

use crate::cache::Cache;
use crate::sync::SyncRegistry;

/// Controller-declared objects plus CRM-owned status objects.
#[derive(Clone, Default)]
pub struct CacheSet {
    pub cloudlets: Cache<Cloudlet>,
    pub flavors: Cache<Flavor>,
    pub apps: Cache<App>,
    pub app_insts: Cache<AppInst>,
    pub cluster_insts: Cache<ClusterInst>,
    pub trust_policies: Cache<TrustPolicy>,
    pub vm_pools: Cache<VmPool>,

    pub cloudlet_infos: Cache<CloudletInfo>,
    pub cluster_inst_infos: Cache<ClusterInstInfo>,
    pub app_inst_infos: Cache<AppInstInfo>,
}

impl CacheSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with controller objects as receive caches and status
    /// objects as send caches.
    pub fn registry(&self) -> SyncRegistry {
        let mut reg = SyncRegistry::new();
        reg.register_recv(&self.cloudlets);
        reg.register_recv(&self.flavors);
        reg.register_recv(&self.apps);
        reg.register_recv(&self.app_insts);
        reg.register_recv(&self.cluster_insts);
        reg.register_recv(&self.trust_policies);
        reg.register_recv(&self.vm_pools);

        reg.register_send(&self.cloudlet_infos);
        reg.register_send(&self.cluster_inst_infos);
        reg.register_send(&self.app_inst_infos);
        reg
    }

    /// AppInsts still referencing `cluster` (by real cluster key).
    pub fn app_insts_on_cluster(&self, cluster: &ClusterInstKey) -> Vec<AppInst> {
        self.app_insts
            .show(|inst| &inst.real_cluster_inst_key() == cluster)
    }

    /// Flavors as reported in CloudletInfo.
    pub fn flavor_infos(&self) -> Vec<FlavorInfo> {
        self.flavors.list().iter().map(FlavorInfo::from).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::SyncMessage;

    #[test]
    fn registry_wires_every_cache() {
        let caches = CacheSet::new();
        let reg = caches.registry();
        assert_eq!(reg.recv_kinds().len(), 7);
        assert_eq!(reg.send_kinds().len(), 3);

        let app = App {
            key: AppKey::new("dev", "app", "1"),
            ..Default::default()
        };
        reg.apply(SyncMessage::update(&app, 5).unwrap()).unwrap();
        assert!(caches.apps.contains(&app.key));
    }

    #[test]
    fn finds_app_insts_on_real_cluster() {
        let caches = CacheSet::new();
        let cloudlet = CloudletKey::new("TMUS", "cloud2");
        let real = ClusterInstKey::new("mt", cloudlet.clone(), "MobiledgeX");

        let mut inst = AppInst::default();
        inst.key.cluster_inst_key = ClusterInstKey::new("autocluster1", cloudlet, "MobiledgeX");
        inst.real_cluster_name = "mt".to_string();
        caches.app_insts.update(inst, 1);

        assert_eq!(caches.app_insts_on_cluster(&real).len(), 1);
    }
}
