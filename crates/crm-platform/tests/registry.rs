//! Backends built through the registry behave the same behind
//! `Arc<dyn Platform>`.

use std::time::Duration;

use crm_core::*;
use crm_platform::*;
use crm_state::CacheSet;

fn init() -> PlatformInit {
    let caches = CacheSet::new();
    caches.flavors.update(
        Flavor {
            key: FlavorKey {
                name: "x1.medium".to_string(),
            },
            ram: 8192,
            vcpus: 4,
            disk: 80,
        },
        1,
    );
    PlatformInit {
        caches,
        cloudlet_key: CloudletKey::new("TMUS", "cloud2"),
        ..Default::default()
    }
}

#[tokio::test]
async fn fake_cluster_delete_is_idempotent() {
    let platform = new_platform("PLATFORM_TYPE_FAKEINFRA", init()).unwrap();
    let ci = ClusterInst {
        key: ClusterInstKey::new("c1", CloudletKey::new("TMUS", "cloud2"), "dev"),
        ..Default::default()
    };
    // Never created.
    platform.delete_cluster_inst(&ci).await.unwrap();

    platform
        .create_cluster_inst(&ci, Duration::from_secs(5))
        .await
        .unwrap();
    platform.delete_cluster_inst(&ci).await.unwrap();
    platform.delete_cluster_inst(&ci).await.unwrap();
}

#[tokio::test]
async fn xind_reports_cached_flavors() {
    let platform = new_platform("kind", init()).unwrap();
    let mut info = CloudletInfo::default();
    platform.gather_cloudlet_info(&mut info).await.unwrap();
    assert_eq!(info.flavors.len(), 1);
    assert_eq!(info.flavors[0].ram, 8192);
    assert_eq!(
        platform.list_load_balancers().await.unwrap(),
        vec!["localhost".to_string()]
    );
    assert!(platform.load_balancer_client("lb2").await.is_err());
}

#[tokio::test]
async fn fake_exec_command_uses_runtime_containers() {
    let platform = new_platform("fake", init()).unwrap();
    let cloudlet = CloudletKey::new("TMUS", "cloud2");
    let ci = ClusterInst {
        key: ClusterInstKey::new("c1", cloudlet.clone(), "dev"),
        deployment: DeploymentType::Docker,
        ..Default::default()
    };
    let app = App {
        key: AppKey::new("dev", "web", "1.0"),
        deployment: DeploymentType::Docker,
        image_path: "docker.io/library/nginx:1".to_string(),
        ..Default::default()
    };
    let mut inst = AppInst {
        key: AppInstKey {
            app_key: app.key.clone(),
            cluster_inst_key: ci.key.clone(),
        },
        ..Default::default()
    };
    inst.runtime_info = platform.app_inst_runtime(&ci, &app, &inst).await.unwrap();
    assert_eq!(inst.runtime_info.container_ids, vec!["web10".to_string()]);

    let req = ExecRequest {
        app_inst_key: inst.key.clone(),
        cmd: Some(RunCmd {
            command: "sh".to_string(),
        }),
        ..Default::default()
    };
    let cmd = platform.container_command(&ci, &app, &inst, &req).await.unwrap();
    assert_eq!(cmd, "docker exec -it web10 sh");
}
