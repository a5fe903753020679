//! Container-level commands for exec requests, and runtime discovery.
//!
//! Kubernetes container ids have the form `[namespace/]pod[/container]`.
//! Docker container ids are plain container names.

use crm_core::config::parse_duration;
use crm_core::sanitize::dns_sanitize;
use crm_core::{App, AppInst, AppInstRuntime, AppKey, DeploymentType, ExecRequest, KubeNames, ShowLog};
use tracing::debug;

use crate::client::PlatformClient;
use crate::error::{PlatformError, PlatformResult};

/// Name of the container a docker AppInst runs in.
pub fn docker_container_name(app_key: &AppKey) -> String {
    dns_sanitize(&format!("{}{}", app_key.name, app_key.version))
}

/// Command that serves `req` for an AppInst of any deployment type.
pub fn container_command(
    app: &App,
    app_inst: &AppInst,
    names: &KubeNames,
    req: &ExecRequest,
) -> PlatformResult<String> {
    match app.deployment {
        DeploymentType::Kubernetes | DeploymentType::Helm => {
            k8s_container_command(names, app_inst, req)
        }
        DeploymentType::Docker => docker_container_command(app_inst, req),
        other => Err(PlatformError::Unsupported(format!(
            "unsupported deployment type {other} for exec"
        ))),
    }
}

fn no_command() -> PlatformError {
    PlatformError::Invalid("no command or log specified with the exec request".into())
}

// ── Kubernetes ─────────────────────────────────────────────────────

#[derive(Debug, PartialEq)]
struct K8sTarget<'a> {
    namespace: &'a str,
    pod: &'a str,
    container: Option<&'a str>,
}

fn parse_container_id<'a>(id: &'a str, default_ns: &'a str) -> PlatformResult<K8sTarget<'a>> {
    let parts: Vec<&str> = id.split('/').collect();
    match parts.as_slice() {
        [pod] => Ok(K8sTarget {
            namespace: default_ns,
            pod,
            container: None,
        }),
        [pod, container] => Ok(K8sTarget {
            namespace: default_ns,
            pod,
            container: Some(container),
        }),
        [namespace, pod, container] => Ok(K8sTarget {
            namespace,
            pod,
            container: Some(container),
        }),
        _ => Err(PlatformError::Invalid(format!(
            "invalid containerID {id:?}, expected to be of format [namespace/]podname[/containername]"
        ))),
    }
}

pub fn k8s_container_command(
    names: &KubeNames,
    app_inst: &AppInst,
    req: &ExecRequest,
) -> PlatformResult<String> {
    let id = if req.container_id.is_empty() {
        app_inst
            .runtime_info
            .container_ids
            .first()
            .map(String::as_str)
            .ok_or_else(|| PlatformError::Invalid("no containers to run command in".into()))?
    } else {
        req.container_id.as_str()
    };
    let target = parse_container_id(id, names.namespace())?;

    if let Some(cmd) = &req.cmd {
        let container = target
            .container
            .map(|c| format!("-c {c} "))
            .unwrap_or_default();
        return Ok(format!(
            "{} kubectl exec -n {} -it {container}{} -- {}",
            names.kconf_env, target.namespace, target.pod, cmd.command
        ));
    }
    let Some(log) = &req.log else {
        return Err(no_command());
    };

    let mut cmd = format!("{} kubectl logs -n {} ", names.kconf_env, target.namespace);
    if !log.since.is_empty() {
        if parse_duration(&log.since).is_some() {
            cmd.push_str(&format!("--since={} ", log.since));
        } else {
            cmd.push_str(&format!("--since-time={} ", log.since));
        }
    }
    if log.tail != 0 {
        cmd.push_str(&format!("--tail={} ", log.tail));
    }
    if log.timestamps {
        cmd.push_str("--timestamps=true ");
    }
    if log.follow {
        cmd.push_str("-f ");
    }
    cmd.push_str(target.pod);
    match target.container {
        Some(c) => cmd.push_str(&format!(" -c {c}")),
        None => cmd.push_str(" --all-containers"),
    }
    Ok(cmd)
}

/// Running containers of a Kubernetes AppInst as `namespace/pod/container`.
pub async fn k8s_runtime(
    client: &dyn PlatformClient,
    names: &KubeNames,
    app: &App,
) -> PlatformResult<AppInstRuntime> {
    let mut runtime = AppInstRuntime::default();
    let workloads = match app.deployment {
        DeploymentType::Kubernetes => names.workloads(&app.deployment_manifest)?,
        _ => Vec::new(),
    };
    for workload in workloads {
        let cmd = format!(
            "{} kubectl get pods -n {} --no-headers --sort-by=.metadata.name --selector=mex-app={} \
             | awk '{{if ($3 == \"Running\") print $1}}'",
            names.kconf_env, workload.namespace, workload.name
        );
        let out = client.output(&cmd).await?;
        for pod in out.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let cmd = format!(
                "{} kubectl get pod {pod} -n {} -o jsonpath='{{.spec.containers[*].name}}'",
                names.kconf_env, workload.namespace
            );
            let containers = client.output(&cmd).await?;
            for container in containers.split_whitespace() {
                runtime
                    .container_ids
                    .push(format!("{}/{pod}/{container}", workload.namespace));
            }
        }
    }
    debug!(app = %names.app_name, containers = runtime.container_ids.len(), "k8s runtime");
    Ok(runtime)
}

// ── Docker ─────────────────────────────────────────────────────────

fn is_proxy_container(name: &str) -> bool {
    name.starts_with("nginx") || name.starts_with("envoy")
}

pub fn docker_container_command(app_inst: &AppInst, req: &ExecRequest) -> PlatformResult<String> {
    let id = if req.container_id.is_empty() {
        let ids = &app_inst.runtime_info.container_ids;
        ids.iter()
            .find(|id| !is_proxy_container(id))
            .or_else(|| ids.first())
            .map(String::as_str)
            .ok_or_else(|| {
                PlatformError::Invalid("no containers found for AppInst, please specify one".into())
            })?
    } else {
        req.container_id.as_str()
    };

    if let Some(cmd) = &req.cmd {
        return Ok(format!("docker exec -it {id} {}", cmd.command));
    }
    let Some(log) = &req.log else {
        return Err(no_command());
    };
    Ok(docker_logs(id, log))
}

fn docker_logs(id: &str, log: &ShowLog) -> String {
    let mut cmd = String::from("docker logs ");
    if !log.since.is_empty() {
        cmd.push_str(&format!("--since {} ", log.since));
    }
    if log.tail != 0 {
        cmd.push_str(&format!("--tail {} ", log.tail));
    }
    if log.timestamps {
        cmd.push_str("--timestamps ");
    }
    if log.follow {
        cmd.push_str("--follow ");
    }
    cmd.push_str(id);
    cmd
}

/// Running containers of a docker AppInst. Falls back to the expected
/// container name when nothing matches.
pub async fn docker_runtime(
    client: &dyn PlatformClient,
    app: &App,
) -> PlatformResult<AppInstRuntime> {
    let name = docker_container_name(&app.key);
    let cmd = format!("docker ps --format \"{{{{.Names}}}}\" --filter name={name}");
    let out = client.output(&cmd).await?;
    let mut container_ids: Vec<String> = out
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect();
    if container_ids.is_empty() {
        container_ids.push(name);
    }
    Ok(AppInstRuntime { container_ids })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crm_core::RunCmd;

    fn names() -> KubeNames {
        KubeNames {
            kconf_env: "KUBECONFIG=c1.operorg.kubeconfig".to_string(),
            ..Default::default()
        }
    }

    fn inst(ids: &[&str]) -> AppInst {
        let mut inst = AppInst::default();
        inst.runtime_info.container_ids = ids.iter().map(|s| s.to_string()).collect();
        inst
    }

    fn run(cmd: &str) -> ExecRequest {
        ExecRequest {
            cmd: Some(RunCmd {
                command: cmd.to_string(),
            }),
            ..Default::default()
        }
    }

    #[test]
    fn container_id_forms() {
        assert_eq!(
            parse_container_id("ns1/pod1/c1", "default").unwrap(),
            K8sTarget {
                namespace: "ns1",
                pod: "pod1",
                container: Some("c1")
            }
        );
        assert_eq!(parse_container_id("pod1", "default").unwrap().namespace, "default");
        let err = parse_container_id("a/b/c/d", "default").unwrap_err();
        assert!(err.to_string().contains("invalid containerID"));
    }

    #[test]
    fn k8s_exec_defaults_to_first_container() {
        let cmd = k8s_container_command(&names(), &inst(&["default/web-0/web"]), &run("sh")).unwrap();
        assert_eq!(
            cmd,
            "KUBECONFIG=c1.operorg.kubeconfig kubectl exec -n default -it -c web web-0 -- sh"
        );

        let err = k8s_container_command(&names(), &inst(&[]), &run("sh")).unwrap_err();
        assert!(err.to_string().contains("no containers to run command in"));
    }

    #[test]
    fn k8s_logs_flags() {
        let mut req = ExecRequest {
            container_id: "web-0".to_string(),
            log: Some(ShowLog {
                since: "1h".to_string(),
                tail: 10,
                timestamps: true,
                follow: true,
            }),
            ..Default::default()
        };
        let cmd = k8s_container_command(&names(), &inst(&[]), &req).unwrap();
        assert_eq!(
            cmd,
            "KUBECONFIG=c1.operorg.kubeconfig kubectl logs -n default --since=1h --tail=10 \
             --timestamps=true -f web-0 --all-containers"
        );

        req.log = Some(ShowLog {
            since: "2026-10-01T00:00:00Z".to_string(),
            ..Default::default()
        });
        let cmd = k8s_container_command(&names(), &inst(&[]), &req).unwrap();
        assert!(cmd.contains("--since-time=2026-10-01T00:00:00Z "));
    }

    #[test]
    fn docker_prefers_app_container_over_proxies() {
        let i = inst(&["nginxmyapp10", "envoymyapp10", "myapp10"]);
        assert_eq!(
            docker_container_command(&i, &run("ls")).unwrap(),
            "docker exec -it myapp10 ls"
        );

        let proxies_only = inst(&["nginxmyapp10"]);
        assert_eq!(
            docker_container_command(&proxies_only, &run("ls")).unwrap(),
            "docker exec -it nginxmyapp10 ls"
        );

        let err = docker_container_command(&inst(&[]), &run("ls")).unwrap_err();
        assert!(err.to_string().contains("please specify one"));
    }

    #[test]
    fn docker_logs_and_missing_request() {
        let req = ExecRequest {
            container_id: "myapp10".to_string(),
            log: Some(ShowLog {
                tail: 5,
                follow: true,
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(
            docker_container_command(&inst(&[]), &req).unwrap(),
            "docker logs --tail 5 --follow myapp10"
        );

        let empty = ExecRequest {
            container_id: "myapp10".to_string(),
            ..Default::default()
        };
        let err = docker_container_command(&inst(&[]), &empty).unwrap_err();
        assert_eq!(
            err.to_string(),
            "no command or log specified with the exec request"
        );
    }

    #[test]
    fn docker_names_drop_dots() {
        assert_eq!(docker_container_name(&AppKey::new("dev", "MyApp", "1.0")), "myapp10");
    }
}
