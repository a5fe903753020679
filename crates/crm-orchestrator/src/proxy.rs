//! Reverse proxies in front of AppInst ports.
//!
//! ```text
//!   client ──▶ envoy{name}  (TCP, optional TLS) ──┐
//!   client ──▶ nginx{name}  (UDP, HTTP)  ─────────┴──▶ backend:internal_port
//! ```
//!
//! Each proxy runs as a docker container on the load balancer with its
//! config under `{kind}/{name}/`. Configs are written to a `.new` file and
//! moved into place before the container starts.

use std::fmt::Write;

use crm_core::{AppPort, LProto};
use crm_platform::{PlatformClient, PlatformError};
use serde_json::json;
use tracing::{info, warn};

use crate::docker::docker_port_args;
use crate::error::{OrchestratorError, OrchestratorResult};

pub const NGINX_IMAGE: &str = "docker.io/library/nginx:1.19";
pub const ENVOY_IMAGE: &str = "docker.io/envoyproxy/envoy:v1.16.2";

const ENVOY_CERTS_MOUNT: &str = "/etc/envoy/certs";
const DEFAULT_WORKER_CONNECTIONS: u32 = 1024;
const MANY_PORTS: u32 = 1000;

#[derive(Debug, Clone)]
pub struct ProxyOptions {
    /// Docker network the proxy containers join.
    pub docker_network: String,
    /// Publish public ports with `-p`. Off when the network is the host's.
    pub publish_ports: bool,
    /// Host directory holding `cert.pem` and `key.pem` for TLS ports.
    pub certs_dir: String,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            docker_network: "host".to_string(),
            publish_ports: false,
            certs_dir: "/root/envoy/certs".to_string(),
        }
    }
}

/// Ports split by the proxy that serves them.
#[derive(Debug, Default, PartialEq)]
pub struct ProxyPlan {
    pub nginx: Vec<AppPort>,
    pub envoy: Vec<AppPort>,
}

/// TCP goes to envoy unless a port asks for nginx; UDP and HTTP always
/// go to nginx.
pub fn check_protocols(ports: &[AppPort]) -> ProxyPlan {
    let mut plan = ProxyPlan::default();
    for port in ports {
        match port.proto {
            LProto::Tcp if !port.nginx => plan.envoy.push(port.clone()),
            _ => plan.nginx.push(port.clone()),
        }
    }
    plan
}

// ── nginx ──────────────────────────────────────────────────────────

fn total_ports(ports: &[AppPort]) -> u32 {
    ports.iter().map(AppPort::count).sum()
}

pub fn worker_connections(ports: &[AppPort]) -> u32 {
    let total = total_ports(ports);
    if total > MANY_PORTS {
        // 20% headroom over one connection per port.
        total + total / 5
    } else {
        DEFAULT_WORKER_CONNECTIONS
    }
}

fn listen_spec(port: &AppPort) -> String {
    if port.is_range() {
        format!("{}-{}", port.public_port, port.end_port)
    } else {
        port.public_port.to_string()
    }
}

pub fn nginx_config(backend: &str, ports: &[AppPort]) -> OrchestratorResult<String> {
    for port in ports.iter().filter(|p| p.is_range()) {
        if port.internal_port != port.public_port {
            return Err(OrchestratorError::Invalid(format!(
                "port range {}-{} must use the same internal and public ports",
                port.public_port, port.end_port
            )));
        }
    }

    let mut conf = format!(
        "user  nginx;
worker_processes  1;
error_log  /var/log/nginx/error.log warn;
pid        /var/run/nginx.pid;

events {{
    worker_connections  {};
}}
",
        worker_connections(ports)
    );

    let (http, stream): (Vec<&AppPort>, Vec<&AppPort>) =
        ports.iter().partition(|p| p.proto == LProto::Http);

    if !stream.is_empty() {
        conf.push_str("\nstream {\n");
        for port in stream {
            let udp = if port.proto == LProto::Udp { " udp" } else { "" };
            let upstream = if port.is_range() {
                format!("{backend}:$server_port")
            } else {
                format!("{backend}:{}", port.internal_port)
            };
            let _ = write!(
                conf,
                "    server {{\n        listen {}{udp};\n        proxy_pass {upstream};\n    }}\n",
                listen_spec(port)
            );
        }
        conf.push_str("}\n");
    }

    if !http.is_empty() {
        conf.push_str("\nhttp {\n");
        for port in http {
            let _ = write!(
                conf,
                "    server {{\n        listen {};\n        location / {{\n            proxy_pass http://{backend}:{};\n        }}\n    }}\n",
                port.public_port, port.internal_port
            );
        }
        conf.push_str("}\n");
    }
    Ok(conf)
}

// ── envoy ──────────────────────────────────────────────────────────

/// Envoy bootstrap with one TCP listener per public port.
pub fn envoy_config(backend: &str, ports: &[AppPort]) -> OrchestratorResult<String> {
    let mut listeners = Vec::new();
    let mut clusters = Vec::new();
    for port in ports {
        for offset in 0..port.count() {
            let public = port.public_port + offset;
            let internal = port.internal_port + offset;
            let cluster = format!("backend{public}");

            let mut chain = json!({
                "filters": [{
                    "name": "envoy.filters.network.tcp_proxy",
                    "typed_config": {
                        "@type": "type.googleapis.com/envoy.extensions.filters.network.tcp_proxy.v3.TcpProxy",
                        "stat_prefix": format!("ingress_tcp_{public}"),
                        "cluster": cluster,
                    }
                }]
            });
            if port.tls {
                chain["transport_socket"] = json!({
                    "name": "envoy.transport_sockets.tls",
                    "typed_config": {
                        "@type": "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.DownstreamTlsContext",
                        "common_tls_context": {
                            "tls_certificates": [{
                                "certificate_chain": {"filename": format!("{ENVOY_CERTS_MOUNT}/cert.pem")},
                                "private_key": {"filename": format!("{ENVOY_CERTS_MOUNT}/key.pem")},
                            }]
                        }
                    }
                });
            }
            listeners.push(json!({
                "name": format!("tcp{public}"),
                "address": {"socket_address": {"address": "0.0.0.0", "port_value": public}},
                "filter_chains": [chain],
            }));
            clusters.push(json!({
                "name": cluster,
                "connect_timeout": "0.25s",
                "type": "STRICT_DNS",
                "lb_policy": "ROUND_ROBIN",
                "load_assignment": {
                    "cluster_name": cluster,
                    "endpoints": [{
                        "lb_endpoints": [{
                            "endpoint": {
                                "address": {"socket_address": {"address": backend, "port_value": internal}}
                            }
                        }]
                    }]
                }
            }));
        }
    }
    let config = json!({
        "static_resources": {
            "listeners": listeners,
            "clusters": clusters,
        }
    });
    Ok(serde_yaml::to_string(&config)?)
}

// ── Lifecycle ──────────────────────────────────────────────────────

/// Writes, starts and removes the proxies of one AppInst.
pub struct Proxy<'a> {
    client: &'a dyn PlatformClient,
    name: String,
    options: ProxyOptions,
}

impl<'a> Proxy<'a> {
    pub fn new(client: &'a dyn PlatformClient, name: &str, options: ProxyOptions) -> Self {
        Self {
            client,
            name: name.to_string(),
            options,
        }
    }

    fn dir(&self, kind: &str) -> String {
        format!("{kind}/{}", self.name)
    }

    async fn write_config(&self, kind: &str, file: &str, contents: &str) -> OrchestratorResult<String> {
        let dir = self.dir(kind);
        let path = format!("{dir}/{file}");
        self.client.run(&format!("mkdir -p {dir}")).await?;
        self.client
            .write_file(&format!("{path}.new"), contents, &format!("{kind} config"), false)
            .await?;
        self.client.run(&format!("mv {path}.new {path}")).await?;
        Ok(path)
    }

    fn run_prefix(&self, container: &str, ports: &[AppPort]) -> String {
        let mut cmd = format!(
            "docker run -d -l edge-cloud --restart=unless-stopped --name={container} --network={}",
            self.options.docker_network
        );
        if self.options.publish_ports {
            for arg in docker_port_args(ports, true, None) {
                cmd.push(' ');
                cmd.push_str(&arg);
            }
        }
        cmd
    }

    /// Start whatever proxies `ports` need. A partial setup is torn down
    /// before the error is returned.
    pub async fn create(&self, backend: &str, ports: &[AppPort]) -> OrchestratorResult<()> {
        let result = self.try_create(backend, ports).await;
        if let Err(e) = &result {
            warn!(name = %self.name, error = %e, "proxy create failed, cleaning up");
            if let Err(undo) = self.delete().await {
                warn!(name = %self.name, error = %undo, "proxy cleanup failed");
            }
        }
        result
    }

    async fn try_create(&self, backend: &str, ports: &[AppPort]) -> OrchestratorResult<()> {
        let plan = check_protocols(ports);
        if !plan.nginx.is_empty() {
            let conf = nginx_config(backend, &plan.nginx)?;
            let path = self.write_config("nginx", "nginx.conf", &conf).await?;
            let container = format!("nginx{}", self.name);
            info!(%container, ports = plan.nginx.len(), "starting nginx");
            self.client
                .run(&format!(
                    "{} -v $PWD/{path}:/etc/nginx/nginx.conf {NGINX_IMAGE}",
                    self.run_prefix(&container, &plan.nginx)
                ))
                .await?;
        }
        if !plan.envoy.is_empty() {
            let conf = envoy_config(backend, &plan.envoy)?;
            let path = self.write_config("envoy", "envoy.yaml", &conf).await?;
            let container = format!("envoy{}", self.name);
            let mut cmd = format!(
                "{} -v $PWD/{path}:/etc/envoy/envoy.yaml",
                self.run_prefix(&container, &plan.envoy)
            );
            if plan.envoy.iter().any(|p| p.tls) {
                let _ = write!(cmd, " -v {}:{ENVOY_CERTS_MOUNT}", self.options.certs_dir);
            }
            let _ = write!(cmd, " {ENVOY_IMAGE} envoy -c /etc/envoy/envoy.yaml");
            info!(%container, ports = plan.envoy.len(), "starting envoy");
            self.client.run(&cmd).await?;
        }
        Ok(())
    }

    /// Remove both proxies and their configs. Missing containers are fine.
    pub async fn delete(&self) -> OrchestratorResult<()> {
        for kind in ["nginx", "envoy"] {
            let container = format!("{kind}{}", self.name);
            for cmd in [format!("docker kill {container}"), format!("docker rm -f {container}")] {
                match self.client.run(&cmd).await {
                    Ok(()) => {}
                    Err(e) if no_such_container(&e) => {}
                    // Kill fails on stopped containers; rm still follows.
                    Err(e) if cmd.contains("kill") => {
                        warn!(%container, error = %e, "kill failed");
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            self.client.delete_dir(&self.dir(kind)).await?;
        }
        Ok(())
    }
}

fn no_such_container(e: &PlatformError) -> bool {
    e.output_contains("No such container")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crm_platform::FakeClient;

    fn port(proto: LProto, internal: u32, public: u32) -> AppPort {
        AppPort {
            proto,
            internal_port: internal,
            public_port: public,
            ..Default::default()
        }
    }

    #[test]
    fn protocols_pick_the_proxy() {
        let mut forced = port(LProto::Tcp, 22, 2222);
        forced.nginx = true;
        let plan = check_protocols(&[
            port(LProto::Tcp, 443, 443),
            port(LProto::Udp, 10101, 10101),
            port(LProto::Http, 8080, 80),
            forced,
        ]);
        assert_eq!(plan.envoy.len(), 1);
        assert_eq!(plan.nginx.len(), 3);
    }

    #[test]
    fn worker_connections_scale_with_ports() {
        assert_eq!(worker_connections(&[port(LProto::Udp, 1, 1)]), 1024);
        let mut range = port(LProto::Udp, 10000, 10000);
        range.end_port = 11999;
        assert_eq!(worker_connections(&[range]), 2400);
    }

    #[test]
    fn nginx_streams_udp_and_serves_http() {
        let mut range = port(LProto::Udp, 5000, 5000);
        range.end_port = 5010;
        let conf = nginx_config(
            "10.1.1.1",
            &[port(LProto::Udp, 10101, 10101), range, port(LProto::Http, 8080, 80)],
        )
        .unwrap();
        assert!(conf.contains("worker_connections  1024;"));
        assert!(conf.contains("listen 10101 udp;\n        proxy_pass 10.1.1.1:10101;"));
        assert!(conf.contains("listen 5000-5010 udp;\n        proxy_pass 10.1.1.1:$server_port;"));
        assert!(conf.contains("proxy_pass http://10.1.1.1:8080;"));

        let mut remapped = port(LProto::Udp, 6000, 7000);
        remapped.end_port = 7010;
        let err = nginx_config("10.1.1.1", &[remapped]).unwrap_err();
        assert!(err.to_string().contains("same internal and public ports"));
    }

    #[test]
    fn envoy_listener_per_port() {
        let mut tls = port(LProto::Tcp, 443, 8443);
        tls.tls = true;
        let conf = envoy_config("web10", &[port(LProto::Tcp, 80, 10080), tls]).unwrap();
        let doc: serde_yaml::Value = serde_yaml::from_str(&conf).unwrap();
        let listeners = doc["static_resources"]["listeners"].as_sequence().unwrap();
        assert_eq!(listeners.len(), 2);
        assert_eq!(listeners[1]["address"]["socket_address"]["port_value"].as_u64(), Some(8443));
        assert!(listeners[0]["filter_chains"][0].get("transport_socket").is_none());
        assert!(listeners[1]["filter_chains"][0].get("transport_socket").is_some());

        let clusters = doc["static_resources"]["clusters"].as_sequence().unwrap();
        let addr = &clusters[0]["load_assignment"]["endpoints"][0]["lb_endpoints"][0]["endpoint"]["address"];
        assert_eq!(addr["socket_address"]["address"].as_str(), Some("web10"));
        assert_eq!(addr["socket_address"]["port_value"].as_u64(), Some(80));
    }

    #[tokio::test]
    async fn create_and_delete_containers() {
        let client = FakeClient::new();
        let mut tls = port(LProto::Tcp, 443, 443);
        tls.tls = true;
        let options = ProxyOptions {
            docker_network: "bridge".to_string(),
            publish_ports: true,
            ..Default::default()
        };
        let proxy = Proxy::new(&client, "web10", options);

        proxy
            .create("10.1.1.1", &[tls, port(LProto::Udp, 10101, 10101)])
            .await
            .unwrap();
        assert!(client.has_container("nginxweb10"));
        assert!(client.has_container("envoyweb10"));
        assert!(client.file("nginx/web10/nginx.conf").is_some());
        assert!(client.file("envoy/web10/envoy.yaml.new").is_none());
        assert!(client.ran("-v /root/envoy/certs:/etc/envoy/certs"));
        assert!(client.ran("-p 443:443/tcp"));

        proxy.delete().await.unwrap();
        assert!(client.containers().is_empty());
        assert!(client.files().is_empty());
        proxy.delete().await.unwrap();
    }

    #[tokio::test]
    async fn failed_start_removes_partial_setup() {
        let client = FakeClient::new();
        client.fail_on("envoyproxy/envoy");
        let proxy = Proxy::new(&client, "web10", ProxyOptions::default());

        let err = proxy
            .create("10.1.1.1", &[port(LProto::Tcp, 443, 443), port(LProto::Udp, 53, 53)])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("injected failure"));
        assert!(client.containers().is_empty());
        assert!(client.files().is_empty());
    }
}
