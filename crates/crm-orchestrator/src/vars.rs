//! Deployment variables substituted into manifests before they are applied.
//!
//! Manifests reference variables as `{{ .CRM.ClusterIp }}`. Apps may pick
//! another delimiter pair (`[[ ]]`) when `{{ }}` clashes with their own
//! templating. A reference that cannot be resolved is an error, never a
//! blank.

use crm_core::sanitize::k8s_sanitize;
use crm_core::{App, ClusterInst};
use regex::Regex;

use crate::error::{OrchestratorError, OrchestratorResult};

const DEFAULT_DELIMITERS: (&str, &str) = ("{{", "}}");

/// Values available to manifests under `.CRM`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeploymentVars {
    pub cluster_ip: String,
    pub cloudlet_name: String,
    pub cluster_name: String,
    pub cloudlet_org: String,
    pub app_org: String,
    pub dns_zone: String,
    pub developer_name: String,
}

impl DeploymentVars {
    pub fn new(cluster_inst: &ClusterInst, app: &App, cluster_ip: &str, dns_zone: &str) -> Self {
        let key = &cluster_inst.key;
        Self {
            cluster_ip: cluster_ip.to_string(),
            cloudlet_name: k8s_sanitize(&key.cloudlet_key.name),
            cluster_name: k8s_sanitize(&key.cluster_key.name),
            cloudlet_org: k8s_sanitize(&key.cloudlet_key.organization),
            app_org: k8s_sanitize(&app.key.organization),
            dns_zone: dns_zone.to_string(),
            developer_name: app.key.organization.clone(),
        }
    }

    fn lookup(&self, field: &str) -> Option<&str> {
        let value = match field {
            "ClusterIp" => &self.cluster_ip,
            "CloudletName" => &self.cloudlet_name,
            "ClusterName" => &self.cluster_name,
            "CloudletOrg" => &self.cloudlet_org,
            "AppOrg" => &self.app_org,
            "DnsZone" => &self.dns_zone,
            "DeveloperName" => &self.developer_name,
            _ => return None,
        };
        (!value.is_empty()).then_some(value.as_str())
    }
}

fn delimiters(spec: &str) -> OrchestratorResult<(&str, &str)> {
    if spec.trim().is_empty() {
        return Ok(DEFAULT_DELIMITERS);
    }
    let parts: Vec<&str> = spec.split_whitespace().collect();
    match parts.as_slice() {
        [open, close] => Ok((*open, *close)),
        _ => Err(OrchestratorError::Invalid(format!(
            "invalid template delimiter {spec:?}, expected an open and close pair"
        ))),
    }
}

/// Replace every `.CRM.*` reference in `text`.
pub fn replace_deployment_vars(
    text: &str,
    delimiter: &str,
    vars: &DeploymentVars,
) -> OrchestratorResult<String> {
    let (open, close) = delimiters(delimiter)?;
    let re = Regex::new(&format!(
        r"{}\s*\.?([A-Za-z0-9_.]+)\s*{}",
        regex::escape(open),
        regex::escape(close)
    ))
    .map_err(|e| OrchestratorError::Invalid(e.to_string()))?;

    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for caps in re.captures_iter(text) {
        let (Some(whole), Some(field)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let field = field.as_str();
        let value = field
            .strip_prefix("CRM.")
            .and_then(|name| vars.lookup(name))
            .ok_or_else(|| OrchestratorError::UnresolvedVar(field.to_string()))?;
        out.push_str(&text[last..whole.start()]);
        out.push_str(value);
        last = whole.end();
    }
    out.push_str(&text[last..]);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = "apiVersion: apps/v1
kind: Deployment
metadata:
  name: someapplication1-deployment
spec:
  replicas: 1
  template:
    metadata:
      labels:
        run: someapplication1
        target: {{ .CRM.ClusterIp }}:443
    spec:
      containers:
      - name: someapplication1
        image: registry.example.net/acme/someapplication1:1.0
";

    const MANIFEST_RESULT: &str = "apiVersion: apps/v1
kind: Deployment
metadata:
  name: someapplication1-deployment
spec:
  replicas: 1
  template:
    metadata:
      labels:
        run: someapplication1
        target: 10.1.1.1:443
    spec:
      containers:
      - name: someapplication1
        image: registry.example.net/acme/someapplication1:1.0
";

    fn ip_only() -> DeploymentVars {
        DeploymentVars {
            cluster_ip: "10.1.1.1".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn golden_cluster_ip_substitution() {
        let out = replace_deployment_vars(MANIFEST, "", &ip_only()).unwrap();
        assert_eq!(out, MANIFEST_RESULT);
        // Nothing left to replace.
        assert_eq!(
            replace_deployment_vars(MANIFEST_RESULT, "", &ip_only()).unwrap(),
            MANIFEST_RESULT
        );
    }

    #[test]
    fn unsupplied_variable_names_the_field() {
        let text = "nfs:\n  server: {{ .CRM.ClusterName }}\n";
        let err = replace_deployment_vars(text, "", &ip_only()).unwrap_err();
        assert!(err.to_string().contains("CRM.ClusterName"));

        let unknown = "server: {{ .CRM.OperatorName }}";
        let err = replace_deployment_vars(unknown, "", &ip_only()).unwrap_err();
        assert!(err.to_string().contains("CRM.OperatorName"));
    }

    #[test]
    fn custom_delimiters_leave_braces_alone() {
        let vars = DeploymentVars {
            developer_name: "AcmeAppCo".to_string(),
            cluster_name: "testcluster".to_string(),
            cloudlet_name: "testcloudlet".to_string(),
            dns_zone: "example-test.net".to_string(),
            ..ip_only()
        };
        let text = "dns: \"*.[[.CRM.DeveloperName]]-[[.CRM.ClusterName]]-[[.CRM.CloudletName]].[[.CRM.DnsZone]]\"\nhelm: {{ .Values.port }}\n";
        let out = replace_deployment_vars(text, "[[ ]]", &vars).unwrap();
        assert_eq!(
            out,
            "dns: \"*.AcmeAppCo-testcluster-testcloudlet.example-test.net\"\nhelm: {{ .Values.port }}\n"
        );

        assert!(replace_deployment_vars(text, "[[", &vars).is_err());
    }
}
