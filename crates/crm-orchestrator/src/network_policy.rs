//! NetworkPolicy for AppInsts on multi-tenant clusters.
//!
//! Pods may talk to their own namespace; public ingress is allowed only on
//! the AppInst's mapped ports. Everything else is denied by the presence
//! of the policy.

use std::fmt::Write;

use crm_core::{AppPort, KubeNames};

use crate::error::{OrchestratorError, OrchestratorResult};

/// Render the policy manifest. Ports keep their input order; ranges carry
/// `endPort`.
pub fn network_policy(names: &KubeNames, ports: &[AppPort]) -> OrchestratorResult<String> {
    let Some(ns) = names.multitenant_namespace.as_deref() else {
        return Err(OrchestratorError::Invalid(
            "network policy only valid for namespaced clusters".into(),
        ));
    };

    let mut mf = format!(
        "apiVersion: networking.k8s.io/v1
kind: NetworkPolicy
metadata:
  name: networkpolicy-{ns}
  namespace: {ns}
spec:
  podSelector:
    matchLabels:
  ingress:
  - from:
    - namespaceSelector:
        matchLabels:
          name: {ns}
"
    );
    if ports.is_empty() {
        return Ok(mf);
    }

    mf.push_str(
        "  - from:
    - ipBlock:
        cidr: 0.0.0.0/0
    ports:
",
    );
    for port in ports {
        // Writing to a String cannot fail.
        let _ = write!(
            mf,
            "    - protocol: {}\n      port: {}\n",
            port.proto.k8s_name(),
            port.internal_port
        );
        if port.is_range() {
            let _ = writeln!(mf, "      endPort: {}", port.internal_end_port());
        }
    }
    Ok(mf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crm_core::LProto;

    fn names(ns: Option<&str>) -> KubeNames {
        KubeNames {
            multitenant_namespace: ns.map(String::from),
            ..Default::default()
        }
    }

    fn port(proto: LProto, internal: u32, public: u32, end: u32) -> AppPort {
        AppPort {
            proto,
            internal_port: internal,
            public_port: public,
            end_port: end,
            ..Default::default()
        }
    }

    const NS: &str = "devorg-myapp-10-autocluster1";

    #[test]
    fn requires_namespace() {
        let err = network_policy(&names(None), &[]).unwrap_err();
        assert!(err.to_string().contains("only valid for namespaced clusters"));
    }

    #[test]
    fn same_namespace_rule_only() {
        let mf = network_policy(&names(Some(NS)), &[]).unwrap();
        assert_eq!(
            mf,
            "apiVersion: networking.k8s.io/v1
kind: NetworkPolicy
metadata:
  name: networkpolicy-devorg-myapp-10-autocluster1
  namespace: devorg-myapp-10-autocluster1
spec:
  podSelector:
    matchLabels:
  ingress:
  - from:
    - namespaceSelector:
        matchLabels:
          name: devorg-myapp-10-autocluster1
"
        );
    }

    #[test]
    fn mapped_ports_in_input_order() {
        let ports = [
            port(LProto::Tcp, 443, 443, 0),
            port(LProto::Tcp, 888, 818, 0),
            port(LProto::Udp, 10101, 10101, 0),
            port(LProto::Tcp, 51000, 51000, 52000),
        ];
        let mf = network_policy(&names(Some(NS)), &ports).unwrap();
        assert_eq!(
            mf,
            "apiVersion: networking.k8s.io/v1
kind: NetworkPolicy
metadata:
  name: networkpolicy-devorg-myapp-10-autocluster1
  namespace: devorg-myapp-10-autocluster1
spec:
  podSelector:
    matchLabels:
  ingress:
  - from:
    - namespaceSelector:
        matchLabels:
          name: devorg-myapp-10-autocluster1
  - from:
    - ipBlock:
        cidr: 0.0.0.0/0
    ports:
    - protocol: TCP
      port: 443
    - protocol: TCP
      port: 888
    - protocol: UDP
      port: 10101
    - protocol: TCP
      port: 51000
      endPort: 52000
"
        );
        assert_eq!(mf.matches("- from:").count(), 2);
        assert_eq!(mf.matches("endPort").count(), 1);
    }
}
