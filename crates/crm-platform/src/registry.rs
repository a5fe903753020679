//! Named platform factory.
//!
//! Backends are compiled in and looked up by name. Controller-style names
//! such as `PLATFORM_TYPE_FAKEINFRA` are accepted and normalized.

use std::sync::Arc;

use crm_core::CloudletKey;
use crm_core::config::PlatformConfig;
use crm_state::CacheSet;
use tracing::info;

use crate::client::LocalClient;
use crate::dind::DindPlatform;
use crate::error::{PlatformError, PlatformResult};
use crate::fake::{FakeFixture, FakePlatform};
use crate::kind::KindPlatform;
use crate::platform::Platform;
use crate::xind::Xind;

/// Everything a backend needs at construction.
#[derive(Clone, Default)]
pub struct PlatformInit {
    pub config: PlatformConfig,
    pub caches: CacheSet,
    pub cloudlet_key: CloudletKey,
}

type Builder = fn(PlatformInit) -> PlatformResult<Arc<dyn Platform>>;

const PLATFORMS: &[(&str, Builder)] = &[
    ("fake", build_fake),
    ("kind", build_kind),
    ("dind", build_dind),
];

fn build_fake(_init: PlatformInit) -> PlatformResult<Arc<dyn Platform>> {
    Ok(Arc::new(FakePlatform::new(FakeFixture::default())))
}

fn xind(init: PlatformInit) -> Xind {
    let client = Arc::new(LocalClient::new(&init.config.working_dir));
    Xind::new(client, init.caches, init.config)
}

fn build_kind(init: PlatformInit) -> PlatformResult<Arc<dyn Platform>> {
    Ok(Arc::new(KindPlatform::new(xind(init))))
}

fn build_dind(init: PlatformInit) -> PlatformResult<Arc<dyn Platform>> {
    Ok(Arc::new(DindPlatform::new(xind(init))?))
}

/// Canonical backend name for `name`.
pub fn normalize_name(name: &str) -> String {
    let lower = name.trim().to_ascii_lowercase();
    let bare = lower.strip_prefix("platform_type_").unwrap_or(&lower);
    match bare {
        "fakeinfra" => "fake".to_string(),
        "kindinfra" => "kind".to_string(),
        "edgebox" => "dind".to_string(),
        other => other.to_string(),
    }
}

/// Names accepted by [`new_platform`].
pub fn platform_names() -> Vec<&'static str> {
    PLATFORMS.iter().map(|(name, _)| *name).collect()
}

pub fn new_platform(name: &str, init: PlatformInit) -> PlatformResult<Arc<dyn Platform>> {
    let canonical = normalize_name(name);
    let Some((_, build)) = PLATFORMS.iter().find(|(n, _)| *n == canonical) else {
        return Err(PlatformError::UnknownPlatform {
            name: name.to_string(),
            known: platform_names().join(", "),
        });
    };
    info!(platform = %canonical, cloudlet = %init.cloudlet_key, "creating platform");
    build(init)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn controller_names_are_normalized() {
        assert_eq!(normalize_name("PLATFORM_TYPE_FAKEINFRA"), "fake");
        assert_eq!(normalize_name("PLATFORM_TYPE_EDGEBOX"), "dind");
        assert_eq!(normalize_name("kind"), "kind");
    }

    #[test]
    fn selects_by_name() {
        let platform = new_platform("PLATFORM_TYPE_FAKE", PlatformInit::default()).unwrap();
        assert_eq!(platform.name(), "fake");
        assert!(platform.features().is_fake);

        let kind = new_platform("kind", PlatformInit::default()).unwrap();
        assert_eq!(kind.name(), "kind");
    }

    #[test]
    fn unknown_names_list_the_choices() {
        let err = match new_platform("openstack", PlatformInit::default()) {
            Err(e) => e,
            Ok(_) => panic!("openstack should not be registered"),
        };
        assert_eq!(
            err.to_string(),
            "unknown platform \"openstack\", expected one of: fake, kind, dind"
        );
    }
}
