pub const KILN_REGISTRY: &str = "KILN_REGISTRY";
pub const KILN_BUCKET_NAME: &str = "KILN_BUCKET_NAME";
pub const KILN_BUILD_FINGERPRINT: &str = "KILN_BUILD_FINGERPRINT";
pub const KILN_RUN_UUID: &str = "KILN_RUN_UUID";
pub const KILN_CLIENT_ID: &str = "KILN_CLIENT_ID";
pub const KILN_CLIENT_SECRET: &str = "KILN_CLIENT_SECRET";
pub const KILN_ORGANIZATION_ID: &str = "KILN_ORGANIZATION_ID";
pub const KILN_PROJECT_ID: &str = "KILN_PROJECT_ID";
pub const KILN_REGISTRY_DB: &str = "KILN_REGISTRY_DB";

/// Registry related settings read from the environment once per run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RegistryEnv {
    /// Raw `KILN_REGISTRY` value.
    pub registry: Option<String>,
    pub bucket_name: Option<String>,
    pub fingerprint: Option<String>,
    pub run_uuid: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub organization_id: Option<String>,
    pub project_id: Option<String>,
    pub database: Option<String>,
}

impl RegistryEnv {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the settings from any key lookup. Empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());
        Self {
            registry: get(KILN_REGISTRY),
            bucket_name: get(KILN_BUCKET_NAME),
            fingerprint: get(KILN_BUILD_FINGERPRINT),
            run_uuid: get(KILN_RUN_UUID),
            client_id: get(KILN_CLIENT_ID),
            client_secret: get(KILN_CLIENT_SECRET),
            organization_id: get(KILN_ORGANIZATION_ID),
            project_id: get(KILN_PROJECT_ID),
            database: get(KILN_REGISTRY_DB),
        }
    }

    pub fn is_disabled(&self) -> bool {
        matches!(self.registry.as_deref().map(str::to_ascii_lowercase).as_deref(), Some("off") | Some("0"))
    }

    pub fn is_explicitly_enabled(&self) -> bool {
        self.registry.is_some() && !self.is_disabled()
    }

    pub fn has_bucket_name(&self) -> bool {
        self.bucket_name.is_some()
    }

    pub fn has_credentials(&self) -> bool {
        self.client_id.is_some() && self.client_secret.is_some()
    }

    pub fn destination(&self) -> String {
        format!(
            "{}/{}",
            self.organization_id.as_deref().unwrap_or("default"),
            self.project_id.as_deref().unwrap_or("default")
        )
    }
}
