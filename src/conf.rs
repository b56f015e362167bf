//! Boot-time configuration payloads handed to machines at creation.
//!
//! Payloads are opaque to the harness: the kind only decides how a backend
//! attaches the bytes (instance user-data, firmware config, guestinfo). The
//! only transformation applied is textual `{KEY}` substitution from the
//! run's bindings.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Format of a boot payload.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum PayloadKind {
    #[default]
    Empty,
    Ignition,
    CloudConfig,
    ContainerLinuxConfig,
    Script,
}

impl PayloadKind {
    /// Whether the payload is consumed by the first-boot provisioning agent
    /// rather than the legacy cloud-init style agent.
    pub fn is_ignition_like(self) -> bool {
        matches!(self, PayloadKind::Ignition | PayloadKind::ContainerLinuxConfig)
    }
}

/// Configuration delivered to a machine at boot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootPayload {
    kind: PayloadKind,
    data: Vec<u8>,
}

impl BootPayload {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_bytes(kind: PayloadKind, data: impl Into<Vec<u8>>) -> Self {
        let data = data.into();
        if data.is_empty() {
            return Self::empty();
        }
        Self { kind, data }
    }

    pub fn ignition(data: impl Into<String>) -> Self {
        Self::from_bytes(PayloadKind::Ignition, data.into())
    }

    pub fn cloud_config(data: impl Into<String>) -> Self {
        Self::from_bytes(PayloadKind::CloudConfig, data.into())
    }

    pub fn container_linux_config(data: impl Into<String>) -> Self {
        Self::from_bytes(PayloadKind::ContainerLinuxConfig, data.into())
    }

    pub fn script(data: impl Into<String>) -> Self {
        Self::from_bytes(PayloadKind::Script, data.into())
    }

    pub fn kind(&self) -> PayloadKind {
        self.kind
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Replaces every `{KEY}` occurrence with its binding.
    ///
    /// Substitution is a single pass over the payload: text produced by a
    /// binding is never expanded again. Unknown keys are left as written.
    /// Payloads that are not valid UTF-8 are returned unchanged.
    pub fn render(&self, bindings: &BTreeMap<String, String>) -> BootPayload {
        if bindings.is_empty() || self.is_empty() {
            return self.clone();
        }
        let Ok(text) = std::str::from_utf8(&self.data) else {
            return self.clone();
        };

        let mut rendered = String::with_capacity(text.len());
        let mut rest = text;
        while let Some(open) = rest.find('{') {
            rendered.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            let binding = after
                .find('}')
                .and_then(|close| bindings.get(&after[..close]).map(|v| (close, v)));
            match binding {
                Some((close, value)) => {
                    rendered.push_str(value);
                    rest = &after[close + 1..];
                }
                None => {
                    rendered.push('{');
                    rest = after;
                }
            }
        }
        rendered.push_str(rest);

        BootPayload {
            kind: self.kind,
            data: rendered.into_bytes(),
        }
    }

    /// Writes the raw payload to `path`.
    pub async fn write_to(&self, path: &Path) -> std::io::Result<()> {
        tokio::fs::write(path, &self.data).await
    }
}

/// The boot payload a test asks for, optionally varying by distribution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserData {
    Single(BootPayload),
    PerDistro(BTreeMap<String, BootPayload>),
}

impl UserData {
    /// Payload to use on `distro`, or `None` if the test has no variant for it.
    pub fn for_distro(&self, distro: &str) -> Option<&BootPayload> {
        match self {
            UserData::Single(payload) => Some(payload),
            UserData::PerDistro(map) => map.get(distro),
        }
    }

    pub fn per_distro<I, K>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, BootPayload)>,
        K: Into<String>,
    {
        UserData::PerDistro(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

impl Default for UserData {
    fn default() -> Self {
        UserData::Single(BootPayload::empty())
    }
}

impl From<BootPayload> for UserData {
    fn from(payload: BootPayload) -> Self {
        UserData::Single(payload)
    }
}
