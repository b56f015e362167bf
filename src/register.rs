//! Test registration and selection.
//!
//! Tests are registered into a [`RegistryBuilder`] at startup, which is
//! then frozen into an immutable [`Registry`]. Names are unique; a second
//! registration under the same name is an error rather than a silent
//! replacement. Selection filters the frozen registry by name pattern,
//! platform, distribution and architecture.

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use regex::Regex;

use crate::conf::UserData;
use crate::config::Platform;
use crate::harness::{TestAbort, TestCluster};

/// Body of a test: receives the cluster handle, returns how it ended.
pub type TestBody =
    Arc<dyn Fn(TestCluster) -> BoxFuture<'static, Result<(), TestAbort>> + Send + Sync>;

/// A registered test and its constraints.
///
/// Empty constraint lists mean "no restriction".
#[derive(Clone)]
pub struct Test {
    pub name: String,
    pub run: TestBody,
    /// Machines provisioned before the body runs.
    pub cluster_size: usize,
    /// Platforms the test may run on.
    pub platforms: Vec<String>,
    /// Platforms the test must never run on.
    pub exclude_platforms: Vec<String>,
    pub distros: Vec<String>,
    pub architectures: Vec<String>,
    pub user_data: UserData,
    /// Overrides the run-wide test timeout.
    pub timeout: Option<Duration>,
}

impl Test {
    pub fn new<F, Fut>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn(TestCluster) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), TestAbort>> + Send + 'static,
    {
        Self {
            name: name.into(),
            run: Arc::new(move |cluster| Box::pin(body(cluster))),
            cluster_size: 0,
            platforms: Vec::new(),
            exclude_platforms: Vec::new(),
            distros: Vec::new(),
            architectures: Vec::new(),
            user_data: UserData::default(),
            timeout: None,
        }
    }

    pub fn cluster_size(mut self, size: usize) -> Self {
        self.cluster_size = size;
        self
    }

    pub fn platforms<I, S>(mut self, platforms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.platforms = platforms.into_iter().map(Into::into).collect();
        self
    }

    pub fn exclude_platforms<I, S>(mut self, platforms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude_platforms = platforms.into_iter().map(Into::into).collect();
        self
    }

    pub fn distros<I, S>(mut self, distros: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.distros = distros.into_iter().map(Into::into).collect();
        self
    }

    pub fn architectures<I, S>(mut self, architectures: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.architectures = architectures.into_iter().map(Into::into).collect();
        self
    }

    pub fn user_data(mut self, user_data: impl Into<UserData>) -> Self {
        self.user_data = user_data.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Whether this test's constraints admit `selection`.
    pub fn matches(&self, selection: &Selection) -> bool {
        let admits = |list: &[String], value: &str| list.is_empty() || list.iter().any(|v| v == value);
        let platform = selection.platform.as_str();

        selection
            .pattern
            .as_ref()
            .is_none_or(|p| p.matches(&self.name))
            && admits(&self.platforms, platform)
            && !self.exclude_platforms.iter().any(|p| p == platform)
            && admits(&self.distros, &selection.distro)
            && admits(&self.architectures, &selection.architecture)
    }
}

impl fmt::Debug for Test {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Test")
            .field("name", &self.name)
            .field("cluster_size", &self.cluster_size)
            .field("platforms", &self.platforms)
            .field("exclude_platforms", &self.exclude_platforms)
            .field("distros", &self.distros)
            .field("architectures", &self.architectures)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("test {0:?} is already registered")]
    Duplicate(String),

    #[error("test names must not be empty")]
    EmptyName,

    #[error("invalid test pattern {pattern:?}: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// Shell-style name pattern: `*` matches any run, `?` one character.
#[derive(Debug, Clone)]
pub struct NamePattern {
    raw: String,
    regex: Regex,
}

impl NamePattern {
    pub fn new(pattern: &str) -> Result<Self, RegistryError> {
        let mut expr = String::with_capacity(pattern.len() + 8);
        expr.push('^');
        for c in pattern.chars() {
            match c {
                '*' => expr.push_str(".*"),
                '?' => expr.push('.'),
                c => expr.push_str(&regex::escape(&c.to_string())),
            }
        }
        expr.push('$');

        let regex = Regex::new(&expr).map_err(|source| RegistryError::Pattern {
            pattern: pattern.to_string(),
            source,
        })?;
        Ok(Self {
            raw: pattern.to_string(),
            regex,
        })
    }

    pub fn matches(&self, name: &str) -> bool {
        self.regex.is_match(name)
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

/// What a run targets; tests are selected against it.
#[derive(Debug, Clone)]
pub struct Selection {
    pub platform: Platform,
    pub distro: String,
    pub architecture: String,
    pub pattern: Option<NamePattern>,
}

/// Mutable registry used during startup.
#[derive(Default)]
pub struct RegistryBuilder {
    tests: Vec<Arc<Test>>,
    names: HashSet<String>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, test: Test) -> Result<(), RegistryError> {
        if test.name.trim().is_empty() {
            return Err(RegistryError::EmptyName);
        }
        if !self.names.insert(test.name.clone()) {
            return Err(RegistryError::Duplicate(test.name));
        }
        self.tests.push(Arc::new(test));
        Ok(())
    }

    /// Ends registration. Tests are ordered by name.
    pub fn freeze(mut self) -> Registry {
        self.tests.sort_by(|a, b| a.name.cmp(&b.name));
        Registry {
            tests: self.tests.into(),
        }
    }
}

/// Frozen, read-only set of tests; cheap to clone and share.
#[derive(Clone, Default)]
pub struct Registry {
    tests: Arc<[Arc<Test>]>,
}

impl Registry {
    pub fn len(&self) -> usize {
        self.tests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Test>> {
        self.tests.iter()
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Test>> {
        self.tests.iter().find(|t| t.name == name)
    }

    /// Tests admitted by `selection`, in name order.
    pub fn select(&self, selection: &Selection) -> Vec<Arc<Test>> {
        self.tests
            .iter()
            .filter(|t| t.matches(selection))
            .cloned()
            .collect()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.tests.iter().map(|t| &t.name))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(name: &str) -> Test {
        Test::new(name, |_c| async { Ok(()) })
    }

    fn selection(platform: Platform, distro: &str) -> Selection {
        Selection {
            platform,
            distro: distro.to_string(),
            architecture: "amd64".to_string(),
            pattern: None,
        }
    }

    #[test]
    fn test_duplicate_registration_is_rejected() {
        let mut builder = RegistryBuilder::new();
        builder.register(noop("cl.basic")).unwrap();
        let err = builder.register(noop("cl.basic")).unwrap_err();
        assert!(matches!(err, RegistryError::Duplicate(ref n) if n == "cl.basic"));
        assert_eq!(builder.freeze().len(), 1);
    }

    #[test]
    fn test_empty_name_is_rejected() {
        let mut builder = RegistryBuilder::new();
        assert!(matches!(
            builder.register(noop(" ")),
            Err(RegistryError::EmptyName)
        ));
    }

    #[test]
    fn test_freeze_orders_by_name() {
        let mut builder = RegistryBuilder::new();
        for name in ["docker.b", "cl.a", "coreos.c"] {
            builder.register(noop(name)).unwrap();
        }
        let names: Vec<_> = builder.freeze().iter().map(|t| t.name.clone()).collect();
        assert_eq!(names, vec!["cl.a", "coreos.c", "docker.b"]);
    }

    #[test]
    fn test_selection_honours_constraints() {
        let mut builder = RegistryBuilder::new();
        builder
            .register(noop("docker.torcx").exclude_platforms(["qemu"]))
            .unwrap();
        builder
            .register(noop("cl.ignition").distros(["cl"]))
            .unwrap();
        builder
            .register(noop("gce.only").platforms(["gce"]))
            .unwrap();
        builder
            .register(noop("arm.only").architectures(["arm64"]))
            .unwrap();
        builder.register(noop("anywhere")).unwrap();
        let registry = builder.freeze();

        let names = |sel: &Selection| -> Vec<String> {
            registry.select(sel).iter().map(|t| t.name.clone()).collect()
        };

        assert_eq!(
            names(&selection(Platform::Qemu, "cl")),
            vec!["anywhere", "cl.ignition"]
        );
        assert_eq!(
            names(&selection(Platform::Gce, "fcos")),
            vec!["anywhere", "docker.torcx", "gce.only"]
        );
    }

    #[test]
    fn test_pattern_selection() {
        let mut builder = RegistryBuilder::new();
        for name in ["cl.ignition.v1.once", "coreos.ignition.v2.once", "docker.torcx"] {
            builder.register(noop(name)).unwrap();
        }
        let registry = builder.freeze();

        let mut sel = selection(Platform::Aws, "cl");
        sel.pattern = Some(NamePattern::new("*.ignition.*").unwrap());
        assert_eq!(registry.select(&sel).len(), 2);

        sel.pattern = Some(NamePattern::new("docker.torc?").unwrap());
        assert_eq!(registry.select(&sel)[0].name, "docker.torcx");

        // Dots are literal, not regex wildcards.
        sel.pattern = Some(NamePattern::new("docker-torcx").unwrap());
        assert!(registry.select(&sel).is_empty());
    }

    #[test]
    fn test_selection_does_not_mutate_registry() {
        let mut builder = RegistryBuilder::new();
        builder.register(noop("a")).unwrap();
        let registry = builder.freeze();
        let shared = registry.clone();

        let _ = registry.select(&selection(Platform::Qemu, "cl"));
        assert_eq!(shared.len(), 1);
        assert!(shared.get("a").is_some());
    }
}
