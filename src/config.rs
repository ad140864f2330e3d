//! Read-only configuration consumed by the metering core.
//!
//! Services, applications, users, metric hierarchies and usage limits are owned by external
//! management APIs. The core only reads them through [`ConfigSource`]. Every record carries a
//! monotonically increasing `version` that the decision cache folds into its keys.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use dashmap::DashMap;

use crate::{Granularity, MetricHierarchy};

/// Lifecycle state of a service, application or user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigState {
    /// Usable.
    Active,
    /// Present but not allowed to make calls.
    Suspended,
}

/// A service and its metric hierarchy.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Service id.
    pub id: String,
    /// Lifecycle state.
    pub state: ConfigState,
    /// Tokens accepted for service-scope calls. Empty means none required.
    pub tokens: Vec<String>,
    /// Whether application referrer filters are enforced.
    pub referrer_filters_required: bool,
    /// Metrics defined for the service.
    pub metrics: MetricHierarchy,
    /// Configuration version, bumped on every mutation including usage limits.
    pub version: u64,
}

impl ServiceConfig {
    /// An active service with the given metrics.
    pub fn new(id: impl Into<String>, metrics: MetricHierarchy) -> Self {
        Self {
            id: id.into(),
            state: ConfigState::Active,
            tokens: Vec::new(),
            referrer_filters_required: false,
            metrics,
            version: 0,
        }
    }
}

/// An application subscribed to a plan of a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationConfig {
    /// Owning service.
    pub service_id: String,
    /// Application id.
    pub id: String,
    /// Plan the application is on.
    pub plan_id: String,
    /// Lifecycle state.
    pub state: ConfigState,
    /// Accepted application keys. Empty means no key is required.
    pub keys: Vec<String>,
    /// Referrer patterns, `*` matching any run of characters.
    pub referrer_filters: Vec<String>,
    /// Configuration version.
    pub version: u64,
}

impl ApplicationConfig {
    /// An active application on `plan_id` with no keys or filters.
    pub fn new(
        service_id: impl Into<String>,
        id: impl Into<String>,
        plan_id: impl Into<String>,
    ) -> Self {
        Self {
            service_id: service_id.into(),
            id: id.into(),
            plan_id: plan_id.into(),
            state: ConfigState::Active,
            keys: Vec::new(),
            referrer_filters: Vec::new(),
            version: 0,
        }
    }
}

/// An end user subscribed to a plan of a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserConfig {
    /// Owning service.
    pub service_id: String,
    /// User id.
    pub id: String,
    /// Plan the user is on.
    pub plan_id: String,
    /// Lifecycle state.
    pub state: ConfigState,
    /// Configuration version.
    pub version: u64,
}

impl UserConfig {
    /// An active user on `plan_id`.
    pub fn new(
        service_id: impl Into<String>,
        id: impl Into<String>,
        plan_id: impl Into<String>,
    ) -> Self {
        Self {
            service_id: service_id.into(),
            id: id.into(),
            plan_id: plan_id.into(),
            state: ConfigState::Active,
            version: 0,
        }
    }
}

/// Maximum value allowed for a metric over one granularity on a plan.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UsageLimit {
    /// Owning service.
    pub service_id: String,
    /// Plan the limit belongs to.
    pub plan_id: String,
    /// Limited metric.
    pub metric_id: String,
    /// Window the limit applies to.
    pub granularity: Granularity,
    /// Maximum allowed counter value.
    pub max_value: i64,
}

/// Lookup interface for externally owned configuration.
pub trait ConfigSource: Send + Sync + 'static {
    /// Service configuration.
    fn service(&self, service_id: &str) -> Option<Arc<ServiceConfig>>;

    /// Application configuration.
    fn application(&self, service_id: &str, application_id: &str)
    -> Option<Arc<ApplicationConfig>>;

    /// User configuration.
    fn user(&self, service_id: &str, user_id: &str) -> Option<Arc<UserConfig>>;

    /// All limits configured for `metric_id` on `plan_id`, one per granularity.
    fn usage_limits(&self, service_id: &str, plan_id: &str, metric_id: &str) -> Vec<UsageLimit>;
}

type LimitKey = (String, String, String);

/// [`ConfigSource`] held in process memory.
///
/// Each mutator bumps the version of the record it touches; usage-limit changes bump the
/// owning service's version, which makes every cached decision for that service unreachable.
#[derive(Debug, Default)]
pub struct InMemoryConfig {
    services: DashMap<String, Arc<ServiceConfig>>,
    applications: DashMap<(String, String), Arc<ApplicationConfig>>,
    users: DashMap<(String, String), Arc<UserConfig>>,
    limits: DashMap<LimitKey, Vec<UsageLimit>>,
    versions: AtomicU64,
}

impl InMemoryConfig {
    /// Empty configuration.
    pub fn new() -> Self {
        Self::default()
    }

    fn next_version(&self) -> u64 {
        self.versions.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Insert or replace a service.
    pub fn put_service(&self, mut service: ServiceConfig) {
        service.version = self.next_version();
        self.services.insert(service.id.clone(), Arc::new(service));
    }

    /// Insert or replace an application.
    pub fn put_application(&self, mut application: ApplicationConfig) {
        application.version = self.next_version();
        self.applications.insert(
            (application.service_id.clone(), application.id.clone()),
            Arc::new(application),
        );
    }

    /// Insert or replace a user.
    pub fn put_user(&self, mut user: UserConfig) {
        user.version = self.next_version();
        self.users
            .insert((user.service_id.clone(), user.id.clone()), Arc::new(user));
    }

    /// Update a service in place. Returns `false` if it does not exist.
    pub fn update_service(&self, service_id: &str, f: impl FnOnce(&mut ServiceConfig)) -> bool {
        let Some(mut entry) = self.services.get_mut(service_id) else {
            return false;
        };

        let mut service = ServiceConfig::clone(&entry);
        f(&mut service);
        service.version = self.next_version();
        *entry = Arc::new(service);

        true
    }

    /// Update an application in place. Returns `false` if it does not exist.
    pub fn update_application(
        &self,
        service_id: &str,
        application_id: &str,
        f: impl FnOnce(&mut ApplicationConfig),
    ) -> bool {
        let key = (service_id.to_string(), application_id.to_string());
        let Some(mut entry) = self.applications.get_mut(&key) else {
            return false;
        };

        let mut application = ApplicationConfig::clone(&entry);
        f(&mut application);
        application.version = self.next_version();
        *entry = Arc::new(application);

        true
    }

    /// Update a user in place. Returns `false` if it does not exist.
    pub fn update_user(
        &self,
        service_id: &str,
        user_id: &str,
        f: impl FnOnce(&mut UserConfig),
    ) -> bool {
        let key = (service_id.to_string(), user_id.to_string());
        let Some(mut entry) = self.users.get_mut(&key) else {
            return false;
        };

        let mut user = UserConfig::clone(&entry);
        f(&mut user);
        user.version = self.next_version();
        *entry = Arc::new(user);

        true
    }

    /// Insert or replace the limit for `(plan, metric, granularity)`.
    pub fn set_usage_limit(&self, limit: UsageLimit) {
        let key = (
            limit.service_id.clone(),
            limit.plan_id.clone(),
            limit.metric_id.clone(),
        );
        let service_id = limit.service_id.clone();

        {
            let mut limits = self.limits.entry(key).or_default();
            limits.retain(|l| l.granularity != limit.granularity);
            limits.push(limit);
            limits.sort_by_key(|l| l.granularity);
        }

        self.update_service(&service_id, |_| {});
    }

    /// Remove the limit for `(plan, metric, granularity)`. Returns whether one existed.
    pub fn remove_usage_limit(
        &self,
        service_id: &str,
        plan_id: &str,
        metric_id: &str,
        granularity: Granularity,
    ) -> bool {
        let key = (
            service_id.to_string(),
            plan_id.to_string(),
            metric_id.to_string(),
        );

        let removed = match self.limits.get_mut(&key) {
            Some(mut limits) => {
                let before = limits.len();
                limits.retain(|l| l.granularity != granularity);
                limits.len() != before
            }
            None => false,
        };

        if removed {
            self.update_service(service_id, |_| {});
        }

        removed
    }
}

impl ConfigSource for InMemoryConfig {
    fn service(&self, service_id: &str) -> Option<Arc<ServiceConfig>> {
        self.services.get(service_id).map(|s| s.clone())
    }

    fn application(
        &self,
        service_id: &str,
        application_id: &str,
    ) -> Option<Arc<ApplicationConfig>> {
        self.applications
            .get(&(service_id.to_string(), application_id.to_string()))
            .map(|a| a.clone())
    }

    fn user(&self, service_id: &str, user_id: &str) -> Option<Arc<UserConfig>> {
        self.users
            .get(&(service_id.to_string(), user_id.to_string()))
            .map(|u| u.clone())
    }

    fn usage_limits(&self, service_id: &str, plan_id: &str, metric_id: &str) -> Vec<UsageLimit> {
        self.limits
            .get(&(
                service_id.to_string(),
                plan_id.to_string(),
                metric_id.to_string(),
            ))
            .map(|l| l.clone())
            .unwrap_or_default()
    }
}
