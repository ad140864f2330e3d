use std::fmt;

/// The dimension a counter or limit is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ScopeKind {
    /// The whole service.
    Service,
    /// One application of a service.
    Application,
    /// One end user of a service.
    User,
}

impl ScopeKind {
    /// Key segment prefix for instance scopes; `None` for the service scope.
    pub fn key_prefix(&self) -> Option<&'static str> {
        match self {
            ScopeKind::Service => None,
            ScopeKind::Application => Some("cinstance"),
            ScopeKind::User => Some("uinstance"),
        }
    }

    pub(crate) fn from_key_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            "cinstance" => Some(ScopeKind::Application),
            "uinstance" => Some(ScopeKind::User),
            _ => None,
        }
    }

    /// Name used in analytics tags.
    pub fn as_str(&self) -> &'static str {
        match self {
            ScopeKind::Service => "service",
            ScopeKind::Application => "application",
            ScopeKind::User => "user",
        }
    }
}

impl fmt::Display for ScopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `(kind, service_id, instance_id?)`. The service scope never carries an instance id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Scope {
    kind: ScopeKind,
    service_id: String,
    instance_id: Option<String>,
}

impl Scope {
    /// Service-level scope.
    pub fn service(service_id: impl Into<String>) -> Self {
        Self {
            kind: ScopeKind::Service,
            service_id: service_id.into(),
            instance_id: None,
        }
    }

    /// Application scope under `service_id`.
    pub fn application(service_id: impl Into<String>, application_id: impl Into<String>) -> Self {
        Self {
            kind: ScopeKind::Application,
            service_id: service_id.into(),
            instance_id: Some(application_id.into()),
        }
    }

    /// End-user scope under `service_id`.
    pub fn user(service_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            kind: ScopeKind::User,
            service_id: service_id.into(),
            instance_id: Some(user_id.into()),
        }
    }

    /// Kind of scope.
    pub fn kind(&self) -> ScopeKind {
        self.kind
    }

    /// Owning service.
    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    /// Application or user id; `None` for the service scope.
    pub fn instance_id(&self) -> Option<&str> {
        self.instance_id.as_deref()
    }

    /// The service scope this scope rolls up into.
    pub fn service_scope(&self) -> Scope {
        Scope::service(self.service_id.clone())
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.instance_id {
            Some(id) => write!(f, "service:{}/{}:{}", self.service_id, self.kind, id),
            None => write!(f, "service:{}", self.service_id),
        }
    }
}
