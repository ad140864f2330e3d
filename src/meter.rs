use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use chrono::{DateTime, Utc};

use crate::{
    AnalyticsStore, ApplicationConfig, ClaimBatchSize, Clock, ConfigSource, CounterStore,
    CounterStoreOptions, Decision, DecisionCache, DecisionCacheTtlMs, DecisionSignature,
    FlushBucketSizeSeconds, FlushConcurrency, FlushOptions, FlushPipeline, Granularity,
    LimitEvaluator, MeteringError, OperationKind, PrimaryStore, RejectionReason, Scope,
    ScopeKind, ServiceConfig, SystemClock, Usage, UserConfig, VersionVector,
    background::BackgroundLoop,
    usage::expand,
    validators::{Subject, validate},
};

/// Configuration for [`Meter`].
#[derive(Clone, Debug)]
pub struct MeterOptions {
    /// Granularities counters are kept for.
    pub granularities: Vec<Granularity>,
    /// Also record application and user usage against the service scope.
    pub rollup_to_service: bool,
    /// Width of the change buckets shared by writers and the flush pipeline.
    pub flush_bucket_size: FlushBucketSizeSeconds,
    /// Buckets flushed in parallel.
    pub flush_concurrency: FlushConcurrency,
    /// Buckets claimed per round trip.
    pub claim_batch_size: ClaimBatchSize,
    /// Lifetime of cached decisions.
    pub decision_cache_ttl_ms: DecisionCacheTtlMs,
}

impl Default for MeterOptions {
    fn default() -> Self {
        Self {
            granularities: Granularity::REPORTING.to_vec(),
            rollup_to_service: true,
            flush_bucket_size: FlushBucketSizeSeconds::default(),
            flush_concurrency: FlushConcurrency::default(),
            claim_batch_size: ClaimBatchSize::default(),
            decision_cache_ttl_ms: DecisionCacheTtlMs::default(),
        }
    }
}

/// Request flags changing how usage is interpreted and what is returned.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Extensions {
    /// Check limits against the usage as given, without adding it to parent metrics.
    /// Recording still propagates to every ancestor.
    pub flat_usage: bool,
    /// Return the decision without usage reports.
    pub no_body: bool,
}

/// Caller-supplied request attributes checked against configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct RequestContext {
    /// Application key or service token.
    pub credential: Option<String>,
    /// Referrer of the originating call.
    pub referrer: Option<String>,
    /// Request flags.
    pub extensions: Extensions,
}

impl RequestContext {
    /// Set the credential.
    pub fn with_credential(mut self, credential: impl Into<String>) -> Self {
        self.credential = Some(credential.into());
        self
    }

    /// Set the referrer.
    pub fn with_referrer(mut self, referrer: impl Into<String>) -> Self {
        self.referrer = Some(referrer.into());
        self
    }

    /// Set the extensions.
    pub fn with_extensions(mut self, extensions: Extensions) -> Self {
        self.extensions = extensions;
        self
    }
}

/// One metered call.
#[derive(Clone, Debug)]
pub struct Transaction {
    /// Who the usage is for.
    pub scope: Scope,
    /// Requested usage.
    pub usage: Usage,
    /// Event time; the meter's clock when absent.
    pub timestamp: Option<DateTime<Utc>>,
    /// Credential, referrer and extensions.
    pub context: RequestContext,
}

impl Transaction {
    /// Transaction for `scope` reporting `usage` now.
    pub fn new(scope: Scope, usage: Usage) -> Self {
        Self {
            scope,
            usage,
            timestamp: None,
            context: RequestContext::default(),
        }
    }

    /// Set an explicit event time.
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Set the request context.
    pub fn with_context(mut self, context: RequestContext) -> Self {
        self.context = context;
        self
    }
}

struct Resolved {
    service: Arc<ServiceConfig>,
    application: Option<Arc<ApplicationConfig>>,
    user: Option<Arc<UserConfig>>,
}

impl Resolved {
    fn subject(&self) -> Subject<'_> {
        match (&self.application, &self.user) {
            (Some(application), _) => Subject::Application(application),
            (None, Some(user)) => Subject::User(user),
            (None, None) => Subject::Service,
        }
    }

    fn plan_id(&self) -> Option<&str> {
        match (&self.application, &self.user) {
            (Some(application), _) => Some(&application.plan_id),
            (None, Some(user)) => Some(&user.plan_id),
            (None, None) => None,
        }
    }

    fn versions(&self) -> VersionVector {
        VersionVector {
            service: self.service.version,
            application: self.application.as_ref().map(|a| a.version),
            user: self.user.as_ref().map(|u| u.version),
        }
    }
}

/// Entry point tying configuration, counters, limits, the decision cache and the flush pipeline
/// together.
///
/// - `authorize`: evaluate only. Decisions are cached.
/// - `authrep`: evaluate, then record the usage when authorized. Only rejections are cached, so
///   a cache hit never has to record anything.
/// - `report`: record without evaluating limits.
/// - `cleanup`: drop expired cached decisions and short-lived counters, once or periodically
///   through `run_cleanup_loop`.
///
/// Transactions carrying an explicit timestamp bypass the decision cache.
pub struct Meter<S, A, C> {
    config: Arc<C>,
    counters: Arc<CounterStore<S>>,
    limits: LimitEvaluator<S, C>,
    flush: Arc<FlushPipeline<S, A>>,
    cache: DecisionCache,
    clock: Arc<dyn Clock>,
    cleanup_loop: Mutex<Option<BackgroundLoop>>,
}

/// Entries dropped by one [`Meter::cleanup`] round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupSummary {
    /// Expired cached decisions.
    pub decisions: usize,
    /// Expired short-lived counters.
    pub counters: usize,
}

impl<S, A, C> Meter<S, A, C>
where
    S: PrimaryStore,
    A: AnalyticsStore,
    C: ConfigSource,
{
    /// Create a meter using the system clock.
    pub fn new(store: Arc<S>, analytics: Arc<A>, config: Arc<C>, options: MeterOptions) -> Self {
        Self::with_clock(store, analytics, config, options, Arc::new(SystemClock))
    }

    /// Create a meter with an explicit clock for default timestamps and change buckets.
    pub fn with_clock(
        store: Arc<S>,
        analytics: Arc<A>,
        config: Arc<C>,
        options: MeterOptions,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let MeterOptions {
            granularities,
            rollup_to_service,
            flush_bucket_size,
            flush_concurrency,
            claim_batch_size,
            decision_cache_ttl_ms,
        } = options;

        let counters = Arc::new(CounterStore::with_clock(
            Arc::clone(&store),
            CounterStoreOptions {
                granularities,
                rollup_to_service,
                flush_bucket_size,
            },
            Arc::clone(&clock),
        ));

        let flush = Arc::new(FlushPipeline::with_clock(
            store,
            analytics,
            FlushOptions {
                flush_bucket_size,
                concurrency: flush_concurrency,
                claim_batch_size,
            },
            Arc::clone(&clock),
        ));

        Self {
            limits: LimitEvaluator::new(Arc::clone(&counters), Arc::clone(&config)),
            config,
            counters,
            flush,
            cache: DecisionCache::new(decision_cache_ttl_ms),
            clock,
            cleanup_loop: Mutex::new(None),
        }
    }

    /// Configuration source.
    pub fn config(&self) -> &Arc<C> {
        &self.config
    }

    /// Counter store.
    pub fn counters(&self) -> &Arc<CounterStore<S>> {
        &self.counters
    }

    /// Limit evaluator.
    pub fn limits(&self) -> &LimitEvaluator<S, C> {
        &self.limits
    }

    /// Flush pipeline.
    pub fn flush(&self) -> &Arc<FlushPipeline<S, A>> {
        &self.flush
    }

    /// Decision cache.
    pub fn cache(&self) -> &DecisionCache {
        &self.cache
    }

    fn resolve(&self, scope: &Scope) -> Result<Resolved, MeteringError> {
        let service_id = scope.service_id();
        let service = self
            .config
            .service(service_id)
            .ok_or_else(|| MeteringError::ServiceNotFound(service_id.to_string()))?;

        let mut resolved = Resolved {
            service,
            application: None,
            user: None,
        };

        match (scope.kind(), scope.instance_id()) {
            (ScopeKind::Service, _) => {}
            (ScopeKind::Application, Some(application_id)) => {
                resolved.application = Some(
                    self.config
                        .application(service_id, application_id)
                        .ok_or_else(|| MeteringError::ApplicationNotFound {
                            service_id: service_id.to_string(),
                            application_id: application_id.to_string(),
                        })?,
                );
            }
            (ScopeKind::User, Some(user_id)) => {
                resolved.user = Some(self.config.user(service_id, user_id).ok_or_else(|| {
                    MeteringError::UserNotFound {
                        service_id: service_id.to_string(),
                        user_id: user_id.to_string(),
                    }
                })?);
            }
            (kind, None) => unreachable!("{kind} scope without an instance id"),
        }

        Ok(resolved)
    }

    async fn decide(
        &self,
        resolved: &Resolved,
        transaction: &Transaction,
        instant: DateTime<Utc>,
    ) -> Result<Decision, MeteringError> {
        let scope = &transaction.scope;
        let extensions = transaction.context.extensions;

        let mut decision = match resolved.plan_id() {
            Some(plan_id) => {
                self.limits
                    .evaluate(
                        scope,
                        plan_id,
                        &transaction.usage,
                        instant,
                        extensions.flat_usage,
                    )
                    .await?
            }
            None => {
                expand(
                    scope.service_id(),
                    &transaction.usage,
                    &resolved.service.metrics,
                    extensions.flat_usage,
                )?;
                Decision::authorized(Vec::new())
            }
        };

        if let Some(reason) = validate(&resolved.service, resolved.subject(), &transaction.context)
        {
            decision.reject(reason);
        }

        if extensions.no_body {
            decision.reports.clear();
        }

        Ok(decision)
    }

    /// Decide whether `transaction` may proceed without recording anything.
    pub async fn authorize(&self, transaction: &Transaction) -> Result<Decision, MeteringError> {
        let resolved = self.resolve(&transaction.scope)?;
        let instant = transaction.timestamp.unwrap_or_else(|| self.clock.now());

        if transaction.timestamp.is_some() {
            return self.decide(&resolved, transaction, instant).await;
        }

        let signature = DecisionSignature::new(
            OperationKind::Authorize,
            &transaction.scope,
            &transaction.usage,
            &transaction.context,
            &resolved.versions(),
        );

        self.cache
            .get_or_compute(signature, || self.decide(&resolved, transaction, instant))
            .await
    }

    /// Decide and, when authorized, record the usage in one step.
    pub async fn authrep(&self, transaction: &Transaction) -> Result<Decision, MeteringError> {
        let resolved = self.resolve(&transaction.scope)?;
        let instant = transaction.timestamp.unwrap_or_else(|| self.clock.now());

        let signature = transaction.timestamp.is_none().then(|| {
            DecisionSignature::new(
                OperationKind::Authrep,
                &transaction.scope,
                &transaction.usage,
                &transaction.context,
                &resolved.versions(),
            )
        });

        if let Some(decision) = signature.as_ref().and_then(|s| self.cache.get(s)) {
            return Ok(decision);
        }

        let decision = self.decide(&resolved, transaction, instant).await?;

        if decision.authorized {
            self.counters
                .apply_usage(
                    &transaction.scope,
                    &resolved.service.metrics,
                    &transaction.usage,
                    instant,
                )
                .await?;
        } else if let Some(signature) = signature {
            self.cache.insert(signature, decision.clone());
        }

        Ok(decision)
    }

    /// Record `transaction` without checking limits.
    ///
    /// State, credential and referrer are still validated: on failure nothing is recorded and
    /// the reason is returned.
    pub async fn report(
        &self,
        transaction: &Transaction,
    ) -> Result<Option<RejectionReason>, MeteringError> {
        let resolved = self.resolve(&transaction.scope)?;

        if let Some(reason) = validate(&resolved.service, resolved.subject(), &transaction.context)
        {
            tracing::debug!(scope = %transaction.scope, %reason, "meter.report_rejected");
            return Ok(Some(reason));
        }

        let instant = transaction.timestamp.unwrap_or_else(|| self.clock.now());

        self.counters
            .apply_usage(
                &transaction.scope,
                &resolved.service.metrics,
                &transaction.usage,
                instant,
            )
            .await?;

        Ok(None)
    }

    /// Drop expired cached decisions and expired counters.
    pub async fn cleanup(&self) -> Result<CleanupSummary, MeteringError> {
        let decisions = self.cache.cleanup();
        let counters = self.counters.store().evict_expired().await?;

        tracing::trace!(decisions, counters, "meter.cleanup");

        Ok(CleanupSummary {
            decisions,
            counters,
        })
    }

    /// Run [`Meter::cleanup`] every `interval` on the current Tokio runtime.
    ///
    /// Calling this while a loop is already running does nothing. The loop ends once the meter
    /// is dropped.
    pub fn run_cleanup_loop(self: &Arc<Self>, interval: Duration) -> Result<(), MeteringError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|err| MeteringError::NoRuntime(err.to_string()))?;

        let mut cleanup_loop = self
            .cleanup_loop
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if cleanup_loop.as_ref().is_some_and(BackgroundLoop::is_running) {
            return Ok(());
        }

        *cleanup_loop = Some(BackgroundLoop::spawn(
            &runtime,
            interval,
            Arc::downgrade(self),
            |meter: Arc<Self>| async move {
                if let Err(err) = meter.cleanup().await {
                    tracing::error!(error = ?err, "Failed to clean up expired entries");
                }
            },
        ));

        Ok(())
    } // end method run_cleanup_loop

    /// Stop the background cleanup loop, if running.
    pub fn stop_cleanup_loop(&self) {
        let running = self
            .cleanup_loop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(running) = running {
            running.stop();
        }
    }

    /// Whether the background cleanup loop is running.
    pub fn is_cleanup_loop_running(&self) -> bool {
        self.cleanup_loop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(BackgroundLoop::is_running)
    }
}

impl<S, A, C> Drop for Meter<S, A, C> {
    fn drop(&mut self) {
        if let Some(running) = self
            .cleanup_loop
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            running.stop();
        }
    }
}
