//! Service loop — startup reconciliation, then periodic monitors.
//!
//! Ordering guarantee: no exit or roll action happens until the startup
//! reconciliation pass has completed. If that pass fails, the engine
//! fails closed and refuses to start the monitors rather than act on an
//! unverified book. On shutdown, the current monitor pass runs to
//! completion (its bounded order waits resolve or cancel) before the
//! loop exits; anything ambiguous is left for the next startup's
//! reconciliation.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info};

use condor_core::config::AppConfig;
use condor_gateway::traits::{AdvisoryService, MarketData, OrderGateway};

use crate::entry::EntryExecutor;
use crate::exit::ExitMonitor;
use crate::reconciler::{ReconciliationReport, Reconciler};
use crate::risk::PortfolioRiskManager;
use crate::roll::RollManager;
use crate::store::PositionStore;

/// Owns the engine's components and drives the periodic tasks.
pub struct LifecycleEngine<G, M, A> {
    store: Arc<PositionStore>,
    risk: Arc<PortfolioRiskManager>,
    reconciler: Reconciler<G>,
    exit_monitor: ExitMonitor<G, M, A>,
    roll_manager: RollManager<G, M, A>,
    entry_executor: EntryExecutor<G, M, A>,
    config: AppConfig,
}

impl<G, M, A> LifecycleEngine<G, M, A>
where
    G: OrderGateway,
    M: MarketData,
    A: AdvisoryService,
{
    /// Wires the engine from its collaborators. Every component shares
    /// the same store and risk aggregate.
    pub fn new(
        gateway: Arc<G>,
        market: Arc<M>,
        advisory: Arc<A>,
        config: AppConfig,
    ) -> Self {
        let store = Arc::new(PositionStore::new());
        let risk = Arc::new(PortfolioRiskManager::new(config.risk.clone()));
        Self::with_store(store, risk, gateway, market, advisory, config)
    }

    /// Wires the engine around an existing store and aggregate (used by
    /// tests and by callers that seed positions).
    pub fn with_store(
        store: Arc<PositionStore>,
        risk: Arc<PortfolioRiskManager>,
        gateway: Arc<G>,
        market: Arc<M>,
        advisory: Arc<A>,
        config: AppConfig,
    ) -> Self {
        let reconciler = Reconciler::new(
            Arc::clone(&store),
            Arc::clone(&risk),
            Arc::clone(&gateway),
        );
        let exit_monitor = ExitMonitor::new(
            Arc::clone(&store),
            Arc::clone(&risk),
            Arc::clone(&gateway),
            Arc::clone(&market),
            Arc::clone(&advisory),
            config.clone(),
        );
        let roll_manager = RollManager::new(
            Arc::clone(&store),
            Arc::clone(&risk),
            Arc::clone(&gateway),
            Arc::clone(&market),
            Arc::clone(&advisory),
            config.clone(),
        );
        let entry_executor = EntryExecutor::new(
            Arc::clone(&store),
            Arc::clone(&risk),
            gateway,
            market,
            advisory,
            config.clone(),
        );
        Self {
            store,
            risk,
            reconciler,
            exit_monitor,
            roll_manager,
            entry_executor,
            config,
        }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<PositionStore> {
        &self.store
    }

    #[must_use]
    pub fn risk(&self) -> &Arc<PortfolioRiskManager> {
        &self.risk
    }

    #[must_use]
    pub fn reconciler(&self) -> &Reconciler<G> {
        &self.reconciler
    }

    #[must_use]
    pub fn entry_executor(&self) -> &EntryExecutor<G, M, A> {
        &self.entry_executor
    }

    #[must_use]
    pub fn exit_monitor(&self) -> &ExitMonitor<G, M, A> {
        &self.exit_monitor
    }

    #[must_use]
    pub fn roll_manager(&self) -> &RollManager<G, M, A> {
        &self.roll_manager
    }

    /// Startup pass: reconcile against the broker and rebuild the risk
    /// aggregate. Must complete before any monitor acts; a failure here
    /// fails closed.
    pub async fn startup(&self) -> Result<ReconciliationReport> {
        let report = self
            .reconciler
            .reconcile()
            .await
            .context("startup reconciliation failed; refusing to start monitors")?;
        self.risk.recompute_from_store(&self.store);
        info!(
            matched = report.matched.len(),
            closed_externally = report.closed_externally.len(),
            inconsistent = report.inconsistent.len(),
            untracked = report.untracked.len(),
            "Startup reconciliation complete; monitors may start"
        );
        Ok(report)
    }

    /// Runs the engine until `shutdown` flips to true.
    ///
    /// Monitor passes run to completion inside their select arm, so an
    /// in-flight order wait is never torn down mid-await by shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        self.startup().await?;

        let mut exit_interval =
            interval(Duration::from_secs(self.config.engine.exit_interval_secs));
        exit_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut roll_interval =
            interval(Duration::from_secs(self.config.engine.roll_interval_secs));
        roll_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut reconcile_interval = self.config.engine.reconcile_interval_secs.map(|secs| {
            let mut periodic = interval(Duration::from_secs(secs));
            periodic.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The startup pass just ran; skip the immediate first tick.
            periodic.reset();
            periodic
        });

        info!(
            exit_secs = self.config.engine.exit_interval_secs,
            roll_secs = self.config.engine.roll_interval_secs,
            reconcile_secs = ?self.config.engine.reconcile_interval_secs,
            "Lifecycle engine running"
        );

        loop {
            tokio::select! {
                _ = exit_interval.tick() => {
                    if let Err(e) = self.exit_monitor.run_once().await {
                        error!(error = %e, "Exit monitor pass failed");
                    }
                }
                _ = roll_interval.tick() => {
                    if let Err(e) = self.roll_manager.run_once().await {
                        error!(error = %e, "Roll manager pass failed");
                    }
                }
                _ = tick_optional(&mut reconcile_interval) => {
                    match self.reconciler.reconcile().await {
                        Ok(_) => self.risk.recompute_from_store(&self.store),
                        Err(e) => error!(error = %e, "Periodic reconciliation failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Shutdown requested; stopping monitors");
                        break;
                    }
                }
            }
        }
        Ok(())
    }
}

/// Ticks the periodic reconciliation interval, or pends forever when it
/// is disabled.
async fn tick_optional(interval: &mut Option<tokio::time::Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
