use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};

use super::commands::{CommandLedger, ControlHandle, LocalCommand};
use super::scheduler::next_sub_wait;
use crate::error::BotError;
use crate::exchange::ExchangeGateway;
use crate::execution::{PositionStore, SnapshotHandle, StatusSnapshot};
use crate::remote::{CommandKind, RemoteControl, StatePublisher};
use crate::risk::RiskGate;
use crate::settings::{ControlSettings, Settings};
use crate::signals::{SentimentAdvisor, SignalSource};
use crate::strategy::StrategyEngine;
use crate::Result;

/// Collaborators injected into the loop
pub struct Components {
    pub gateway: Arc<dyn ExchangeGateway>,
    pub signals: Arc<dyn SignalSource>,
    pub advisor: Option<Arc<dyn SentimentAdvisor>>,
    pub remote: Arc<dyn RemoteControl>,
}

/// What command processing asks of the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Nothing changed
    Idle,
    /// Switched between Standby and Trading
    Transitioned,
    Shutdown,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuntimeState {
    pub running: bool,
    pub cycle_count: u64,
    pub last_signal_scan_at: Option<DateTime<Utc>>,
    pub last_resync_cycle: u64,
}

/// Single owner of the position store. Everything that mutates positions
/// happens on this task.
pub struct ControlLoop {
    settings: ControlSettings,
    ladder_total: f64,
    gateway: Arc<dyn ExchangeGateway>,
    remote: Arc<dyn RemoteControl>,
    store: PositionStore,
    engine: StrategyEngine,
    publisher: StatePublisher,
    snapshots: SnapshotHandle,
    ledger: CommandLedger,
    local: mpsc::UnboundedReceiver<LocalCommand>,
    state: RuntimeState,
    marks: HashMap<String, f64>,
    balance: f64,
}

impl ControlLoop {
    pub fn new(settings: &Settings, components: Components) -> (Self, ControlHandle) {
        let Components {
            gateway,
            signals,
            advisor,
            remote,
        } = components;

        let store = PositionStore::new(
            gateway.clone(),
            settings.strategy.clone(),
            settings.risk.max_positions,
        );
        let engine = StrategyEngine::new(
            settings.strategy.clone(),
            gateway.clone(),
            signals,
            advisor,
            RiskGate::new(&settings.risk, &settings.strategy),
        );

        let (tx, local) = mpsc::unbounded_channel();
        let control_loop = Self {
            settings: settings.control.clone(),
            ladder_total: settings.strategy.ladder_total(),
            gateway,
            remote,
            store,
            engine,
            publisher: StatePublisher::new(settings.control.state_push_min_interval_ms),
            snapshots: SnapshotHandle::default(),
            ledger: CommandLedger::new(settings.control.command_ledger_capacity),
            local,
            state: RuntimeState {
                running: settings.control.auto_start,
                ..Default::default()
            },
            marks: HashMap::new(),
            balance: 0.0,
        };

        (control_loop, ControlHandle::new(tx))
    }

    pub fn state(&self) -> &RuntimeState {
        &self.state
    }

    pub fn store(&self) -> &PositionStore {
        &self.store
    }

    /// Observers clone this and call `latest()`
    pub fn snapshots(&self) -> SnapshotHandle {
        self.snapshots.clone()
    }

    /// Connectivity, trading rules, balance sanity, then recovery of whatever
    /// is already open. Any error here keeps the bot out of Trading.
    pub async fn startup(&mut self) -> Result<()> {
        let server_time = self
            .gateway
            .server_time()
            .await
            .map_err(|e| BotError::Startup(format!("exchange unreachable: {}", e)))?;
        tracing::info!("🔌 Exchange reachable (server time {})", server_time);

        match self.gateway.load_trading_rules().await {
            Ok(count) => tracing::info!("📐 Loaded trading rules for {} symbols", count),
            Err(e) => return Err(BotError::Startup(format!("exchange info: {}", e))),
        }

        match self.gateway.balance().await {
            Ok(balance) => {
                self.balance = balance.wallet_balance;
                if balance.available_balance < self.ladder_total {
                    tracing::warn!(
                        "⚠️ Available balance ${:.2} is below one full ladder (${:.2})",
                        balance.available_balance,
                        self.ladder_total
                    );
                }
            }
            Err(e) => tracing::warn!("⚠️ Could not read balance at startup: {}", e),
        }

        let report = self
            .store
            .recover()
            .await
            .map_err(|e| BotError::Startup(format!("recovery failed: {}", e)))?;
        if !report.recovered.is_empty() {
            tracing::info!("♻️ Managing recovered: {}", report.recovered.join(", "));
        }

        self.refresh_marks().await;
        self.publish(Utc::now()).await;
        Ok(())
    }

    /// Run until a shutdown command. Positions are left open on the exchange.
    pub async fn run(&mut self) -> Result<()> {
        tracing::info!(
            "🚀 Control loop started in {}",
            if self.state.running { "Trading" } else { "Standby" }
        );

        loop {
            if self.tick().await == Flow::Shutdown {
                break;
            }

            let interval = if self.state.running {
                self.settings.cycle_interval_secs
            } else {
                self.settings.standby_interval_secs
            };
            if self.pause(Duration::from_secs(interval)).await == Flow::Shutdown {
                break;
            }
        }

        tracing::info!(
            "🛑 Shutting down; {} position(s) stay open on the exchange",
            self.store.open_count()
        );
        self.state.running = false;
        self.publish_now(Utc::now()).await;
        Ok(())
    }

    /// One iteration: commands first, then a trading cycle or a standby
    /// refresh, then the snapshot.
    pub async fn tick(&mut self) -> Flow {
        let flow = self.process_commands().await;
        if flow == Flow::Shutdown {
            return flow;
        }

        let now = Utc::now();
        if self.state.running {
            self.run_cycle(now).await;
        } else {
            self.refresh_marks().await;
        }
        self.publish(now).await;
        flow
    }

    /// Evaluate positions, then resync and scan on their own cadences
    pub async fn run_cycle(&mut self, now: DateTime<Utc>) {
        self.state.cycle_count += 1;

        let marks = match self.gateway.mark_prices().await {
            Ok(marks) => marks,
            Err(e) => {
                tracing::warn!("Mark prices unavailable ({:?}), skipping cycle: {}", e.class(), e);
                return;
            }
        };
        self.marks = marks;
        self.refresh_balance().await;

        let actions = self.engine.evaluate(&mut self.store, &self.marks, now).await;
        if !actions.is_empty() {
            tracing::info!(
                cycle = self.state.cycle_count,
                steps = actions.steps_added.len(),
                half_closed = actions.half_closed.len(),
                closed = actions.closed.len(),
                emergency = actions.emergency_closed.len(),
                failed = actions.failed.len(),
                "Cycle actions"
            );
        }

        if self.resync_due() {
            self.state.last_resync_cycle = self.state.cycle_count;
            match self.store.resync().await {
                Ok(report) if !report.is_quiet() => {
                    for (symbol, pnl) in &report.stopped_out {
                        self.engine.record_stop_out(symbol, *pnl, now);
                    }
                    for warning in &report.warnings {
                        tracing::warn!("⚠️ Resync: {}", warning);
                    }
                    tracing::info!(
                        "🔄 Resync: removed {:?}, refreshed {:?}, adopted {:?}",
                        report.removed,
                        report.refreshed,
                        report.adopted
                    );
                }
                Ok(_) => {}
                Err(e) => tracing::warn!("Resync failed ({:?}): {}", e.class(), e),
            }
        }

        if self.scan_due(now) {
            self.state.last_signal_scan_at = Some(now);
            if self.store.open_count() >= self.store.max_positions() {
                tracing::debug!("At max positions, skipping pump scan");
            } else {
                match self.engine.scan_for_entries(&mut self.store, now).await {
                    Ok(opened) if !opened.is_empty() => {
                        tracing::info!("🎯 Opened {}", opened.join(", "));
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!("Pump scan failed ({:?}): {}", e.class(), e),
                }
            }
        }
    }

    fn resync_due(&self) -> bool {
        let every = self.settings.resync_every_cycles;
        every > 0 && self.state.cycle_count - self.state.last_resync_cycle >= every
    }

    fn scan_due(&self, now: DateTime<Utc>) -> bool {
        match self.state.last_signal_scan_at {
            None => true,
            Some(last) => {
                now - last >= ChronoDuration::seconds(self.settings.pump_scan_interval_secs as i64)
            }
        }
    }

    /// Apply local commands, then remote ones.
    ///
    /// Every remote id is logged before it is acted on; ids already seen are
    /// ignored.
    pub async fn process_commands(&mut self) -> Flow {
        let mut flow = Flow::Idle;

        while let Ok(command) = self.local.try_recv() {
            let transitioned = match command {
                LocalCommand::Start => self.transition(true),
                LocalCommand::Stop => self.transition(false),
                LocalCommand::Shutdown => return Flow::Shutdown,
            };
            if transitioned {
                flow = Flow::Transitioned;
            }
        }

        let commands = match self.remote.poll_commands().await {
            Ok(commands) => commands,
            Err(e) => {
                tracing::debug!("Command poll failed: {}", e);
                Vec::new()
            }
        };

        for command in commands {
            if !self.ledger.first_sighting(command.id) {
                tracing::debug!("Command {} already handled", command.id);
                continue;
            }
            tracing::info!("📨 Remote command {}: {:?}", command.id, command.kind);

            let transitioned = match command.kind {
                CommandKind::Start => self.transition(true),
                CommandKind::Stop => self.transition(false),
            };
            if transitioned {
                flow = Flow::Transitioned;
            }
        }

        flow
    }

    /// START while trading and STOP while in standby change nothing
    fn transition(&mut self, running: bool) -> bool {
        if self.state.running == running {
            return false;
        }
        self.state.running = running;
        if running {
            tracing::info!("▶️ Trading started");
        } else {
            tracing::info!("⏸️ Trading stopped, standing by");
        }
        true
    }

    /// Sleep up to `total`, polling commands between short sub-waits.
    ///
    /// Returns early on a state change or shutdown.
    pub async fn pause(&mut self, total: Duration) -> Flow {
        let deadline = Instant::now() + total;
        let tick = Duration::from_millis(self.settings.command_poll_ms);

        while let Some(wait) = next_sub_wait(Instant::now(), deadline, tick) {
            tokio::time::sleep(wait).await;
            match self.process_commands().await {
                Flow::Idle => {}
                flow => return flow,
            }
        }
        Flow::Idle
    }

    /// Read-only refresh used in Standby
    async fn refresh_marks(&mut self) {
        if self.store.positions().next().is_some() {
            match self.gateway.mark_prices().await {
                Ok(marks) => self.marks = marks,
                Err(e) => tracing::debug!("Mark prices unavailable: {}", e),
            }
        }
        self.refresh_balance().await;
    }

    async fn refresh_balance(&mut self) {
        match self.gateway.balance().await {
            Ok(balance) => self.balance = balance.wallet_balance,
            Err(e) => tracing::debug!("Balance unavailable: {}", e),
        }
    }

    fn snapshot(&self, now: DateTime<Utc>) -> StatusSnapshot {
        let mut snapshot = self.store.snapshot(
            &self.marks,
            self.balance,
            self.state.running,
            self.state.cycle_count,
        );
        snapshot.updated_at = now;
        snapshot
    }

    /// Local snapshot every time; remote push only when the throttle allows
    async fn publish(&mut self, now: DateTime<Utc>) {
        let snapshot = self.snapshot(now);
        self.publisher
            .publish_at(self.remote.as_ref(), &snapshot, now)
            .await;
        self.snapshots.publish(snapshot);
    }

    /// Bypass the throttle for the final state on shutdown
    async fn publish_now(&mut self, now: DateTime<Utc>) {
        let snapshot = self.snapshot(now);
        if let Err(e) = self.remote.push_state(&snapshot).await {
            tracing::debug!("Final state push failed: {}", e);
        }
        self.snapshots.publish(snapshot);
    }
}

