//! Cascading guardrail controller.
//!
//! # Rules
//! ```text
//! alerts(chain, last hour)   >= alert_rate_limit → MUTE_ALERTS(chain), expires
//! alerts(chain, last 15 min) >= alert_kill_limit → KILL_SWITCH(chain), manual reset
//! error rate (trailing window) > error_rate_warn → BACKOFF_COLLECTORS, expires
//! error rate (trailing window) > error_rate_kill → KILL_SWITCH(global), manual reset
//! ```
//!
//! # Design Decisions
//! - Chain rules run on every recorded alert and every sweep; error rules on sweeps
//! - An action never re-fires while its effect is active
//! - Mute and backoff activity is derived from `until` instants, so a late or
//!   skipped sweep cannot extend an effect
//! - Journal writes and event broadcasts happen after the state lock is released

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::clock::Clock;
use crate::config::schema::GuardrailConfig;
use crate::guardrail::journal::ActionJournal;
use crate::guardrail::types::{
    ActionType, AlertDecision, ChainMetrics, ErrorMetrics, GuardrailAction, GuardrailEvent, GuardrailThresholds,
};
use crate::lifecycle::shutdown::Shutdown;
use crate::lifecycle::ticker::{Ticker, TickerHandle};
use crate::observability::metrics;

const HOUR: Duration = Duration::from_secs(3600);
const KILL_WINDOW: Duration = Duration::from_secs(15 * 60);
const MAX_RECENT_ACTIONS: usize = 200;

#[derive(Debug, Default)]
struct ChainState {
    /// Alert instants within the last hour, oldest first.
    alerts: VecDeque<Instant>,
    last_alert: Option<Instant>,
    mute_until: Option<Instant>,
    /// Alerts at or before this instant do not count toward the next mute.
    muted_at: Option<Instant>,
    kill_switch: bool,
}

impl ChainState {
    fn prune(&mut self, now: Instant) {
        while let Some(front) = self.alerts.front() {
            if now.saturating_duration_since(*front) >= HOUR {
                self.alerts.pop_front();
            } else {
                break;
            }
        }
    }

    fn count_within(&self, window: Duration, now: Instant) -> usize {
        self.alerts
            .iter()
            .rev()
            .take_while(|t| now.saturating_duration_since(**t) < window)
            .count()
    }

    fn count_since_mute(&self, now: Instant) -> usize {
        self.alerts
            .iter()
            .rev()
            .take_while(|t| {
                now.saturating_duration_since(**t) < HOUR && self.muted_at.map_or(true, |m| **t > m)
            })
            .count()
    }

    fn is_muted(&self, now: Instant) -> bool {
        self.mute_until.map_or(false, |until| until > now)
    }
}

#[derive(Debug)]
struct ErrorBucket {
    start: Instant,
    total: u64,
    errors: u64,
}

/// Request outcomes in fixed-width buckets over a trailing window.
#[derive(Debug)]
struct ErrorWindow {
    buckets: VecDeque<ErrorBucket>,
    width: Duration,
    span: Duration,
}

impl ErrorWindow {
    fn new(width: Duration, span: Duration) -> Self {
        Self {
            buckets: VecDeque::new(),
            width: width.max(Duration::from_millis(1)),
            span,
        }
    }

    fn record(&mut self, now: Instant, success: bool) {
        self.prune(now);
        let fits = self
            .buckets
            .back()
            .map_or(false, |b| now.saturating_duration_since(b.start) < self.width);
        if !fits {
            self.buckets.push_back(ErrorBucket {
                start: now,
                total: 0,
                errors: 0,
            });
        }
        if let Some(bucket) = self.buckets.back_mut() {
            bucket.total += 1;
            if !success {
                bucket.errors += 1;
            }
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(front) = self.buckets.front() {
            if now.saturating_duration_since(front.start) >= self.span {
                self.buckets.pop_front();
            } else {
                break;
            }
        }
    }

    /// `(total, errors)` within the window.
    fn totals(&self, now: Instant) -> (u64, u64) {
        self.buckets
            .iter()
            .filter(|b| now.saturating_duration_since(b.start) < self.span)
            .fold((0, 0), |(t, e), b| (t + b.total, e + b.errors))
    }

    fn clear(&mut self) {
        self.buckets.clear();
    }
}

#[derive(Debug)]
struct GuardrailState {
    chains: HashMap<String, ChainState>,
    errors: ErrorWindow,
    backoff_until: Option<Instant>,
    global_kill: bool,
    recent: VecDeque<GuardrailAction>,
}

impl GuardrailState {
    fn is_backoff_active(&self, now: Instant) -> bool {
        self.backoff_until.map_or(false, |until| until > now)
    }

    fn remember(&mut self, outcomes: &[Outcome]) {
        for outcome in outcomes {
            if let Outcome::Action { action, .. } = outcome {
                self.recent.push_back(action.clone());
            }
        }
        while self.recent.len() > MAX_RECENT_ACTIONS {
            self.recent.pop_front();
        }
    }
}

/// Produced under the lock, published after it is released.
#[derive(Debug)]
enum Outcome {
    Action {
        action: GuardrailAction,
        event: Option<GuardrailEvent>,
    },
    Event(GuardrailEvent),
}

/// Process-wide mitigation controller.
pub struct GuardrailController {
    thresholds: ArcSwap<GuardrailThresholds>,
    state: Mutex<GuardrailState>,
    journal: Arc<dyn ActionJournal>,
    events: broadcast::Sender<GuardrailEvent>,
    clock: Clock,
}

impl GuardrailController {
    pub fn new(config: &GuardrailConfig, journal: Arc<dyn ActionJournal>) -> Self {
        Self::with_clock(config, journal, Clock::new())
    }

    pub fn with_clock(config: &GuardrailConfig, journal: Arc<dyn ActionJournal>, clock: Clock) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            thresholds: ArcSwap::from_pointee(GuardrailThresholds::from(config)),
            state: Mutex::new(GuardrailState {
                chains: HashMap::new(),
                errors: ErrorWindow::new(
                    Duration::from_secs(config.error_bucket_secs),
                    Duration::from_secs(config.error_window_secs),
                ),
                backoff_until: None,
                global_kill: false,
                recent: VecDeque::new(),
            }),
            journal,
            events,
            clock,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GuardrailEvent> {
        self.events.subscribe()
    }

    pub fn thresholds(&self) -> Arc<GuardrailThresholds> {
        self.thresholds.load_full()
    }

    /// Swap thresholds atomically. Applies from the next evaluation.
    pub fn update_thresholds(&self, thresholds: GuardrailThresholds) {
        tracing::info!(
            alert_rate_limit = thresholds.alert_rate_limit,
            alert_kill_limit = thresholds.alert_kill_limit,
            error_rate_warn = thresholds.error_rate_warn,
            error_rate_kill = thresholds.error_rate_kill,
            mute_duration_min = thresholds.mute_minutes(),
            "Guardrail thresholds updated"
        );
        self.thresholds.store(Arc::new(thresholds));
    }

    /// Count an emitted alert for `chain` and apply the chain rules.
    pub fn record_alert(&self, chain: &str) {
        let now = Instant::now();
        let thresholds = self.thresholds.load();
        let mut out = Vec::new();
        {
            let mut st = self.state.lock();
            let cs = st.chains.entry(chain.to_string()).or_default();
            cs.alerts.push_back(now);
            cs.last_alert = Some(now);
            evaluate_chain(&self.clock, chain, cs, now, &thresholds, &mut out);
            st.remember(&out);
        }
        metrics::record_alert(chain);
        self.publish(out);
    }

    /// Whether an alert for `chain` may be dispatched now.
    pub fn admit_alert(&self, chain: &str) -> AlertDecision {
        let now = Instant::now();
        let st = self.state.lock();
        if st.global_kill {
            return AlertDecision::Killed;
        }
        match st.chains.get(chain) {
            Some(cs) if cs.kill_switch => AlertDecision::Killed,
            Some(cs) if cs.is_muted(now) => AlertDecision::Muted {
                until_ms: cs
                    .mute_until
                    .map_or(0, |until| self.clock.epoch_millis_at(until)),
            },
            _ => AlertDecision::Allowed,
        }
    }

    /// Count one upstream request outcome toward the error rate.
    pub fn record_request(&self, success: bool) {
        let now = Instant::now();
        self.state.lock().errors.record(now, success);
    }

    /// Periodic sweep: expire mutes and backoffs, prune windows, apply every
    /// rule. Returns the events it emitted.
    pub fn run_checks(&self) -> Vec<GuardrailEvent> {
        let now = Instant::now();
        let now_ms = self.clock.epoch_millis_at(now);
        let t = self.thresholds.load();
        let mut out = Vec::new();
        {
            let mut st = self.state.lock();
            let st = &mut *st;

            for (chain, cs) in st.chains.iter_mut() {
                evaluate_chain(&self.clock, chain, cs, now, &t, &mut out);
            }

            if matches!(st.backoff_until, Some(until) if until <= now) {
                st.backoff_until = None;
                tracing::info!("Collector backoff expired, resuming normal polling");
                out.push(Outcome::Event(GuardrailEvent::BackoffResume));
            }

            st.errors.prune(now);
            let (total, errors) = st.errors.totals(now);
            if total > 0 && total >= t.min_error_samples {
                let rate = errors as f64 / total as f64;
                let metadata = json!({
                    "error_rate": rate,
                    "total_requests": total,
                    "error_requests": errors,
                });

                if rate > t.error_rate_kill {
                    if !st.global_kill {
                        st.global_kill = true;
                        let action = GuardrailAction::new(
                            ActionType::KillSwitch,
                            now_ms,
                            format!(
                                "error rate {:.1}% exceeds kill threshold {:.1}%",
                                rate * 100.0,
                                t.error_rate_kill * 100.0
                            ),
                        )
                        .with_metadata(metadata);
                        out.push(Outcome::Action {
                            event: Some(GuardrailEvent::KillSwitch {
                                chain: None,
                                action: action.clone(),
                            }),
                            action,
                        });
                    }
                } else if rate > t.error_rate_warn && !st.is_backoff_active(now) {
                    let until = now + t.backoff_duration;
                    st.backoff_until = Some(until);
                    let until_ms = self.clock.epoch_millis_at(until);
                    let action = GuardrailAction::new(
                        ActionType::BackoffCollectors,
                        now_ms,
                        format!(
                            "error rate {:.1}% exceeds warn threshold {:.1}%",
                            rate * 100.0,
                            t.error_rate_warn * 100.0
                        ),
                    )
                    .lasting(t.backoff_minutes())
                    .with_metadata(metadata);
                    out.push(Outcome::Action {
                        event: Some(GuardrailEvent::Backoff {
                            until_ms,
                            action: action.clone(),
                        }),
                        action,
                    });
                }
            }

            st.remember(&out);
        }

        let events = out
            .iter()
            .filter_map(|o| match o {
                Outcome::Action { event, .. } => event.clone(),
                Outcome::Event(event) => Some(event.clone()),
            })
            .collect();
        self.publish(out);
        events
    }

    /// Engage the global kill switch. Returns false if already engaged.
    pub fn manual_kill_switch(&self, reason: &str) -> bool {
        let now_ms = self.clock.epoch_millis();
        let mut out = Vec::new();
        {
            let mut st = self.state.lock();
            if st.global_kill {
                return false;
            }
            st.global_kill = true;
            let action = GuardrailAction::new(ActionType::KillSwitch, now_ms, reason)
                .with_metadata(json!({ "manual": true }));
            out.push(Outcome::Action {
                event: Some(GuardrailEvent::KillSwitch {
                    chain: None,
                    action: action.clone(),
                }),
                action,
            });
            st.remember(&out);
        }
        self.publish(out);
        true
    }

    /// Clear the global kill switch (`None`) or one chain's. Returns false if
    /// it was not engaged.
    ///
    /// Resetting clears the matching history (error window or chain alerts)
    /// so the switch does not re-trip on the samples that engaged it.
    pub fn reset_kill_switch(&self, chain: Option<&str>) -> bool {
        {
            let mut st = self.state.lock();
            match chain {
                None => {
                    if !st.global_kill {
                        return false;
                    }
                    st.global_kill = false;
                    st.errors.clear();
                }
                Some(name) => match st.chains.get_mut(name) {
                    Some(cs) if cs.kill_switch => {
                        cs.kill_switch = false;
                        cs.alerts.clear();
                        cs.muted_at = None;
                    }
                    _ => return false,
                },
            }
        }
        tracing::info!(chain = ?chain, "Kill switch reset");
        let _ = self.events.send(GuardrailEvent::KillSwitchReset {
            chain: chain.map(str::to_string),
        });
        true
    }

    /// Journal a parameter rollback by the threshold optimizer.
    pub fn record_tuning_rollback(&self, reason: &str, metadata: serde_json::Value) -> GuardrailAction {
        let action = GuardrailAction::new(ActionType::RollbackTuning, self.clock.epoch_millis(), reason)
            .with_metadata(metadata);
        let out = vec![Outcome::Action {
            action: action.clone(),
            event: None,
        }];
        self.state.lock().remember(&out);
        self.publish(out);
        action
    }

    pub fn is_chain_muted(&self, chain: &str) -> bool {
        let now = Instant::now();
        self.state
            .lock()
            .chains
            .get(chain)
            .map_or(false, |cs| cs.is_muted(now))
    }

    /// Global switch, or the global switch or `chain`'s when a chain is given.
    pub fn is_kill_switch_active(&self, chain: Option<&str>) -> bool {
        let st = self.state.lock();
        st.global_kill
            || chain
                .and_then(|c| st.chains.get(c))
                .map_or(false, |cs| cs.kill_switch)
    }

    pub fn is_backoff_active(&self) -> bool {
        self.state.lock().is_backoff_active(Instant::now())
    }

    /// Poll interval a collector should use given its normal `base`.
    /// Doubled (poll rate halved) while backoff is active.
    pub fn poll_interval(&self, base: Duration) -> Duration {
        if self.is_backoff_active() {
            base.saturating_mul(2)
        } else {
            base
        }
    }

    pub fn chain_metrics(&self, chain: &str) -> Option<ChainMetrics> {
        let now = Instant::now();
        let st = self.state.lock();
        st.chains.get(chain).map(|cs| self.chain_snapshot(chain, cs, now))
    }

    /// Metrics for every chain seen, sorted by name.
    pub fn all_chain_metrics(&self) -> Vec<ChainMetrics> {
        let now = Instant::now();
        let st = self.state.lock();
        let mut out: Vec<_> = st
            .chains
            .iter()
            .map(|(chain, cs)| self.chain_snapshot(chain, cs, now))
            .collect();
        out.sort_by(|a, b| a.chain.cmp(&b.chain));
        out
    }

    fn chain_snapshot(&self, chain: &str, cs: &ChainState, now: Instant) -> ChainMetrics {
        ChainMetrics {
            chain: chain.to_string(),
            alerts_last_hour: cs.count_within(HOUR, now),
            alerts_last_15min: cs.count_within(KILL_WINDOW, now),
            last_alert_ms: cs.last_alert.map(|t| self.clock.epoch_millis_at(t)),
            mute_until_ms: cs
                .mute_until
                .filter(|until| *until > now)
                .map(|until| self.clock.epoch_millis_at(until)),
            kill_switch_active: cs.kill_switch,
        }
    }

    pub fn error_metrics(&self) -> ErrorMetrics {
        let now = Instant::now();
        let st = self.state.lock();
        let (total, errors) = st.errors.totals(now);
        ErrorMetrics {
            total_requests: total,
            error_requests: errors,
            error_rate: if total == 0 { 0.0 } else { errors as f64 / total as f64 },
            backoff_active: st.is_backoff_active(now),
            backoff_until_ms: st
                .backoff_until
                .filter(|until| *until > now)
                .map(|until| self.clock.epoch_millis_at(until)),
            kill_switch_active: st.global_kill,
        }
    }

    /// Actions whose effect is still in force, newest first.
    pub fn active_actions(&self) -> Vec<GuardrailAction> {
        let now = Instant::now();
        let now_ms = self.clock.epoch_millis_at(now);
        let st = self.state.lock();
        let mut seen = HashSet::new();
        let mut active = Vec::new();

        for action in st.recent.iter().rev() {
            let chain_state = action.chain.as_deref().and_then(|c| st.chains.get(c));
            let in_force = match action.action_type {
                ActionType::MuteAlerts => {
                    chain_state.map_or(false, |cs| cs.is_muted(now))
                        && action.expires_at().map_or(false, |t| t > now_ms)
                }
                ActionType::BackoffCollectors => {
                    st.is_backoff_active(now) && action.expires_at().map_or(false, |t| t > now_ms)
                }
                ActionType::KillSwitch => match &action.chain {
                    None => st.global_kill,
                    Some(_) => chain_state.map_or(false, |cs| cs.kill_switch),
                },
                ActionType::RollbackTuning => false,
            };
            if in_force && seen.insert((action.action_type, action.chain.clone())) {
                active.push(action.clone());
            }
        }
        active
    }

    /// Up to `limit` most recent actions, newest first.
    pub fn recent_actions(&self, limit: usize) -> Vec<GuardrailAction> {
        self.state.lock().recent.iter().rev().take(limit).cloned().collect()
    }

    /// Re-apply mutes and collector backoffs from the journal whose window
    /// still covers now. Kill switches are not restored. Returns the number
    /// of effects re-applied.
    pub fn restore_from_journal(&self) -> usize {
        let actions = match self.journal.load() {
            Ok(actions) => actions,
            Err(e) => {
                tracing::error!(error = %e, "Failed to load guardrail journal");
                return 0;
            }
        };

        let now = Instant::now();
        let now_ms = self.clock.epoch_millis_at(now);
        let mut restored = 0;
        let mut st = self.state.lock();

        for action in &actions {
            let Some(expires) = action.expires_at().filter(|t| *t > now_ms) else {
                continue;
            };
            let until = self.clock.instant_at(expires);
            match (action.action_type, action.chain.as_deref()) {
                (ActionType::MuteAlerts, Some(chain)) => {
                    let cs = st.chains.entry(chain.to_string()).or_default();
                    cs.mute_until = Some(cs.mute_until.map_or(until, |u| u.max(until)));
                    restored += 1;
                }
                (ActionType::BackoffCollectors, _) => {
                    st.backoff_until = Some(st.backoff_until.map_or(until, |u| u.max(until)));
                    restored += 1;
                }
                _ => {}
            }
        }

        let skip = actions.len().saturating_sub(MAX_RECENT_ACTIONS);
        st.recent.extend(actions.into_iter().skip(skip));
        while st.recent.len() > MAX_RECENT_ACTIONS {
            st.recent.pop_front();
        }

        tracing::info!(restored, "Guardrail state restored from journal");
        restored
    }

    /// Run [`run_checks`](Self::run_checks) every `period` until shutdown.
    pub fn spawn_sweeps(self: &Arc<Self>, period: Duration, shutdown: &Shutdown) -> TickerHandle {
        let controller = Arc::clone(self);
        Ticker::spawn("guardrail-sweep", period, shutdown, move || {
            let controller = controller.clone();
            async move {
                let events = controller.run_checks();
                if !events.is_empty() {
                    tracing::debug!(events = events.len(), "Guardrail sweep emitted events");
                }
            }
        })
    }

    fn publish(&self, outcomes: Vec<Outcome>) {
        for outcome in outcomes {
            match outcome {
                Outcome::Action { action, event } => {
                    tracing::warn!(
                        action_id = %action.id,
                        action_type = action.action_type.as_str(),
                        chain = ?action.chain,
                        duration_min = ?action.duration,
                        reason = %action.reason,
                        "Guardrail action"
                    );
                    metrics::record_guardrail_action(action.action_type.as_str());
                    if let Err(e) = self.journal.append(&action) {
                        tracing::error!(action_id = %action.id, error = %e, "Failed to journal guardrail action");
                    }
                    if let Some(event) = event {
                        let _ = self.events.send(event);
                    }
                }
                Outcome::Event(event) => {
                    let _ = self.events.send(event);
                }
            }
        }
    }
}

impl std::fmt::Debug for GuardrailController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardrailController")
            .field("thresholds", &self.thresholds.load_full())
            .field("state", &self.state)
            .finish()
    }
}

/// Expire a lapsed mute, then apply the kill and mute rules for one chain.
fn evaluate_chain(
    clock: &Clock,
    chain: &str,
    cs: &mut ChainState,
    now: Instant,
    t: &GuardrailThresholds,
    out: &mut Vec<Outcome>,
) {
    cs.prune(now);

    if matches!(cs.mute_until, Some(until) if until <= now) {
        cs.mute_until = None;
        tracing::info!(chain = %chain, "Alert mute expired");
        out.push(Outcome::Event(GuardrailEvent::MuteExpired {
            chain: chain.to_string(),
        }));
    }

    let now_ms = clock.epoch_millis_at(now);
    let last_15 = cs.count_within(KILL_WINDOW, now);
    let last_hour = cs.count_since_mute(now);

    if !cs.kill_switch && last_15 >= t.alert_kill_limit as usize {
        cs.kill_switch = true;
        let action = GuardrailAction::new(
            ActionType::KillSwitch,
            now_ms,
            format!("{} alerts in 15 minutes (limit {})", last_15, t.alert_kill_limit),
        )
        .for_chain(chain)
        .with_metadata(json!({
            "alerts_last_15min": last_15,
            "limit": t.alert_kill_limit,
        }));
        out.push(Outcome::Action {
            event: Some(GuardrailEvent::KillSwitch {
                chain: Some(chain.to_string()),
                action: action.clone(),
            }),
            action,
        });
    }

    if !cs.kill_switch && !cs.is_muted(now) && last_hour >= t.alert_rate_limit as usize {
        let until = now + t.mute_duration;
        cs.mute_until = Some(until);
        cs.muted_at = Some(now);
        let until_ms = clock.epoch_millis_at(until);
        let action = GuardrailAction::new(
            ActionType::MuteAlerts,
            now_ms,
            format!("{} alerts in the last hour (limit {})", last_hour, t.alert_rate_limit),
        )
        .for_chain(chain)
        .lasting(t.mute_minutes())
        .with_metadata(json!({
            "alerts_last_hour": last_hour,
            "limit": t.alert_rate_limit,
            "mute_until": until_ms,
        }));
        out.push(Outcome::Action {
            event: Some(GuardrailEvent::Mute {
                chain: chain.to_string(),
                until_ms,
                action: action.clone(),
            }),
            action,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guardrail::journal::{JournalError, MemoryJournal};

    const EPOCH: u64 = 1_700_000_000_000;

    fn controller(journal: Arc<MemoryJournal>) -> GuardrailController {
        let clock = Clock::anchored_at(Instant::now(), EPOCH);
        GuardrailController::with_clock(&GuardrailConfig::default(), journal, clock)
    }

    fn drain(rx: &mut broadcast::Receiver<GuardrailEvent>) -> Vec<GuardrailEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test(start_paused = true)]
    async fn test_alert_storm_mutes_chain_once() {
        let journal = Arc::new(MemoryJournal::new());
        let guard = controller(journal.clone());
        let mut rx = guard.subscribe();

        for _ in 0..15 {
            guard.record_alert("eth");
            tokio::time::advance(Duration::from_secs(60)).await;
        }
        let entries = journal.entries();
        assert_eq!(entries.len(), 1);
        let mute = &entries[0];
        assert_eq!(mute.action_type, ActionType::MuteAlerts);
        assert_eq!(mute.duration, Some(30));
        assert_eq!(mute.chain.as_deref(), Some("eth"));
        // muted at the 15th alert, recorded 14 minutes in
        assert_eq!(mute.timestamp, EPOCH + 14 * 60_000);
        assert_eq!(mute.metadata["mute_until"], EPOCH + 44 * 60_000);

        guard.record_alert("eth");
        assert_eq!(journal.entries().len(), 1);
        assert!(guard.is_chain_muted("eth"));
        assert!(matches!(guard.admit_alert("eth"), AlertDecision::Muted { .. }));
        assert!(guard.admit_alert("bsc").is_allowed());

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], GuardrailEvent::Mute { chain, .. } if chain == "eth"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_mute_expires_without_sweep() {
        let guard = controller(Arc::new(MemoryJournal::new()));
        for _ in 0..15 {
            guard.record_alert("sol");
        }
        assert!(guard.is_chain_muted("sol"));

        tokio::time::advance(Duration::from_secs(30 * 60)).await;
        assert!(!guard.is_chain_muted("sol"));
        assert!(guard.active_actions().is_empty());

        let mut rx = guard.subscribe();
        guard.run_checks();
        assert_eq!(
            drain(&mut rx),
            vec![GuardrailEvent::MuteExpired { chain: "sol".into() }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_rapid_alerts_trip_chain_kill_switch() {
        let journal = Arc::new(MemoryJournal::new());
        let guard = controller(journal.clone());

        for _ in 0..25 {
            guard.record_alert("base");
        }
        let types: Vec<_> = journal.entries().iter().map(|a| a.action_type).collect();
        assert_eq!(types, vec![ActionType::MuteAlerts, ActionType::KillSwitch]);
        assert!(guard.is_kill_switch_active(Some("base")));
        assert!(!guard.is_kill_switch_active(None));
        assert_eq!(guard.admit_alert("base"), AlertDecision::Killed);

        // never expires on its own
        tokio::time::advance(Duration::from_secs(6 * 3600)).await;
        guard.run_checks();
        assert!(guard.is_kill_switch_active(Some("base")));

        assert!(guard.reset_kill_switch(Some("base")));
        assert!(!guard.reset_kill_switch(Some("base")));
        assert!(guard.admit_alert("base").is_allowed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_spike_backs_off_once() {
        let journal = Arc::new(MemoryJournal::new());
        let guard = controller(journal.clone());

        for i in 0..100 {
            guard.record_request(i >= 12);
        }
        guard.run_checks();
        assert!(guard.is_backoff_active());
        assert_eq!(guard.poll_interval(Duration::from_secs(30)), Duration::from_secs(60));

        for _ in 0..3 {
            guard.record_request(false);
        }
        guard.run_checks();

        let entries = journal.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action_type, ActionType::BackoffCollectors);
        assert_eq!(entries[0].duration, Some(60));
        assert!(!guard.is_kill_switch_active(None));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_resumes_after_window() {
        let guard = controller(Arc::new(MemoryJournal::new()));
        for i in 0..20 {
            guard.record_request(i % 7 != 0);
        }
        guard.run_checks();
        assert!(guard.is_backoff_active());

        tokio::time::advance(Duration::from_secs(3600)).await;
        assert_eq!(guard.poll_interval(Duration::from_secs(30)), Duration::from_secs(30));
        let events = guard.run_checks();
        assert_eq!(events, vec![GuardrailEvent::BackoffResume]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_severe_error_rate_kills_globally() {
        let guard = controller(Arc::new(MemoryJournal::new()));
        for i in 0..50 {
            guard.record_request(i % 2 == 0);
        }
        let events = guard.run_checks();
        assert!(matches!(&events[..], [GuardrailEvent::KillSwitch { chain: None, .. }]));
        assert!(guard.is_kill_switch_active(Some("eth")));
        assert_eq!(guard.admit_alert("eth"), AlertDecision::Killed);
        assert!(!guard.is_backoff_active());

        assert!(guard.reset_kill_switch(None));
        assert_eq!(guard.error_metrics().total_requests, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_too_few_samples_do_not_trigger() {
        let guard = controller(Arc::new(MemoryJournal::new()));
        for _ in 0..5 {
            guard.record_request(false);
        }
        assert!(guard.run_checks().is_empty());
        assert_eq!(guard.error_metrics().error_rate, 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_window_slides() {
        let guard = controller(Arc::new(MemoryJournal::new()));
        for _ in 0..20 {
            guard.record_request(false);
        }
        tokio::time::advance(Duration::from_secs(301)).await;
        for _ in 0..20 {
            guard.record_request(true);
        }
        let metrics = guard.error_metrics();
        assert_eq!(metrics.total_requests, 20);
        assert_eq!(metrics.error_requests, 0);
        assert!(guard.run_checks().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_kill_switch_and_active_actions() {
        let guard = controller(Arc::new(MemoryJournal::new()));
        assert!(guard.manual_kill_switch("maintenance"));
        assert!(!guard.manual_kill_switch("again"));

        let active = guard.active_actions();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].reason, "maintenance");
        assert_eq!(active[0].metadata["manual"], true);

        guard.reset_kill_switch(None);
        assert!(guard.active_actions().is_empty());
        assert_eq!(guard.recent_actions(10).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_reapplies_live_effects_only() {
        let minute = 60_000;
        let journal = Arc::new(MemoryJournal::with_actions(vec![
            GuardrailAction::new(ActionType::MuteAlerts, EPOCH - 10 * minute, "storm")
                .for_chain("eth")
                .lasting(30),
            GuardrailAction::new(ActionType::MuteAlerts, EPOCH - 40 * minute, "old storm")
                .for_chain("bsc")
                .lasting(30),
            GuardrailAction::new(ActionType::BackoffCollectors, EPOCH - 5 * minute, "errors").lasting(60),
            GuardrailAction::new(ActionType::KillSwitch, EPOCH - minute, "manual"),
        ]));
        let guard = controller(journal);

        assert_eq!(guard.restore_from_journal(), 2);
        assert!(guard.is_chain_muted("eth"));
        assert!(!guard.is_chain_muted("bsc"));
        assert!(guard.is_backoff_active());
        assert!(!guard.is_kill_switch_active(None));
        assert_eq!(guard.recent_actions(10).len(), 4);

        tokio::time::advance(Duration::from_secs(20 * 60)).await;
        assert!(!guard.is_chain_muted("eth"));
        assert!(guard.is_backoff_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_threshold_update_applies_to_next_alert() {
        let guard = controller(Arc::new(MemoryJournal::new()));
        guard.update_thresholds(GuardrailThresholds {
            alert_rate_limit: 2,
            ..GuardrailThresholds::default()
        });
        guard.record_alert("arb");
        assert!(!guard.is_chain_muted("arb"));
        guard.record_alert("arb");
        assert!(guard.is_chain_muted("arb"));
    }

    struct FailingJournal;

    impl ActionJournal for FailingJournal {
        fn append(&self, _: &GuardrailAction) -> Result<(), JournalError> {
            Err(JournalError::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk full")))
        }

        fn load(&self) -> Result<Vec<GuardrailAction>, JournalError> {
            Err(JournalError::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk full")))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_journal_failure_is_swallowed() {
        let guard = GuardrailController::new(&GuardrailConfig::default(), Arc::new(FailingJournal));
        assert!(guard.manual_kill_switch("drill"));
        assert!(guard.is_kill_switch_active(None));
        assert_eq!(guard.restore_from_journal(), 0);

        let action = guard.record_tuning_rollback("precision dropped", json!({ "from": 0.7, "to": 0.6 }));
        assert_eq!(action.action_type, ActionType::RollbackTuning);
        assert_eq!(guard.recent_actions(1)[0].id, action.id);
    }
}
