// src/realtime/supervisor.rs
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout, Instant};
use tracing;

use crate::config::ReconnectPolicy;
use crate::models::connection::{ConnectionQuality, NetworkStatus};
use crate::realtime::channel::RealtimeChannel;
use crate::services::auth_service::AuthSession;

/// Notifications the UI (and owning components) react to.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// A reconnection attempt is starting.
    Reconnecting { attempt: u32 },
    /// The channel is back; subscriptions have been restored.
    Restored,
    /// The attempt ceiling was reached. Emitted exactly once per outage;
    /// after this, only `manual_retry` (or a network change after it) gets
    /// the supervisor going again.
    Exhausted,
    /// Informational quality change for user messaging.
    QualityChanged(ConnectionQuality),
}

/// Re-subscription hook run after every successful reconnect. Owners of
/// per-trip subscriptions register one and deregister it on teardown.
pub type RestoreCallback = Box<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Handle for a registered restore callback.
#[derive(Debug)]
pub struct RestoreRegistration {
    id: u64,
}

struct ReconnectState {
    reconnecting: bool,
    attempts: u32,
    last_attempt: Option<Instant>,
    exhausted_reported: bool,
}

struct SupervisorInner {
    channel: Arc<dyn RealtimeChannel>,
    auth: Arc<dyn AuthSession>,
    policy: ReconnectPolicy,
    state: Mutex<ReconnectState>,
    network: Mutex<NetworkStatus>,
    restore: Mutex<HashMap<u64, RestoreCallback>>,
    next_restore_id: AtomicU64,
    events: broadcast::Sender<ConnectionEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    health_task: Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

/// Watches channel health and drives bounded reconnection: fixed delay
/// between attempts, hard attempt ceiling, reentrancy-safe trigger.
///
/// Runs underneath any number of sessions and trackers; they learn about
/// restored connectivity through restore callbacks and the event stream.
#[derive(Clone)]
pub struct ReconnectionSupervisor {
    inner: Arc<SupervisorInner>,
}

impl ReconnectionSupervisor {
    pub fn new(
        channel: Arc<dyn RealtimeChannel>,
        auth: Arc<dyn AuthSession>,
        policy: ReconnectPolicy,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(SupervisorInner {
                channel,
                auth,
                policy,
                state: Mutex::new(ReconnectState {
                    reconnecting: false,
                    attempts: 0,
                    last_attempt: None,
                    exhausted_reported: false,
                }),
                network: Mutex::new(NetworkStatus::wifi()),
                restore: Mutex::new(HashMap::new()),
                next_restore_id: AtomicU64::new(1),
                events,
                tasks: Mutex::new(Vec::new()),
                health_task: Mutex::new(None),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    pub fn channel(&self) -> Arc<dyn RealtimeChannel> {
        Arc::clone(&self.inner.channel)
    }

    /// Starts the periodic health probe. Idempotent.
    pub fn start(&self) {
        let mut slot = self.inner.health_task.lock().unwrap();
        if slot.is_some() {
            return;
        }
        let supervisor = self.clone();
        let period = self.inner.policy.health_interval;
        *slot = Some(tokio::spawn(async move {
            let mut ticks = interval(period);
            // skip the immediate tick; the caller decides when to first connect
            ticks.tick().await;
            loop {
                ticks.tick().await;
                if supervisor.inner.shut_down.load(Ordering::SeqCst) {
                    return;
                }
                let reachable = supervisor.inner.network.lock().unwrap().reachable;
                if reachable && !supervisor.inner.channel.is_connected() {
                    tracing::debug!("health probe found channel down");
                    supervisor.trigger_reconnect();
                }
            }
        }));
    }

    /// Registers a hook to run after each successful reconnect.
    pub fn register_restore(&self, callback: RestoreCallback) -> RestoreRegistration {
        let id = self.inner.next_restore_id.fetch_add(1, Ordering::Relaxed);
        self.inner.restore.lock().unwrap().insert(id, callback);
        RestoreRegistration { id }
    }

    pub fn deregister_restore(&self, registration: RestoreRegistration) {
        self.inner.restore.lock().unwrap().remove(&registration.id);
    }

    /// Feeds the platform's reachability callback into the supervisor.
    pub fn set_network_status(&self, status: NetworkStatus) {
        let previous = {
            let mut network = self.inner.network.lock().unwrap();
            std::mem::replace(&mut *network, status)
        };

        let quality = ConnectionQuality::from_network(&status);
        if quality != ConnectionQuality::from_network(&previous) {
            let _ = self
                .inner
                .events
                .send(ConnectionEvent::QualityChanged(quality));
        }

        // Coming back online is the cheapest moment to repair the channel.
        if status.reachable && !previous.reachable && !self.inner.channel.is_connected() {
            self.trigger_reconnect();
        }
    }

    pub fn connection_quality(&self) -> ConnectionQuality {
        ConnectionQuality::from_network(&self.inner.network.lock().unwrap())
    }

    /// Clears the attempt counter after an exhausted outage and tries again.
    /// Wired to the UI's explicit "retry" action.
    pub fn manual_retry(&self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            state.attempts = 0;
            state.last_attempt = None;
            state.exhausted_reported = false;
        }
        self.trigger_reconnect();
    }

    /// Starts one reconnection sequence if none is running.
    ///
    /// No-ops when an attempt is already in flight, when the previous attempt
    /// was under `retry_delay` ago, or when the ceiling is reached (reporting
    /// the exhaustion exactly once). The guard is checked and set inside a
    /// single lock acquisition, so concurrent triggers cannot both pass.
    pub fn trigger_reconnect(&self) {
        if self.inner.shut_down.load(Ordering::SeqCst) {
            return;
        }

        let attempt = {
            let mut state = self.inner.state.lock().unwrap();
            if state.reconnecting {
                tracing::debug!("reconnect already in progress");
                return;
            }
            if state.attempts >= self.inner.policy.max_attempts {
                if !state.exhausted_reported {
                    state.exhausted_reported = true;
                    drop(state);
                    tracing::warn!(
                        "reconnect ceiling of {} reached, giving up",
                        self.inner.policy.max_attempts
                    );
                    let _ = self.inner.events.send(ConnectionEvent::Exhausted);
                }
                return;
            }
            if let Some(last) = state.last_attempt {
                if last.elapsed() < self.inner.policy.retry_delay {
                    tracing::debug!("reconnect trigger inside spacing window, ignored");
                    return;
                }
            }
            state.reconnecting = true;
            state.attempts += 1;
            state.last_attempt = Some(Instant::now());
            state.attempts
        };

        let _ = self
            .inner
            .events
            .send(ConnectionEvent::Reconnecting { attempt });

        let supervisor = self.clone();
        let handle = tokio::spawn(async move {
            supervisor.run_attempt(attempt).await;
        });
        self.track_task(handle);
    }

    async fn run_attempt(&self, attempt: u32) {
        let inner = &self.inner;
        tracing::info!("reconnect attempt {} starting", attempt);

        // Fresh socket: drop the old one and give it a moment to tear down.
        inner.channel.disconnect().await;
        sleep(inner.policy.teardown_grace).await;

        let connected = match inner.auth.current_token().await {
            Ok(token) => {
                match timeout(inner.policy.confirm_timeout, inner.channel.connect(&token)).await {
                    Ok(Ok(confirmed)) => confirmed,
                    Ok(Err(e)) => {
                        tracing::warn!("reconnect attempt {} failed: {}", attempt, e);
                        false
                    }
                    Err(_) => {
                        tracing::warn!("reconnect attempt {} unconfirmed in time", attempt);
                        false
                    }
                }
            }
            Err(e) => {
                tracing::warn!("reconnect attempt {} has no token: {}", attempt, e);
                false
            }
        };

        if connected {
            {
                let mut state = inner.state.lock().unwrap();
                state.reconnecting = false;
                state.attempts = 0;
                state.exhausted_reported = false;
            }
            tracing::info!("reconnected after attempt {}", attempt);

            // The fresh socket has no server-side subscriptions; owners
            // re-establish theirs through the registered hooks.
            let pending: Vec<BoxFuture<'static, ()>> = {
                let restore = inner.restore.lock().unwrap();
                restore.values().map(|callback| callback()).collect()
            };
            for restoration in pending {
                restoration.await;
            }

            let _ = inner.events.send(ConnectionEvent::Restored);
            return;
        }

        {
            let mut state = inner.state.lock().unwrap();
            state.reconnecting = false;
        }

        // Exactly one retry per failed attempt, after the fixed delay. The
        // recursion bottoms out at the ceiling check inside the trigger.
        let supervisor = self.clone();
        let delay = inner.policy.retry_delay;
        let handle = tokio::spawn(async move {
            sleep(delay).await;
            supervisor.trigger_reconnect();
        });
        self.track_task(handle);
    }

    fn track_task(&self, handle: JoinHandle<()>) {
        let mut tasks = self.inner.tasks.lock().unwrap();
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }

    /// Cancels every pending timer and probe. Nothing fires after this.
    pub fn shutdown(&self) {
        self.inner.shut_down.store(true, Ordering::SeqCst);
        if let Some(task) = self.inner.health_task.lock().unwrap().take() {
            task.abort();
        }
        for task in self.inner.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        self.inner.restore.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::channel::InMemoryChannel;
    use crate::services::auth_service::SharedTokenSession;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    fn test_policy() -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: 5,
            retry_delay: Duration::from_millis(3000),
            confirm_timeout: Duration::from_millis(5000),
            teardown_grace: Duration::from_millis(300),
            health_interval: Duration::from_secs(30),
        }
    }

    fn supervisor_with(
        channel: Arc<InMemoryChannel>,
    ) -> (ReconnectionSupervisor, broadcast::Receiver<ConnectionEvent>) {
        let auth = Arc::new(SharedTokenSession::new("tok"));
        let supervisor = ReconnectionSupervisor::new(channel, auth, test_policy());
        let events = supervisor.subscribe_events();
        (supervisor, events)
    }

    fn drain(events: &mut broadcast::Receiver<ConnectionEvent>) -> Vec<ConnectionEvent> {
        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        seen
    }

    #[tokio::test(start_paused = true)]
    async fn successful_reconnect_resets_counter() {
        let channel = Arc::new(InMemoryChannel::new());
        let (supervisor, mut events) = supervisor_with(channel.clone());

        supervisor.trigger_reconnect();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(channel.is_connected());
        assert_eq!(channel.connect_attempts(), 1);
        let seen = drain(&mut events);
        assert!(seen.contains(&ConnectionEvent::Reconnecting { attempt: 1 }));
        assert!(seen.contains(&ConnectionEvent::Restored));

        // counter was reset, so a later outage gets the full budget again
        channel.force_disconnect();
        channel.script_connect_results([true]);
        tokio::time::sleep(Duration::from_secs(4)).await;
        supervisor.trigger_reconnect();
        tokio::time::sleep(Duration::from_secs(1)).await;
        let seen = drain(&mut events);
        assert!(seen.contains(&ConnectionEvent::Reconnecting { attempt: 1 }));

        supervisor.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn ceiling_stops_after_five_attempts_and_reports_once() {
        let channel = Arc::new(InMemoryChannel::new());
        channel.script_connect_results([false, false, false, false, false]);
        let (supervisor, mut events) = supervisor_with(channel.clone());

        supervisor.trigger_reconnect();
        // enough virtual time for 5 attempts spaced 3 s apart plus slack
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(channel.connect_attempts(), 5);
        assert!(!channel.is_connected());

        let seen = drain(&mut events);
        let exhausted = seen
            .iter()
            .filter(|event| **event == ConnectionEvent::Exhausted)
            .count();
        assert_eq!(exhausted, 1);

        // a sixth external trigger is a no-op and does not re-report
        supervisor.trigger_reconnect();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(channel.connect_attempts(), 5);
        assert!(drain(&mut events).is_empty());

        supervisor.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_triggers_run_one_sequence() {
        let channel = Arc::new(InMemoryChannel::new());
        let (supervisor, _events) = supervisor_with(channel.clone());

        supervisor.trigger_reconnect();
        supervisor.trigger_reconnect();
        supervisor.trigger_reconnect();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(channel.connect_attempts(), 1);
        supervisor.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn triggers_inside_spacing_window_are_ignored() {
        let channel = Arc::new(InMemoryChannel::new());
        channel.script_connect_results([false, true]);
        let (supervisor, _events) = supervisor_with(channel.clone());

        supervisor.trigger_reconnect();
        // first attempt finishes fast (scripted failure), well inside the
        // 3 s spacing window
        tokio::time::sleep(Duration::from_millis(1000)).await;
        supervisor.trigger_reconnect();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(channel.connect_attempts(), 1);

        // the scheduled retry still happens after the fixed delay
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(channel.connect_attempts(), 2);
        assert!(channel.is_connected());

        supervisor.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn health_probe_repairs_dropped_connection() {
        let channel = Arc::new(InMemoryChannel::new());
        let (supervisor, _events) = supervisor_with(channel.clone());
        supervisor.start();

        // connected at first probe: nothing to do
        channel.connect("tok").await.unwrap();
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(channel.connect_attempts(), 1);

        // drop the socket; next probe notices and reconnects
        channel.force_disconnect();
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(channel.connect_attempts() >= 2);
        assert!(channel.is_connected());

        supervisor.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn health_probe_respects_unreachable_network() {
        let channel = Arc::new(InMemoryChannel::new());
        let (supervisor, _events) = supervisor_with(channel.clone());
        supervisor.set_network_status(NetworkStatus::offline());
        supervisor.start();

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(channel.connect_attempts(), 0);

        supervisor.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn restore_callbacks_run_after_success() {
        let channel = Arc::new(InMemoryChannel::new());
        let (supervisor, _events) = supervisor_with(channel.clone());

        let restored = Arc::new(AtomicU32::new(0));
        let counter = restored.clone();
        let registration = supervisor.register_restore(Box::new(move || {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        }));

        supervisor.trigger_reconnect();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(restored.load(Ordering::SeqCst), 1);

        // deregistered hooks stop firing
        supervisor.deregister_restore(registration);
        channel.force_disconnect();
        tokio::time::sleep(Duration::from_secs(4)).await;
        supervisor.trigger_reconnect();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(restored.load(Ordering::SeqCst), 1);

        supervisor.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn manual_retry_reopens_an_exhausted_supervisor() {
        let channel = Arc::new(InMemoryChannel::new());
        channel.script_connect_results([false, false, false, false, false, true]);
        let (supervisor, mut events) = supervisor_with(channel.clone());

        supervisor.trigger_reconnect();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(channel.connect_attempts(), 5);

        supervisor.manual_retry();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(channel.connect_attempts(), 6);
        assert!(channel.is_connected());
        assert!(drain(&mut events).contains(&ConnectionEvent::Restored));

        supervisor.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_pending_retry() {
        let channel = Arc::new(InMemoryChannel::new());
        channel.script_connect_results([false]);
        let (supervisor, _events) = supervisor_with(channel.clone());

        supervisor.trigger_reconnect();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(channel.connect_attempts(), 1);

        supervisor.shutdown();
        tokio::time::sleep(Duration::from_secs(30)).await;
        // the scheduled retry was aborted; nothing fired after teardown
        assert_eq!(channel.connect_attempts(), 1);
    }
}
