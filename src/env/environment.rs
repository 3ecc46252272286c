//! The trading environment: wires sensors, state and actions together and
//! drives one agent through an event loop.

use crate::api::{AccountApi, AssetsApi, CandlesApi, SubscriptionsApi, TradingApi};
use crate::client::Session;
use crate::domain::{BlitzOptionConfig, Position};
use crate::env::actions::ActionExecutor;
use crate::env::sensors::SensorManager;
use crate::env::state::{EnvironmentState, PositionTransition};
use crate::env::types::{Action, Agent, EnvironmentRules, Observation};
use crate::error::{BlitzError, Result};
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{error, info};

/// Event feeding the agent loop. Sensor updates trigger a fresh observation;
/// closed positions are delivered to the agent exactly once.
#[derive(Debug)]
enum EnvEvent {
    SensorUpdate { sensor_id: String },
    PositionClosed(Position),
}

pub struct TradingEnvironment {
    session: Arc<Session>,
    account: Arc<AccountApi>,
    assets: Arc<AssetsApi>,
    sensors: Arc<SensorManager>,
    executor: ActionExecutor,
    state: Arc<EnvironmentState>,
    rules: Mutex<EnvironmentRules>,
    user_id: AtomicU64,
    balance_id: AtomicU64,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<EnvEvent>>>,
}

impl TradingEnvironment {
    /// Build the environment over an authenticated session. Event wiring
    /// happens here; network state is fetched later by [`initialize`].
    ///
    /// [`initialize`]: TradingEnvironment::initialize
    pub fn new(session: Arc<Session>) -> Arc<Self> {
        let account = Arc::new(AccountApi::new(Arc::clone(&session)));
        let assets = Arc::new(AssetsApi::new(Arc::clone(&session)));
        let candles = CandlesApi::new(Arc::clone(&session));
        let trading = TradingApi::new(Arc::clone(&session));
        let subscriptions = Arc::new(SubscriptionsApi::new(Arc::clone(&session)));
        let sensors =
            SensorManager::new(Arc::clone(&candles), Arc::clone(&trading), subscriptions);
        let state = Arc::new(EnvironmentState::new());
        let executor = ActionExecutor::new(
            Arc::clone(&trading),
            Arc::clone(&account),
            Arc::clone(&assets),
            Arc::clone(&sensors),
        );

        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let environment = Arc::new(Self {
            session,
            account,
            assets,
            sensors: Arc::clone(&sensors),
            executor,
            state: Arc::clone(&state),
            rules: Mutex::new(EnvironmentRules::default()),
            user_id: AtomicU64::new(0),
            balance_id: AtomicU64::new(0),
            events_rx: Mutex::new(Some(events_rx)),
        });

        // Every buffered sensor reading wakes the agent loop.
        let tx = events_tx.clone();
        sensors.on_update(move |sensor_id, _| {
            let _ = tx.send(EnvEvent::SensorUpdate { sensor_id: sensor_id.to_string() });
        });

        // Position events fold into the state; the first close of an id is
        // forwarded to the agent, duplicates never are.
        let tx = events_tx;
        trading.on_position_changed(move |position| {
            if let PositionTransition::Closed(closed) = state.apply_position(position) {
                let _ = tx.send(EnvEvent::PositionClosed(closed));
            }
        });

        environment
    }

    /// Fetch profile, demo balance and the instrument catalog, then open the
    /// always-on subscriptions.
    pub async fn initialize(&self) -> Result<()> {
        let profile = self.account.get_profile().await?.into_result("profile")?;
        self.user_id.store(profile.user_id, Ordering::SeqCst);

        let demo = self.account.get_demo_balance().await?;
        self.balance_id.store(demo.id, Ordering::SeqCst);
        self.state.set_balance(demo.amount);

        // Ask the server to push trade outcomes back over the socket.
        self.account.set_options(json!({ "sendResults": true })).await?;

        let tradable = self.assets.list_blitz_options().await?;
        if let Some(min_bet) = tradable.iter().map(|asset| asset.minimal_bet).min() {
            self.rules.lock().unwrap().min_bet = min_bet;
        }
        let asset_count = tradable.len();
        self.state.set_assets(tradable);

        let balance_id = demo.id;
        let state = Arc::clone(&self.state);
        self.account
            .subscribe_balance_changed(move |event| {
                if event.current_balance.id == balance_id {
                    state.set_balance(event.current_balance.amount);
                }
            })
            .await?;

        info!(
            user_id = profile.user_id,
            balance_id,
            balance = %demo.amount,
            assets = asset_count,
            "environment initialized"
        );
        Ok(())
    }

    pub fn user_id(&self) -> u64 {
        self.user_id.load(Ordering::SeqCst)
    }

    pub fn balance_id(&self) -> u64 {
        self.balance_id.load(Ordering::SeqCst)
    }

    pub fn rules(&self) -> EnvironmentRules {
        self.rules.lock().unwrap().clone()
    }

    pub fn available_assets(&self) -> Vec<BlitzOptionConfig> {
        self.state.assets()
    }

    pub fn sensors(&self) -> &Arc<SensorManager> {
        &self.sensors
    }

    /// Seconds until a position expires against the server clock, zero when
    /// already expired or never expiring.
    pub fn remaining_time(&self, position: &Position) -> u64 {
        let Some(expiration) = position.expiration_time else {
            return 0;
        };
        expiration.saturating_sub(self.now_secs())
    }

    fn now_secs(&self) -> u64 {
        self.session
            .server_time_secs()
            .unwrap_or_else(|| chrono::Utc::now().timestamp() as u64)
    }

    /// A fresh observation: sensor buffers plus state snapshot, stamped with
    /// the server clock (local clock until the first time sync).
    pub fn observation(&self) -> Observation {
        let now = self.now_secs();
        self.state.set_server_time(now);
        Observation {
            sensors: self.sensors.get_all(),
            state: self.state.snapshot(),
            timestamp: now,
        }
    }

    /// Execute a batch sequentially. A failed action is logged and the rest
    /// of the batch still runs.
    pub async fn execute_actions(&self, actions: Vec<Action>) {
        for action in actions {
            let label = action_label(&action);
            if let Err(err) = self.executor.execute(action).await {
                error!(action = label, error = %err, "action failed");
            }
        }
    }

    /// Drive one agent: initialize it, then loop over environment events
    /// until the event channel closes. Only one loop may run per
    /// environment.
    pub async fn run_agent(&self, agent: &mut dyn Agent) -> Result<()> {
        let mut events = self
            .events_rx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| BlitzError::Agent("agent loop is already running".to_string()))?;

        agent.initialize(self).await?;
        info!(agent = agent.name(), "agent running");

        while let Some(event) = events.recv().await {
            match event {
                EnvEvent::SensorUpdate { sensor_id } => {
                    let observation = self.observation();
                    match agent.on_observation(&observation).await {
                        Ok(actions) if !actions.is_empty() => self.execute_actions(actions).await,
                        Ok(_) => {}
                        Err(err) => {
                            error!(agent = agent.name(), sensor_id, error = %err, "agent failed on observation");
                        }
                    }
                }
                EnvEvent::PositionClosed(position) => agent.on_trade_result(&position),
            }
        }
        Ok(())
    }
}

fn action_label(action: &Action) -> &'static str {
    match action {
        Action::Trade(_) => "trade",
        Action::Subscribe(_) => "subscribe",
        Action::Unsubscribe { .. } => "unsubscribe",
        Action::Query(_) => "query",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::testing::{data, push, MockSink};
    use crate::client::transport::FrameSink;
    use crate::env::types::Sensor;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use tokio::task::yield_now;

    fn setup(sink: &Arc<MockSink>) -> (Arc<TradingEnvironment>, Arc<Session>) {
        let session = Session::new(Arc::clone(sink) as Arc<dyn FrameSink>);
        (TradingEnvironment::new(Arc::clone(&session)), session)
    }

    /// Reply to the next outbound call once it shows up on the sink.
    async fn respond(
        session: &Arc<Session>,
        sink: &Arc<MockSink>,
        seen: &mut usize,
        msg: serde_json::Value,
    ) {
        while sink.sent_count() == *seen {
            yield_now().await;
        }
        *seen = sink.sent_count();
        let frame = sink.sent().last().cloned().unwrap();
        let request_id = frame.request_id.clone().unwrap();
        session.handle_frame(data(&request_id, "reply", msg));
    }

    #[tokio::test]
    async fn initialize_seeds_identity_balance_and_assets() {
        let sink = MockSink::new();
        let (environment, session) = setup(&sink);

        let env = Arc::clone(&environment);
        let task = tokio::spawn(async move { env.initialize().await });

        let mut seen = 0;
        respond(
            &session,
            &sink,
            &mut seen,
            json!({"isSuccessful": true, "result": {"user_id": 9, "balance_id": 14, "balance": 10000.0, "currency": "USD"}}),
        )
        .await;
        respond(
            &session,
            &sink,
            &mut seen,
            json!({"result": [
                {"id": 13, "type": 1, "amount": 0.0},
                {"id": 14, "type": 4, "amount": 10000.0},
            ]}),
        )
        .await;
        // setOptions is fire-and-forget; the next correlated call is the
        // initialization data.
        while sink.sent_count() < seen + 2 {
            yield_now().await;
        }
        seen = sink.sent_count();
        let init_call = sink.sent()[seen - 1].clone();
        assert_eq!(init_call.msg["name"], "get-initialization-data");
        session.handle_frame(data(
            init_call.request_id.as_deref().unwrap(),
            "initialization-data",
            json!({"turbo": {"actives": {
                "76": {"name": "front.EURUSD-OTC", "enabled": true, "minimal_bet": 2,
                        "option": {"profit": {"commission": 14.0}}},
                "1": {"name": "front.EURUSD", "enabled": false}
            }}}),
        ));

        task.await.unwrap().unwrap();
        assert_eq!(environment.user_id(), 9);
        assert_eq!(environment.balance_id(), 14);
        assert_eq!(environment.rules().min_bet, dec!(2));
        assert_eq!(environment.available_assets().len(), 1);
        assert_eq!(environment.observation().state.balance, dec!(10000));

        // balance-changed stream is live and filtered by balance id.
        session.handle_frame(push(
            "balance-changed",
            json!({"current_balance": {"id": 14, "amount": 10030.0}}),
        ));
        session.handle_frame(push(
            "balance-changed",
            json!({"current_balance": {"id": 13, "amount": 1.0}}),
        ));
        assert_eq!(environment.observation().state.balance, dec!(10030));
    }

    struct RecordingAgent {
        observations: Arc<Mutex<usize>>,
        results: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Agent for RecordingAgent {
        fn name(&self) -> &str {
            "recording"
        }

        async fn initialize(&mut self, env: &TradingEnvironment) -> Result<()> {
            env.sensors().subscribe(Sensor::candle(76, 1)).await
        }

        async fn on_observation(&mut self, _observation: &Observation) -> Result<Vec<Action>> {
            *self.observations.lock().unwrap() += 1;
            Ok(Vec::new())
        }

        fn on_trade_result(&mut self, position: &Position) {
            self.results.lock().unwrap().push(position.id.to_string());
        }
    }

    #[tokio::test]
    async fn agent_loop_observes_sensors_and_sees_each_close_once() {
        let sink = MockSink::new();
        let (environment, session) = setup(&sink);

        let observations = Arc::new(Mutex::new(0));
        let results = Arc::new(Mutex::new(Vec::new()));
        let mut agent = RecordingAgent {
            observations: Arc::clone(&observations),
            results: Arc::clone(&results),
        };

        let env = Arc::clone(&environment);
        let loop_task = tokio::spawn(async move { env.run_agent(&mut agent).await });

        // Wait for the agent's candle subscription to go out.
        while sink.sent_count() == 0 {
            yield_now().await;
        }

        session.handle_frame(push(
            "candle-generated",
            json!({"from": 1, "to": 2, "open": 1.0, "close": 1.1, "min": 1.0, "max": 1.1,
                    "active_id": 76, "size": 1}),
        ));
        while *observations.lock().unwrap() == 0 {
            yield_now().await;
        }

        // The same close event twice reaches the agent once.
        let closed = json!({"id": 41, "status": "closed", "close_reason": "win", "pnl": 24.0});
        session.handle_frame(push("portfolio.position-changed", closed.clone()));
        session.handle_frame(push("portfolio.position-changed", closed));
        while results.lock().unwrap().is_empty() {
            yield_now().await;
        }
        yield_now().await;

        assert_eq!(*results.lock().unwrap(), vec!["41".to_string()]);
        assert_eq!(environment.observation().state.closed_count, 1);

        loop_task.abort();
    }

    /// Errors on the first `fail_first` observations, then counts the rest.
    struct ErraticAgent {
        fail_first: usize,
        attempts: Arc<Mutex<usize>>,
        successes: Arc<Mutex<usize>>,
    }

    #[async_trait]
    impl Agent for ErraticAgent {
        fn name(&self) -> &str {
            "erratic"
        }

        async fn initialize(&mut self, env: &TradingEnvironment) -> Result<()> {
            env.sensors().subscribe(Sensor::candle(76, 1)).await
        }

        async fn on_observation(&mut self, _observation: &Observation) -> Result<Vec<Action>> {
            let mut attempts = self.attempts.lock().unwrap();
            *attempts += 1;
            if *attempts <= self.fail_first {
                return Err(BlitzError::Agent("bad cycle".to_string()));
            }
            *self.successes.lock().unwrap() += 1;
            Ok(Vec::new())
        }

        fn on_trade_result(&mut self, _position: &Position) {}
    }

    #[tokio::test]
    async fn agent_observation_error_does_not_stop_the_loop() {
        let sink = MockSink::new();
        let (environment, session) = setup(&sink);

        let attempts = Arc::new(Mutex::new(0));
        let successes = Arc::new(Mutex::new(0));
        let mut agent = ErraticAgent {
            fail_first: 1,
            attempts: Arc::clone(&attempts),
            successes: Arc::clone(&successes),
        };

        let env = Arc::clone(&environment);
        let loop_task = tokio::spawn(async move { env.run_agent(&mut agent).await });
        while sink.sent_count() == 0 {
            yield_now().await;
        }

        let candle = json!({"from": 1, "to": 2, "open": 1.0, "close": 1.1, "min": 1.0,
                             "max": 1.1, "active_id": 76, "size": 1});
        // First update makes the agent fail; the loop must survive and
        // deliver the second one.
        session.handle_frame(push("candle-generated", candle.clone()));
        while *attempts.lock().unwrap() < 1 {
            yield_now().await;
        }
        session.handle_frame(push("candle-generated", candle));
        while *successes.lock().unwrap() == 0 {
            yield_now().await;
        }

        assert_eq!(*attempts.lock().unwrap(), 2);
        assert_eq!(*successes.lock().unwrap(), 1);

        loop_task.abort();
    }

    #[tokio::test]
    async fn failed_actions_do_not_stop_the_batch() {
        let sink = MockSink::failing();
        let session = Session::new(Arc::clone(&sink) as Arc<dyn FrameSink>);
        let environment = TradingEnvironment::new(session);

        // Both sends fail against the dead sink; neither failure aborts the
        // batch.
        environment
            .execute_actions(vec![
                Action::Subscribe(Sensor::candle(76, 1)),
                Action::Unsubscribe { sensor_id: "candle:76:1".to_string() },
            ])
            .await;
    }

    #[tokio::test]
    async fn second_agent_loop_is_rejected() {
        let sink = MockSink::new();
        let (environment, _session) = setup(&sink);

        // Steal the receiver as the first loop would.
        environment.events_rx.lock().unwrap().take().unwrap();

        let mut agent = RecordingAgent {
            observations: Arc::new(Mutex::new(0)),
            results: Arc::new(Mutex::new(Vec::new())),
        };
        let err = environment.run_agent(&mut agent).await.unwrap_err();
        assert!(matches!(err, BlitzError::Agent(_)));
    }
}
