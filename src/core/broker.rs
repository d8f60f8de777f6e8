//! Broker: polls agent queues and runs each message through the executor.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::core::message::{Message, MessageType, COST_METADATA_KEY};
use crate::core::queue::QueueManager;
use crate::core::session::SessionManager;
use crate::error::{Error, Result};
use crate::providers::Executor;

/// Called with each response produced by the poll loop.
pub type ResponseHandler = Box<dyn Fn(Message) + Send + Sync>;

/// Called with the agent id and its wrapped error when a turn fails.
pub type ErrorHandler = Box<dyn Fn(&str, &Error) + Send + Sync>;

/// Coordinates queues, sessions and the executor for a fixed set of agents.
pub struct Broker {
    queues: Arc<QueueManager>,
    sessions: Arc<SessionManager>,
    executor: Arc<dyn Executor>,
    on_response: Option<ResponseHandler>,
    on_error: Option<ErrorHandler>,
    agents: Vec<String>,
}

impl Broker {
    pub fn new(
        queues: Arc<QueueManager>,
        sessions: Arc<SessionManager>,
        executor: Arc<dyn Executor>,
    ) -> Self {
        Self {
            queues,
            sessions,
            executor,
            on_response: None,
            on_error: None,
            agents: Vec::new(),
        }
    }

    /// Create the agent's session and queue, then register it for polling.
    pub fn initialize_agent(&mut self, agent_id: &str) -> Result<()> {
        // Queue first: it is the only step that can fail.
        self.queues.get_queue(agent_id)?;
        self.sessions.create_session(agent_id);

        self.agents.push(agent_id.to_string());
        tracing::info!(agent = agent_id, "Initialized agent");
        Ok(())
    }

    /// Registered agents in polling order.
    pub fn agents(&self) -> &[String] {
        &self.agents
    }

    pub fn set_response_handler(&mut self, handler: impl Fn(Message) + Send + Sync + 'static) {
        self.on_response = Some(Box::new(handler));
    }

    pub fn set_error_handler(&mut self, handler: impl Fn(&str, &Error) + Send + Sync + 'static) {
        self.on_error = Some(Box::new(handler));
    }

    /// Enqueue a message on its recipient's queue.
    pub fn send_message(&self, msg: &Message) -> Result<()> {
        let queue = self.queues.get_queue(&msg.to)?;
        queue.enqueue(msg)
    }

    /// Enqueue a message to `to_agent` that appears to come from `as_agent`.
    pub fn inject(&self, as_agent: &str, to_agent: &str, text: &str) -> Result<Message> {
        let msg = Message::new(as_agent, to_agent, MessageType::Inject, text);
        self.send_message(&msg)?;
        tracing::debug!(from = as_agent, to = to_agent, id = %msg.id, "Injected message");
        Ok(msg)
    }

    /// Run one turn for `agent_id`.
    ///
    /// Returns `None` when the queue is empty. The response is returned to the
    /// caller and is not enqueued anywhere. A message that fails after being
    /// dequeued is not restored.
    pub async fn process_next(
        &self,
        cancel: &CancellationToken,
        agent_id: &str,
    ) -> Result<Option<Message>> {
        let queue = self.queues.get_queue(agent_id)?;
        let Some(msg) = queue.dequeue()? else {
            return Ok(None);
        };

        let session = self.sessions.get_session(agent_id)?;
        let is_new = !session.is_started();

        tracing::debug!(
            agent = agent_id,
            id = %msg.id,
            from = %msg.from,
            is_new,
            "Executing turn"
        );
        let result = self
            .executor
            .execute(cancel, &session.session_id, msg.text(), is_new)
            .await?;

        if is_new || result.session_id != session.session_id {
            self.sessions.set_session_id(agent_id, &result.session_id)?;
        }
        self.sessions.increment_turn(agent_id)?;

        let turn_number = session.turn_number + 1;
        tracing::info!(
            agent = agent_id,
            turn = turn_number,
            cost = result.cost,
            "Turn completed"
        );

        let response = Message::agent(agent_id, &msg.from, result.response)
            .with_context(result.session_id, turn_number)
            .with_metadata(COST_METADATA_KEY, format!("{:.6}", result.cost));
        Ok(Some(response))
    }

    /// One poll pass over every registered agent, in registration order.
    ///
    /// Per-agent failures go to the error handler and do not stop the pass.
    /// Once `cancel` fires no further agent is started.
    pub async fn process_all(&self, cancel: &CancellationToken) {
        for agent_id in &self.agents {
            if cancel.is_cancelled() {
                break;
            }

            match self.process_next(cancel, agent_id).await {
                Ok(Some(response)) => {
                    if let Some(handler) = &self.on_response {
                        handler(response);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    let err = e.for_agent(agent_id.as_str());
                    if let Some(handler) = &self.on_error {
                        handler(agent_id, &err);
                    }
                }
            }
        }
    }

    /// Poll every `poll_interval` until `cancel` fires.
    ///
    /// A pass that overruns the interval delays the next tick instead of
    /// queuing extra ones.
    pub async fn run(&self, cancel: CancellationToken, poll_interval: Duration) {
        let mut ticker = interval_at(Instant::now() + poll_interval, poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            agents = ?self.agents,
            poll_interval_ms = poll_interval.as_millis() as u64,
            "Broker started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.process_all(&cancel).await,
            }
        }

        tracing::info!("Broker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::message::{AGENT_A, AGENT_B, HUMAN};
    use crate::providers::{ExecuteResult, ExecutorError};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    #[derive(Debug, Clone, PartialEq)]
    struct Call {
        session_id: String,
        text: String,
        is_new: bool,
    }

    /// Starts sessions as `sess-<text>`, echoes the session id on resume, and
    /// fails any message whose text is `boom`.
    #[derive(Default)]
    struct MockExecutor {
        calls: Mutex<Vec<Call>>,
    }

    impl MockExecutor {
        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Executor for MockExecutor {
        async fn execute(
            &self,
            _cancel: &CancellationToken,
            session_id: &str,
            text: &str,
            is_new: bool,
        ) -> std::result::Result<ExecuteResult, ExecutorError> {
            self.calls.lock().unwrap().push(Call {
                session_id: session_id.to_string(),
                text: text.to_string(),
                is_new,
            });

            if text == "boom" {
                return Err(ExecutorError::Failed {
                    status: "exit status: 1".to_string(),
                    stderr: "collaborator crashed".to_string(),
                });
            }

            let session_id = if is_new {
                format!("sess-{}", text)
            } else {
                session_id.to_string()
            };
            Ok(ExecuteResult {
                session_id,
                response: format!("re: {}", text),
                cost: 0.001,
            })
        }
    }

    /// Starts session `s1` and replies `hi`.
    struct ScriptedExecutor;

    #[async_trait]
    impl Executor for ScriptedExecutor {
        async fn execute(
            &self,
            _cancel: &CancellationToken,
            _session_id: &str,
            _text: &str,
            is_new: bool,
        ) -> std::result::Result<ExecuteResult, ExecutorError> {
            assert!(is_new);
            Ok(ExecuteResult {
                session_id: "s1".to_string(),
                response: "hi".to_string(),
                cost: 0.001,
            })
        }
    }

    /// Blocks until cancelled.
    struct HangingExecutor;

    #[async_trait]
    impl Executor for HangingExecutor {
        async fn execute(
            &self,
            cancel: &CancellationToken,
            _session_id: &str,
            _text: &str,
            _is_new: bool,
        ) -> std::result::Result<ExecuteResult, ExecutorError> {
            cancel.cancelled().await;
            Err(ExecutorError::Cancelled)
        }
    }

    struct Fixture {
        _tmp: tempfile::TempDir,
        queues: Arc<QueueManager>,
        sessions: Arc<SessionManager>,
    }

    fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let queues = Arc::new(QueueManager::new(tmp.path().join("queues")).unwrap());
        let sessions = Arc::new(SessionManager::new(tmp.path().join("sessions")).unwrap());
        Fixture {
            _tmp: tmp,
            queues,
            sessions,
        }
    }

    impl Fixture {
        fn broker(&self, executor: Arc<dyn Executor>, agents: &[&str]) -> Broker {
            let mut broker = Broker::new(self.queues.clone(), self.sessions.clone(), executor);
            for agent in agents {
                broker.initialize_agent(agent).unwrap();
            }
            broker
        }
    }

    #[test]
    fn test_initialize_agent() {
        let fx = fixture();
        let broker = fx.broker(Arc::new(MockExecutor::default()), &[AGENT_A, AGENT_B]);

        assert_eq!(broker.agents(), &[AGENT_A.to_string(), AGENT_B.to_string()]);
        let session = fx.sessions.get_session(AGENT_A).unwrap();
        assert_eq!(session.agent_id, AGENT_A);
        assert_eq!(session.turn_number, 0);
        assert!(fx.queues.base_dir().join(AGENT_B).is_dir());
    }

    #[test]
    fn test_initialize_agent_failure_registers_nothing() {
        let fx = fixture();
        // A file where the agent's queue directory should go.
        std::fs::write(fx.queues.base_dir().join("blocked"), "x").unwrap();

        let mut broker = Broker::new(
            fx.queues.clone(),
            fx.sessions.clone(),
            Arc::new(MockExecutor::default()),
        );
        let err = broker.initialize_agent("blocked").unwrap_err();

        assert!(matches!(err, Error::Storage { .. }));
        assert!(broker.agents().is_empty());
        assert!(fx.sessions.get_session("blocked").is_err());
    }

    #[test]
    fn test_send_message() {
        let fx = fixture();
        let broker = fx.broker(Arc::new(MockExecutor::default()), &[AGENT_A]);

        broker.send_message(&Message::user(AGENT_A, "hello agent")).unwrap();

        assert_eq!(fx.queues.get_queue(AGENT_A).unwrap().len().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_process_next_scenario() {
        let fx = fixture();
        let broker = fx.broker(Arc::new(ScriptedExecutor), &[AGENT_A]);
        broker.send_message(&Message::user(AGENT_A, "hello")).unwrap();

        let response = broker
            .process_next(&CancellationToken::new(), AGENT_A)
            .await
            .unwrap()
            .expect("a response");

        assert_eq!(response.from, AGENT_A);
        assert_eq!(response.to, HUMAN);
        assert_eq!(response.message_type, MessageType::Message);
        assert_eq!(response.text(), "hi");
        let ctx = response.context.clone().unwrap();
        assert_eq!(ctx.session_id, "s1");
        assert_eq!(ctx.turn_number, 1);
        assert_eq!(
            response.payload.metadata.get(COST_METADATA_KEY).map(String::as_str),
            Some("0.001000")
        );

        assert_eq!(fx.queues.get_queue(AGENT_A).unwrap().len().unwrap(), 0);
        let session = fx.sessions.get_session(AGENT_A).unwrap();
        assert_eq!(session.session_id, "s1");
        assert_eq!(session.turn_number, 1);
    }

    #[tokio::test]
    async fn test_process_next_empty_queue() {
        let fx = fixture();
        let exec = Arc::new(MockExecutor::default());
        let broker = fx.broker(exec.clone(), &[AGENT_A]);

        let response = broker.process_next(&CancellationToken::new(), AGENT_A).await.unwrap();

        assert!(response.is_none());
        assert!(exec.calls().is_empty());
    }

    #[tokio::test]
    async fn test_turn_accounting_and_resume() {
        let fx = fixture();
        let exec = Arc::new(MockExecutor::default());
        let broker = fx.broker(exec.clone(), &[AGENT_A]);
        let cancel = CancellationToken::new();

        for i in 1..=3u64 {
            broker.send_message(&Message::user(AGENT_A, format!("m{}", i))).unwrap();
            let response = broker.process_next(&cancel, AGENT_A).await.unwrap().unwrap();
            assert_eq!(response.context.unwrap().turn_number, i);

            let session = fx.sessions.get_session(AGENT_A).unwrap();
            assert_eq!(session.turn_number, i);
            assert_eq!(session.session_id, "sess-m1");
        }

        let calls = exec.calls();
        assert_eq!(
            calls[0],
            Call {
                session_id: String::new(),
                text: "m1".to_string(),
                is_new: true
            }
        );
        assert!(calls[1..].iter().all(|c| !c.is_new && c.session_id == "sess-m1"));
    }

    #[tokio::test]
    async fn test_agents_keep_separate_sessions() {
        let fx = fixture();
        let broker = fx.broker(Arc::new(MockExecutor::default()), &[AGENT_A, AGENT_B]);
        let cancel = CancellationToken::new();

        broker.send_message(&Message::user(AGENT_A, "alpha")).unwrap();
        broker.send_message(&Message::user(AGENT_B, "beta")).unwrap();
        broker.process_next(&cancel, AGENT_A).await.unwrap();
        broker.process_next(&cancel, AGENT_B).await.unwrap();
        broker.send_message(&Message::user(AGENT_A, "again")).unwrap();
        broker.process_next(&cancel, AGENT_A).await.unwrap();

        let a = fx.sessions.get_session(AGENT_A).unwrap();
        let b = fx.sessions.get_session(AGENT_B).unwrap();
        assert_eq!(a.session_id, "sess-alpha");
        assert_eq!(b.session_id, "sess-beta");
        assert_ne!(a.session_id, b.session_id);
        assert_eq!(a.turn_number, 2);
        assert_eq!(b.turn_number, 1);
    }

    #[tokio::test]
    async fn test_inject_and_reply_routing() {
        let fx = fixture();
        let broker = fx.broker(Arc::new(MockExecutor::default()), &[AGENT_A, AGENT_B]);

        broker.inject(AGENT_A, AGENT_B, "hi").unwrap();

        let queued = fx.queues.get_queue(AGENT_B).unwrap().list().unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].message_type, MessageType::Inject);
        assert_eq!(queued[0].from, AGENT_A);
        assert_eq!(queued[0].to, AGENT_B);
        assert_eq!(fx.queues.get_queue(AGENT_A).unwrap().len().unwrap(), 0);

        let response = broker
            .process_next(&CancellationToken::new(), AGENT_B)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response.from, AGENT_B);
        assert_eq!(response.to, AGENT_A);

        // Responses are returned, never auto-delivered.
        assert_eq!(fx.queues.get_queue(AGENT_A).unwrap().len().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failed_turn_drops_message_and_keeps_session() {
        let fx = fixture();
        let broker = fx.broker(Arc::new(MockExecutor::default()), &[AGENT_A]);
        broker.send_message(&Message::user(AGENT_A, "boom")).unwrap();

        let err = broker
            .process_next(&CancellationToken::new(), AGENT_A)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Collaborator(_)));
        assert_eq!(fx.queues.get_queue(AGENT_A).unwrap().len().unwrap(), 0);
        let session = fx.sessions.get_session(AGENT_A).unwrap();
        assert_eq!(session.turn_number, 0);
        assert!(!session.is_started());
    }

    #[tokio::test]
    async fn test_uninitialized_agent_is_not_found() {
        let fx = fixture();
        let broker = fx.broker(Arc::new(MockExecutor::default()), &[]);
        broker.send_message(&Message::user("stranger", "hello")).unwrap();

        let err = broker
            .process_next(&CancellationToken::new(), "stranger")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_corrupt_record_surfaces_each_time() {
        let fx = fixture();
        let broker = fx.broker(Arc::new(MockExecutor::default()), &[AGENT_A]);
        let queue = fx.queues.get_queue(AGENT_A).unwrap();
        std::fs::write(queue.dir().join("00000000000000000000_bad.json"), "{").unwrap();
        let cancel = CancellationToken::new();

        for _ in 0..2 {
            let err = broker.process_next(&cancel, AGENT_A).await.unwrap_err();
            assert!(matches!(err, Error::Serialization { .. }));
        }

        queue.clear().unwrap();
        assert!(broker.process_next(&cancel, AGENT_A).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_poll_loop_delivers_response() {
        let fx = fixture();
        let mut broker = fx.broker(Arc::new(MockExecutor::default()), &[AGENT_A]);
        broker.send_message(&Message::user(AGENT_A, "poll me")).unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        broker.set_response_handler(move |msg| {
            let _ = tx.send(msg);
        });

        let cancel = CancellationToken::new();
        let broker = Arc::new(broker);
        let task = {
            let broker = broker.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { broker.run(cancel, Duration::from_millis(20)).await })
        };

        let resp = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("response before timeout")
            .unwrap();
        assert_eq!(resp.text(), "re: poll me");

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_poll_loop_isolates_agent_errors() {
        let fx = fixture();
        let mut broker = fx.broker(Arc::new(MockExecutor::default()), &[AGENT_A, AGENT_B]);
        broker.send_message(&Message::user(AGENT_A, "boom")).unwrap();
        broker.send_message(&Message::user(AGENT_B, "fine")).unwrap();

        let (resp_tx, mut resp_rx) = mpsc::unbounded_channel();
        let (err_tx, mut err_rx) = mpsc::unbounded_channel();
        broker.set_response_handler(move |msg| {
            let _ = resp_tx.send(msg);
        });
        broker.set_error_handler(move |agent, err| {
            let _ = err_tx.send((agent.to_string(), err.to_string(), matches!(err.root(), Error::Collaborator(_))));
        });

        let cancel = CancellationToken::new();
        broker.process_all(&cancel).await;

        let (agent, message, is_collaborator) = err_rx.try_recv().unwrap();
        assert_eq!(agent, AGENT_A);
        assert!(message.starts_with("agent agent-a:"));
        assert!(is_collaborator);

        let resp = resp_rx.try_recv().unwrap();
        assert_eq!(resp.from, AGENT_B);
        assert_eq!(resp.text(), "re: fine");
    }

    #[tokio::test]
    async fn test_process_all_stops_after_cancel() {
        let fx = fixture();
        let broker = fx.broker(Arc::new(HangingExecutor), &[AGENT_A, AGENT_B]);
        broker.send_message(&Message::user(AGENT_A, "first")).unwrap();
        broker.send_message(&Message::user(AGENT_B, "second")).unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        tokio::time::timeout(Duration::from_secs(5), broker.process_all(&cancel))
            .await
            .expect("pass ends once cancelled");

        // agent-a's message was consumed and interrupted; agent-b was never started.
        assert_eq!(fx.queues.get_queue(AGENT_A).unwrap().len().unwrap(), 0);
        assert_eq!(fx.queues.get_queue(AGENT_B).unwrap().len().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_run_returns_on_cancel() {
        let fx = fixture();
        let broker = fx.broker(Arc::new(MockExecutor::default()), &[AGENT_A]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        tokio::time::timeout(Duration::from_secs(1), broker.run(cancel, Duration::from_secs(60)))
            .await
            .expect("run exits immediately when already cancelled");
    }
}
