//! In-memory transport shared by the pool and wiring tests.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use switchboard::{Connector, Result, SwitchboardError, TransportFrame, TransportLink};
use tokio::sync::mpsc;
use tokio::time::Instant;

pub const URL: &str = "ws://backend.test/live";

/// Route library logs to the test output. `RUST_LOG=switchboard=debug` to see them.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// What the next connect attempt does.
#[derive(Clone, Copy, Debug)]
pub enum Plan {
    Accept,
    Refuse,
    Hang,
}

/// Server side of an accepted link.
pub struct ServerEnd {
    pub to_client: mpsc::Sender<TransportFrame>,
    pub from_client: mpsc::Receiver<String>,
}

impl ServerEnd {
    pub async fn push(&self, json: serde_json::Value) {
        self.to_client
            .send(TransportFrame::Text(json.to_string()))
            .await
            .unwrap();
    }

    pub async fn pong(&self) {
        self.push(serde_json::json!({"type": "pong"})).await;
    }
}

struct MockState {
    plans: Mutex<VecDeque<Plan>>,
    fallback: Plan,
    attempts: Mutex<Vec<Instant>>,
    accepted: mpsc::UnboundedSender<ServerEnd>,
}

/// Connector that follows a script of plans, then repeats `fallback`.
#[derive(Clone)]
pub struct MockConnector {
    state: Arc<MockState>,
}

impl MockConnector {
    pub fn new(plans: &[Plan], fallback: Plan) -> (Self, mpsc::UnboundedReceiver<ServerEnd>) {
        let (accepted, servers) = mpsc::unbounded_channel();
        let connector = Self {
            state: Arc::new(MockState {
                plans: Mutex::new(plans.iter().copied().collect()),
                fallback,
                attempts: Mutex::new(Vec::new()),
                accepted,
            }),
        };
        (connector, servers)
    }

    pub fn accepting() -> (Self, mpsc::UnboundedReceiver<ServerEnd>) {
        Self::new(&[], Plan::Accept)
    }

    pub fn attempts(&self) -> Vec<Instant> {
        self.state.attempts.lock().clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, url: &str) -> Result<TransportLink> {
        self.state.attempts.lock().push(Instant::now());
        let plan = self
            .state
            .plans
            .lock()
            .pop_front()
            .unwrap_or(self.state.fallback);

        match plan {
            Plan::Accept => {
                let (out_tx, out_rx) = mpsc::channel(64);
                let (in_tx, in_rx) = mpsc::channel(64);
                let _ = self.state.accepted.send(ServerEnd {
                    to_client: in_tx,
                    from_client: out_rx,
                });
                Ok(TransportLink {
                    outbound: out_tx,
                    inbound: in_rx,
                })
            }
            Plan::Refuse => Err(SwitchboardError::Transport {
                channel: url.to_string(),
                message: "connection refused".to_string(),
            }),
            Plan::Hang => futures::future::pending().await,
        }
    }
}
