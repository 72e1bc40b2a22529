//! Scripted scanners for tests

use async_trait::async_trait;
use std::time::Duration;

use super::{ChainScanner, ScanBatch, ScanError};
use crate::types::{Chain, Cursor, Deposit, ScanCheckpoint};

pub(crate) enum Script {
    Deposits(Vec<Deposit>, u64),
    Fail(String),
    Hang,
}

pub(crate) struct StubScanner {
    pub chain: Chain,
    pub script: Script,
}

impl StubScanner {
    pub fn ok(chain: Chain, deposits: Vec<Deposit>, height: u64) -> Self {
        Self {
            chain,
            script: Script::Deposits(deposits, height),
        }
    }

    pub fn failing(chain: Chain, message: &str) -> Self {
        Self {
            chain,
            script: Script::Fail(message.to_string()),
        }
    }

    pub fn hanging(chain: Chain) -> Self {
        Self {
            chain,
            script: Script::Hang,
        }
    }
}

#[async_trait]
impl ChainScanner for StubScanner {
    fn chain(&self) -> Chain {
        self.chain
    }

    async fn scan(&self, _checkpoint: Option<&ScanCheckpoint>) -> Result<ScanBatch, ScanError> {
        match &self.script {
            Script::Deposits(deposits, height) => Ok(ScanBatch {
                deposits: deposits.clone(),
                checkpoint: ScanCheckpoint::new(self.chain, Cursor::BlockHeight(*height), 1),
            }),
            Script::Fail(message) => Err(ScanError::Transport(message.clone())),
            Script::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(ScanError::Transport("unreachable".to_string()))
            }
        }
    }
}

/// Serve `router` on an ephemeral local port, returning its base URL
pub(crate) async fn serve(router: axum::Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind fake upstream");
    let addr = listener.local_addr().expect("fake upstream address");
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    format!("http://{}", addr)
}
