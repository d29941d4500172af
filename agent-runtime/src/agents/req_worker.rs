use std::time::Duration;

use async_trait::async_trait;
use common::error::AppError;
use serde_json::json;
use tracing::{debug, warn};

use crate::bus::{AgentHandler, BusMessage, MessageContext};

const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Forwards requirement DTOs to an optional external endpoint. Delivery is
/// fire-and-forget: send errors are logged and never retried.
pub struct ReqWorkerAgent {
    endpoint: Option<String>,
    client: reqwest::Client,
}

impl ReqWorkerAgent {
    pub fn new(endpoint: Option<String>) -> Self {
        Self {
            endpoint,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl AgentHandler for ReqWorkerAgent {
    async fn on_message(&self, message: BusMessage, ctx: &MessageContext) -> Result<(), AppError> {
        let body = match message {
            BusMessage::Dto { req_id, title } => json!({
                "req_id": req_id,
                "title": title,
                "correlation_id": ctx.correlation_id,
            }),
            BusMessage::MinedDto { requirement } => {
                serde_json::to_value(&requirement).unwrap_or_default()
            }
            _ => return Ok(()),
        };

        let Some(endpoint) = &self.endpoint else {
            debug!("no req worker endpoint configured; DTO dropped");
            return Ok(());
        };

        let send = self
            .client
            .post(endpoint)
            .timeout(SEND_TIMEOUT)
            .json(&body)
            .send()
            .await;
        match send {
            Ok(response) if response.status().is_success() => {
                debug!(endpoint = %endpoint, "DTO forwarded");
            }
            Ok(response) => {
                warn!(endpoint = %endpoint, status = %response.status(), "DTO forward rejected");
            }
            Err(err) => {
                warn!(endpoint = %endpoint, error = %err, "DTO forward failed");
            }
        }

        Ok(())
    }
}
