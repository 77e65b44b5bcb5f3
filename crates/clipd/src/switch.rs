//! Home Assistant switch toggle. Best-effort: a failure is logged and
//! reported as `false`, never an error.

use reqwest::Client;

pub struct SwitchClient {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl SwitchClient {
    pub fn new(client: Client, base_url: &str, token: Option<String>) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.filter(|t| !t.is_empty()),
        }
    }

    /// `turn_off` service URL for the entity's domain
    /// (`input_boolean.flask_switch` → `/api/services/input_boolean/turn_off`).
    pub fn turn_off_url(&self, entity_id: &str) -> String {
        let domain = entity_id.split('.').next().unwrap_or(entity_id);
        format!("{}/api/services/{domain}/turn_off", self.base_url)
    }

    pub async fn turn_off(&self, entity_id: &str) -> bool {
        let Some(token) = &self.token else {
            tracing::warn!(entity_id, "no Home Assistant token configured, skipping switch toggle");
            return false;
        };

        let url = self.turn_off_url(entity_id);
        let result = self
            .client
            .post(&url)
            .bearer_auth(token)
            .json(&serde_json::json!({ "entity_id": entity_id }))
            .send()
            .await;

        match result {
            Ok(resp) if resp.status().is_success() => {
                tracing::info!(entity_id, "switch turned off");
                true
            }
            Ok(resp) => {
                tracing::warn!(entity_id, status = %resp.status(), "switch toggle rejected");
                false
            }
            Err(e) => {
                tracing::warn!(entity_id, error = %e, "switch toggle failed (non-fatal)");
                false
            }
        }
    }
}
