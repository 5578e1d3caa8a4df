//! Token service client.
//!
//! Exchanges team slugs for API tokens against a credential service
//! (`{domain}/github/token?team={slug}` with a bearer header). All slugs are
//! fetched concurrently at startup; any failed slug fails the run.

use std::time::Duration;

use futures::future::join_all;
use serde_json::Value;
use thiserror::Error;

use super::Credential;

/// Where and how to reach the token service.
#[derive(Debug, Clone)]
pub struct TokenServiceConfig {
    pub domain: String,
    pub bearer: String,
    pub team_slugs: Vec<String>,
}

#[derive(Debug, Error)]
pub enum TokenServiceError {
    #[error("token service request for team '{team}' failed: {source}")]
    Request {
        team: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("token service returned HTTP {status} for team '{team}'")]
    Status { team: String, status: u16 },

    #[error("token service response for team '{team}' has no 'token' field")]
    MissingToken { team: String },
}

/// Fetch one credential per team slug, concurrently.
pub async fn fetch_team_tokens(
    config: &TokenServiceConfig,
) -> Result<Vec<Credential>, TokenServiceError> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap_or_else(|_| reqwest::Client::new());

    let fetches = config.team_slugs.iter().map(|slug| {
        let client = client.clone();
        let url = format!("{}/github/token", config.domain.trim_end_matches('/'));
        let bearer = config.bearer.clone();
        let team = slug.clone();
        async move {
            let response = client
                .get(&url)
                .query(&[("team", team.as_str())])
                .header("Authorization", format!("Bearer {bearer}"))
                .send()
                .await
                .map_err(|source| TokenServiceError::Request {
                    team: team.clone(),
                    source,
                })?;

            let status = response.status();
            if !status.is_success() {
                return Err(TokenServiceError::Status {
                    team,
                    status: status.as_u16(),
                });
            }

            let payload: Value =
                response
                    .json()
                    .await
                    .map_err(|source| TokenServiceError::Request {
                        team: team.clone(),
                        source,
                    })?;
            let token = payload
                .get("token")
                .and_then(Value::as_str)
                .filter(|t| !t.is_empty())
                .ok_or_else(|| TokenServiceError::MissingToken { team: team.clone() })?;

            tracing::info!(team = %team, "Fetched credential from token service");
            Ok(Credential::new(team, token))
        }
    });

    join_all(fetches).await.into_iter().collect()
}
