//! Run configuration assembled from CLI arguments and the environment.

use std::path::PathBuf;

use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;

use crate::credentials::{fetch_team_tokens, Credential, TokenServiceConfig};

const DEFAULT_SERVICE_DOMAIN: &str = "http://localhost:3001";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no repositories given: pass --repos or --languages")]
    NoTargets,

    #[error("invalid cutoff date '{0}': expected YYYYMMDD")]
    BadCutoff(String),

    #[error("invalid repository name '{0}': expected owner/name")]
    BadRepo(String),

    #[error("concurrency must be at least 1")]
    ZeroConcurrency,

    #[error(
        "no credentials: set FORGE_TOKENS, GITHUB_TOKEN, or TEAM_IDS with a token service"
    )]
    NoCredentials,

    #[error("token service: {0}")]
    TokenService(#[from] crate::credentials::TokenServiceError),

    #[error("cannot read policy file {path}: {source}")]
    PolicyRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse policy file {path}: {source}")]
    PolicyParse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Where credentials come from, resolved before the run starts.
#[derive(Debug, Clone)]
pub enum CredentialSource {
    /// Literal tokens, from `FORGE_TOKENS` or `GITHUB_TOKEN`.
    Direct(Vec<String>),
    /// One token per team slug, fetched from the token service.
    Service(TokenServiceConfig),
}

/// Fully resolved configuration for a collection run.
#[derive(Debug, Clone)]
pub struct CollectConfig {
    /// `owner/name` repositories to mine.
    pub repos: Vec<String>,
    pub cutoff: Option<DateTime<Utc>>,
    pub max_pulls: Option<u64>,
    pub concurrency: usize,
    pub output_dir: PathBuf,
    pub policy_path: Option<PathBuf>,
    pub refresh: bool,
    pub version: String,
    pub credentials: CredentialSource,
}

impl CollectConfig {
    /// Validate the assembled configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.repos.is_empty() {
            return Err(ConfigError::NoTargets);
        }
        if self.concurrency == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        for repo in &self.repos {
            let mut parts = repo.split('/');
            let valid = matches!(
                (parts.next(), parts.next(), parts.next()),
                (Some(owner), Some(name), None) if !owner.is_empty() && !name.is_empty()
            );
            if !valid {
                return Err(ConfigError::BadRepo(repo.clone()));
            }
        }
        Ok(())
    }

    /// Turn the credential source into concrete credentials.
    pub async fn resolve_credentials(&self) -> Result<Vec<Credential>, ConfigError> {
        resolve_credentials(&self.credentials).await
    }
}

/// Turn a credential source into concrete credentials.
pub async fn resolve_credentials(source: &CredentialSource) -> Result<Vec<Credential>, ConfigError> {
    let credentials = match source {
        CredentialSource::Direct(tokens) => tokens
            .iter()
            .enumerate()
            .map(|(i, token)| Credential::new(format!("token-{i}"), token.clone()))
            .collect::<Vec<_>>(),
        CredentialSource::Service(service) => fetch_team_tokens(service).await?,
    };
    if credentials.is_empty() {
        return Err(ConfigError::NoCredentials);
    }
    Ok(credentials)
}

/// Parse an inclusive `YYYYMMDD` cutoff into midnight UTC of that day.
pub fn parse_cutoff(raw: &str) -> Result<DateTime<Utc>, ConfigError> {
    NaiveDate::parse_from_str(raw, "%Y%m%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
        .ok_or_else(|| ConfigError::BadCutoff(raw.to_string()))
}

/// Discover the credential source from the environment.
///
/// Precedence: explicit token list, then a single token, then the token
/// service keyed by team slugs.
pub fn credential_source_from_env() -> Result<CredentialSource, ConfigError> {
    if let Ok(raw) = std::env::var("FORGE_TOKENS") {
        let tokens: Vec<String> = raw
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect();
        if !tokens.is_empty() {
            return Ok(CredentialSource::Direct(tokens));
        }
    }
    if let Ok(token) = std::env::var("GITHUB_TOKEN") {
        if !token.trim().is_empty() {
            return Ok(CredentialSource::Direct(vec![token.trim().to_string()]));
        }
    }
    if let Ok(teams) = std::env::var("TEAM_IDS") {
        let team_slugs: Vec<String> = teams
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect();
        if !team_slugs.is_empty() {
            let domain = std::env::var("GHTOKEN_SERVICE_DOMAIN")
                .unwrap_or_else(|_| DEFAULT_SERVICE_DOMAIN.to_string());
            let bearer = std::env::var("GHTOKEN_SERVICE_BEARER")
                .or_else(|_| std::env::var("SERVICE_AUTH"))
                .unwrap_or_default();
            return Ok(CredentialSource::Service(TokenServiceConfig {
                domain,
                bearer,
                team_slugs,
            }));
        }
    }
    Err(ConfigError::NoCredentials)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Datelike;

    fn base_config() -> CollectConfig {
        CollectConfig {
            repos: vec!["octo/widgets".into()],
            cutoff: None,
            max_pulls: None,
            concurrency: 4,
            output_dir: PathBuf::from("out"),
            policy_path: None,
            refresh: false,
            version: "0.1".into(),
            credentials: CredentialSource::Direct(vec!["t".into()]),
        }
    }

    #[test]
    fn cutoff_parses_inclusive_day() {
        let cutoff = parse_cutoff("20240315").expect("valid date");
        assert_eq!((cutoff.year(), cutoff.month(), cutoff.day()), (2024, 3, 15));
        assert!(parse_cutoff("2024-03-15").is_err());
        assert!(parse_cutoff("20241340").is_err());
    }

    #[test]
    fn validate_accepts_owner_name() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn validate_rejects_bad_shapes() {
        let mut config = base_config();
        config.repos = vec![];
        assert!(matches!(config.validate(), Err(ConfigError::NoTargets)));

        let mut config = base_config();
        config.repos = vec!["not-a-repo".into()];
        assert!(matches!(config.validate(), Err(ConfigError::BadRepo(_))));

        let mut config = base_config();
        config.repos = vec!["a/b/c".into()];
        assert!(matches!(config.validate(), Err(ConfigError::BadRepo(_))));

        let mut config = base_config();
        config.concurrency = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ZeroConcurrency)
        ));
    }

    #[tokio::test]
    async fn direct_tokens_become_credentials() {
        let mut config = base_config();
        config.credentials = CredentialSource::Direct(vec!["aaa".into(), "bbb".into()]);
        let creds = config.resolve_credentials().await.expect("direct tokens");
        assert_eq!(creds.len(), 2);
        assert_eq!(creds[0].token, "aaa");
        assert_ne!(creds[0].id, creds[1].id);
    }
}
