//! Environment-driven configuration (spec.md §6), following the same
//! env-var-with-default pattern used for `EnvFilter::DEFAULT_ENV`.

const DEFAULT_TOOLSHED_API_URL: &str = "http://localhost:8000";
const DEFAULT_OPERATOR_PASS: &str = "dev-operator-pass";

/// Runtime-wide configuration read from the environment at startup.
#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    pub toolshed_api_url: String,
    pub operator_pass: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            toolshed_api_url: DEFAULT_TOOLSHED_API_URL.to_string(),
            operator_pass: DEFAULT_OPERATOR_PASS.to_string(),
        }
    }
}

impl RuntimeConfig {
    /// Reads `TOOLSHED_API_URL`/`OPERATOR_PASS` from the environment,
    /// falling back to local defaults when unset.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            toolshed_api_url: std::env::var("TOOLSHED_API_URL").unwrap_or(defaults.toolshed_api_url),
            operator_pass: std::env::var("OPERATOR_PASS").unwrap_or(defaults.operator_pass),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_env_unset() {
        std::env::remove_var("TOOLSHED_API_URL");
        std::env::remove_var("OPERATOR_PASS");
        let config = RuntimeConfig::from_env();
        assert_eq!(config.toolshed_api_url, DEFAULT_TOOLSHED_API_URL);
        assert_eq!(config.operator_pass, DEFAULT_OPERATOR_PASS);
    }
}
