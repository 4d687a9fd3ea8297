use serde::{Deserialize, Serialize};

/// Optional scenario parameters forwarded to the run stream.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub budget: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl Scenario {
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn budget(mut self, budget: f64) -> Self {
        self.budget = Some(budget);
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

/// Reconnect behavior of one stream handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempt a resume after a connection error.
    pub auto_reconnect: bool,
    /// Upper bound on resume attempts over the handle's lifetime.
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            max_retries: 1,
        }
    }
}

/// The three keys identifying a run on the server.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunKey {
    pub route: String,
    pub session_id: String,
    pub org: String,
}

impl RunKey {
    pub fn new(
        route: impl Into<String>,
        session_id: impl Into<String>,
        org: impl Into<String>,
    ) -> Self {
        Self {
            route: route.into(),
            session_id: session_id.into(),
            org: org.into(),
        }
    }
}

/// Options for `StreamClient::open`.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamOptions {
    pub key: RunKey,
    pub scenario: Scenario,
    pub retry: RetryPolicy,
}

impl StreamOptions {
    pub fn new(
        route: impl Into<String>,
        session_id: impl Into<String>,
        org: impl Into<String>,
    ) -> Self {
        Self::for_key(RunKey::new(route, session_id, org))
    }

    pub fn for_key(key: RunKey) -> Self {
        Self {
            key,
            scenario: Scenario::default(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn scenario(mut self, scenario: Scenario) -> Self {
        self.scenario = scenario;
        self
    }

    pub fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.retry.auto_reconnect = enabled;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.retry.max_retries = max_retries;
        self
    }
}

/// Options for `StreamClient::open_jobs`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobStreamOptions {
    pub job_id: String,
    pub org: String,
    pub retry: RetryPolicy,
}

impl JobStreamOptions {
    pub fn new(job_id: impl Into<String>, org: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            org: org.into(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.retry.auto_reconnect = enabled;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.retry.max_retries = max_retries;
        self
    }
}
