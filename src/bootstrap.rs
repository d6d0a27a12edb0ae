//! Ordered startup phases.
//!
//! Replaces the event-bus lifecycle of older revisions with explicit phases
//! invoked by the application entry point: cluster-wide first-run setup,
//! per-process connect, optional test-mode collection drop. The returned
//! [`DbContext`] resolving is the "initialization complete" signal for
//! dependents.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use mongodb::bson::doc;
use tracing::{debug, info, warn};

use crate::config::DbConfig;
use crate::connect::probe_client;
use crate::context::DbContext;
use crate::error::{categorize, Error, ErrorCategory, Result};
use crate::url::{build_url, sanitized_url};

const SETUP_KEY: &str = "bedrock-mongo.setup";

/// Cluster-wide exactly-once execution primitive, provided by the host
/// framework's coordination store. [`ProcessOnceGate`] covers single-node
/// runs and tests.
#[async_trait]
pub trait OnceGate: Send + Sync {
    /// Claim the keyed slot. Returns true when the caller won it and must
    /// run the guarded work.
    async fn begin(&self, key: &str) -> Result<bool>;
    /// Record that the guarded work ran to completion.
    async fn finish(&self, key: &str) -> Result<()>;
}

/// In-process [`OnceGate`]: exactly-once within one process only.
#[derive(Default)]
pub struct ProcessOnceGate {
    claimed: Mutex<HashSet<String>>,
}

impl ProcessOnceGate {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OnceGate for ProcessOnceGate {
    async fn begin(&self, key: &str) -> Result<bool> {
        let mut claimed = self.claimed.lock().unwrap_or_else(|e| e.into_inner());
        Ok(claimed.insert(key.to_string()))
    }

    async fn finish(&self, _key: &str) -> Result<()> {
        Ok(())
    }
}

/// Interactive credential collection, consulted when the server rejects
/// authentication during first-run setup and `admin_prompt` permits it.
#[async_trait]
pub trait CredentialPrompt: Send + Sync {
    async fn credentials(&self) -> Result<(String, String)>;
}

/// Sequences the startup phases for one process.
pub struct Bootstrapper {
    config: DbConfig,
    gate: Arc<dyn OnceGate>,
    prompt: Option<Arc<dyn CredentialPrompt>>,
    test_mode: bool,
}

impl Bootstrapper {
    pub fn new(config: DbConfig) -> Self {
        Self {
            config,
            gate: Arc::new(ProcessOnceGate::new()),
            prompt: None,
            test_mode: false,
        }
    }

    /// Use the host framework's cluster-wide gate instead of the in-process
    /// default.
    pub fn with_gate(mut self, gate: Arc<dyn OnceGate>) -> Self {
        self.gate = gate;
        self
    }

    pub fn with_prompt(mut self, prompt: Arc<dyn CredentialPrompt>) -> Self {
        self.prompt = Some(prompt);
        self
    }

    /// Permit destructive test setup (collection drops) during bootstrap.
    pub fn with_test_mode(mut self, enabled: bool) -> Self {
        self.test_mode = enabled;
        self
    }

    /// Run the phases in order and return the ready context.
    pub async fn bootstrap(mut self) -> Result<DbContext> {
        self.config.validate()?;

        if self.gate.begin(SETUP_KEY).await? {
            self.ensure_user().await?;
            self.gate.finish(SETUP_KEY).await?;
        }

        let context = match DbContext::connect(&self.config).await {
            Ok(context) => context,
            Err(Error::AdminSetupRequired { url }) => {
                let Some(prompt) = self.prompt.clone() else {
                    return Err(Error::AdminSetupRequired { url });
                };
                warn!(url = %url, "authentication rejected; collecting admin credentials");
                let (username, password) = prompt.credentials().await?;
                self.config.username = Some(username);
                self.config.password = Some(password);
                self.ensure_user().await?;
                // One retry after interactive setup; a second rejection is
                // fatal.
                DbContext::connect(&self.config).await?
            }
            Err(e) => return Err(e),
        };

        if self.test_mode && self.config.drop_collections.on_init {
            context
                .drop_collections(&self.config.drop_collections.collections)
                .await?;
        }

        info!(database = %self.config.name, "database bootstrap complete");
        Ok(context)
    }

    /// First-run setup: create the configured database user if the server
    /// does not know it yet. Runs over a short-lived admin connection;
    /// "already exists" answers mean setup happened earlier and are
    /// absorbed. The absorption is scoped to this bootstrap path only.
    async fn ensure_user(&self) -> Result<()> {
        let (Some(username), Some(password)) = (&self.config.username, &self.config.password)
        else {
            debug!("no credentials configured; skipping user setup");
            return Ok(());
        };

        let display = sanitized_url(&build_url(&self.config)?);
        let client = probe_client(&self.config, &display).await?;
        let result = client
            .database(&self.config.name)
            .run_command(doc! {
                "createUser": username.as_str(),
                "pwd": password.as_str(),
                "roles": [
                    { "role": "readWrite", "db": self.config.name.as_str() },
                    { "role": "dbAdmin", "db": self.config.name.as_str() },
                ],
            })
            .await;
        client.shutdown().immediate(true).await;

        match result {
            Ok(_) => {
                info!(database = %self.config.name, user = %username, "created database user");
                Ok(())
            }
            Err(e)
                if matches!(
                    categorize(&e),
                    ErrorCategory::AlreadyExists | ErrorCategory::DuplicateKey
                ) =>
            {
                debug!(user = %username, "database user already present");
                Ok(())
            }
            // A locked-down server refuses anonymous user creation; the
            // authenticated connect that follows decides what that means.
            Err(e)
                if matches!(
                    categorize(&e),
                    ErrorCategory::Unauthorized | ErrorCategory::AuthenticationFailed
                ) =>
            {
                debug!("server refused unauthenticated user setup");
                Ok(())
            }
            Err(e) => Err(Error::operation("failed to set up database user", &display, e)),
        }
    }
}
