//! Connection negotiation.
//!
//! Produces a single authenticated, version-validated connection from a
//! [`DbConfig`] without requiring the caller to know in advance whether the
//! target server enforces authentication. Per attempt:
//!
//! 1. build the connection URL;
//! 2. open a short-lived unauthenticated probe (server identity endpoints
//!    are open to anonymous callers);
//! 3. fetch `buildInfo` and check the version against the configured range;
//! 4. decide whether authentication is required, either via the
//!    `force_authentication` flag or by attempting a privileged read
//!    (listing databases) on the probe;
//! 5. open the working connection, with credentials merged in when needed;
//! 6. ping before declaring success.
//!
//! Probe clients are always shut down forcefully, on success and failure
//! paths, and are never reused as the working connection.

use std::time::Duration;

use mongodb::bson::doc;
use mongodb::options::{
    Acknowledgment, AuthMechanism, ClientOptions, Credential, Tls, TlsOptions, WriteConcern,
};
use mongodb::{Client, Database};
use semver::{Version, VersionReq};
use tracing::{debug, info};

use crate::config::DbConfig;
use crate::error::{categorize, Error, ErrorCategory, Result};
use crate::url::{build_url, sanitized_url};

/// The process-wide working connection: a client owning the transport pool
/// and a database handle scoped within it. Created once during bootstrap and
/// never explicitly closed.
pub struct ConnectionHandle {
    pub client: Client,
    pub db: Database,
}

/// Server identity fetched fresh on every negotiation, never cached across
/// reconnects.
#[derive(Debug, Clone)]
pub struct ServerInfo {
    /// Parsed version with any pre-release tag stripped
    pub version: Version,
    /// Version string exactly as reported by the server
    pub raw_version: String,
    /// Whether the server is recent enough for role-based user documents
    pub supports_user_roles: bool,
}

/// Versions from here on understand role-based `createUser` documents.
const USER_ROLES_SINCE: Version = Version::new(2, 6, 0);

/// Run the full negotiation state machine and return the working connection.
///
/// Stateless and safe to invoke repeatedly; each call is a fresh attempt.
pub async fn negotiate(config: &DbConfig) -> Result<ConnectionHandle> {
    let url = build_url(config)?;
    let display_url = sanitized_url(&url);

    let probe = probe_client(config, &display_url).await?;
    let probed = inspect_server(&probe, config, &display_url).await;
    probe.shutdown().immediate(true).await;
    let (info, auth_required) = probed?;

    debug!(
        url = %display_url,
        version = %info.raw_version,
        auth_required,
        "server negotiation complete"
    );

    let options = working_options(config, &url, &display_url, auth_required).await?;
    let client = Client::with_options(options)
        .map_err(|e| Error::operation("failed to initialize client", &display_url, e))?;
    let db = client.database(&config.name);

    if let Err(e) = db.run_command(doc! { "ping": 1 }).await {
        let failed_auth = categorize(&e) == ErrorCategory::AuthenticationFailed;
        client.clone().shutdown().immediate(true).await;
        if failed_auth && config.admin_prompt {
            return Err(Error::AdminSetupRequired { url: display_url });
        }
        return Err(Error::operation("failed to connect", &display_url, e));
    }

    info!(database = %config.name, url = %display_url, "connected to database");
    Ok(ConnectionHandle { client, db })
}

/// Open a short-lived unauthenticated client against the credential-stripped
/// URL, carrying only non-identifying connect options.
pub(crate) async fn probe_client(config: &DbConfig, display: &str) -> Result<Client> {
    let mut options = ClientOptions::parse(display)
        .await
        .map_err(|e| Error::operation("failed to parse connection url", display, e))?;
    apply_connect_options(&mut options, config);
    // Drop anything identifying that may have ridden in on the URL.
    options.credential = None;
    Client::with_options(options)
        .map_err(|e| Error::operation("failed to initialize probe client", display, e))
}

/// Steps 3 and 4 on the probe connection: version validation, then the auth
/// requirement decision. Split out so the caller can tear the probe down on
/// every path.
async fn inspect_server(
    probe: &Client,
    config: &DbConfig,
    display: &str,
) -> Result<(ServerInfo, bool)> {
    let info = fetch_server_info(probe, &config.requirements.server_version, display).await?;
    let auth_required = if config.force_authentication {
        true
    } else {
        authentication_required(probe, display).await?
    };
    Ok((info, auth_required))
}

/// Query `buildInfo` and validate the reported version against the
/// configured semver range. Fails fast on a mismatch, before any
/// authentication attempt.
async fn fetch_server_info(client: &Client, requirement: &str, display: &str) -> Result<ServerInfo> {
    let reply = client
        .database("admin")
        .run_command(doc! { "buildInfo": 1 })
        .await
        .map_err(|e| Error::operation("failed to query server version", display, e))?;
    let raw = reply.get_str("version").unwrap_or("").to_string();

    let required = VersionReq::parse(requirement).map_err(|e| {
        Error::Configuration(format!(
            "invalid requirements.server_version '{requirement}': {e}"
        ))
    })?;
    let version = parse_server_version(&raw).ok_or_else(|| Error::Version {
        url: display.to_string(),
        actual: raw.clone(),
        required: requirement.to_string(),
    })?;
    if !required.matches(&version) {
        return Err(Error::Version {
            url: display.to_string(),
            actual: raw,
            required: requirement.to_string(),
        });
    }

    let supports_user_roles = version >= USER_ROLES_SINCE;
    Ok(ServerInfo {
        version,
        raw_version: raw,
        supports_user_roles,
    })
}

/// Parse a server-reported version leniently: pad short `x` / `x.y` forms
/// and strip any pre-release tag so range matching behaves on release
/// candidates.
fn parse_server_version(raw: &str) -> Option<Version> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let base = trimmed.split(['-', '+']).next()?;
    let mut padded = base.to_string();
    for _ in base.split('.').count()..3 {
        padded.push_str(".0");
    }
    Version::parse(&padded).ok()
}

/// Decide whether the server demands authentication by attempting a
/// privileged read on the unauthenticated probe. A privilege refusal means
/// auth is required; success means it is not; anything else propagates.
async fn authentication_required(probe: &Client, display_url: &str) -> Result<bool> {
    match probe.list_database_names().await {
        Ok(_) => Ok(false),
        Err(e) if categorize(&e) == ErrorCategory::Unauthorized => {
            debug!(url = %display_url, "server refused unauthenticated listDatabases");
            Ok(true)
        }
        Err(e) => Err(Error::operation(
            "authentication probe failed",
            display_url,
            e,
        )),
    }
}

/// Assemble the working connection's options from the authoritative URL plus
/// the configured connect and write options, merging credentials in when the
/// negotiation decided authentication is required.
async fn working_options(
    config: &DbConfig,
    url: &str,
    display: &str,
    auth_required: bool,
) -> Result<ClientOptions> {
    let mut options = ClientOptions::parse(url)
        .await
        .map_err(|e| Error::operation("failed to parse connection url", display, e))?;
    apply_connect_options(&mut options, config);
    options.write_concern = Some(write_concern(config));

    if auth_required {
        let username = match (&config.username, config.url.is_some()) {
            (Some(username), _) => Some(username.clone()),
            // A user-supplied URL may already carry its own credentials.
            (None, true) if options.credential.is_some() => None,
            _ => {
                return Err(Error::Configuration(format!(
                    "server at {display} requires authentication but no credentials are configured"
                )))
            }
        };
        if let Some(username) = username {
            let mut credential = Credential::builder().username(username).build();
            credential.password = config.password.clone();
            credential.source = Some(
                config
                    .connect_options
                    .auth_source
                    .clone()
                    .unwrap_or_else(|| config.name.clone()),
            );
            credential.mechanism = auth_mechanism(config)?;
            options.credential = Some(credential);
        }
    }
    Ok(options)
}

/// Apply the non-identifying driver options shared by probe and working
/// connections.
fn apply_connect_options(options: &mut ClientOptions, config: &DbConfig) {
    let connect = &config.connect_options;
    options.server_selection_timeout =
        Some(Duration::from_millis(connect.server_selection_timeout_ms));
    options.connect_timeout = Some(Duration::from_millis(connect.connect_timeout_ms));
    if connect.ssl {
        options.tls = Some(Tls::Enabled(TlsOptions::default()));
    }
    if let Some(ref replica_set) = connect.replica_set {
        options.repl_set_name = Some(replica_set.clone());
    }
    if let Some(ref app_name) = connect.app_name {
        options.app_name = Some(app_name.clone());
    }
}

/// Translate the configured acknowledgment mode and journal flag.
fn write_concern(config: &DbConfig) -> WriteConcern {
    let w = config.write_options.w.as_str();
    let acknowledgment = if w.eq_ignore_ascii_case("majority") {
        Acknowledgment::Majority
    } else if let Ok(nodes) = w.parse::<u32>() {
        Acknowledgment::Nodes(nodes)
    } else {
        Acknowledgment::Custom(w.to_string())
    };
    let mut concern = WriteConcern::builder().w(acknowledgment).build();
    concern.journal = Some(config.write_options.journal);
    concern
}

/// Map the configured mechanism name onto the driver's closed set.
fn auth_mechanism(config: &DbConfig) -> Result<Option<AuthMechanism>> {
    let Some(name) = config.authentication.get("mechanism") else {
        return Ok(None);
    };
    let mechanism = match name.as_str() {
        "SCRAM-SHA-1" => AuthMechanism::ScramSha1,
        "SCRAM-SHA-256" => AuthMechanism::ScramSha256,
        "MONGODB-X509" => AuthMechanism::MongoDbX509,
        "PLAIN" => AuthMechanism::Plain,
        other => {
            return Err(Error::Configuration(format!(
                "unsupported authentication mechanism '{other}'"
            )))
        }
    };
    Ok(Some(mechanism))
}
