/// `mongodb://` connection string parsing
///
/// Produces a [`Config`] with the cluster, pool, monitor and selection
/// sections filled from the URI. Unknown options are rejected so typos do
/// not silently fall back to defaults.
use super::{Config, ConfigError, CredentialConfig};
use crate::utils::parse_u64;

const SCHEME: &str = "mongodb://";

pub fn parse(uri: &str) -> Result<Config, ConfigError> {
    let rest = uri
        .strip_prefix(SCHEME)
        .ok_or_else(|| invalid(format!("connection string must start with '{}'", SCHEME)))?;

    let (authority, query) = match rest.split_once('?') {
        Some((authority, query)) => (authority, Some(query)),
        None => (rest, None),
    };

    // The path component only names a default database, which the core ignores
    // apart from using it as the default auth source.
    let (authority, database) = match authority.split_once('/') {
        Some((authority, db)) => (authority, Some(db).filter(|db| !db.is_empty())),
        None => (authority, None),
    };

    let (userinfo, hosts) = match authority.rsplit_once('@') {
        Some((userinfo, hosts)) => (Some(userinfo), hosts),
        None => (None, authority),
    };

    let seeds: Vec<String> = hosts
        .split(',')
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .map(percent_decode)
        .collect::<Result<_, _>>()?;
    if seeds.is_empty() {
        return Err(invalid("connection string contains no hosts"));
    }

    let mut config = Config::default();
    config.cluster.seeds = seeds;

    if let Some(userinfo) = userinfo {
        let (username, password) = match userinfo.split_once(':') {
            Some((user, password)) => (user, Some(password)),
            None => (userinfo, None),
        };
        config.cluster.credential = Some(CredentialConfig {
            username: percent_decode(username)?,
            password: password.map(percent_decode).transpose()?,
            source: database.unwrap_or("admin").to_string(),
            mechanism: None,
        });
    }

    if let Some(query) = query {
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| invalid(format!("option '{}' has no value", pair)))?;
            apply_option(&mut config, key, &percent_decode(value)?)?;
        }
    }

    Ok(config)
}

fn apply_option(config: &mut Config, key: &str, value: &str) -> Result<(), ConfigError> {
    match key.to_ascii_lowercase().as_str() {
        "replicaset" => config.cluster.replica_set = Some(value.to_string()),
        "appname" => config.cluster.app_name = Some(value.to_string()),
        "directconnection" => config.cluster.direct_connection = bool_option(key, value)?,
        "retryreads" => config.cluster.retry_reads = bool_option(key, value)?,
        "retrywrites" => config.cluster.retry_writes = bool_option(key, value)?,
        "tls" | "ssl" => config.cluster.tls.enabled = bool_option(key, value)?,
        "tlscafile" => config.cluster.tls.ca_file = Some(value.to_string()),
        "tlscertificatekeyfile" => config.cluster.tls.cert_key_file = Some(value.to_string()),
        "authsource" => credential_mut(config, key)?.source = value.to_string(),
        "authmechanism" => credential_mut(config, key)?.mechanism = Some(value.to_string()),
        "maxpoolsize" => config.pool.max_size = number_option(key, value)? as usize,
        "minpoolsize" => config.pool.min_size = number_option(key, value)? as usize,
        "maxidletimems" => config.pool.max_idle_time_ms = number_option(key, value)?,
        "waitqueuetimeoutms" => config.pool.wait_queue_timeout_ms = number_option(key, value)?,
        "connecttimeoutms" => {
            let timeout = number_option(key, value)?;
            config.pool.connect_timeout_ms = timeout;
            config.monitor.connect_timeout_ms = timeout;
        }
        "sockettimeoutms" => config.pool.socket_timeout_ms = number_option(key, value)?,
        "heartbeatfrequencyms" => config.monitor.heartbeat_frequency_ms = number_option(key, value)?,
        "serverselectiontimeoutms" => {
            config.selection.server_selection_timeout_ms = number_option(key, value)?
        }
        "localthresholdms" => config.selection.local_threshold_ms = number_option(key, value)?,
        _ => return Err(invalid(format!("unsupported connection string option '{}'", key))),
    }
    Ok(())
}

fn credential_mut<'a>(
    config: &'a mut Config,
    key: &str,
) -> Result<&'a mut CredentialConfig, ConfigError> {
    config
        .cluster
        .credential
        .as_mut()
        .ok_or_else(|| invalid(format!("option '{}' requires a username", key)))
}

fn bool_option(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(invalid(format!("option '{}' expects true or false, got '{}'", key, value))),
    }
}

fn number_option(key: &str, value: &str) -> Result<u64, ConfigError> {
    parse_u64(value)
        .ok_or_else(|| invalid(format!("option '{}' expects a non-negative integer, got '{}'", key, value)))
}

/// Decode `%XX` escapes. Every `%` must start a two digit hex escape.
fn percent_decode(input: &str) -> Result<String, ConfigError> {
    let bytes = input.as_bytes();
    let malformed = bytes.iter().enumerate().any(|(i, b)| {
        *b == b'%'
            && !bytes
                .get(i + 1..i + 3)
                .is_some_and(|hex| hex.iter().all(u8::is_ascii_hexdigit))
    });
    if malformed {
        return Err(invalid(format!("invalid percent-encoding in '{}'", input)));
    }
    urlencoding::decode(input)
        .map(|decoded| decoded.into_owned())
        .map_err(|_| invalid(format!("'{}' is not valid UTF-8", input)))
}

fn invalid<S: Into<String>>(message: S) -> ConfigError {
    ConfigError::ParseError(message.into())
}
