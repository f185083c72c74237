/// Default port for a node address without an explicit port
pub const DEFAULT_PORT: u16 = 27017;

/// Split `host[:port]` into its parts. Bracketed IPv6 literals are supported.
pub fn split_host_port(input: &str) -> Result<(String, u16), String> {
    let input = input.trim();
    if input.is_empty() {
        return Err("empty address".to_string());
    }

    let (host, port) = if let Some(rest) = input.strip_prefix('[') {
        let end = rest
            .find(']')
            .ok_or_else(|| format!("unterminated IPv6 literal in '{}'", input))?;
        let host = &rest[..end];
        let tail = &rest[end + 1..];
        let port = match tail.strip_prefix(':') {
            Some(port) => Some(port),
            None if tail.is_empty() => None,
            None => return Err(format!("unexpected characters after IPv6 literal in '{}'", input)),
        };
        (host, port)
    } else {
        match input.rsplit_once(':') {
            Some((host, port)) => {
                if host.contains(':') {
                    return Err(format!("IPv6 address '{}' must be enclosed in brackets", input));
                }
                (host, Some(port))
            }
            None => (input, None),
        }
    };

    if host.is_empty() {
        return Err(format!("missing host in '{}'", input));
    }

    let port = match port {
        Some(port) => parse_port(port).ok_or_else(|| format!("invalid port in '{}'", input))?,
        None => DEFAULT_PORT,
    };

    Ok((host.to_ascii_lowercase(), port))
}

fn parse_port(port: &str) -> Option<u16> {
    match btoi::btou::<u16>(port.as_bytes()) {
        Ok(0) | Err(_) => None,
        Ok(port) => Some(port),
    }
}

/// Parse a non-negative integer option value
pub fn parse_u64(value: &str) -> Option<u64> {
    btoi::btou::<u64>(value.trim().as_bytes()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_host_port() {
        assert_eq!(
            split_host_port("db1.example.com:27018").unwrap(),
            ("db1.example.com".to_string(), 27018)
        );
        assert_eq!(split_host_port("LocalHost").unwrap(), ("localhost".to_string(), 27017));
        assert_eq!(split_host_port("[::1]:27019").unwrap(), ("::1".to_string(), 27019));
        assert_eq!(split_host_port("[::1]").unwrap(), ("::1".to_string(), 27017));
    }

    #[test]
    fn test_split_host_port_errors() {
        assert!(split_host_port("").is_err());
        assert!(split_host_port(":27017").is_err());
        assert!(split_host_port("host:notaport").is_err());
        assert!(split_host_port("host:0").is_err());
        assert!(split_host_port("host:70000").is_err());
        assert!(split_host_port("::1:27017").is_err());
        assert!(split_host_port("[::1").is_err());
    }

    #[test]
    fn test_parse_u64() {
        assert_eq!(parse_u64("1500"), Some(1500));
        assert_eq!(parse_u64("-1"), None);
        assert_eq!(parse_u64("abc"), None);
    }
}
