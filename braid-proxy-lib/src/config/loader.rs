#![forbid(unsafe_code)]

use std::fs;
use std::path::Path;

use crate::config::{Config, Mode};
use crate::error::{ProxyError, Result};

pub fn load_from_path<P: AsRef<Path>>(p: P) -> Result<Config> {
    let txt = fs::read_to_string(p)
        .map_err(|e| ProxyError::Config(format!("failed to read config file: {e}")))?;
    let cfg: Config = toml::from_str(&txt)
        .map_err(|e| ProxyError::Config(format!("failed to parse config: {e}")))?;

    validate_config(&cfg)?;

    Ok(cfg)
}

fn validate_config(cfg: &Config) -> Result<()> {
    match cfg.mode {
        Mode::Client => {
            if cfg.downstreams.is_empty() {
                return Err(ProxyError::NoDownstreams);
            }
            for d in &cfg.downstreams {
                if !d.address.contains(':') {
                    return Err(ProxyError::Config(format!(
                        "downstream address is not host:port: {}",
                        d.address
                    )));
                }
            }
        }
        Mode::Server => match &cfg.upstream {
            None => return Err(ProxyError::NoUpstream),
            Some(addr) if !addr.contains(':') => {
                return Err(ProxyError::Config(format!(
                    "upstream address is not host:port: {addr}"
                )));
            }
            Some(_) => {}
        },
    }

    if cfg.circuit.axe_timeout_ms == 0 {
        return Err(ProxyError::Config(
            "circuit.axe_timeout_ms must be nonzero".into(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Frontend;
    use std::io::Write;

    fn load(toml: &str) -> Result<Config> {
        let mut f = tempfile::NamedTempFile::new().expect("temp file");
        f.write_all(toml.as_bytes()).expect("write config");
        load_from_path(f.path())
    }

    #[test]
    fn client_config_parses() {
        let cfg = load(
            r#"
            mode = "client"
            listen = "127.0.0.1:1080"
            frontend = "socks5"

            [[downstreams]]
            address = "example.net:7001"

            [[downstreams]]
            address = "example.net:7002"
            "#,
        )
        .expect("valid client config");

        assert_eq!(cfg.mode, Mode::Client);
        assert_eq!(cfg.frontend, Frontend::Socks5);
        assert_eq!(cfg.downstreams.len(), 2);
        assert_eq!(cfg.circuit.axe_timeout_ms, 100);
        assert!(cfg.metrics.is_none());
    }

    #[test]
    fn server_config_parses() {
        let cfg = load(
            r#"
            mode = "server"
            listen = "0.0.0.0:7001"
            upstream = "127.0.0.1:8080"

            [circuit]
            axe_timeout_ms = 250
            "#,
        )
        .expect("valid server config");

        assert_eq!(cfg.mode, Mode::Server);
        assert_eq!(cfg.upstream.as_deref(), Some("127.0.0.1:8080"));
        assert_eq!(cfg.circuit.axe_timeout_ms, 250);
        assert_eq!(cfg.frontend, Frontend::Plain);
    }

    #[test]
    fn client_requires_downstreams() {
        let err = load(
            r#"
            mode = "client"
            listen = "127.0.0.1:1080"
            "#,
        )
        .expect_err("missing downstreams");
        assert!(matches!(err, ProxyError::NoDownstreams));
    }

    #[test]
    fn server_requires_upstream() {
        let err = load(
            r#"
            mode = "server"
            listen = "0.0.0.0:7001"
            "#,
        )
        .expect_err("missing upstream");
        assert!(matches!(err, ProxyError::NoUpstream));
    }

    #[test]
    fn malformed_addresses_are_rejected() {
        let err = load(
            r#"
            mode = "client"
            listen = "127.0.0.1:1080"

            [[downstreams]]
            address = "no-port-here"
            "#,
        )
        .expect_err("bad address");
        assert!(matches!(err, ProxyError::Config(_)));
    }
}
