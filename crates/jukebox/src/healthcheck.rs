use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use jukebox_service::config::Config;

/// Asks a running server at `addr`, or at the configured bind address, whether it is healthy.
///
/// Prints `OK` or `ERROR` for container health checks, and returns the reason of a failure.
pub fn healthcheck(config: &Config, addr: Option<SocketAddr>, timeout: Duration) -> Result<()> {
    let outcome = target_addr(config, addr).and_then(|addr| check(addr, timeout));
    println!("{}", if outcome.is_ok() { "OK" } else { "ERROR" });
    outcome
}

fn target_addr(config: &Config, addr: Option<SocketAddr>) -> Result<SocketAddr> {
    match addr {
        Some(addr) => Ok(addr),
        None => config
            .bind
            .parse()
            .with_context(|| format!("invalid bind address {}", config.bind)),
    }
}

fn check(addr: SocketAddr, timeout: Duration) -> Result<()> {
    let url = format!("http://{addr}/healthcheck");
    tracing::debug!(%url, "Checking health");

    let client = reqwest::blocking::Client::builder()
        .timeout(timeout)
        .build()?;
    client
        .get(&url)
        .send()
        .with_context(|| format!("failed to reach jukebox at {addr}"))?
        .error_for_status()
        .with_context(|| format!("jukebox at {addr} is unhealthy"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use axum::Router;
    use axum::http::StatusCode;
    use axum::routing::get;
    use jukebox_test::Server;

    use super::*;

    #[test]
    fn test_target_addr() {
        let mut config = Config::default();
        config.bind = "127.0.0.1:5000".into();

        let configured = target_addr(&config, None).unwrap();
        assert_eq!(configured, SocketAddr::from(([127, 0, 0, 1], 5000)));

        let explicit = SocketAddr::from(([10, 0, 0, 1], 8080));
        assert_eq!(target_addr(&config, Some(explicit)).unwrap(), explicit);

        config.bind = "localhost".into();
        assert!(target_addr(&config, None).is_err());
    }

    #[tokio::test]
    async fn test_check() {
        let healthy = Server::new(Router::new().route("/healthcheck", get(|| async { "ok" })));
        let unhealthy = Server::new(Router::new().route(
            "/healthcheck",
            get(|| async { StatusCode::SERVICE_UNAVAILABLE }),
        ));
        let (healthy_addr, unhealthy_addr) = (healthy.addr(), unhealthy.addr());

        // the blocking client must not run on the runtime
        let (healthy, unhealthy) = tokio::task::spawn_blocking(move || {
            let timeout = Duration::from_secs(5);
            (check(healthy_addr, timeout), check(unhealthy_addr, timeout))
        })
        .await
        .unwrap();

        assert!(healthy.is_ok(), "{healthy:?}");
        let err = unhealthy.unwrap_err();
        assert!(err.to_string().contains("unhealthy"), "{err:?}");
    }
}
