//! Public endpoint detection.

use std::net::IpAddr;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::config::ENDPOINT_PLACEHOLDER;
use crate::error::{BridgeError, Result};

/// Services queried in order until one answers with an IP address.
pub const IP_SERVICES: [&str; 3] = [
    "https://ifconfig.co",
    "https://ifconfig.me",
    "https://icanhazip.com",
];

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Parses a plain-text service response.
///
/// # Errors
///
/// Returns [`BridgeError::Endpoint`] if the body is not an IP address.
pub fn parse_ip_response(body: &str) -> Result<IpAddr> {
    let trimmed = body.trim();
    trimmed
        .parse()
        .map_err(|_| BridgeError::Endpoint(format!("unexpected response '{trimmed}'")))
}

async fn query(client: &reqwest::Client, url: &str) -> Result<IpAddr> {
    let response = client
        .get(url)
        .header(reqwest::header::USER_AGENT, "curl/8")
        .send()
        .await
        .map_err(|e| BridgeError::Endpoint(format!("{url}: {e}")))?;
    if !response.status().is_success() {
        return Err(BridgeError::Endpoint(format!(
            "{url}: status {}",
            response.status()
        )));
    }
    let body = response
        .text()
        .await
        .map_err(|e| BridgeError::Endpoint(format!("{url}: {e}")))?;
    parse_ip_response(&body)
}

/// Asks each of `services` for our public address.
///
/// # Errors
///
/// Returns [`BridgeError::Endpoint`] if every service fails.
pub async fn detect_public_ip(services: &[&str]) -> Result<IpAddr> {
    let client = reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .map_err(|e| BridgeError::Endpoint(format!("failed to create HTTP client: {e}")))?;

    for url in services {
        debug!(service = %url, "querying public IP");
        match query(&client, url).await {
            Ok(ip) => {
                info!(service = %url, ip = %ip, "detected public IP");
                return Ok(ip);
            }
            Err(e) => warn!(error = %e, "public IP lookup failed"),
        }
    }
    Err(BridgeError::Endpoint("all public IP services failed".to_string()))
}

/// Resolves the host peers should dial: the configured value, else the
/// detected address, else [`ENDPOINT_PLACEHOLDER`].
pub async fn resolve_endpoint(configured: Option<&str>) -> String {
    if let Some(host) = configured {
        return host.trim().to_string();
    }
    match detect_public_ip(&IP_SERVICES).await {
        Ok(ip) => ip.to_string(),
        Err(e) => {
            error!(
                error = %e,
                placeholder = ENDPOINT_PLACEHOLDER,
                "could not detect public IP, set PUBLIC_IP and re-issue client configs"
            );
            ENDPOINT_PLACEHOLDER.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("203.0.113.7\n", "203.0.113.7" ; "ipv4 with newline")]
    #[test_case("  2001:db8::1  ", "2001:db8::1" ; "ipv6 padded")]
    fn test_parse_ip_response(body: &str, expected: &str) {
        let ip = parse_ip_response(body).expect("valid");
        assert_eq!(ip.to_string(), expected);
    }

    #[test]
    fn test_parse_ip_response_rejects_html() {
        assert!(parse_ip_response("<html>rate limited</html>").is_err());
    }

    #[tokio::test]
    async fn test_configured_endpoint_wins() {
        let host = resolve_endpoint(Some(" vpn.example.com ")).await;
        assert_eq!(host, "vpn.example.com");
    }

    #[tokio::test]
    async fn test_no_services_is_an_error() {
        assert!(detect_public_ip(&[]).await.is_err());
    }
}
