use webrtc::ice::mdns::MulticastDnsMode;

/// Environment override for the mDNS candidate mode
pub const MDNS_MODE_ENV: &str = "VDEV_WEBRTC_MDNS_MODE";

pub fn parse_mdns_mode(raw: &str) -> Option<MulticastDnsMode> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "disabled" | "off" | "false" | "0" => Some(MulticastDnsMode::Disabled),
        "query" | "query_only" | "query-only" => Some(MulticastDnsMode::QueryOnly),
        "gather" | "query_and_gather" | "query-and-gather" | "on" | "true" | "1" => {
            Some(MulticastDnsMode::QueryAndGather)
        }
        _ => None,
    }
}

pub fn mdns_mode() -> MulticastDnsMode {
    // Gathering .local host candidates makes first LAN connections flaky
    std::env::var(MDNS_MODE_ENV)
        .ok()
        .and_then(|raw| parse_mdns_mode(&raw))
        .unwrap_or(MulticastDnsMode::QueryOnly)
}

pub fn mdns_mode_label(mode: MulticastDnsMode) -> &'static str {
    match mode {
        MulticastDnsMode::Disabled => "disabled",
        MulticastDnsMode::QueryOnly => "query_only",
        MulticastDnsMode::QueryAndGather => "query_and_gather",
    }
}

pub fn mdns_host_name(connection: u64) -> String {
    format!("vdev-{connection}.local")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mdns_mode() {
        assert_eq!(parse_mdns_mode("off"), Some(MulticastDnsMode::Disabled));
        assert_eq!(
            parse_mdns_mode(" Query-Only "),
            Some(MulticastDnsMode::QueryOnly)
        );
        assert_eq!(
            parse_mdns_mode("gather"),
            Some(MulticastDnsMode::QueryAndGather)
        );
        assert_eq!(parse_mdns_mode(""), None);
        assert_eq!(parse_mdns_mode("sometimes"), None);
    }
}
