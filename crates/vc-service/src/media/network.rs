//! Network family detection, listener selection and ICE candidate rewriting.
//!
//! Clients reach the SFU over whichever address family their own network
//! uses. The family is detected once at accept time from proxy headers (or
//! the socket peer) and drives which engine listener a transport binds to.
//! Behind a port-translating tunnel the engine announces its bound port,
//! so matching candidates are rewritten to the public port.

use super::types::{IceCandidate, TransportListener};
use crate::config::Config;

use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;
use tracing::debug;

/// IP address family of a client or listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkFamily {
    #[default]
    Ipv4,
    Ipv6,
}

impl NetworkFamily {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            NetworkFamily::Ipv4 => "ipv4",
            NetworkFamily::Ipv6 => "ipv6",
        }
    }

    /// Family of an address. IPv4-mapped IPv6 addresses count as IPv4.
    #[must_use]
    pub fn of(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => NetworkFamily::Ipv4,
            IpAddr::V6(v6) if v6.to_ipv4_mapped().is_some() => NetworkFamily::Ipv4,
            IpAddr::V6(_) => NetworkFamily::Ipv6,
        }
    }
}

impl fmt::Display for NetworkFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NetworkFamily {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ipv4" | "v4" | "4" => Ok(NetworkFamily::Ipv4),
            "ipv6" | "v6" | "6" => Ok(NetworkFamily::Ipv6),
            _ => Err(()),
        }
    }
}

/// Detect the client's network family.
///
/// Sources are tried in order: `Forwarded` (`for=`), the first
/// `X-Forwarded-For` entry, `X-Real-IP`, then the socket peer. The first
/// source that yields a parsable address wins. Defaults to IPv4.
#[must_use]
pub fn detect_family(headers: &HeaderMap, peer: Option<SocketAddr>) -> NetworkFamily {
    let from_headers = header_value(headers, "forwarded")
        .and_then(forwarded_for)
        .or_else(|| {
            header_value(headers, "x-forwarded-for")
                .and_then(|v| v.split(',').next())
                .and_then(parse_host)
        })
        .or_else(|| header_value(headers, "x-real-ip").and_then(parse_host));

    from_headers
        .or_else(|| peer.map(|addr| addr.ip()))
        .map(NetworkFamily::of)
        .unwrap_or_default()
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Extract the `for=` node of the first `Forwarded` element.
fn forwarded_for(value: &str) -> Option<IpAddr> {
    let first = value.split(',').next()?;
    first
        .split(';')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case("for"))
        .and_then(|(_, node)| parse_host(node))
}

/// Parse `1.2.3.4`, `1.2.3.4:80`, `"[2001:db8::1]:443"` or `2001:db8::1`.
fn parse_host(raw: &str) -> Option<IpAddr> {
    let trimmed = raw.trim().trim_matches('"');

    if let Some(rest) = trimmed.strip_prefix('[') {
        let (inner, _) = rest.split_once(']')?;
        return inner.parse().ok();
    }

    trimmed
        .parse::<IpAddr>()
        .ok()
        .or_else(|| trimmed.parse::<SocketAddr>().ok().map(|addr| addr.ip()))
}

/// Listener set and rewrite policy derived from configuration.
#[derive(Debug, Clone)]
pub struct ListenerPlan {
    listeners: Vec<TransportListener>,
    preferred: NetworkFamily,
    bound_port: Option<u16>,
    public_port: Option<u16>,
}

impl ListenerPlan {
    /// Build the plan from announced addresses and ports.
    ///
    /// With no announced address at all, a single unannounced IPv4
    /// listener is used.
    #[must_use]
    pub fn new(
        ipv4: Option<IpAddr>,
        ipv6: Option<IpAddr>,
        port: Option<u16>,
        preferred: NetworkFamily,
        public_port: Option<u16>,
    ) -> Self {
        let mut listeners = Vec::with_capacity(2);

        if let Some(announced) = ipv4 {
            listeners.push(TransportListener {
                family: NetworkFamily::Ipv4,
                listen_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                announced_address: Some(announced),
                port,
            });
        }

        if let Some(announced) = ipv6 {
            listeners.push(TransportListener {
                family: NetworkFamily::Ipv6,
                listen_ip: IpAddr::V6(Ipv6Addr::UNSPECIFIED),
                announced_address: Some(announced),
                port,
            });
        }

        if listeners.is_empty() {
            listeners.push(unannounced_ipv4(port));
        }

        Self {
            listeners,
            preferred,
            bound_port: port,
            public_port,
        }
    }

    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.sfu_ipv4,
            config.sfu_ipv6,
            config.sfu_port,
            config.sfu_preferred_family,
            config.sfu_public_port,
        )
    }

    #[must_use]
    pub fn listeners(&self) -> &[TransportListener] {
        &self.listeners
    }

    /// Pick the listener for a client of the given family.
    ///
    /// Prefers the client's family, then the configured preferred family,
    /// then whichever listener exists.
    #[must_use]
    pub fn select(&self, family: NetworkFamily) -> TransportListener {
        self.listeners
            .iter()
            .find(|l| l.family == family)
            .or_else(|| self.listeners.iter().find(|l| l.family == self.preferred))
            .or_else(|| self.listeners.first())
            .cloned()
            .unwrap_or_else(|| unannounced_ipv4(self.bound_port))
    }

    /// Rewrite candidates announced on the bound port to the public port.
    ///
    /// Only a candidate whose address equals the listener's announced address
    /// and whose port equals the bound port is touched. Returns the number
    /// of rewritten candidates.
    pub fn rewrite_ice_candidates(
        &self,
        listener: &TransportListener,
        candidates: &mut [IceCandidate],
    ) -> usize {
        let (Some(public_port), Some(bound_port), Some(announced)) =
            (self.public_port, self.bound_port, listener.announced_address)
        else {
            return 0;
        };

        let mut rewritten = 0;
        for candidate in candidates.iter_mut() {
            let address_matches = candidate
                .address
                .parse::<IpAddr>()
                .is_ok_and(|ip| ip == announced);

            if address_matches && candidate.port == bound_port {
                candidate.port = public_port;
                rewritten += 1;
            }
        }

        if rewritten > 0 {
            debug!(
                target: "vc.media",
                announced = %announced,
                bound_port,
                public_port,
                rewritten,
                "Rewrote ICE candidates to public port"
            );
        }

        rewritten
    }
}

fn unannounced_ipv4(port: Option<u16>) -> TransportListener {
    TransportListener {
        family: NetworkFamily::Ipv4,
        listen_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        announced_address: None,
        port,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use serde_json::Map;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(value));
        }
        map
    }

    fn candidate(address: &str, port: u16) -> IceCandidate {
        IceCandidate {
            foundation: "f".to_string(),
            priority: 1,
            address: address.to_string(),
            protocol: "udp".to_string(),
            port,
            candidate_type: "host".to_string(),
            extra: Map::new(),
        }
    }

    fn v4() -> IpAddr {
        "203.0.113.7".parse().unwrap()
    }

    fn v6() -> IpAddr {
        "2001:db8::7".parse().unwrap()
    }

    #[test]
    fn test_family_from_str() {
        assert_eq!("ipv4".parse::<NetworkFamily>(), Ok(NetworkFamily::Ipv4));
        assert_eq!("IPv6".parse::<NetworkFamily>(), Ok(NetworkFamily::Ipv6));
        assert_eq!(" ipv6 ".parse::<NetworkFamily>(), Ok(NetworkFamily::Ipv6));
        assert!("ipx".parse::<NetworkFamily>().is_err());
    }

    #[test]
    fn test_detect_from_forwarded_header() {
        let h = headers(&[("forwarded", "for=\"[2001:db8:cafe::17]:4711\";proto=https")]);
        assert_eq!(detect_family(&h, None), NetworkFamily::Ipv6);

        let h = headers(&[("forwarded", "proto=http;for=192.0.2.60, for=2001:db8::1")]);
        assert_eq!(detect_family(&h, None), NetworkFamily::Ipv4);
    }

    #[test]
    fn test_forwarded_takes_precedence_over_x_forwarded_for() {
        let h = headers(&[
            ("forwarded", "for=\"[2001:db8::1]\""),
            ("x-forwarded-for", "192.0.2.1"),
        ]);
        assert_eq!(detect_family(&h, None), NetworkFamily::Ipv6);
    }

    #[test]
    fn test_detect_from_first_x_forwarded_for_entry() {
        let h = headers(&[("x-forwarded-for", "2001:db8::5, 192.0.2.1")]);
        assert_eq!(detect_family(&h, None), NetworkFamily::Ipv6);
    }

    #[test]
    fn test_detect_from_x_real_ip() {
        let h = headers(&[("x-real-ip", "2001:db8::9")]);
        assert_eq!(detect_family(&h, None), NetworkFamily::Ipv6);
    }

    #[test]
    fn test_detect_falls_back_to_peer() {
        let peer: SocketAddr = "[2001:db8::2]:5000".parse().unwrap();
        assert_eq!(detect_family(&HeaderMap::new(), Some(peer)), NetworkFamily::Ipv6);

        let h = headers(&[("x-forwarded-for", "unknown")]);
        assert_eq!(detect_family(&h, Some(peer)), NetworkFamily::Ipv6);
    }

    #[test]
    fn test_ipv4_mapped_counts_as_ipv4() {
        let peer: SocketAddr = "[::ffff:192.0.2.10]:5000".parse().unwrap();
        assert_eq!(detect_family(&HeaderMap::new(), Some(peer)), NetworkFamily::Ipv4);
    }

    #[test]
    fn test_detect_defaults_to_ipv4() {
        assert_eq!(detect_family(&HeaderMap::new(), None), NetworkFamily::Ipv4);

        let h = headers(&[("forwarded", "for=_hidden")]);
        assert_eq!(detect_family(&h, None), NetworkFamily::Ipv4);
    }

    #[test]
    fn test_plan_without_announced_addresses() {
        let plan = ListenerPlan::new(None, None, Some(40000), NetworkFamily::Ipv6, None);

        assert_eq!(plan.listeners().len(), 1);
        let listener = plan.select(NetworkFamily::Ipv6);
        assert_eq!(listener.family, NetworkFamily::Ipv4);
        assert_eq!(listener.announced_address, None);
        assert_eq!(listener.port, Some(40000));
    }

    #[test]
    fn test_plan_selects_client_family() {
        let plan = ListenerPlan::new(Some(v4()), Some(v6()), None, NetworkFamily::Ipv4, None);

        let listener = plan.select(NetworkFamily::Ipv6);
        assert_eq!(listener.family, NetworkFamily::Ipv6);
        assert_eq!(listener.listen_ip, IpAddr::V6(Ipv6Addr::UNSPECIFIED));
        assert_eq!(listener.announced_address, Some(v6()));

        let listener = plan.select(NetworkFamily::Ipv4);
        assert_eq!(listener.listen_ip, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert_eq!(listener.announced_address, Some(v4()));
    }

    #[test]
    fn test_plan_falls_back_when_family_missing() {
        let plan = ListenerPlan::new(None, Some(v6()), None, NetworkFamily::Ipv4, None);
        assert_eq!(plan.select(NetworkFamily::Ipv4).family, NetworkFamily::Ipv6);

        let plan = ListenerPlan::new(Some(v4()), None, None, NetworkFamily::Ipv6, None);
        assert_eq!(plan.select(NetworkFamily::Ipv6).family, NetworkFamily::Ipv4);
    }

    #[test]
    fn test_rewrite_only_exact_match() {
        let plan = ListenerPlan::new(Some(v4()), None, Some(40000), NetworkFamily::Ipv4, Some(443));
        let listener = plan.select(NetworkFamily::Ipv4);

        let mut candidates = vec![
            candidate("203.0.113.7", 40000),
            candidate("203.0.113.7", 40001),
            candidate("198.51.100.1", 40000),
        ];

        let rewritten = plan.rewrite_ice_candidates(&listener, &mut candidates);

        assert_eq!(rewritten, 1);
        assert_eq!(candidates[0].port, 443);
        assert_eq!(candidates[1].port, 40001);
        assert_eq!(candidates[2].port, 40000);
    }

    #[test]
    fn test_rewrite_disabled_without_public_port() {
        let plan = ListenerPlan::new(Some(v4()), None, Some(40000), NetworkFamily::Ipv4, None);
        let listener = plan.select(NetworkFamily::Ipv4);
        let mut candidates = vec![candidate("203.0.113.7", 40000)];

        assert_eq!(plan.rewrite_ice_candidates(&listener, &mut candidates), 0);
        assert_eq!(candidates[0].port, 40000);
    }

    #[test]
    fn test_rewrite_requires_announced_address() {
        let plan = ListenerPlan::new(None, None, Some(40000), NetworkFamily::Ipv4, Some(443));
        let listener = plan.select(NetworkFamily::Ipv4);
        let mut candidates = vec![candidate("0.0.0.0", 40000)];

        assert_eq!(plan.rewrite_ice_candidates(&listener, &mut candidates), 0);
    }

    #[test]
    fn test_rewrite_ipv6_candidate() {
        let plan = ListenerPlan::new(None, Some(v6()), Some(40000), NetworkFamily::Ipv6, Some(443));
        let listener = plan.select(NetworkFamily::Ipv6);
        let mut candidates = vec![candidate("2001:db8::7", 40000)];

        assert_eq!(plan.rewrite_ice_candidates(&listener, &mut candidates), 1);
        assert_eq!(candidates[0].port, 443);
    }
}
