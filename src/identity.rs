//! Random identity generation: a plausible public IPv4 address and a
//! matching user-agent/header pair, generated fresh for every flow
//! iteration so traffic looks like independent end users.

use std::net::Ipv4Addr;

const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (iPhone; CPU iPhone OS 17_4 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Mobile/15E148 Safari/604.1",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:125.0) Gecko/20100101 Firefox/125.0",
    "Mozilla/5.0 (Linux; Android 14; Pixel 8) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Mobile Safari/537.36",
];

const ACCEPT_LANGUAGES: &[&str] = &[
    "en-US,en;q=0.9",
    "en-GB,en;q=0.8",
    "de-DE,de;q=0.9,en;q=0.7",
    "fr-FR,fr;q=0.9,en;q=0.6",
    "es-ES,es;q=0.9,en;q=0.5",
];

/// A generated identity for one flow iteration.
#[derive(Debug, Clone)]
pub struct Identity {
    pub fake_ip: Ipv4Addr,
    pub user_agent: &'static str,
    pub accept_language: &'static str,
}

/// Reports whether an address falls inside a reserved/non-public range that
/// would never appear as a real client address: this-network, loopback,
/// link-local, private-use, shared-address space (CGNAT), documentation
/// ranges, benchmarking, reserved, broadcast, and multicast/class E.
fn is_reserved(addr: Ipv4Addr) -> bool {
    let o = addr.octets();
    addr.is_loopback()
        || addr.is_link_local()
        || addr.is_private()
        || addr.is_multicast()
        || addr.is_broadcast()
        || addr.is_documentation()
        || addr.is_unspecified()
        || o[0] == 0
        || (o[0] == 100 && (64..=127).contains(&o[1])) // CGNAT shared space
        || (o[0] == 192 && o[1] == 0 && o[2] == 0) // IETF protocol assignments
        || (o[0] == 192 && o[1] == 0 && o[2] == 2) // TEST-NET-1
        || (o[0] == 192 && o[1] == 88 && o[2] == 99) // 6to4 relay anycast
        || (o[0] == 198 && (18..=19).contains(&o[1])) // benchmarking
        || (o[0] == 198 && o[1] == 51 && o[2] == 100) // TEST-NET-2
        || (o[0] == 203 && o[1] == 0 && o[2] == 113) // TEST-NET-3
        || o[0] >= 240 // reserved + class E
}

fn random_public_ipv4() -> Ipv4Addr {
    loop {
        let octets = [
            fastrand::u8(1..=255),
            fastrand::u8(0..=255),
            fastrand::u8(0..=255),
            fastrand::u8(1..=254),
        ];
        let addr = Ipv4Addr::from(octets);
        if !is_reserved(addr) {
            return addr;
        }
    }
}

/// Generates a fresh identity: a plausible public IP, paired with a
/// randomly-chosen user-agent and accept-language from a fixed pool.
pub fn generate() -> Identity {
    Identity {
        fake_ip: random_public_ipv4(),
        user_agent: USER_AGENTS[fastrand::usize(..USER_AGENTS.len())],
        accept_language: ACCEPT_LANGUAGES[fastrand::usize(..ACCEPT_LANGUAGES.len())],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ip_is_never_reserved() {
        for _ in 0..1000 {
            let ip = random_public_ipv4();
            assert!(!is_reserved(ip), "generated reserved address: {ip}");
        }
    }

    #[test]
    fn rejects_known_reserved_ranges() {
        assert!(is_reserved(Ipv4Addr::new(10, 0, 0, 1)));
        assert!(is_reserved(Ipv4Addr::new(127, 0, 0, 1)));
        assert!(is_reserved(Ipv4Addr::new(169, 254, 1, 1)));
        assert!(is_reserved(Ipv4Addr::new(172, 16, 0, 1)));
        assert!(is_reserved(Ipv4Addr::new(192, 168, 1, 1)));
        assert!(is_reserved(Ipv4Addr::new(100, 64, 0, 1)));
        assert!(is_reserved(Ipv4Addr::new(198, 51, 100, 1)));
        assert!(is_reserved(Ipv4Addr::new(203, 0, 113, 1)));
        assert!(is_reserved(Ipv4Addr::new(224, 0, 0, 1)));
        assert!(is_reserved(Ipv4Addr::new(255, 255, 255, 255)));
        assert!(!is_reserved(Ipv4Addr::new(8, 8, 8, 8)));
    }

    #[test]
    fn generate_picks_from_pools() {
        let identity = generate();
        assert!(USER_AGENTS.contains(&identity.user_agent));
        assert!(ACCEPT_LANGUAGES.contains(&identity.accept_language));
    }
}
