//! DNS blocklist reputation
//!
//! Looks up the connecting client's address in DNS blocklists when the
//! envelope sender is given. The lookup suspends the handler; other
//! connections keep running meanwhile.

use async_trait::async_trait;
use mailhook_common::types::{HookName, HookOutcome};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::error::ResolveErrorKind;
use trust_dns_resolver::TokioAsyncResolver;
use tracing::{debug, info, warn};

use super::types::{LoadContext, Plugin, PluginError, PluginResult};
use crate::spam::DNSBL_SCORE_NOTE;
use crate::transaction::Transaction;

/// Note listing the zones that returned a listing
pub const DNSBL_LISTED_NOTE: &str = "dnsbl.listed";

/// Address lookups used for blocklist queries
#[async_trait]
pub trait DnsLookup: Send + Sync {
    /// A records for `name`. An empty list means the name does not exist.
    async fn lookup_a(&self, name: &str) -> PluginResult<Vec<Ipv4Addr>>;
}

/// Lookups through the system resolver
pub struct TrustDnsLookup {
    resolver: TokioAsyncResolver,
}

impl TrustDnsLookup {
    pub fn new() -> Self {
        Self {
            resolver: TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default()),
        }
    }
}

impl Default for TrustDnsLookup {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DnsLookup for TrustDnsLookup {
    async fn lookup_a(&self, name: &str) -> PluginResult<Vec<Ipv4Addr>> {
        match self.resolver.ipv4_lookup(name).await {
            Ok(lookup) => Ok(lookup.iter().map(|record| (*record).into()).collect()),
            Err(e) => {
                if matches!(e.kind(), ResolveErrorKind::NoRecordsFound { .. }) {
                    Ok(Vec::new())
                } else {
                    Err(PluginError::ExecutionFailed(format!("DNS lookup for {} failed: {}", name, e)))
                }
            }
        }
    }
}

/// One blocklist zone
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Zone {
    pub zone: String,
    /// Reputation score (0-100) for a listing in this zone
    #[serde(default = "default_zone_score")]
    pub score: f64,
}

fn default_zone_score() -> f64 {
    80.0
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct Settings {
    zones: Vec<Zone>,
    /// Deny MAIL FROM when the score reaches this value
    reject_score: Option<f64>,
    /// Skip loopback and private client addresses
    skip_private: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            zones: default_zones(),
            reject_score: None,
            skip_private: true,
        }
    }
}

fn default_zones() -> Vec<Zone> {
    vec![
        Zone {
            zone: "zen.spamhaus.org".to_string(),
            score: 80.0,
        },
        Zone {
            zone: "b.barracudacentral.org".to_string(),
            score: 80.0,
        },
        Zone {
            zone: "dnsbl.sorbs.net".to_string(),
            score: 85.0,
        },
    ]
}

/// A listing found in one zone
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub zone: String,
    /// Return code, last octet of the 127.0.0.x answer
    pub code: u8,
    pub list: String,
    pub score: f64,
}

/// Spamhaus ZEN sub-list and score for a return code
fn spamhaus_listing(code: u8, fallback: f64) -> (&'static str, f64) {
    match code {
        2 => ("SBL", 95.0),
        3 => ("CSS", 90.0),
        4..=7 => ("XBL", 100.0),
        10 | 11 => ("PBL", 85.0),
        _ => ("LISTED", fallback),
    }
}

/// Query name for `ip` under `zone`: reversed octets, or reversed nibbles for IPv6
pub fn query_name(ip: IpAddr, zone: &str) -> String {
    match ip {
        IpAddr::V4(v4) => {
            let [a, b, c, d] = v4.octets();
            format!("{}.{}.{}.{}.{}", d, c, b, a, zone)
        }
        IpAddr::V6(v6) => {
            let mut labels: Vec<String> = Vec::with_capacity(33);
            for byte in v6.octets().iter().rev() {
                labels.push(format!("{:x}", byte & 0x0f));
                labels.push(format!("{:x}", byte >> 4));
            }
            labels.push(zone.to_string());
            labels.join(".")
        }
    }
}

/// Check if an IP address is in a private/reserved range
fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(ipv4) => {
            ipv4.is_loopback()
                || ipv4.is_private()
                || ipv4.is_link_local()
                || ipv4.is_broadcast()
                || ipv4.is_unspecified()
                || ipv4.octets()[0] == 100 && (ipv4.octets()[1] & 0xC0) == 64
        }
        IpAddr::V6(ipv6) => {
            ipv6.is_loopback()
                || ipv6.is_unspecified()
                || (ipv6.segments()[0] & 0xfe00) == 0xfc00
                || (ipv6.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}

/// Client reputation from DNS blocklists
pub struct DnsblPlugin {
    settings: Settings,
    lookup: Option<Arc<dyn DnsLookup>>,
}

impl DnsblPlugin {
    pub const NAME: &'static str = "dnsbl";

    /// Plugin using the given lookup and the default zones
    pub fn with_lookup(lookup: Arc<dyn DnsLookup>) -> Self {
        Self {
            settings: Settings::default(),
            lookup: Some(lookup),
        }
    }

    pub fn zones(mut self, zones: Vec<Zone>) -> Self {
        self.settings.zones = zones;
        self
    }

    pub fn reject_score(mut self, score: Option<f64>) -> Self {
        self.settings.reject_score = score;
        self
    }

    pub fn skip_private(mut self, skip: bool) -> Self {
        self.settings.skip_private = skip;
        self
    }

    /// Query every zone for `ip`. Zones whose lookup fails are skipped.
    pub async fn check(&self, ip: IpAddr) -> PluginResult<Vec<Listing>> {
        let lookup = self
            .lookup
            .as_ref()
            .ok_or_else(|| PluginError::Internal("DNS resolver not initialised".to_string()))?;

        let mut listings = Vec::new();
        for zone in &self.settings.zones {
            let name = query_name(ip, &zone.zone);
            let answers = match lookup.lookup_a(&name).await {
                Ok(answers) => answers,
                Err(e) => {
                    warn!(zone = %zone.zone, "Blocklist lookup failed: {}", e);
                    continue;
                }
            };

            // Only 127.0.0.x answers are listings; anything else is a list-side error code.
            // A client on several sub-lists is scored by its worst listing.
            let spamhaus = zone.zone.ends_with("spamhaus.org");
            let worst = answers
                .iter()
                .filter_map(|a| match a.octets() {
                    [127, 0, 0, code] => Some(code),
                    _ => None,
                })
                .map(|code| {
                    let (list, score) = if spamhaus {
                        spamhaus_listing(code, zone.score)
                    } else {
                        ("LISTED", zone.score)
                    };
                    (code, list, score)
                })
                .fold(None, |worst: Option<(u8, &'static str, f64)>, candidate| match worst {
                    Some(current) if current.2 >= candidate.2 => Some(current),
                    _ => Some(candidate),
                });
            let (code, list, score) = match worst {
                Some(listing) => listing,
                None => {
                    if !answers.is_empty() {
                        warn!(zone = %zone.zone, answers = ?answers, "Ignoring non-listing blocklist answer");
                    }
                    continue;
                }
            };

            debug!(zone = %zone.zone, code, list, "Client listed");
            listings.push(Listing {
                zone: zone.zone.clone(),
                code,
                list: list.to_string(),
                score,
            });
        }

        Ok(listings)
    }
}

impl Default for DnsblPlugin {
    fn default() -> Self {
        Self {
            settings: Settings::default(),
            lookup: None,
        }
    }
}

impl std::fmt::Debug for DnsblPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DnsblPlugin")
            .field("settings", &self.settings)
            .field("lookup", &self.lookup.is_some())
            .finish()
    }
}

#[async_trait]
impl Plugin for DnsblPlugin {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn hooks(&self) -> &[HookName] {
        &[HookName::EnvelopeFrom]
    }

    async fn on_load(&mut self, ctx: &LoadContext) -> PluginResult<()> {
        self.settings = ctx.settings()?;
        if self.settings.zones.is_empty() {
            return Err(PluginError::Config("dnsbl needs at least one zone".to_string()));
        }
        if self.lookup.is_none() {
            self.lookup = Some(Arc::new(TrustDnsLookup::new()));
        }
        Ok(())
    }

    async fn on_envelope_from(&self, txn: &mut Transaction) -> PluginResult<HookOutcome> {
        let ip = match txn.client_ip {
            Some(ip) => ip,
            None => return Err(PluginError::Malformed("no client address".to_string())),
        };
        if self.settings.skip_private && is_private_ip(&ip) {
            debug!(%ip, "Skipping blocklist lookup for private address");
            return Ok(HookOutcome::Continue);
        }

        let listings = self.check(ip).await?;
        let score = listings.iter().map(|l| l.score).fold(0.0, f64::max);

        txn.set_note(DNSBL_SCORE_NOTE, score);
        txn.set_note_as(DNSBL_LISTED_NOTE, &listings)?;

        if let (Some(reject), Some(worst)) = (
            self.settings.reject_score,
            listings.iter().max_by(|a, b| a.score.total_cmp(&b.score)),
        ) {
            if score >= reject {
                info!(%ip, zone = %worst.zone, list = %worst.list, "Client rejected by blocklist");
                return Ok(HookOutcome::deny(
                    554,
                    format!("5.7.1 Client host [{}] blocked using {}", ip, worst.zone),
                ));
            }
        }

        Ok(HookOutcome::Continue)
    }
}
