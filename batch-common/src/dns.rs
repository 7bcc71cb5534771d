//! DNS-level protection for webhook delivery.
//!
//! Webhook URLs come from job submissions, so delivery must never be allowed
//! to reach into the orchestrator's own network. The resolver here filters
//! lookups down to public IPv4 addresses; the URL check covers raw IP
//! literals, which never hit the resolver.

use std::error::Error as StdError;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::{fmt, io};

use futures::FutureExt;
use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use tokio::task::spawn_blocking;
use url::Host;

pub struct NoPublicIPv4Error;

impl std::error::Error for NoPublicIPv4Error {}
impl fmt::Display for NoPublicIPv4Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "No public IPv4 found for specified host")
    }
}
impl fmt::Debug for NoPublicIPv4Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "No public IPv4 found for specified host")
    }
}

/// Internal reqwest type, copied here as part of Resolving
pub(crate) type BoxError = Box<dyn StdError + Send + Sync>;

/// Returns [`true`] if the address appears to be a globally reachable IPv4.
///
/// Trimmed down version of the unstable IpAddr::is_global, move to it when it's stable.
pub fn is_global_ipv4(ip: &Ipv4Addr) -> bool {
    !(ip.octets()[0] == 0 // "This network"
    || ip.is_private()
    || ip.is_loopback()
    || ip.is_link_local()
    || ip.is_broadcast())
}

fn is_global_ipv4_socket_addr(addr: &SocketAddr) -> bool {
    match addr.ip() {
        IpAddr::V4(ip) => is_global_ipv4(&ip),
        IpAddr::V6(_) => false, // Delivery does not currently support IPv6 targets.
    }
}

/// Whether a webhook URL's host may be delivered to. Raw IP literals are
/// checked here; domains are deferred to [`PublicIPv4Resolver`], except
/// `localhost`, which is never public.
pub fn is_safe_webhook_host(url: &url::Url) -> bool {
    match url.host() {
        Some(Host::Ipv4(ip)) => is_global_ipv4(&ip),
        Some(Host::Ipv6(_)) => false,
        Some(Host::Domain(domain)) => !domain.eq_ignore_ascii_case("localhost"),
        None => false,
    }
}

/// Walk an error's source chain looking for a `T`.
pub fn is_error_source<T: StdError + 'static>(err: &dyn StdError) -> bool {
    let mut source = err.source();
    while let Some(current) = source {
        if current.is::<T>() {
            return true;
        }
        source = current.source();
    }
    false
}

/// DNS resolver using the stdlib resolver, but filtering results to only pass
/// public IPv4 results.
///
/// Private and broadcast addresses are filtered out, so are IPv6 results for
/// now. This is adapted from the GaiResolver in hyper and reqwest.
pub struct PublicIPv4Resolver {}

impl Resolve for PublicIPv4Resolver {
    fn resolve(&self, name: Name) -> Resolving {
        // Closure to call the system's resolver (blocking call) through the ToSocketAddrs trait.
        let resolve_host = move || (name.as_str(), 0).to_socket_addrs();

        // Execute the blocking call in a separate worker thread then process its result asynchronously.
        let future_result = spawn_blocking(resolve_host).map(|result| match result {
            Ok(Ok(all_addrs)) => {
                // Resolution succeeded, filter the results
                let filtered_addr: Vec<SocketAddr> =
                    all_addrs.filter(is_global_ipv4_socket_addr).collect();
                if filtered_addr.is_empty() {
                    let err: BoxError = Box::new(NoPublicIPv4Error);
                    Err(err)
                } else {
                    let addrs: Addrs = Box::new(filtered_addr.into_iter());
                    Ok(addrs)
                }
            }
            Ok(Err(err)) => {
                // Resolution failed, pass error through in a Box
                let err: BoxError = Box::new(err);
                Err(err)
            }
            Err(join_err) => {
                // The tokio task failed, pass as io::Error in a Box
                let err: BoxError = Box::new(io::Error::from(join_err));
                Err(err)
            }
        });

        // Box the Future to satisfy the Resolving interface.
        Box::pin(future_result)
    }
}
