//! Shared scaffolding for the end-to-end scenario tests (spec.md §8):
//! a registry bound on an ephemeral port, and a small polling helper since
//! this crate's cross-thread effects (peer join, subscription propagation,
//! lifecycle transitions) are asynchronous by nature.

use std::net::SocketAddr;
use std::thread;
use std::time::{Duration, Instant};

use silkit_rs::Participant;

const LOOPBACK: &str = "127.0.0.1:0";

/// Starts a registry on an OS-assigned port and runs its accept loop on a
/// detached background thread for the lifetime of the test process.
pub fn start_registry() -> SocketAddr {
  let registry = silkit_rs::registry::Registry::bind(LOOPBACK.parse().unwrap()).expect("bind registry");
  let addr = registry.local_addr().expect("registry local addr");
  thread::spawn(move || {
    let _ = registry.run();
  });
  addr
}

/// Polls `condition` every 10ms until it returns `true` or `timeout` elapses.
/// Returns whether the condition was observed to hold.
pub fn poll_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
  let deadline = Instant::now() + timeout;
  loop {
    if condition() {
      return true;
    }
    if Instant::now() >= deadline {
      return false;
    }
    thread::sleep(Duration::from_millis(10));
  }
}

/// Blocks until `a` has observed `b` join the mesh (and vice versa).
pub fn wait_for_mutual_join(a: &Participant, b: &Participant, timeout: Duration) {
  assert!(
    poll_until(timeout, || a.known_peer_id(b.name()).is_some() && b.known_peer_id(a.name()).is_some()),
    "peers {} and {} never joined each other's mesh view",
    a.name(),
    b.name()
  );
  // Subscription announcements piggyback on the same peer link but are a
  // separate frame than the one that drove PeerJoined; give them a moment to
  // land before a test starts sending traffic that depends on them.
  thread::sleep(Duration::from_millis(150));
}
