//! Fingerprint router and driver registry
//!
//! Drivers register byte-prefix patterns before the accept loops start; the
//! registry compiles them into a byte trie and routes each sniffed buffer
//! to the driver whose pattern is the longest prefix of it. Routed
//! connections are delivered to the driver's synthetic listener over an
//! unbounded channel, so delivery never blocks a connection handler.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::context::ConnContext;
use crate::sniff::SniffStream;

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// A protocol impersonator. Implementations declare which initial byte
/// prefixes they answer for and run a serve loop over the synthetic
/// listener they are handed at startup.
pub trait Driver: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Byte prefixes this driver matches. Queried once at registration.
    fn patterns(&self) -> Vec<Vec<u8>>;

    /// Accept loop over routed connections. Called once; returns only on
    /// fatal error.
    fn serve(self: Arc<Self>, listener: DriverListener) -> BoxFuture<Result<()>>;
}

/// A connection delivered to a driver: the replayable stream plus its
/// request-scoped context.
pub struct Routed {
    pub conn: SniffStream,
    pub ctx: ConnContext,
}

/// Synthetic listener owned by one driver. `accept` pops connections the
/// router delivered; the driver never learns how they arrived.
pub struct DriverListener {
    rx: mpsc::UnboundedReceiver<Routed>,
}

impl DriverListener {
    /// Next routed connection, or `None` once the registry is gone.
    pub async fn accept(&mut self) -> Option<Routed> {
        self.rx.recv().await
    }
}

struct TrieNode {
    children: HashMap<u8, TrieNode>,
    driver: Option<usize>,
}

impl TrieNode {
    fn new() -> Self {
        Self {
            children: HashMap::new(),
            driver: None,
        }
    }
}

/// Prefix-match structure over every registered pattern. Built once at
/// startup, read-only afterwards.
struct PatternTrie {
    root: TrieNode,
}

impl PatternTrie {
    fn new() -> Self {
        Self {
            root: TrieNode::new(),
        }
    }

    fn insert(&mut self, pattern: &[u8], driver: usize) {
        let mut node = &mut self.root;
        for byte in pattern {
            node = node.children.entry(*byte).or_insert_with(TrieNode::new);
        }
        // First registration wins on identical patterns.
        if node.driver.is_none() {
            node.driver = Some(driver);
        }
    }

    /// Driver whose pattern is the longest prefix of `buf`.
    fn longest_match(&self, buf: &[u8]) -> Option<usize> {
        let mut node = &self.root;
        let mut best = None;
        for byte in buf {
            node = match node.children.get(byte) {
                Some(next) => next,
                None => break,
            };
            if let Some(driver) = node.driver {
                best = Some(driver);
            }
        }
        best
    }
}

struct DriverEntry {
    name: &'static str,
    ingress: mpsc::UnboundedSender<Routed>,
}

/// Process-wide driver table. Register every driver, then call
/// [`RegistryBuilder::start`]; the registry is immutable from then on.
pub struct DriverRegistry {
    entries: Vec<DriverEntry>,
    trie: PatternTrie,
}

#[derive(Default)]
pub struct RegistryBuilder {
    drivers: Vec<Arc<dyn Driver>>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, driver: impl Driver) -> Self {
        self.drivers.push(Arc::new(driver));
        self
    }

    /// Compile the pattern trie and spawn every driver's serve loop.
    pub fn start(self) -> DriverRegistry {
        let mut entries = Vec::with_capacity(self.drivers.len());
        let mut trie = PatternTrie::new();

        for (index, driver) in self.drivers.into_iter().enumerate() {
            for pattern in driver.patterns() {
                if pattern.is_empty() {
                    warn!("driver {} registered an empty pattern, ignored", driver.name());
                    continue;
                }
                trie.insert(&pattern, index);
            }

            let (tx, rx) = mpsc::unbounded_channel();
            let name = driver.name();
            entries.push(DriverEntry { name, ingress: tx });

            tokio::spawn(async move {
                if let Err(e) = driver.serve(DriverListener { rx }).await {
                    debug!("{} driver exited: {}", name, e);
                }
            });
        }

        DriverRegistry { entries, trie }
    }
}

impl DriverRegistry {
    /// Resolve the sniffed buffer to a driver ingress, longest prefix wins.
    pub fn route(&self, buf: &[u8]) -> Option<(&'static str, &mpsc::UnboundedSender<Routed>)> {
        self.trie
            .longest_match(buf)
            .map(|index| (self.entries[index].name, &self.entries[index].ingress))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn longest_prefix_wins() {
        let mut trie = PatternTrie::new();
        trie.insert(b"GET", 0);
        trie.insert(b"GET /admin", 1);

        assert_eq!(trie.longest_match(b"GET / HTTP/1.0"), Some(0));
        assert_eq!(trie.longest_match(b"GET /admin HTTP/1.0"), Some(1));
    }

    #[test]
    fn identical_patterns_go_to_earliest_registration() {
        let mut trie = PatternTrie::new();
        trie.insert(b"SSH-", 0);
        trie.insert(b"SSH-", 1);

        assert_eq!(trie.longest_match(b"SSH-2.0-OpenSSH"), Some(0));
    }

    #[test]
    fn no_prefix_no_match() {
        let mut trie = PatternTrie::new();
        trie.insert(b"GET", 0);
        trie.insert(&[3, 0, 0], 1);

        assert_eq!(trie.longest_match(b"\xde\xad\xbe\xef"), None);
        assert_eq!(trie.longest_match(b""), None);
        // A buffer shorter than every pattern matches nothing.
        assert_eq!(trie.longest_match(b"GE"), None);
    }

    #[test]
    fn full_mtu_buffer_matches_without_truncation() {
        let mut trie = PatternTrie::new();
        let pattern = vec![0x41u8; crate::sniff::MTU];
        trie.insert(&pattern, 0);

        let buf = vec![0x41u8; crate::sniff::MTU];
        assert_eq!(trie.longest_match(&buf), Some(0));

        let mut short = buf.clone();
        short.truncate(crate::sniff::MTU - 1);
        assert_eq!(trie.longest_match(&short), None);
    }

    #[test]
    fn binary_patterns_route() {
        let mut trie = PatternTrie::new();
        trie.insert(&[3, 0, 0], 0);

        assert_eq!(trie.longest_match(&[3, 0, 0, 11, 6]), Some(0));
        assert_eq!(trie.longest_match(&[3, 1]), None);
    }
}
