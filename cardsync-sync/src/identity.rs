//! Identity Manager: mints and resolves stable block identities.

use cardsync_core::{Block, Identity, ShortIdentity};

use crate::normalize::{canonical, sha256_hex};
use crate::state_store::StateStore;

/// Outcome of resolving one block against the State Store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// The embedded marker matched exactly one tracked identity.
    Reused(Identity),
    /// A fresh identity; a marker must be written (or rewritten) once the
    /// remote record exists.
    Minted(Identity),
    /// The embedded marker matches several tracked identities.
    Collision {
        short: ShortIdentity,
        candidates: Vec<Identity>,
    },
}

impl Resolution {
    /// The resolved identity, if the block is unambiguous.
    pub fn identity(&self) -> Option<&Identity> {
        match self {
            Resolution::Reused(id) | Resolution::Minted(id) => Some(id),
            Resolution::Collision { .. } => None,
        }
    }

    pub fn needs_marker(&self) -> bool {
        matches!(self, Resolution::Minted(_))
    }
}

/// Deterministic identity for a block that has none:
/// `sha256(kind "|" canonical(body) "|" source_file)`.
pub fn mint(kind: &str, normalized_body: &str, source_file: &str) -> Identity {
    let material = format!("{kind}|{}|{source_file}", canonical(normalized_body));
    Identity(sha256_hex(&material))
}

/// Resolve `block` to an identity.
pub fn resolve(store: &StateStore, block: &Block) -> Resolution {
    let Some(short) = &block.embedded_short_identity else {
        return Resolution::Minted(mint_for(block));
    };

    let mut candidates = store.match_short(short);
    match candidates.len() {
        0 => {
            tracing::debug!(
                "{}: marker {short} matches no tracked identity, minting",
                block.location()
            );
            Resolution::Minted(mint_for(block))
        }
        1 => Resolution::Reused(candidates.remove(0)),
        n => {
            tracing::warn!(
                "{}: marker {short} matches {n} tracked identities",
                block.location()
            );
            Resolution::Collision {
                short: short.clone(),
                candidates,
            }
        }
    }
}

fn mint_for(block: &Block) -> Identity {
    mint(&block.kind, &block.normalized_body, &block.source_file)
}
