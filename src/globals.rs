//! Process-wide mutable state: the inefficient-action policy, the
//! unique-name counter, and the name deduplication registry. All of it lives
//! in one lazily initialized structure behind a single lock.

use std::collections::HashSet;
use std::sync::OnceLock;

use parking_lot::RwLock;

/// What to do when an operation is about to traverse a matrix against its
/// major axis.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InefficientPolicy {
    Ignore,
    Warn,
    Error,
}

struct GlobalState {
    inefficient_policy: InefficientPolicy,
    name_counter: u64,
    name_registry: HashSet<String>,
}

fn globals() -> &'static RwLock<GlobalState> {
    static GLOBALS: OnceLock<RwLock<GlobalState>> = OnceLock::new();
    GLOBALS.get_or_init(|| {
        RwLock::new(GlobalState {
            inefficient_policy: InefficientPolicy::Warn,
            name_counter: 0,
            name_registry: HashSet::new(),
        })
    })
}

/// The policy applied to inefficient matrix accesses. Read by every thread at
/// the point of checking.
pub fn inefficient_action_policy() -> InefficientPolicy {
    globals().read().inefficient_policy
}

/// Install a new inefficient-access policy, returning the previous one.
/// Writes serialize through the global lock.
pub fn set_inefficient_action_policy(policy: InefficientPolicy) -> InefficientPolicy {
    let mut state = globals().write();
    std::mem::replace(&mut state.inefficient_policy, policy)
}

/// A process-unique name of the form `<base>#<proc>.<counter>`.
pub fn unique_name(base: &str) -> String {
    let mut state = globals().write();
    state.name_counter += 1;
    let name = format!("{}#{}.{}", base, std::process::id(), state.name_counter);
    state.name_registry.insert(name.clone());
    name
}

/// Claim a store name, appending a unique suffix if it was already taken.
pub fn claim_name(base: &str) -> String {
    {
        let mut state = globals().write();
        if state.name_registry.insert(base.to_owned()) {
            return base.to_owned();
        }
    }
    unique_name(base)
}

/// Release a previously claimed store name.
pub fn release_name(name: &str) {
    globals().write().name_registry.remove(name);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_deduplicate() {
        let first = claim_name("globals-test-store");
        let second = claim_name("globals-test-store");
        assert_eq!(first, "globals-test-store");
        assert_ne!(second, first);
        assert!(second.starts_with("globals-test-store#"));
        release_name(&first);
        release_name(&second);
    }

    #[test]
    fn unique_names_differ() {
        let first = unique_name("base");
        let second = unique_name("base");
        assert_ne!(first, second);
    }
}
