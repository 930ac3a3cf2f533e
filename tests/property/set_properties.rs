//! Property tests for the expiring keyed [`Set`].
//!
//! 1. After any sequence of adds and removes, `len` matches a model of the
//!    live keys.
//! 2. `replace` moves an entry to the new key, leaving the old one missing
//!    unless both keys normalise to the same value.
//! 3. Expiry is monotonic: an entry is live until its TTL and never comes
//!    back afterwards.

use std::collections::HashSet;
use std::time::Duration;

use parlor::set::{Set, SetError, normalize};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Add(String),
    Remove(String),
}

/// Small key space with mixed case, so collisions are common.
fn arb_key() -> impl Strategy<Value = String> {
    "[a-cA-C]{1,2}"
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![arb_key().prop_map(Op::Add), arb_key().prop_map(Op::Remove)]
}

fn paused_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .start_paused(true)
        .build()
        .expect("runtime should build")
}

proptest! {
    /// `len` always equals the number of keys the model says are live.
    #[test]
    fn len_matches_model(ops in prop::collection::vec(arb_op(), 0..64)) {
        let set = Set::new();
        let mut model = HashSet::new();
        for op in ops {
            match op {
                Op::Add(key) => {
                    let fresh = model.insert(normalize(&key));
                    let result = set.add(key);
                    prop_assert_eq!(result.is_ok(), fresh);
                    if !fresh {
                        prop_assert_eq!(result, Err(SetError::Collision));
                    }
                }
                Op::Remove(key) => {
                    let present = model.remove(&normalize(&key));
                    prop_assert_eq!(set.remove(&key).is_ok(), present);
                }
            }
            prop_assert_eq!(set.len(), model.len());
        }
    }

    /// `replace` then `get` finds the new item under its own key.
    #[test]
    fn replace_round_trip(old in arb_key(), new in arb_key()) {
        let set = Set::new();
        set.add(old.clone()).expect("empty set accepts any key");
        set.replace(&old, new.clone()).expect("only entry cannot collide");

        prop_assert_eq!(set.get(&new), Ok(new.clone()));
        if normalize(&old) == normalize(&new) {
            prop_assert_eq!(set.len(), 1);
        } else {
            prop_assert_eq!(set.get(&old), Err(SetError::Missing));
        }
    }

    /// An expiring entry is live before its TTL and dead from then on.
    #[test]
    fn expiry_is_monotonic(ttl_ms in 1u64..500, checks in prop::collection::vec(0u64..100, 1..8)) {
        let rt = paused_runtime();
        rt.block_on(async {
            let set = Set::new();
            set.add_expiring("temp".to_string(), Duration::from_millis(ttl_ms))
                .expect("empty set accepts any key");
            prop_assert!(set.contains("temp"));

            let mut elapsed = 0;
            let mut expired = false;
            for step in checks {
                tokio::time::advance(Duration::from_millis(step)).await;
                elapsed += step;
                let live = set.contains("temp");
                if expired {
                    prop_assert!(!live, "entry came back after expiring");
                }
                prop_assert_eq!(live, elapsed < ttl_ms);
                expired = !live;
            }
            Ok(())
        })?;
    }
}
