//! Property tests for [`History`]: `get(n)` returns exactly the last
//! `min(n, retained)` messages in insertion order, and never more than the
//! capacity.

use parlor::history::History;
use parlor::message::Message;
use proptest::prelude::*;

proptest! {
    #[test]
    fn get_returns_tail_in_order(
        capacity in 0usize..12,
        inserted in 0usize..40,
        n in 0usize..50,
    ) {
        let history = History::new(capacity);
        for i in 0..inserted {
            history.add(Message::announce(i.to_string()));
        }

        let retained = inserted.min(capacity);
        prop_assert_eq!(history.len(), retained);

        let got: Vec<String> = history
            .get(n)
            .iter()
            .map(|msg| msg.body().to_string())
            .collect();
        let expected: Vec<String> = (inserted - n.min(retained)..inserted)
            .map(|i| i.to_string())
            .collect();
        prop_assert!(got.len() <= capacity);
        prop_assert_eq!(got, expected);
    }
}
